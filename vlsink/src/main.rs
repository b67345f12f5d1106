use anyhow::Result;
use clap::Parser;
use vlsink::{
    commands,
    config::{Cli, Command},
};

#[tokio::main]
async fn main() -> Result<()> {
    monitoring::logging::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(config) => commands::run::run(config).await,
    }
}
