use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "vlsink")]
#[command(version)]
#[command(about = "Loads collectd value lists from Redis into partitioned PostgreSQL tables", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the ingestion workers.
    Run(RunConfig),
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunConfig {
    /// PostgreSQL connection URL for the metrics warehouse (required)
    ///
    /// Format: postgresql://[user]:[password]@[host]:[port]/[database]
    /// Can also be set via DATABASE_URL environment variable
    #[arg(long, env = "DATABASE_URL", required = true)]
    pub database_url: String,

    /// Redis server hostname (default: localhost)
    ///
    /// Can also be set via REDIS_HOST environment variable
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    /// Redis server port (default: 6379)
    ///
    /// Can also be set via REDIS_PORT environment variable
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Redis list key the collectors push batches to (default: vlsink)
    ///
    /// Can also be set via REDIS_KEY environment variable
    #[arg(long, env = "REDIS_KEY", default_value = "vlsink")]
    pub redis_key: String,

    /// Number of ingestion workers (default: 1, valid range: 1-256)
    ///
    /// Each worker opens one Redis and one PostgreSQL connection.
    /// Can also be set via WORKERS environment variable
    #[arg(short = 'w', long, env = "WORKERS", default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=256))]
    pub workers: u16,

    /// Seconds between stats report lines (default: 60)
    ///
    /// Can also be set via STATS_INTERVAL_SECS environment variable
    #[arg(long, env = "STATS_INTERVAL_SECS", default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub stats_interval_secs: u64,

    /// Seconds to back off after losing a partition-creation race (default: 3)
    ///
    /// Can also be set via RACE_BACKOFF_SECS environment variable
    #[arg(long, env = "RACE_BACKOFF_SECS", default_value_t = 3)]
    pub race_backoff_secs: u64,

    /// Plugins whose partitions are additionally split by type (default: postgresql)
    ///
    /// Can also be set via TYPE_PARTITIONED_PLUGINS environment variable
    #[arg(
        long,
        env = "TYPE_PARTITIONED_PLUGINS",
        value_delimiter = ',',
        default_value = "postgresql"
    )]
    pub type_partitioned_plugins: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RunConfig {
        let mut argv = vec![
            "vlsink",
            "run",
            "--database-url",
            "postgresql://localhost/metrics",
        ];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        let Command::Run(config) = cli.command;
        config
    }

    #[test]
    fn defaults_mirror_the_reference_deployment() {
        let config = parse(&[]);
        assert_eq!(config.redis_host, "localhost");
        assert_eq!(config.redis_port, 6379);
        assert_eq!(config.redis_key, "vlsink");
        assert_eq!(config.workers, 1);
        assert_eq!(config.stats_interval_secs, 60);
        assert_eq!(config.race_backoff_secs, 3);
        assert_eq!(config.type_partitioned_plugins, ["postgresql"]);
    }

    #[test]
    fn type_partitioned_plugins_are_comma_separated() {
        let config = parse(&["--type-partitioned-plugins", "postgresql,cpu"]);
        assert_eq!(config.type_partitioned_plugins, ["postgresql", "cpu"]);
    }

    #[test]
    fn database_url_is_required() {
        assert!(Cli::try_parse_from(["vlsink", "run"]).is_err());
    }
}
