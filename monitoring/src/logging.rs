//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{io::IsTerminal, sync::Once};

use tracing_subscriber::{self, EnvFilter, filter::LevelFilter};

static VLSINK_LOG_ENV_VAR: &str = "VLSINK_LOG";

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, vlsink_log_level) = env_filter_and_log_level();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();

        tracing::info!("log level: {}", vlsink_log_level);
    });
}

/// Renders the full `source()` chain of an error for structured log fields.
///
/// `tracing` only formats the top-level error; the chain usually holds the
/// actionable detail (e.g. the SQLSTATE-bearing database error under a
/// higher-level load error).
pub fn error_source<E: std::error::Error>(err: &E) -> String {
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(err) = source {
        chain.push(err.to_string());
        source = err.source();
    }
    chain.join(": ")
}

/// List of crates in the workspace.
const VLSINK_CRATES: &[&str] = &["monitoring", "vlsink"];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    // Parse directives from RUST_LOG
    let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = log_filter.parse(&directive_string).unwrap();

    let log_level = std::env::var(VLSINK_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in VLSINK_CRATES {
        // Add directives for each crate in VLSINK_CRATES, if not overriden by RUST_LOG
        if !directive_string.contains(&format!("{crate_name}=")) {
            env_filter =
                env_filter.add_directive(format!("{crate_name}={log_level}").parse().unwrap());
        }
    }

    (env_filter, log_level)
}

/// If this fails, just update the above `VLSINK_CRATES` to match reality.
#[test]
fn assert_vlsink_crates() {
    use cargo_metadata::MetadataCommand;

    let cmd = MetadataCommand::new().exec().unwrap();
    let mut names: Vec<String> = cmd
        .workspace_packages()
        .into_iter()
        .map(|pkg| pkg.name.replace("-", "_").clone())
        .collect();
    names.sort();
    assert_eq!(names, VLSINK_CRATES);
}
