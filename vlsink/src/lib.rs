// Core modules
pub mod commands;
pub mod config;
pub mod conn;
pub mod loader;
pub mod partition;
pub mod queue;
pub mod record;
pub mod sql;
pub mod supervisor;
pub mod worker;

// Re-export for convenience
pub use config::RunConfig;
pub use record::MetricRecord;
pub use supervisor::Supervisor;
