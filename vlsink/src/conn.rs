//! Warehouse connection establishment.
//!
//! Every worker holds one dedicated [`PgConnection`] for its whole lifetime;
//! there is no pool. Startup retries transient failures so the service can
//! come up before (or while) the warehouse does.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use sqlx::{Connection as _, PgConnection};
use tracing::warn;

/// Errors that can occur when connecting to the warehouse.
#[derive(Debug, thiserror::Error)]
#[error("error connecting to warehouse: {0}")]
pub struct ConnectError(#[source] sqlx::Error);

fn connect_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(20)
}

/// Returns true for errors worth retrying at startup.
fn is_transient_connect_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|code| {
                matches!(
                    code.as_ref(),
                    "53300" | // Too many connections
                    "08006" | // Connection failure
                    "08001" | // Unable to connect to server
                    "08004" | // Connection rejected
                    "57P03" // Database starting up
                )
            })
        }
        sqlx::Error::Io(_) => true,
        _ => false,
    }
}

/// Opens one dedicated warehouse connection, retrying transient failures
/// with exponential backoff.
pub async fn connect(url: &str) -> Result<PgConnection, ConnectError> {
    fn notify_retry(err: &sqlx::Error, dur: Duration) {
        warn!(
            error = %err,
            "warehouse not reachable yet, retrying in {:.1}s",
            dur.as_secs_f32()
        );
    }

    (|| PgConnection::connect(url))
        .retry(connect_retry_policy())
        .when(is_transient_connect_error)
        .notify(notify_retry)
        .await
        .map_err(ConnectError)
}
