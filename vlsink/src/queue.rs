//! Batch intake from the Redis work queue.
//!
//! Producers `RPUSH` JSON batch payloads onto a single list key; each worker
//! pops from the head with `BLPOP` over its own connection, so a batch is
//! delivered to exactly one worker. The pop uses a short server-side timeout
//! instead of blocking indefinitely, which keeps the worker loop responsive
//! to shutdown between deliveries.

use std::future::Future;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

/// Server-side `BLPOP` timeout. An expired timeout is an empty pop, not an
/// error.
const POP_TIMEOUT_SECS: f64 = 5.0;

/// Errors raised by the queue connection.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to connect to queue at '{url}'")]
    Connect {
        url: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("failed to pop from queue key '{key}'")]
    Pop {
        key: String,
        #[source]
        source: redis::RedisError,
    },
}

/// Seam between the worker loop and the queue.
///
/// `Ok(None)` means no batch arrived within the pop timeout; the worker
/// simply polls again.
pub trait BatchQueue: Send {
    fn pop(&mut self) -> impl Future<Output = Result<Option<String>, QueueError>> + Send;
}

/// Work queue over one dedicated Redis connection.
pub struct RedisQueue {
    conn: MultiplexedConnection,
    key: String,
}

impl RedisQueue {
    /// Connects and binds to the list key the producers push to.
    pub async fn connect(host: &str, port: u16, key: String) -> Result<Self, QueueError> {
        let url = format!("redis://{host}:{port}/");
        let client =
            redis::Client::open(url.as_str()).map_err(|source| QueueError::Connect {
                url: url.clone(),
                source,
            })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|source| QueueError::Connect { url, source })?;
        Ok(Self { conn, key })
    }
}

impl BatchQueue for RedisQueue {
    async fn pop(&mut self) -> Result<Option<String>, QueueError> {
        // BLPOP replies with a (key, value) pair, or nil on timeout. A reply
        // of any other shape carries no payload to recover, so it is treated
        // the same as an empty pop.
        let reply: Result<Option<(String, String)>, redis::RedisError> =
            self.conn.blpop(&self.key, POP_TIMEOUT_SECS).await;
        match reply {
            Ok(Some((_key, payload))) => Ok(Some(payload)),
            Ok(None) => Ok(None),
            Err(err) if err.kind() == redis::ErrorKind::TypeError => Ok(None),
            Err(source) => Err(QueueError::Pop {
                key: self.key.clone(),
                source,
            }),
        }
    }
}
