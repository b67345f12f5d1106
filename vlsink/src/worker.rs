//! The worker loop: pop a batch, decode it, load each record.
//!
//! Workers are independent; each owns its queue and loader connections and
//! shares only the stats counters and the shutdown token. Failures are
//! contained at the smallest useful unit: a failed pop delays and retries, a
//! malformed batch is dropped whole, a failed record is dropped alone while
//! the rest of its batch proceeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use monitoring::logging;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{loader::RecordLoader, queue::BatchQueue, record::decode_batch};

/// Wait after a failed pop before polling the queue again.
const POP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Counters shared by all workers, reported periodically by the supervisor.
#[derive(Debug, Default)]
pub struct Stats {
    batches: AtomicU64,
    inserts: AtomicU64,
}

impl Stats {
    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative totals since startup (or the last [`Stats::take`]).
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        }
    }

    /// Reads and resets the counters; one reporting interval's totals.
    pub fn take(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.swap(0, Ordering::Relaxed),
            inserts: self.inserts.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Batches received from the queue. Pops that time out empty are not
    /// counted.
    pub batches: u64,
    /// Records handed to the loader (attempted, not necessarily stored).
    pub inserts: u64,
}

/// One ingestion worker.
pub struct Worker<Q, L> {
    id: usize,
    queue: Q,
    loader: L,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
}

impl<Q: BatchQueue, L: RecordLoader> Worker<Q, L> {
    pub fn new(
        id: usize,
        queue: Q,
        loader: L,
        stats: Arc<Stats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            queue,
            loader,
            stats,
            shutdown,
        }
    }

    /// Runs until shutdown is requested.
    ///
    /// Shutdown is only observed between pops. The pop itself is always
    /// awaited to completion: a BLPOP already sent to the server removes the
    /// element it delivers, so abandoning the in-flight pop would lose that
    /// batch. The short server-side pop timeout bounds how long shutdown
    /// waits. Likewise, a batch in flight is always driven to completion so
    /// its records are not silently dropped mid-way.
    pub async fn run(mut self) {
        debug!(worker = self.id, "worker_started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.queue.pop().await {
                Ok(Some(payload)) => {
                    self.stats.record_batch();
                    self.process_batch(&payload).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        worker = self.id,
                        error = %err, error_source = logging::error_source(&err),
                        "queue_pop_failed"
                    );
                    sleep(POP_RETRY_DELAY).await;
                }
            }
        }
        debug!(worker = self.id, "worker_stopped");
    }

    async fn process_batch(&mut self, payload: &str) {
        let records = match decode_batch(payload) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    worker = self.id,
                    error = %err, error_source = logging::error_source(&err),
                    "batch_decode_failed"
                );
                return;
            }
        };

        for record in &records {
            self.stats.record_insert();
            if let Err(err) = self.loader.load(record).await {
                warn!(
                    worker = self.id,
                    plugin = %record.plugin,
                    r#type = %record.type_name,
                    host = %record.host,
                    time = record.time,
                    error = %err, error_source = logging::error_source(&err),
                    "record_load_failed"
                );
            }
        }
        debug!(worker = self.id, records = records.len(), "batch_loaded");
    }
}
