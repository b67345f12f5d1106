//! Worker pool lifecycle and periodic stats reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::RunConfig,
    conn::{self, ConnectError},
    loader::PartitionedLoader,
    partition::Partitioning,
    queue::{QueueError, RedisQueue},
    worker::{Stats, Worker},
};

/// Errors that prevent the worker pool from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Warehouse(#[from] ConnectError),
}

/// Handle over the spawned workers and the stats reporter.
pub struct Supervisor {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    reporter: JoinHandle<()>,
}

impl Supervisor {
    /// Connects and spawns one worker per configured slot, plus the stats
    /// reporter.
    ///
    /// All connections are established up front; any connection failure here
    /// (after the startup retry budget in [`conn::connect`]) is fatal rather
    /// than degrading to a smaller pool.
    pub async fn start(config: &RunConfig) -> Result<Self, StartError> {
        let shutdown = CancellationToken::new();
        let stats = Arc::new(Stats::default());
        let partitioning = Partitioning::new(config.type_partitioned_plugins.iter().cloned());
        let race_backoff = Duration::from_secs(config.race_backoff_secs);

        let mut workers = Vec::with_capacity(config.workers as usize);
        for id in 0..config.workers as usize {
            let queue = RedisQueue::connect(
                &config.redis_host,
                config.redis_port,
                config.redis_key.clone(),
            )
            .await?;
            let conn = conn::connect(&config.database_url).await?;
            let loader = PartitionedLoader::new(conn, partitioning.clone(), race_backoff);
            let worker = Worker::new(id, queue, loader, stats.clone(), shutdown.clone());
            workers.push(tokio::spawn(worker.run()));
        }
        info!(workers = workers.len(), "workers_started");

        let reporter = tokio::spawn(report_loop(
            stats,
            Duration::from_secs(config.stats_interval_secs),
            shutdown.clone(),
        ));

        Ok(Self {
            shutdown,
            workers,
            reporter,
        })
    }

    /// Requests shutdown and waits for every worker to finish its current
    /// batch and exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            // A worker task only ends by returning; a join error means it
            // panicked, which there is nothing left to do about during
            // shutdown.
            let _ = worker.await;
        }
        let _ = self.reporter.await;
        info!("workers_stopped");
    }
}

/// Logs one stats line per interval and resets the counters, so each line
/// covers exactly one interval's work.
async fn report_loop(stats: Arc<Stats>, period: Duration, shutdown: CancellationToken) {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let snapshot = stats.take();
                info!(batches = snapshot.batches, inserts = snapshot.inserts, "stats");
            }
        }
    }
    // Final line so work done since the last tick is still accounted for.
    let snapshot = stats.take();
    info!(batches = snapshot.batches, inserts = snapshot.inserts, "stats");
}
