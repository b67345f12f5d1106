//! Partition-aware record loading.
//!
//! [`PartitionedLoader::load`] maps a record to its target partition, runs
//! the parameterized insert, and resolves a missing partition by creating it
//! and retrying. Retryable conditions never escape to the caller: an `Err`
//! from `load` means the record is dropped, so a single bad record can never
//! stall a worker.
//!
//! # Race resolution
//!
//! Partition creation races are resolved optimistically. Every worker that
//! observes a missing table attempts the create; the warehouse's uniqueness
//! of table names lets at most one succeed. A loser backs off for a fixed
//! interval so the winner's transaction can commit, then retries the insert
//! once. No in-process lock is involved, which also covers races against
//! other independently started instances of this service.

use std::future::Future;
use std::time::Duration;

use sqlx::PgConnection;

use crate::{
    partition::{self, EnsureOutcome, PartitionKey, Partitioning, TimestampOutOfRange},
    record::MetricRecord,
    sql,
};

/// SQLSTATE for `undefined_table`: the target partition does not exist.
const UNDEFINED_TABLE: &str = "42P01";

/// Default wait before retrying an insert after losing a creation race.
pub const DEFAULT_RACE_BACKOFF: Duration = Duration::from_secs(3);

/// Errors that cause a record to be dropped.
///
/// Every variant carries the partition so the log line locates the failed
/// record; the worker adds the record identity fields.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Record timestamp cannot be mapped to a UTC day.
    #[error("record maps to no representable partition day")]
    Timestamp(#[from] TimestampOutOfRange),

    /// Partition name derived from the record is not a safe identifier.
    /// Plugin and type strings originate from unauthenticated collectors,
    /// so this is rejected rather than quoted into DDL.
    #[error("partition name '{table}' is not a safe SQL identifier")]
    UnsafePartitionName {
        table: String,
        #[source]
        source: sql::ValidateIdentifierError,
    },

    /// Failed to JSON-encode the record's arrays for binding.
    #[error("failed to encode record arrays for insert into '{table}'")]
    EncodeArrays {
        table: String,
        #[source]
        source: serde_json::Error,
    },

    /// First insert attempt failed for a reason other than a missing
    /// partition (bad values, constraint violation, connectivity).
    #[error("insert into partition '{table}' failed")]
    Insert {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// Insert failed again right after this worker created the partition.
    #[error("insert into partition '{table}' failed after creating it")]
    InsertAfterCreate {
        table: String,
        #[source]
        source: sqlx::Error,
    },

    /// Insert failed again after backing off from a lost creation race.
    #[error("insert into partition '{table}' failed after lost-race backoff")]
    InsertAfterBackoff {
        table: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Seam between the worker loop and the warehouse.
///
/// `Err` means the record was dropped; the worker logs it and moves on.
pub trait RecordLoader: Send {
    fn load(&mut self, record: &MetricRecord)
    -> impl Future<Output = Result<(), LoadError>> + Send;
}

/// Warehouse operations the loader sequences.
///
/// Split out from [`PartitionedLoader`] so the insert → create → retry
/// orchestration can be driven against a scripted store in tests.
pub trait PartitionStore: Send {
    /// Executes one prepared insert with the record's fields bound.
    fn insert(
        &mut self,
        statement: &str,
        record: &EncodedRecord<'_>,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Creates the partition for `key`; see [`partition::ensure_partition`].
    fn ensure_partition(
        &mut self,
        key: &PartitionKey,
    ) -> impl Future<Output = EnsureOutcome> + Send;
}

/// [`PartitionStore`] over one dedicated warehouse connection.
pub struct PgPartitionStore {
    conn: PgConnection,
}

impl PartitionStore for PgPartitionStore {
    async fn insert(
        &mut self,
        statement: &str,
        record: &EncodedRecord<'_>,
    ) -> Result<(), sqlx::Error> {
        let mut query = sqlx::query(statement)
            .bind(record.inner.time)
            .bind(record.inner.interval)
            .bind(&record.inner.host)
            .bind(&record.inner.plugin)
            .bind(record.inner.plugin_instance.as_deref())
            .bind(&record.inner.type_name)
            .bind(record.inner.type_instance.as_deref())
            .bind(&record.dsnames_json)
            .bind(&record.dstypes_json)
            .bind(&record.values_json);
        if let Some(metadata_json) = &record.metadata_json {
            query = query.bind(metadata_json);
        }
        query.execute(&mut self.conn).await.map(|_| ())
    }

    async fn ensure_partition(&mut self, key: &PartitionKey) -> EnsureOutcome {
        partition::ensure_partition(&mut self.conn, key).await
    }
}

/// Loader bound to one warehouse store.
///
/// Each worker owns exactly one loader (and thus one connection) for its
/// lifetime; nothing here is shared across workers.
pub struct PartitionedLoader<S = PgPartitionStore> {
    store: S,
    partitioning: Partitioning,
    race_backoff: Duration,
}

impl PartitionedLoader {
    pub fn new(conn: PgConnection, partitioning: Partitioning, race_backoff: Duration) -> Self {
        Self::with_store(PgPartitionStore { conn }, partitioning, race_backoff)
    }
}

impl<S: PartitionStore> PartitionedLoader<S> {
    fn with_store(store: S, partitioning: Partitioning, race_backoff: Duration) -> Self {
        Self {
            store,
            partitioning,
            race_backoff,
        }
    }
}

impl<S: PartitionStore> RecordLoader for PartitionedLoader<S> {
    /// Inserts one record, creating its partition on demand.
    ///
    /// The key is recomputed per record (never cached), since the UTC day
    /// can roll over between records of one batch.
    async fn load(&mut self, record: &MetricRecord) -> Result<(), LoadError> {
        let key = self
            .partitioning
            .key_for(&record.plugin, &record.type_name, record.time)?;
        let table = key.table_name();
        sql::validate_identifier(&table).map_err(|source| LoadError::UnsafePartitionName {
            table: table.clone(),
            source,
        })?;

        let record = EncodedRecord::encode(record, &table)?;
        let statement = sql::insert_record(&table, record.metadata_json.is_some());

        let err = match self.store.insert(&statement, &record).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !is_missing_partition(&err) {
            return Err(LoadError::Insert { table, source: err });
        }

        // The partition does not exist yet; create it and retry once. If the
        // create fails we likely lost the race, so give the winner's
        // transaction time to commit before the retry. The retry can still
        // fail (the backoff is no guarantee) and is then reported, not
        // swallowed.
        match self.store.ensure_partition(&key).await {
            EnsureOutcome::Created => self
                .store
                .insert(&statement, &record)
                .await
                .map_err(|source| LoadError::InsertAfterCreate { table, source }),
            EnsureOutcome::AlreadyExists => {
                tokio::time::sleep(self.race_backoff).await;
                self.store
                    .insert(&statement, &record)
                    .await
                    .map_err(|source| LoadError::InsertAfterBackoff { table, source })
            }
        }
    }
}

/// A record with its array fields pre-encoded for binding.
pub struct EncodedRecord<'a> {
    inner: &'a MetricRecord,
    dsnames_json: String,
    dstypes_json: String,
    values_json: String,
    metadata_json: Option<String>,
}

impl<'a> EncodedRecord<'a> {
    fn encode(inner: &'a MetricRecord, table: &str) -> Result<Self, LoadError> {
        let encode_err = |source| LoadError::EncodeArrays {
            table: table.to_string(),
            source,
        };
        Ok(Self {
            inner,
            dsnames_json: serde_json::to_string(&inner.dsnames).map_err(encode_err)?,
            dstypes_json: serde_json::to_string(&inner.dstypes).map_err(encode_err)?,
            values_json: serde_json::to_string(&inner.values).map_err(encode_err)?,
            metadata_json: inner
                .metadata
                .as_ref()
                .map(|metadata| serde_json::to_string(metadata))
                .transpose()
                .map_err(encode_err)?,
        })
    }
}

fn is_missing_partition(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.code().is_some_and(|code| code.as_ref() == UNDEFINED_TABLE)
    )
}
