//! Partition naming and on-demand partition creation.
//!
//! Records land in per-plugin, per-UTC-day child tables of the parent
//! `value_list` relation. Partitions are created lazily by whichever worker
//! first inserts into a missing one. Creation is expected to race across
//! workers (and across independently started instances of the service); the
//! warehouse's uniqueness of table names is the only arbiter, so a failed
//! creation is reported as [`EnsureOutcome::AlreadyExists`] and never
//! propagated as a caller-visible error.

use std::collections::BTreeSet;

use chrono::{DateTime, Days, NaiveDate};
use monitoring::logging;
use sqlx::{Connection, PgConnection};
use tracing::{debug, info, warn};

use crate::sql;

/// SQLSTATE for `duplicate_table`, the signature of a lost creation race.
const DUPLICATE_TABLE: &str = "42P07";

/// Identity of one partition: a plugin, a UTC calendar day, and, for plugins
/// partitioned further by type, the type.
///
/// Derived from a record; the same plugin/type/timestamp always maps to the
/// same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKey {
    pub plugin: String,
    pub day: NaiveDate,
    pub type_partition: Option<String>,
}

impl PartitionKey {
    /// Partition table name: `vl_<plugin>_<YYYYMMDD>[_<type>]`.
    pub fn table_name(&self) -> String {
        let day = self.day.format("%Y%m%d");
        match &self.type_partition {
            Some(type_name) => format!("vl_{}_{}_{}", self.plugin, day, type_name),
            None => format!("vl_{}_{}", self.plugin, day),
        }
    }

    fn day_bounds(&self) -> (String, String) {
        // `day + 1` cannot overflow for any date reachable from an i64 unix
        // timestamp accepted by from_timestamp.
        let next = self.day.checked_add_days(Days::new(1)).unwrap_or(self.day);
        (
            self.day.format("%Y-%m-%d").to_string(),
            next.format("%Y-%m-%d").to_string(),
        )
    }
}

/// The record timestamp does not map to a representable UTC date.
#[derive(Debug, thiserror::Error)]
#[error("timestamp {timestamp} is outside the representable UTC date range")]
pub struct TimestampOutOfRange {
    pub timestamp: i64,
}

/// Maps records to partition keys.
///
/// The set of plugins that get per-type sub-partitions is configuration; the
/// reference deployment sub-partitions only `postgresql`, whose `type`
/// cardinality is high enough to warrant isolation.
#[derive(Debug, Clone)]
pub struct Partitioning {
    type_partitioned: BTreeSet<String>,
}

impl Partitioning {
    pub fn new(type_partitioned: impl IntoIterator<Item = String>) -> Self {
        Self {
            type_partitioned: type_partitioned.into_iter().collect(),
        }
    }

    /// Derives the partition key for a plugin/type/timestamp triple.
    ///
    /// Pure; called before every insert attempt rather than cached, since
    /// the UTC day can roll over mid-stream.
    pub fn key_for(
        &self,
        plugin: &str,
        type_name: &str,
        timestamp: i64,
    ) -> Result<PartitionKey, TimestampOutOfRange> {
        let day = DateTime::from_timestamp(timestamp, 0)
            .ok_or(TimestampOutOfRange { timestamp })?
            .date_naive();
        let type_partition = self
            .type_partitioned
            .contains(plugin)
            .then(|| type_name.to_string());
        Ok(PartitionKey {
            plugin: plugin.to_string(),
            day,
            type_partition,
        })
    }
}

impl Default for Partitioning {
    fn default() -> Self {
        Self::new(["postgresql".to_string()])
    }
}

/// One index of a partition's plugin-specific index plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSpec {
    /// Plain index over the named columns.
    Columns(&'static [&'static str]),
    /// Partial index over one hstore metadata key, limited to rows where the
    /// key is present.
    MetadataKey(&'static str),
}

/// Index every partition gets regardless of plugin.
const HOST_INDEX: IndexSpec = IndexSpec::Columns(&["host"]);

const DEFAULT_PLAN: &[IndexSpec] = &[IndexSpec::Columns(&["time", "host"])];

/// Plugin-specific index plan for a new partition.
///
/// Static lookup keyed by plugin name with a default fallback. The `(host)`
/// index from [`HOST_INDEX`] is appended to every plan at creation time.
pub fn index_plan(plugin: &str) -> &'static [IndexSpec] {
    match plugin {
        "cpu" => &[IndexSpec::Columns(&[
            "time",
            "host",
            "type_instance",
            "plugin_instance",
        ])],
        "postgresql" => &[
            IndexSpec::Columns(&["time", "host"]),
            IndexSpec::MetadataKey("database"),
            IndexSpec::MetadataKey("schema"),
            IndexSpec::MetadataKey("table"),
            IndexSpec::MetadataKey("index"),
        ],
        "memory" | "vmem" => &[IndexSpec::Columns(&["time", "host"])],
        _ => DEFAULT_PLAN,
    }
}

/// Outcome of a partition creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// This worker created the partition.
    Created,
    /// The creation transaction failed, most commonly because a concurrent
    /// worker created the table first. The caller proceeds as if the
    /// partition already exists.
    AlreadyExists,
}

/// Creates the partition table for `key`, with its CHECK constraints and
/// plugin index plan, in a single transaction.
///
/// Losing a race is the expected failure mode here: the whole transaction is
/// rolled back (no partially applied DDL) and the loss is reported as
/// [`EnsureOutcome::AlreadyExists`]. This function never returns an error to
/// its caller.
pub async fn ensure_partition(conn: &mut PgConnection, key: &PartitionKey) -> EnsureOutcome {
    let table = key.table_name();
    match create_partition(conn, &table, key).await {
        Ok(()) => {
            info!(table = %table, plugin = %key.plugin, "partition_created");
            EnsureOutcome::Created
        }
        Err(err) if is_duplicate_table(&err) => {
            debug!(table = %table, "partition_create_race_lost");
            EnsureOutcome::AlreadyExists
        }
        Err(err) => {
            warn!(
                table = %table,
                error = %err, error_source = logging::error_source(&err),
                "partition_create_failed"
            );
            EnsureOutcome::AlreadyExists
        }
    }
}

async fn create_partition(
    conn: &mut PgConnection,
    table: &str,
    key: &PartitionKey,
) -> Result<(), sqlx::Error> {
    let (day_start, day_end) = key.day_bounds();

    let mut tx = conn.begin().await?;

    let ddl = sql::create_partition_table(table, &day_start, &day_end, &key.plugin);
    sqlx::query(&ddl).execute(&mut *tx).await?;

    // Additional CHECK constraint for constraint exclusion by type.
    if let Some(type_name) = &key.type_partition {
        sqlx::query(&sql::add_type_check(table, type_name))
            .execute(&mut *tx)
            .await?;
    }

    for spec in index_plan(&key.plugin).iter().chain([&HOST_INDEX]) {
        let ddl = match spec {
            IndexSpec::Columns(columns) => sql::create_index(table, columns),
            IndexSpec::MetadataKey(metadata_key) => sql::create_metadata_index(table, metadata_key),
        };
        sqlx::query(&ddl).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(())
}

fn is_duplicate_table(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.code().is_some_and(|code| code.as_ref() == DUPLICATE_TABLE)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_partitioning() -> Partitioning {
        Partitioning::default()
    }

    #[test]
    fn names_plain_plugin_partition() {
        // 1700000000 is 2023-11-14 UTC.
        let key = default_partitioning()
            .key_for("cpu", "cpu", 1700000000)
            .unwrap();
        assert_eq!(key.table_name(), "vl_cpu_20231114");
        assert_eq!(key.type_partition, None);
    }

    #[test]
    fn names_type_partitioned_plugin() {
        let key = default_partitioning()
            .key_for("postgresql", "backends", 1700000000)
            .unwrap();
        assert_eq!(key.table_name(), "vl_postgresql_20231114_backends");
        assert_eq!(key.type_partition.as_deref(), Some("backends"));
    }

    #[test]
    fn naming_is_deterministic_within_a_day() {
        let partitioning = default_partitioning();
        // Same UTC day, different seconds.
        let morning = partitioning.key_for("cpu", "cpu", 1699920000).unwrap();
        let evening = partitioning.key_for("cpu", "cpu", 1700000000).unwrap();
        assert_eq!(morning, evening);
        assert_eq!(morning.table_name(), evening.table_name());
    }

    #[test]
    fn day_rollover_switches_partition() {
        let partitioning = default_partitioning();
        // 86399 is the last second of 1970-01-01, 86400 the first of 01-02.
        let before = partitioning.key_for("cpu", "cpu", 86399).unwrap();
        let after = partitioning.key_for("cpu", "cpu", 86400).unwrap();
        assert_eq!(before.table_name(), "vl_cpu_19700101");
        assert_eq!(after.table_name(), "vl_cpu_19700102");
    }

    #[test]
    fn day_bounds_are_half_open_consecutive_days() {
        let key = default_partitioning()
            .key_for("cpu", "cpu", 1700000000)
            .unwrap();
        assert_eq!(
            key.day_bounds(),
            ("2023-11-14".to_string(), "2023-11-15".to_string())
        );
    }

    #[test]
    fn type_partitioned_set_is_configurable() {
        let partitioning = Partitioning::new(["cpu".to_string()]);
        let key = partitioning.key_for("cpu", "idle", 1700000000).unwrap();
        assert_eq!(key.table_name(), "vl_cpu_20231114_idle");

        let key = partitioning
            .key_for("postgresql", "backends", 1700000000)
            .unwrap();
        assert_eq!(key.table_name(), "vl_postgresql_20231114");
    }

    #[test]
    fn rejects_unrepresentable_timestamp() {
        let err = default_partitioning()
            .key_for("cpu", "cpu", i64::MAX)
            .unwrap_err();
        assert_eq!(err.timestamp, i64::MAX);
    }

    #[test]
    fn index_plans_per_plugin() {
        assert_eq!(
            index_plan("cpu"),
            &[IndexSpec::Columns(&[
                "time",
                "host",
                "type_instance",
                "plugin_instance"
            ])]
        );
        assert_eq!(index_plan("memory"), DEFAULT_PLAN);
        assert_eq!(index_plan("vmem"), DEFAULT_PLAN);
        assert_eq!(index_plan("unknown_plugin"), DEFAULT_PLAN);

        let postgresql = index_plan("postgresql");
        assert_eq!(postgresql.len(), 5);
        assert_eq!(postgresql[0], IndexSpec::Columns(&["time", "host"]));
        for (spec, key) in postgresql[1..]
            .iter()
            .zip(["database", "schema", "table", "index"])
        {
            assert_eq!(*spec, IndexSpec::MetadataKey(key));
        }
    }
}
