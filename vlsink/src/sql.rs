//! SQL utilities for safe identifier handling and statement building.
//!
//! This module provides:
//! 1. **Validation**: Ensures partition names are safe PostgreSQL identifiers
//! 2. **Quoting**: Properly escapes identifiers and literals
//! 3. **Statement Building**: Helpers for the INSERT and partition DDL shapes
//!
//! # Security Model
//!
//! All SQL identifier handling goes through this module, providing a single
//! auditable boundary for SQL injection prevention:
//!
//! ```text
//! Record fields → validate_identifier() → quote_identifier() → SQL Query
//!                 (sqlparser check)        (pg_escape quoting)
//! ```
//!
//! Row values (host, instances, the JSON-encoded arrays) are never part of a
//! statement string; they are always bound parameters. Only the partition
//! name and the CHECK-constraint literals are interpolated, and those pass
//! through validation/quoting here first. Record fields originate from
//! unauthenticated collectors, so this boundary is load-bearing.

use pg_escape::{quote_identifier, quote_literal};
use sqlparser::{dialect::PostgreSqlDialect, parser::Parser};

/// Parent relation every day partition inherits from.
pub const PARENT_TABLE: &str = "value_list";

/// Errors that occur during SQL identifier validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidateIdentifierError {
    /// Identifier is empty
    #[error("Identifier cannot be empty")]
    Empty,

    /// Identifier exceeds PostgreSQL's 63-byte limit
    #[error("Identifier exceeds PostgreSQL limit of 63 bytes (got {length})")]
    TooLong { length: usize },

    /// Identifier contains invalid characters
    #[error("Identifier contains invalid character: '{character}'")]
    InvalidCharacter { character: char },

    /// Identifier must start with letter or underscore
    #[error("Identifier must start with letter or underscore, got '{first_char}'")]
    InvalidFirstCharacter { first_char: char },

    /// Identifier failed SQL parser validation
    #[error("Not a valid SQL identifier: {reason}")]
    ParserError { reason: String },

    /// Identifier parsed as multiple SQL statements (injection attempt)
    #[error("Identifier parsed as multiple SQL statements")]
    MultipleStatements,
}

/// Validate that a string is a safe PostgreSQL identifier.
///
/// This function validates that:
/// 1. The name parses successfully as a SQL identifier (via sqlparser)
/// 2. It's a simple, unqualified identifier (no dots for schema.table)
/// 3. It doesn't require quoting (no special characters)
/// 4. It doesn't exceed PostgreSQL's 63-byte limit
///
/// Partition names embed record-supplied plugin and type strings, so every
/// name is validated before it reaches a statement.
pub fn validate_identifier(name: &str) -> Result<(), ValidateIdentifierError> {
    // Check empty
    if name.is_empty() {
        return Err(ValidateIdentifierError::Empty);
    }

    // Check PostgreSQL length limit (63 bytes for identifiers)
    if name.len() > 63 {
        return Err(ValidateIdentifierError::TooLong { length: name.len() });
    }

    // Reject names that would require quoting or contain problematic characters
    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '_' && ch != '$' {
            return Err(ValidateIdentifierError::InvalidCharacter { character: ch });
        }
    }

    // First character must be letter or underscore (PostgreSQL rule)
    let first_char = name.chars().next().unwrap(); // Safe: we checked for empty above
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ValidateIdentifierError::InvalidFirstCharacter { first_char });
    }

    // Use sqlparser to validate that this is a valid SQL identifier.
    // This catches edge cases and SQL injection attempts.
    let sql = format!("SELECT * FROM {}", name);
    let dialect = PostgreSqlDialect {};

    match Parser::parse_sql(&dialect, &sql) {
        Ok(statements) => {
            if statements.len() != 1 {
                return Err(ValidateIdentifierError::MultipleStatements);
            }
            Ok(())
        }
        Err(e) => Err(ValidateIdentifierError::ParserError {
            reason: e.to_string(),
        }),
    }
}

/// Builds the parameterized single-record INSERT for a partition.
///
/// The three parallel arrays arrive as JSON-encoded text parameters and are
/// exploded server-side; `values` elements are cast to NUMERIC. When
/// `with_metadata` is set, an additional JSON object parameter is decomposed
/// into an hstore column.
///
/// Column names are quoted because `time`, `type` and `values` collide with
/// PostgreSQL keywords.
///
/// Parameter order: `$1` time (unix seconds), `$2` interval, `$3` host,
/// `$4` plugin, `$5` plugin_instance, `$6` type, `$7` type_instance,
/// `$8` dsnames JSON, `$9` dstypes JSON, `$10` values JSON,
/// `$11` metadata JSON (only with `with_metadata`).
pub fn insert_record(table_name: &str, with_metadata: bool) -> String {
    let quoted = quote_identifier(table_name);
    let meta_column = if with_metadata { ", meta" } else { "" };
    let meta_value = if with_metadata {
        ",
        COALESCE((SELECT hstore(array_agg(key), array_agg(value))
                  FROM json_each_text($11::JSON) AS z), ''::hstore)"
    } else {
        ""
    };
    format!(
        r#"INSERT INTO {quoted}
            ("time", "interval", host, plugin, plugin_instance,
             "type", type_instance, dsnames, dstypes, "values"{meta_column})
VALUES (TIMESTAMP WITH TIME ZONE 'EPOCH' + $1 * INTERVAL '1 SECOND',
        $2, $3, $4, $5, $6, $7,
        (SELECT array_agg(a) FROM json_array_elements_text($8::JSON) AS a),
        (SELECT array_agg(a) FROM json_array_elements_text($9::JSON) AS a),
        (SELECT array_agg(a::NUMERIC) FROM json_array_elements_text($10::JSON) AS a){meta_value})"#
    )
}

/// Builds the CREATE TABLE for a day partition.
///
/// The partition is bounded by the half-open UTC day interval
/// `[day_start, day_end)` and constrained to its plugin, and inherits the
/// parent relation so constraint exclusion keeps parent-side queries
/// planner-friendly. Day bounds are `YYYY-MM-DD` strings.
pub fn create_partition_table(
    table_name: &str,
    day_start: &str,
    day_end: &str,
    plugin: &str,
) -> String {
    let quoted = quote_identifier(table_name);
    let day_start = quote_literal(day_start);
    let day_end = quote_literal(day_end);
    let plugin = quote_literal(plugin);
    format!(
        r#"CREATE TABLE {quoted} (
    CHECK ("time" >= {day_start}::TIMESTAMP AT TIME ZONE 'UTC'
       AND "time" < {day_end}::TIMESTAMP AT TIME ZONE 'UTC'),
    CHECK (plugin = {plugin})
) INHERITS ({PARENT_TABLE})"#
    )
}

/// Builds the extra type CHECK for plugins partitioned by type.
pub fn add_type_check(table_name: &str, type_name: &str) -> String {
    let quoted = quote_identifier(table_name);
    let type_name = quote_literal(type_name);
    format!("ALTER TABLE {quoted} ADD CHECK (\"type\" = {type_name})")
}

/// Builds a plain multi-column index for a partition.
pub fn create_index(table_name: &str, columns: &[&str]) -> String {
    let quoted = quote_identifier(table_name);
    let columns = columns
        .iter()
        .map(|column| quote_identifier(column).to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE INDEX ON {quoted} ({columns})")
}

/// Builds a partial index over one hstore metadata key.
pub fn create_metadata_index(table_name: &str, key: &str) -> String {
    let quoted = quote_identifier(table_name);
    let key = quote_literal(key);
    format!(
        "CREATE INDEX ON {quoted} ((meta -> {key})) WHERE ((meta -> {key}) IS NOT NULL)"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_valid() {
        assert!(validate_identifier("vl_cpu_20231114").is_ok());
        assert!(validate_identifier("vl_postgresql_20231114_backends").is_ok());
        assert!(validate_identifier("_internal").is_ok());
        assert!(validate_identifier("t$ble").is_ok()); // $ is allowed
    }

    #[test]
    fn test_validate_identifier_empty() {
        let err = validate_identifier("").unwrap_err();
        assert!(matches!(err, ValidateIdentifierError::Empty));
    }

    #[test]
    fn test_validate_identifier_too_long() {
        let long_name = "a".repeat(64);
        let err = validate_identifier(&long_name).unwrap_err();
        assert!(matches!(err, ValidateIdentifierError::TooLong { .. }));
    }

    #[test]
    fn test_validate_identifier_invalid_chars() {
        assert!(validate_identifier("vl_cpu-20231114").is_err());
        assert!(validate_identifier("vl cpu").is_err());
        assert!(validate_identifier("vl.cpu").is_err());
        assert!(validate_identifier("vl'cpu").is_err());
        assert!(validate_identifier("vl\"cpu").is_err());
    }

    #[test]
    fn test_validate_identifier_invalid_first_char() {
        let err = validate_identifier("20231114_cpu").unwrap_err();
        assert!(matches!(
            err,
            ValidateIdentifierError::InvalidFirstCharacter { .. }
        ));
    }

    #[test]
    fn test_validate_identifier_sql_injection() {
        assert!(validate_identifier("vl_cpu; DROP TABLE value_list").is_err());
        assert!(validate_identifier("vl_cpu--").is_err());
        assert!(validate_identifier("vl_cpu\"; DROP TABLE value_list; --").is_err());
    }

    #[test]
    fn test_insert_record_binds_all_values() {
        let sql = insert_record("vl_cpu_20231114", false);
        assert!(sql.contains("INSERT INTO"));
        assert!(sql.contains("vl_cpu_20231114"));
        // All record fields are parameters, none interpolated.
        for placeholder in ["$1", "$2", "$3", "$4", "$5", "$6", "$7", "$8", "$9", "$10"] {
            assert!(sql.contains(placeholder), "missing {placeholder} in {sql}");
        }
        assert!(!sql.contains("$11"));
        assert!(sql.contains("json_array_elements_text"));
        assert!(sql.contains("a::NUMERIC"));
        assert!(!sql.contains("meta"));
    }

    #[test]
    fn test_insert_record_with_metadata() {
        let sql = insert_record("vl_postgresql_20231114_backends", true);
        assert!(sql.contains("$11"));
        assert!(sql.contains("meta"));
        assert!(sql.contains("json_each_text"));
        assert!(sql.contains("hstore"));
    }

    #[test]
    fn test_create_partition_table_has_day_and_plugin_checks() {
        let sql = create_partition_table("vl_cpu_20231114", "2023-11-14", "2023-11-15", "cpu");
        assert!(sql.contains("CREATE TABLE"));
        assert!(sql.contains("'2023-11-14'::TIMESTAMP AT TIME ZONE 'UTC'"));
        assert!(sql.contains("'2023-11-15'::TIMESTAMP AT TIME ZONE 'UTC'"));
        assert!(sql.contains("CHECK (plugin = 'cpu')"));
        assert!(sql.contains("INHERITS (value_list)"));
    }

    #[test]
    fn test_create_partition_table_escapes_literals() {
        let sql = create_partition_table("vl_x_20231114", "2023-11-14", "2023-11-15", "x'; drop");
        // quote_literal doubles the embedded quote, defusing the breakout.
        assert!(sql.contains("'x''; drop'"));
    }

    #[test]
    fn test_add_type_check() {
        let sql = add_type_check("vl_postgresql_20231114_backends", "backends");
        assert!(sql.contains("ALTER TABLE"));
        assert!(sql.contains("ADD CHECK (\"type\" = 'backends')"));
    }

    #[test]
    fn test_create_index_quotes_reserved_columns() {
        let sql = create_index("vl_cpu_20231114", &["time", "host"]);
        assert!(sql.contains("CREATE INDEX ON"));
        assert!(sql.contains("\"time\""));
        assert!(sql.contains("host"));
    }

    #[test]
    fn test_create_metadata_index_is_partial() {
        let sql = create_metadata_index("vl_postgresql_20231114_backends", "database");
        assert!(sql.contains("(meta -> 'database')"));
        assert!(sql.contains("WHERE ((meta -> 'database') IS NOT NULL)"));
    }
}
