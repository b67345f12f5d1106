//! Decoding of queue payloads into metric records.
//!
//! A queue payload is a JSON array of record objects in the collectd write
//! format. The whole batch is decoded up front; a payload that fails to
//! decode is discarded (the queue entry is already consumed by the pop, so
//! there is nothing to retry against).

use std::collections::BTreeMap;

use serde::Deserialize;

/// One measurement element of a queue batch.
///
/// `dsnames`, `dstypes` and `values` are parallel arrays describing the data
/// sources of the measured type; they are carried through to the warehouse
/// as-is and exploded server-side.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetricRecord {
    pub plugin: String,
    #[serde(default)]
    pub plugin_instance: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub type_instance: Option<String>,
    pub host: String,
    /// Unix seconds.
    pub time: i64,
    /// Collection interval in seconds.
    pub interval: i64,
    pub dsnames: Vec<String>,
    pub dstypes: Vec<String>,
    pub values: Vec<serde_json::Number>,
    /// Plugin-specific metadata, present only for some plugins.
    #[serde(default, rename = "meta")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Errors that occur when decoding a queue payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not a JSON array of record objects, or an element is
    /// missing a required field.
    #[error("queue payload is not a JSON array of metric records")]
    MalformedPayload {
        #[source]
        source: serde_json::Error,
    },
}

/// Decodes one queue payload into an in-order batch of records.
///
/// Some queue clients wrap the stored string in an extra leading double
/// quote; a single leading `"` is skipped for compatibility with that
/// encoding before parsing.
pub fn decode_batch(payload: &str) -> Result<Vec<MetricRecord>, DecodeError> {
    let payload = payload.strip_prefix('"').unwrap_or(payload);
    serde_json::from_str(payload).map_err(|source| DecodeError::MalformedPayload { source })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPU_BATCH: &str = r#"[{"plugin":"cpu","type":"cpu","host":"h1","time":1700000000,
        "interval":10,"dsnames":["value"],"dstypes":["derive"],"values":[42]}]"#;

    #[test]
    fn decodes_minimal_record() {
        let records = decode_batch(CPU_BATCH).unwrap();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.plugin, "cpu");
        assert_eq!(record.type_name, "cpu");
        assert_eq!(record.host, "h1");
        assert_eq!(record.time, 1700000000);
        assert_eq!(record.interval, 10);
        assert_eq!(record.dsnames, vec!["value"]);
        assert_eq!(record.dstypes, vec!["derive"]);
        assert_eq!(record.values.len(), 1);
        assert_eq!(record.plugin_instance, None);
        assert_eq!(record.type_instance, None);
        assert_eq!(record.metadata, None);
    }

    #[test]
    fn decodes_optional_fields_and_meta() {
        let payload = r#"[{"plugin":"postgresql","plugin_instance":"main","type":"backends",
            "type_instance":"active","host":"db1","time":1700000000,"interval":60,
            "dsnames":["count"],"dstypes":["gauge"],"values":[7.5],
            "meta":{"database":"prod","schema":"public"}}]"#;

        let records = decode_batch(payload).unwrap();
        let record = &records[0];
        assert_eq!(record.plugin_instance.as_deref(), Some("main"));
        assert_eq!(record.type_instance.as_deref(), Some("active"));

        let meta = record.metadata.as_ref().unwrap();
        assert_eq!(meta.get("database").map(String::as_str), Some("prod"));
        assert_eq!(meta.get("schema").map(String::as_str), Some("public"));
    }

    #[test]
    fn strips_leading_quote_artifact() {
        let payload = format!("\"{CPU_BATCH}");
        let records = decode_batch(&payload).unwrap();
        assert_eq!(records[0].plugin, "cpu");
    }

    #[test]
    fn rejects_non_array_payload() {
        assert!(decode_batch("{\"plugin\":\"cpu\"}").is_err());
        assert!(decode_batch("not json at all").is_err());
    }

    #[test]
    fn rejects_record_missing_required_field() {
        // No "host".
        let payload = r#"[{"plugin":"cpu","type":"cpu","time":1700000000,"interval":10,
            "dsnames":["value"],"dstypes":["derive"],"values":[42]}]"#;
        assert!(decode_batch(payload).is_err());
    }

    #[test]
    fn preserves_batch_order() {
        let payload = r#"[
            {"plugin":"cpu","type":"cpu","host":"a","time":1,"interval":10,
             "dsnames":[],"dstypes":[],"values":[]},
            {"plugin":"memory","type":"memory","host":"b","time":2,"interval":10,
             "dsnames":[],"dstypes":[],"values":[]}
        ]"#;
        let records = decode_batch(payload).unwrap();
        assert_eq!(records[0].plugin, "cpu");
        assert_eq!(records[1].plugin, "memory");
    }
}
