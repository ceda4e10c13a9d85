//! Record decoding
//!
//! Every record in a batch or on the change feed is decoded on its own, so a
//! single malformed record is logged and skipped instead of failing the batch.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::DataError;
use super::types::{ChangeEvent, ChangeTable, Record, SessionRecord, SpanRecord, TraceRecord};

/// Decode and validate a single record
pub fn decode_record<R>(value: Value) -> Result<R, DataError>
where
    R: Record + DeserializeOwned,
{
    let record: R =
        serde_json::from_value(value).map_err(|e| DataError::decode(R::TABLE, e.to_string()))?;
    record
        .validate()
        .map_err(|reason| DataError::decode(R::TABLE, reason))?;
    Ok(record)
}

/// Decode a batch, skipping (and logging) malformed records
pub fn decode_batch<R>(values: Vec<Value>) -> Vec<R>
where
    R: Record + DeserializeOwned,
{
    let total = values.len();
    let records: Vec<R> = values
        .into_iter()
        .filter_map(|value| match decode_record::<R>(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, table = %R::TABLE, "Skipping malformed record");
                None
            }
        })
        .collect();

    if records.len() < total {
        tracing::debug!(
            table = %R::TABLE,
            kept = records.len(),
            skipped = total - records.len(),
            "Decoded batch with skipped records"
        );
    }
    records
}

/// Decode a change-feed event by its event name.
///
/// Returns `Ok(None)` for event names that do not carry a record
/// (keep-alives, server notices).
pub fn decode_change(event: &str, data: &str) -> Result<Option<ChangeEvent>, DataError> {
    let Some(table) = ChangeTable::parse(event) else {
        return Ok(None);
    };
    let value: Value =
        serde_json::from_str(data).map_err(|e| DataError::decode(table, e.to_string()))?;

    let change = match table {
        ChangeTable::Span => ChangeEvent::Span(decode_record::<SpanRecord>(value)?),
        ChangeTable::Trace => ChangeEvent::Trace(decode_record::<TraceRecord>(value)?),
        ChangeTable::Session => ChangeEvent::Session(decode_record::<SessionRecord>(value)?),
    };
    Ok(Some(change))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_batch_skips_malformed() {
        let spans: Vec<SpanRecord> = decode_batch(vec![
            json!({"id": "s1", "trace_id": "t1", "duration_ms": 10}),
            json!({"trace_id": "t1"}),
            json!({"id": "s3", "duration_ms": -4}),
            json!("not an object"),
            json!({"id": "s5", "status": "error"}),
        ]);
        let ids: Vec<_> = spans.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s5"]);
    }

    #[test]
    fn test_decode_record_unknown_status_is_decode_error() {
        let err = decode_record::<SpanRecord>(json!({"id": "s1", "status": "exploded"}))
            .unwrap_err();
        assert!(matches!(
            err,
            DataError::Decode {
                table: ChangeTable::Span,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_change_by_event_name() {
        let change = decode_change("session", r#"{"id": "c1", "source": "pos"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(change.table(), ChangeTable::Session);
        assert_eq!(change.id(), "c1");
    }

    #[test]
    fn test_decode_change_ignores_other_events() {
        assert_eq!(decode_change("ping", "{}").unwrap(), None);
        assert_eq!(decode_change("message", "hello").unwrap(), None);
    }

    #[test]
    fn test_decode_change_bad_json() {
        let err = decode_change("trace", "{not json").unwrap_err();
        assert!(matches!(
            err,
            DataError::Decode {
                table: ChangeTable::Trace,
                ..
            }
        ));
    }
}
