//! Change-feed records and their decoding into block keys.
//!
//! Decoding is a pure projection: a record either yields a typed
//! [`BlockKey`], is ignored (not an insertion), or fails to decode. Records
//! that fail are dropped individually; a bad record never sinks its batch.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::BlockRef;

/// Identity of an inserted block as carried by the feed.
pub type BlockKey = BlockRef;

/// The event type that announces a new block.
pub const INSERT_EVENT: &str = "INSERT";

/// One record of a change-feed notification batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    #[serde(default, alias = "eventName")]
    pub event_type: Option<String>,
    #[serde(default, alias = "keys")]
    pub block_key: Option<serde_json::Value>,
}

/// A decoded feed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Insert(BlockKey),
    /// Any event other than an insertion (updates, removals).
    Ignored { event_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedDecodeError {
    #[error("record has no event type")]
    MissingEventType,
    #[error("insert record has no block key")]
    MissingKey,
    #[error("invalid block key: {0}")]
    InvalidKey(String),
}

impl FeedRecord {
    pub fn insert(key: &BlockKey) -> Self {
        Self {
            event_type: Some(INSERT_EVENT.to_string()),
            block_key: serde_json::to_value(key).ok(),
        }
    }

    /// Lenient conversion: anything that is not a record-shaped object
    /// becomes an empty record, which then fails [`FeedRecord::decode`].
    pub fn from_value(value: serde_json::Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    pub fn decode(&self) -> Result<FeedEvent, FeedDecodeError> {
        let event_type = self
            .event_type
            .as_deref()
            .ok_or(FeedDecodeError::MissingEventType)?;
        if event_type != INSERT_EVENT {
            return Ok(FeedEvent::Ignored {
                event_type: event_type.to_string(),
            });
        }
        let key = self.block_key.clone().ok_or(FeedDecodeError::MissingKey)?;
        serde_json::from_value::<BlockKey>(key)
            .map(FeedEvent::Insert)
            .map_err(|e| FeedDecodeError::InvalidKey(e.to_string()))
    }
}

/// Parse a JSON array of feed records. Only a non-array document is an
/// error; individual malformed elements come back as empty records.
pub fn parse_batch(json: &str) -> serde_json::Result<Vec<FeedRecord>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(json)?;
    Ok(values.into_iter().map(FeedRecord::from_value).collect())
}

/// The block keys of every well-formed insertion in `records`, in order.
pub fn extract_block_keys(records: &[FeedRecord]) -> Vec<BlockKey> {
    records
        .iter()
        .enumerate()
        .filter_map(|(i, record)| match record.decode() {
            Ok(FeedEvent::Insert(key)) => Some(key),
            Ok(FeedEvent::Ignored { event_type }) => {
                debug!(index = i, %event_type, "ignoring feed record");
                None
            }
            Err(e) => {
                debug!(index = i, error = %e, "dropping malformed feed record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_insert() {
        let record = FeedRecord::from_value(json!({
            "eventType": "INSERT",
            "blockKey": { "hash": "0xabc", "number": 12 }
        }));
        assert_eq!(
            record.decode().unwrap(),
            FeedEvent::Insert(BlockRef::new("0xabc", 12u64))
        );
    }

    #[test]
    fn non_insert_is_ignored() {
        let record = FeedRecord::from_value(json!({
            "eventName": "MODIFY",
            "keys": { "hash": "0xabc", "number": 12 }
        }));
        assert!(matches!(record.decode().unwrap(), FeedEvent::Ignored { .. }));
    }

    #[test]
    fn decode_failures() {
        let no_key = FeedRecord::from_value(json!({ "eventType": "INSERT" }));
        assert_eq!(no_key.decode(), Err(FeedDecodeError::MissingKey));

        let bad_key = FeedRecord::from_value(json!({
            "eventType": "INSERT",
            "blockKey": { "hash": "0xabc" }
        }));
        assert!(matches!(bad_key.decode(), Err(FeedDecodeError::InvalidKey(_))));

        let not_an_object = FeedRecord::from_value(json!(42));
        assert_eq!(not_an_object.decode(), Err(FeedDecodeError::MissingEventType));
    }

    #[test]
    fn malformed_records_do_not_sink_the_batch() {
        let batch = parse_batch(
            r#"[
                {"eventType": "INSERT", "blockKey": {"hash": "0x1", "number": 1}},
                {"eventType": "INSERT"},
                null,
                {"eventType": "REMOVE", "blockKey": {"hash": "0x2", "number": 2}},
                {"eventType": "INSERT", "blockKey": {"hash": "0x3", "number": "0x3"}}
            ]"#,
        )
        .unwrap();
        assert_eq!(batch.len(), 5);

        let keys = extract_block_keys(&batch);
        assert_eq!(
            keys,
            vec![BlockRef::new("0x1", 1u64), BlockRef::new("0x3", 3u64)]
        );
    }

    #[test]
    fn extraction_leaves_input_untouched() {
        let batch = vec![FeedRecord::insert(&BlockRef::new("0x1", 1u64))];
        let before = batch.clone();
        let _ = extract_block_keys(&batch);
        assert_eq!(batch, before);
    }

    #[test]
    fn non_array_batch_is_an_error() {
        assert!(parse_batch(r#"{"eventType": "INSERT"}"#).is_err());
    }
}
