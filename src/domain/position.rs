use crate::error::PositionError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

/// Last known playback offset of one video.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub video_id: String,
    /// Seconds, always finite and >= 0
    pub position: f64,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_verified_at: Option<DateTime<Utc>>,
    /// Advisory count of bound player instances
    pub active_session_count: u32,
}

impl PositionRecord {
    pub fn new(video_id: &str) -> Self {
        Self {
            video_id: video_id.to_string(),
            position: 0.0,
            last_saved_at: None,
            last_verified_at: None,
            active_session_count: 0,
        }
    }
}

/// Clamp a position to a finite, non-negative number of seconds.
pub fn clamp_position(position: f64) -> f64 {
    if position.is_finite() && position >= 0.0 {
        position
    } else {
        warn!(position, "Clamping invalid position to 0");
        0.0
    }
}

fn valid_position(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .filter(|position| position.is_finite() && *position >= 0.0)
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Decode one table entry. Accepts a bare number or an object carrying
/// `position` (or a numeric `lastSaved`). Anything else reads as absent.
fn decode_entry(video_id: &str, value: &Value) -> Option<PositionRecord> {
    let mut record = PositionRecord::new(video_id);
    match value {
        Value::Number(_) => {
            record.position = valid_position(value)?;
        }
        Value::Object(fields) => {
            record.position = fields
                .get("position")
                .or_else(|| fields.get("lastSaved").filter(|v| v.is_number()))
                .and_then(valid_position)?;
            record.last_saved_at = timestamp(fields.get("lastSaved"));
            record.last_verified_at = timestamp(fields.get("lastVerified"));
        }
        _ => return None,
    }
    Some(record)
}

/// Parse the namespaced position table.
///
/// Malformed entries are skipped; a payload that is not a JSON object at
/// all is an error so the caller can fall back to an empty table.
pub fn decode_table(raw: &str) -> Result<HashMap<String, PositionRecord>, PositionError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(entries) = value else {
        return Err(PositionError::StorageUnavailable(
            "position table is not a JSON object".to_string(),
        ));
    };

    let mut table = HashMap::with_capacity(entries.len());
    for (video_id, entry) in &entries {
        match decode_entry(video_id, entry) {
            Some(record) => {
                table.insert(video_id.clone(), record);
            }
            None => warn!(video_id = %video_id, "Skipping malformed position entry"),
        }
    }
    Ok(table)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntry {
    position: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_saved: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_verified: Option<DateTime<Utc>>,
    session_count: u32,
}

/// Serialize records into the namespaced position table.
pub fn encode_table<'a, I>(records: I) -> Result<String, PositionError>
where
    I: IntoIterator<Item = &'a PositionRecord>,
{
    let mut table = Map::new();
    for record in records {
        let entry = StoredEntry {
            position: record.position,
            last_saved: record.last_saved_at,
            last_verified: record.last_verified_at,
            session_count: record.active_session_count,
        };
        table.insert(record.video_id.clone(), serde_json::to_value(entry)?);
    }
    Ok(serde_json::to_string(&Value::Object(table))?)
}
