use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Named SSE channel the booking service may publish updates on.
pub const BOOKING_UPDATED_CHANNEL: &str = "BOOKING_UPDATED";
/// Channel name SSE assigns to frames without an `event:` field.
pub const DEFAULT_CHANNEL: &str = "message";

const HANDSHAKE_TYPE: &str = "connected";

/// One booking update as delivered on the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingEvent {
    pub event_class: String,
    pub event_id: String,
    pub booking_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// A decoded `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Server acknowledgement sent when the subscription opens.
    Handshake { message: Option<String> },
    Booking(BookingEvent),
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("frame is not valid json: {0}")]
    Json(#[source] serde_json::Error),

    #[error("frame is not a booking event: {0}")]
    NotABookingEvent(#[source] serde_json::Error),
}

/// Decodes the payload of a single `data:` line.
///
/// Payloads whose `type` field is `"connected"` are handshakes and never
/// become booking events.
pub fn decode_frame(payload: &str) -> Result<StreamFrame, FrameDecodeError> {
    let value: Value = serde_json::from_str(payload).map_err(FrameDecodeError::Json)?;

    if value.get("type").and_then(Value::as_str) == Some(HANDSHAKE_TYPE) {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(StreamFrame::Handshake { message });
    }

    serde_json::from_value(value)
        .map(StreamFrame::Booking)
        .map_err(FrameDecodeError::NotABookingEvent)
}

/// Body of a publish call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishRequest {
    pub event_id: String,
    pub transaction_id: String,
    pub updated_at: DateTime<Utc>,
    pub user_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl PublishRequest {
    /// Builds a request stamped with fresh identifiers and the current time.
    ///
    /// Identifiers are UUIDv7 values, which are time-ordered and unique for
    /// the lifetime of the process. `metadata` carries the provenance keys
    /// `source` and `triggered_at`.
    pub fn fresh(user_id: impl Into<String>, source: &str) -> Self {
        let now = Utc::now();
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), Value::String(source.to_string()));
        metadata.insert(
            "triggered_at".to_string(),
            Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );

        Self {
            event_id: format!("evt-{}", Uuid::now_v7()),
            transaction_id: format!("txn-{}", Uuid::now_v7()),
            updated_at: now,
            user_id: user_id.into(),
            metadata,
        }
    }

    /// Adds or replaces one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
