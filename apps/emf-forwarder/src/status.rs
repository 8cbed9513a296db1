use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryStatus {
    pub last_attempt_utc: Option<DateTime<Utc>>,
    pub last_success_utc: Option<DateTime<Utc>>,
    pub last_error_utc: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub outage_since_utc: Option<DateTime<Utc>>,
    pub last_http_status: Option<u16>,
    pub last_response_text: Option<String>,
    pub queue_len: usize,
    pub dropped_invalid: u64,
    pub dropped_capacity: u64,
    pub last_drop_reason: Option<String>,
    pub last_payload_masked: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    PayloadPrepared {
        connection_id: String,
        payload: Value,
    },
    DeliveryResult {
        connection_id: String,
        success: bool,
        http_status: Option<u16>,
        error: Option<String>,
    },
    StatusSnapshot {
        connection_id: String,
        status: DeliveryStatus,
    },
}

/// Receives pipeline status notifications; fire-and-forget.
pub trait StatusSink: Send + Sync {
    fn emit(&self, event: StatusEvent);
}

pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn emit(&self, event: StatusEvent) {
        match event {
            StatusEvent::PayloadPrepared {
                connection_id,
                payload,
            } => {
                tracing::debug!(connection=%connection_id, %payload, "submitting payload");
            }
            StatusEvent::DeliveryResult {
                connection_id,
                success: true,
                http_status,
                ..
            } => {
                tracing::debug!(connection=%connection_id, ?http_status, "delivery succeeded");
            }
            StatusEvent::DeliveryResult {
                connection_id,
                success: false,
                http_status,
                error,
            } => {
                tracing::warn!(
                    connection=%connection_id,
                    ?http_status,
                    error = error.as_deref().unwrap_or(""),
                    "delivery failed"
                );
            }
            StatusEvent::StatusSnapshot {
                connection_id,
                status,
            } => {
                tracing::debug!(
                    connection=%connection_id,
                    queue_len = status.queue_len,
                    outage_since = ?status.outage_since_utc,
                    dropped_invalid = status.dropped_invalid,
                    dropped_capacity = status.dropped_capacity,
                    "status updated"
                );
            }
        }
    }
}

/// Masks all but the last four characters.
pub fn mask_secret(secret: Option<&str>) -> Option<String> {
    let secret = secret.map(str::trim).filter(|s| !s.is_empty())?;
    let len = secret.chars().count();
    if len <= 4 {
        return Some("*".repeat(len));
    }
    let tail: String = secret.chars().skip(len - 4).collect();
    Some(format!("{}{}", "*".repeat(len - 4), tail))
}
