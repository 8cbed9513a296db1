use super::Pipeline;
use crate::config::ConnectionConfig;
use crate::queue::QueueItem;
use crate::status::{mask_secret, StatusEvent};
use crate::submit::SubmitResponse;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

const HTTP_UNPROCESSABLE_ENTITY: u16 = 422;

enum Outcome {
    Delivered(SubmitResponse),
    Rejected(SubmitResponse),
    Failed {
        http_status: Option<u16>,
        response_text: Option<String>,
        message: String,
    },
}

/// Wire body: credentials, timestamp and the item's fields. The client tag stays local.
pub(crate) fn build_payload(config: &ConnectionConfig, item: &QueueItem) -> Value {
    let mut body = Map::new();
    body.insert("api_key".to_string(), Value::from(config.api_key.as_str()));
    body.insert("site_fid".to_string(), Value::from(config.site_fid.as_str()));
    body.insert(
        "datapoint_ts".to_string(),
        Value::from(item.datapoint_ts.as_str()),
    );
    for (name, value) in &item.fields {
        body.insert(name.clone(), Value::from(*value));
    }
    Value::Object(body)
}

fn mask_payload(payload: &Value) -> Value {
    let mut masked = payload.clone();
    if let Some(body) = masked.as_object_mut() {
        let key = body.get("api_key").and_then(Value::as_str).map(str::to_string);
        body.insert(
            "api_key".to_string(),
            mask_secret(key.as_deref()).map(Value::from).unwrap_or(Value::Null),
        );
    }
    masked
}

impl Pipeline {
    /// Delivers queued items newest-first, at most `max_send_per_tick` per call.
    /// Never fails; every outcome lands in the delivery status.
    pub async fn drain(&mut self, reason: &str) {
        if let Some(problem) = self.configuration_problem() {
            let now = self.deps.clock.now();
            tracing::warn!(connection = %self.config.id, reason, problem, "delivery not configured");
            self.status.last_error_utc = Some(now);
            self.status.last_error_message = Some(problem.to_string());
            self.outage.mark_failure(problem, now);
            self.publish_status();
            return;
        }

        self.trim_queue();
        let cap = self.config.max_send_per_tick;
        if cap == 0 {
            tracing::debug!(connection = %self.config.id, "max_send_per_tick is 0; holding queue");
            self.publish_status();
            return;
        }

        let mut processed = 0;
        while processed < cap {
            let Some(item) = self.queue.peek_newest() else {
                break;
            };
            let payload = build_payload(&self.config, item);
            let attempt_at = self.deps.clock.now();
            if !self.attempt(&payload, attempt_at).await {
                break;
            }
            processed += 1;
        }

        tracing::debug!(
            connection = %self.config.id,
            reason,
            processed,
            remaining = self.queue.len(),
            "drain finished"
        );
        if self.queue.is_empty() && !self.outage.is_open() {
            self.outage.clear_advisory();
        }
        self.publish_status();
    }

    /// Submits the newest item; returns whether draining may continue.
    async fn attempt(&mut self, payload: &Value, now: DateTime<Utc>) -> bool {
        let masked = mask_payload(payload);
        self.deps.sink.emit(StatusEvent::PayloadPrepared {
            connection_id: self.config.id.clone(),
            payload: masked.clone(),
        });
        self.status.last_payload_masked = Some(masked);
        self.status.last_attempt_utc = Some(now);

        let outcome = match self.submitter.submit(payload).await {
            Ok(response) if response.is_success() => Outcome::Delivered(response),
            Ok(response) if response.status == HTTP_UNPROCESSABLE_ENTITY => {
                Outcome::Rejected(response)
            }
            Ok(response) => Outcome::Failed {
                message: format!("HTTP {}: {}", response.status, response.text),
                http_status: Some(response.status),
                response_text: Some(response.text),
            },
            Err(err) => Outcome::Failed {
                http_status: None,
                response_text: None,
                message: err.to_string(),
            },
        };

        match outcome {
            Outcome::Delivered(response) => {
                self.queue.pop_newest();
                self.status.last_success_utc = Some(now);
                self.status.last_http_status = Some(response.status);
                self.status.last_response_text = Some(response.text);
                self.status.last_error_utc = None;
                self.status.last_error_message = None;
                self.outage.mark_success();
                self.emit_result(true, Some(response.status), None);
                true
            }
            Outcome::Rejected(response) => {
                self.queue.pop_newest();
                let reason = format!("HTTP 422: {}", response.text);
                tracing::warn!(connection = %self.config.id, %reason, "item rejected; dropped");
                self.status.dropped_invalid += 1;
                self.status.last_drop_reason = Some(reason.clone());
                self.status.last_http_status = Some(response.status);
                self.status.last_response_text = Some(response.text);
                self.emit_result(false, Some(response.status), Some(reason));
                true
            }
            Outcome::Failed {
                http_status,
                response_text,
                message,
            } => {
                self.status.last_error_utc = Some(now);
                self.status.last_error_message = Some(message.clone());
                self.status.last_http_status = http_status;
                self.status.last_response_text = response_text;
                self.outage.mark_failure(&message, now);
                self.emit_result(false, http_status, Some(message));
                false
            }
        }
    }

    fn emit_result(&self, success: bool, http_status: Option<u16>, error: Option<String>) {
        self.deps.sink.emit(StatusEvent::DeliveryResult {
            connection_id: self.config.id.clone(),
            success,
            http_status,
            error,
        });
    }

    fn configuration_problem(&self) -> Option<&'static str> {
        if self.config.base_url.is_empty() {
            Some("base_url is not configured")
        } else if !self.config.has_credentials() {
            Some("api_key or site_fid is not configured")
        } else {
            None
        }
    }
}
