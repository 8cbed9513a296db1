mod drain;
mod outage;


pub use outage::{IssueBoard, IssueRegistry, OutageIssue};

use crate::collector::{ReadingCollector, StateProvider};
use crate::config::{ConnectionConfig, DatapointTsMode};
use crate::queue::DurableQueue;
use crate::scheduler::Clock;
use crate::status::{mask_secret, DeliveryStatus, StatusEvent, StatusSink};
use crate::submit::Submitter;
use chrono::{DateTime, Utc};
use outage::OutageTracker;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Collaborators shared by every connection's pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub provider: Arc<dyn StateProvider>,
    pub sink: Arc<dyn StatusSink>,
    pub issues: Arc<dyn IssueRegistry>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub title: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub site_fid: String,
    pub datapoint_ts_mode: String,
    pub em_power_grid_entity: Option<String>,
    pub fields: BTreeMap<String, String>,
    pub queue_max_len: usize,
    pub max_send_per_tick: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub connection: ConnectionSummary,
    pub status: DeliveryStatus,
    pub advisory: Option<OutageIssue>,
}

/// Per-connection context: owns the queue and delivery status, and is the only thing that mutates them.
pub struct Pipeline {
    config: ConnectionConfig,
    queue: DurableQueue,
    status: DeliveryStatus,
    outage: OutageTracker,
    submitter: Arc<dyn Submitter>,
    deps: PipelineDeps,
}

impl Pipeline {
    pub fn new(
        config: ConnectionConfig,
        queue: DurableQueue,
        submitter: Arc<dyn Submitter>,
        deps: PipelineDeps,
    ) -> Self {
        let outage = OutageTracker::new(&config.id, &config.title, deps.issues.clone());
        let status = DeliveryStatus {
            queue_len: queue.len(),
            ..DeliveryStatus::default()
        };
        tracing::info!(
            connection = %config.id,
            queue_len = queue.len(),
            "pipeline ready"
        );
        Self {
            config,
            queue,
            status,
            outage,
            submitter,
            deps,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Collect one snapshot, enqueue it, trim, then drain.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>, reason: &str) {
        let item = ReadingCollector::new(&self.config, self.deps.provider.as_ref())
            .collect(now)
            .await;
        match item {
            Some(item) => {
                self.queue.enqueue(item);
                self.trim_queue();
            }
            None => {
                tracing::debug!(connection = %self.config.id, reason, "no snapshot this cycle");
            }
        }
        self.drain(reason).await;
    }

    pub async fn send_now(&mut self) -> DeliveryStatus {
        let now = self.deps.clock.now();
        self.run_cycle(now, "send_now").await;
        self.snapshot()
    }

    /// Read-only; emits a snapshot event.
    pub fn get_status(&self) -> DeliveryStatus {
        let status = self.snapshot();
        self.deps.sink.emit(StatusEvent::StatusSnapshot {
            connection_id: self.config.id.clone(),
            status: status.clone(),
        });
        status
    }

    pub fn clear_queue(&mut self) -> DeliveryStatus {
        let dropped = self.queue.len();
        self.queue.clear();
        tracing::info!(connection = %self.config.id, dropped, "queue cleared");
        if !self.outage.is_open() {
            self.outage.clear_advisory();
        }
        self.publish_status();
        self.snapshot()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let config = &self.config;
        let datapoint_ts_mode = match &config.datapoint_ts_mode {
            DatapointTsMode::Now => "now".to_string(),
            DatapointTsMode::Entity(entity) => format!("entity:{entity}"),
        };
        Diagnostics {
            connection: ConnectionSummary {
                id: config.id.clone(),
                title: config.title.clone(),
                base_url: config.base_url.clone(),
                api_key: mask_secret(Some(&config.api_key)),
                site_fid: config.site_fid.clone(),
                datapoint_ts_mode,
                em_power_grid_entity: config.grid_entity.clone(),
                fields: config.optional_fields.iter().cloned().collect(),
                queue_max_len: config.queue_max_len,
                max_send_per_tick: config.max_send_per_tick,
            },
            status: self.snapshot(),
            advisory: self.outage.advisory(),
        }
    }

    fn snapshot(&self) -> DeliveryStatus {
        DeliveryStatus {
            queue_len: self.queue.len(),
            outage_since_utc: self.outage.since(),
            ..self.status.clone()
        }
    }

    /// Enforces `queue_max_len`, counting every evicted item as a capacity drop.
    fn trim_queue(&mut self) {
        let max_len = self.config.queue_max_len;
        let dropped = self.queue.trim(max_len);
        if dropped == 0 {
            return;
        }
        self.status.dropped_capacity += dropped as u64;
        self.status.last_drop_reason = Some(if max_len == 0 {
            "queue disabled (queue_max_len=0)".to_string()
        } else {
            format!("queue full (queue_max_len={max_len}); oldest item evicted")
        });
        tracing::warn!(
            connection = %self.config.id,
            dropped,
            max_len,
            "evicted oldest queue items"
        );
    }

    fn publish_status(&mut self) {
        self.status.queue_len = self.queue.len();
        self.status.outage_since_utc = self.outage.since();
        self.deps.sink.emit(StatusEvent::StatusSnapshot {
            connection_id: self.config.id.clone(),
            status: self.status.clone(),
        });
    }
}
