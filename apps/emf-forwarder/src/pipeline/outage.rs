use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

const ISSUE_ID_PREFIX: &str = "emf_outage_";

/// Standing advisory shown while a connection cannot deliver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutageIssue {
    pub id: String,
    pub connection_id: String,
    pub title: String,
    pub message: String,
    pub since_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

pub fn issue_id(connection_id: &str) -> String {
    format!("{ISSUE_ID_PREFIX}{connection_id}")
}

/// Keyed advisory store; `upsert` replaces an existing issue with the same id.
pub trait IssueRegistry: Send + Sync {
    fn upsert(&self, issue: OutageIssue);
    fn remove(&self, issue_id: &str);
    fn get(&self, issue_id: &str) -> Option<OutageIssue>;
    fn list(&self) -> Vec<OutageIssue>;
}

#[derive(Default)]
pub struct IssueBoard {
    issues: Mutex<BTreeMap<String, OutageIssue>>,
}

impl IssueRegistry for IssueBoard {
    fn upsert(&self, issue: OutageIssue) {
        let mut issues = self.issues.lock().unwrap_or_else(PoisonError::into_inner);
        if !issues.contains_key(&issue.id) {
            tracing::warn!(issue = %issue.id, message = %issue.message, "advisory raised");
        }
        issues.insert(issue.id.clone(), issue);
    }

    fn remove(&self, issue_id: &str) {
        let mut issues = self.issues.lock().unwrap_or_else(PoisonError::into_inner);
        if issues.remove(issue_id).is_some() {
            tracing::info!(issue = issue_id, "advisory cleared");
        }
    }

    fn get(&self, issue_id: &str) -> Option<OutageIssue> {
        self.issues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(issue_id)
            .cloned()
    }

    fn list(&self) -> Vec<OutageIssue> {
        self.issues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Tracks one connection's failure streak and keeps its advisory in sync.
pub struct OutageTracker {
    connection_id: String,
    title: String,
    since: Option<DateTime<Utc>>,
    registry: Arc<dyn IssueRegistry>,
}

impl OutageTracker {
    pub fn new(connection_id: &str, title: &str, registry: Arc<dyn IssueRegistry>) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            title: title.to_string(),
            since: None,
            registry,
        }
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    pub fn is_open(&self) -> bool {
        self.since.is_some()
    }

    /// Opens the outage on the first failure of a streak and refreshes the advisory text.
    pub fn mark_failure(&mut self, error_message: &str, now: DateTime<Utc>) {
        let since = *self.since.get_or_insert(now);
        let local = since.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
        self.registry.upsert(OutageIssue {
            id: issue_id(&self.connection_id),
            connection_id: self.connection_id.clone(),
            title: format!("EMF delivery failing: {}", self.title),
            message: format!("EMF delivery interrupted since {local}: {error_message}"),
            since_utc: since,
            updated_utc: now,
        });
    }

    pub fn mark_success(&mut self) {
        if let Some(since) = self.since.take() {
            tracing::info!(connection = %self.connection_id, %since, "delivery recovered");
        }
    }

    pub fn advisory(&self) -> Option<OutageIssue> {
        self.registry.get(&issue_id(&self.connection_id))
    }

    pub fn clear_advisory(&self) {
        self.registry.remove(&issue_id(&self.connection_id));
    }
}
