use crate::fields::FieldValue;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

/// One normalized snapshot waiting for delivery. Credentials are attached at send time only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub datapoint_ts: String,
    pub client: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueDocument {
    #[serde(default)]
    queue: Vec<QueueItem>,
}

/// Durable key-value slot holding one connection's queue document.
pub trait QueueStore: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, document: &str) -> Result<()>;
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_connection(state_dir: &Path, connection_id: &str) -> Self {
        Self::new(state_dir.join(format!("emf_queue_{connection_id}.json")))
    }
}

impl QueueStore for JsonFileStore {
    fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        Ok(Some(raw))
    }

    fn save(&self, document: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, document).context("write queue tmp")?;
        fs::rename(&tmp, &self.path).context("rename queue")?;
        Ok(())
    }
}

/// Bounded queue, oldest item at the front. Every mutation rewrites the whole document.
pub struct DurableQueue {
    items: VecDeque<QueueItem>,
    store: Box<dyn QueueStore>,
}

impl DurableQueue {
    /// Loads the persisted queue. Absent or malformed documents start an empty queue.
    pub fn restore(store: Box<dyn QueueStore>) -> Self {
        let items = match store.load() {
            Ok(Some(raw)) => match serde_json::from_str::<QueueDocument>(&raw) {
                Ok(doc) => doc.queue.into(),
                Err(err) => {
                    tracing::warn!(error=%err, "queue document malformed; starting empty");
                    VecDeque::new()
                }
            },
            Ok(None) => VecDeque::new(),
            Err(err) => {
                tracing::warn!(error=%err, "failed to load queue; starting empty");
                VecDeque::new()
            }
        };
        Self { items, store }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter()
    }

    pub fn enqueue(&mut self, item: QueueItem) {
        self.items.push_back(item);
        self.persist();
    }

    pub fn peek_newest(&self) -> Option<&QueueItem> {
        self.items.back()
    }

    pub fn pop_newest(&mut self) -> Option<QueueItem> {
        let item = self.items.pop_back();
        if item.is_some() {
            self.persist();
        }
        item
    }

    /// Drops oldest items until at most `max_len` remain; returns how many were dropped.
    pub fn pop_oldest_until(&mut self, max_len: usize) -> usize {
        let mut dropped = 0;
        while self.items.len() > max_len {
            self.items.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.persist();
        }
        dropped
    }

    /// Caps the queue at `max_len`; zero empties it. Returns the number of evicted items.
    pub fn trim(&mut self, max_len: usize) -> usize {
        if max_len == 0 {
            let dropped = self.items.len();
            self.clear();
            return dropped;
        }
        self.pop_oldest_until(max_len)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.persist();
    }

    pub fn persist(&self) {
        if let Err(err) = self.try_persist() {
            tracing::warn!(error=%err, len = self.items.len(), "failed to persist queue");
        }
    }

    fn try_persist(&self) -> Result<()> {
        let doc = QueueDocument {
            queue: self.items.iter().cloned().collect(),
        };
        let raw = serde_json::to_string(&doc).context("encode queue")?;
        self.store.save(&raw)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Shared in-memory slot so a test can reopen the "same" storage.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryStore {
        pub(crate) document: Arc<Mutex<Option<String>>>,
    }

    impl QueueStore for MemoryStore {
        fn load(&self) -> Result<Option<String>> {
            Ok(self.document.lock().unwrap().clone())
        }

        fn save(&self, document: &str) -> Result<()> {
            *self.document.lock().unwrap() = Some(document.to_string());
            Ok(())
        }
    }

    pub(crate) fn item(ts: &str, grid: i64) -> QueueItem {
        let mut fields = BTreeMap::new();
        fields.insert("em_power_grid".to_string(), FieldValue::Int(grid));
        QueueItem {
            datapoint_ts: ts.to_string(),
            client: "test-client".to_string(),
            fields,
        }
    }

    fn grids(queue: &DurableQueue) -> Vec<i64> {
        queue
            .items()
            .map(|item| match item.fields["em_power_grid"] {
                FieldValue::Int(v) => v,
                FieldValue::Float(v) => v as i64,
            })
            .collect()
    }

    #[test]
    fn trim_evicts_oldest_first() {
        let mut queue = DurableQueue::restore(Box::new(MemoryStore::default()));
        for grid in 1..=5 {
            queue.enqueue(item("2025-01-01 00:00:00", grid));
        }

        assert_eq!(queue.trim(3), 2);
        assert_eq!(grids(&queue), vec![3, 4, 5]);
        assert_eq!(queue.trim(10), 0);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn trim_to_zero_clears() {
        let mut queue = DurableQueue::restore(Box::new(MemoryStore::default()));
        queue.enqueue(item("2025-01-01 00:00:00", 1));
        queue.enqueue(item("2025-01-01 00:05:00", 2));

        assert_eq!(queue.trim(0), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn newest_end_is_the_back() {
        let mut queue = DurableQueue::restore(Box::new(MemoryStore::default()));
        queue.enqueue(item("2025-01-01 00:00:00", 1));
        queue.enqueue(item("2025-01-01 00:05:00", 2));

        assert_eq!(queue.peek_newest().map(|i| i.datapoint_ts.as_str()), Some("2025-01-01 00:05:00"));
        let popped = queue.pop_newest().unwrap();
        assert_eq!(popped.fields["em_power_grid"], FieldValue::Int(2));
        assert_eq!(grids(&queue), vec![1]);
    }

    #[test]
    fn reload_reproduces_queue_after_mutations() {
        let store = MemoryStore::default();
        let mut queue = DurableQueue::restore(Box::new(store.clone()));
        let mut soc = item("2025-01-01 00:00:00", -250);
        soc.fields.insert("bat_soc".to_string(), FieldValue::Float(50.0));
        soc.fields.insert("bat_dc_voltage".to_string(), FieldValue::Float(52.25));
        queue.enqueue(soc);
        queue.enqueue(item("2025-01-01 00:05:00", 100));
        queue.enqueue(item("2025-01-01 00:10:00", 200));
        queue.pop_newest();
        queue.enqueue(item("2025-01-01 00:15:00", 300));

        let reloaded = DurableQueue::restore(Box::new(store));
        let before: Vec<_> = queue.items().cloned().collect();
        let after: Vec<_> = reloaded.items().cloned().collect();
        assert_eq!(before, after);
        assert_eq!(after[0].fields["bat_soc"], FieldValue::Float(50.0));
    }

    #[test]
    fn malformed_or_missing_documents_restore_empty() {
        let store = MemoryStore::default();
        assert!(DurableQueue::restore(Box::new(store.clone())).is_empty());

        *store.document.lock().unwrap() = Some("{not json".to_string());
        assert!(DurableQueue::restore(Box::new(store)).is_empty());
    }

    #[test]
    fn json_file_store_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::for_connection(dir.path(), "site-a");
        let mut queue = DurableQueue::restore(Box::new(store));
        queue.enqueue(item("2025-01-01 00:00:00", 42));
        queue.enqueue(item("2025-01-01 00:05:00", 43));

        let path = dir.path().join("emf_queue_site-a.json");
        let raw = fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["queue"].as_array().unwrap().len(), 2);
        assert_eq!(doc["queue"][0]["em_power_grid"], 42);
        assert!(!dir.path().join("emf_queue_site-a.json.tmp").exists());

        let reloaded = DurableQueue::restore(Box::new(JsonFileStore::new(path)));
        assert_eq!(grids(&reloaded), vec![42, 43]);
    }
}
