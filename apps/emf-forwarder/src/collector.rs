use crate::config::{ConnectionConfig, DatapointTsMode};
use crate::fields::{Reading, GRID_POWER_FIELD};
use crate::queue::QueueItem;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

pub const CLIENT_TAG: &str = concat!("emf-forwarder/", env!("CARGO_PKG_VERSION"));
pub const DATAPOINT_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub state: String,
    pub unit: Option<String>,
}

/// Source of current entity states. `Ok(None)` means the entity does not exist.
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn state(&self, entity_id: &str) -> Result<Option<EntityState>>;
}

#[derive(Debug, Error, PartialEq)]
pub enum ReadingError {
    #[error("state unavailable")]
    Unavailable,

    #[error("state {0:?} is not numeric")]
    NotNumeric(String),
}

/// Parses a raw state string; accepts `,` as decimal separator.
pub fn parse_state(raw: &str) -> Result<f64, ReadingError> {
    let trimmed = raw.trim();
    if is_unavailable(trimmed) {
        return Err(ReadingError::Unavailable);
    }
    match trimmed.replace(',', ".").parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ReadingError::NotNumeric(trimmed.to_string())),
    }
}

fn is_unavailable(state: &str) -> bool {
    matches!(state, "" | "unknown" | "unavailable")
}

pub fn format_datapoint_ts(ts: DateTime<Utc>) -> String {
    ts.format(DATAPOINT_TS_FORMAT).to_string()
}

/// Builds one queue item per tick from the connection's entity mappings.
pub struct ReadingCollector<'a> {
    config: &'a ConnectionConfig,
    provider: &'a dyn StateProvider,
}

impl<'a> ReadingCollector<'a> {
    pub fn new(config: &'a ConnectionConfig, provider: &'a dyn StateProvider) -> Self {
        Self { config, provider }
    }

    /// Returns `None` when the grid power reading is unavailable.
    pub async fn collect(&self, now: DateTime<Utc>) -> Option<QueueItem> {
        let Some(grid_entity) = self.config.grid_entity.as_deref() else {
            tracing::debug!(connection=%self.config.id, "skipping tick: no grid power entity mapped");
            return None;
        };
        let grid = match self.read(grid_entity, GRID_POWER_FIELD).await {
            Ok(reading) => reading,
            Err(err) => {
                tracing::debug!(
                    connection=%self.config.id,
                    entity = grid_entity,
                    error=%err,
                    "skipping tick: grid power not available"
                );
                return None;
            }
        };

        let mut fields = BTreeMap::new();
        fields.insert(GRID_POWER_FIELD.to_string(), grid.normalized());

        for (field, entity) in &self.config.optional_fields {
            match self.read(entity, field).await {
                Ok(reading) => {
                    fields.insert(field.clone(), reading.normalized());
                }
                Err(err) => {
                    tracing::trace!(connection=%self.config.id, field=%field, error=%err, "optional field omitted");
                }
            }
        }

        Some(QueueItem {
            datapoint_ts: self.datapoint_ts(now).await,
            client: CLIENT_TAG.to_string(),
            fields,
        })
    }

    async fn read(&self, entity_id: &str, field: &str) -> Result<Reading, ReadingError> {
        let state = match self.provider.state(entity_id).await {
            Ok(Some(state)) => state,
            Ok(None) => return Err(ReadingError::Unavailable),
            Err(err) => {
                tracing::warn!(entity = entity_id, error=%err, "failed to read entity state");
                return Err(ReadingError::Unavailable);
            }
        };
        let value = parse_state(&state.state)?;
        Ok(Reading {
            name: field.to_string(),
            value,
            unit: state.unit,
        })
    }

    async fn datapoint_ts(&self, now: DateTime<Utc>) -> String {
        if let DatapointTsMode::Entity(entity_id) = &self.config.datapoint_ts_mode {
            match self.provider.state(entity_id).await {
                Ok(Some(state)) if !is_unavailable(state.state.trim()) => {
                    return state.state.trim().to_string();
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(entity = %entity_id, error=%err, "failed to read timestamp entity");
                }
            }
        }
        format_datapoint_ts(now)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::connection_config;
    use crate::fields::FieldValue;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeStates {
        pub(crate) states: Mutex<HashMap<String, EntityState>>,
        pub(crate) failing: Mutex<Vec<String>>,
    }

    impl FakeStates {
        pub(crate) fn set(&self, entity_id: &str, state: &str, unit: Option<&str>) {
            self.states.lock().unwrap().insert(
                entity_id.to_string(),
                EntityState {
                    state: state.to_string(),
                    unit: unit.map(str::to_string),
                },
            );
        }
    }

    #[async_trait]
    impl StateProvider for FakeStates {
        async fn state(&self, entity_id: &str) -> Result<Option<EntityState>> {
            if self.failing.lock().unwrap().iter().any(|e| e == entity_id) {
                return Err(anyhow!("connection refused"));
            }
            Ok(self.states.lock().unwrap().get(entity_id).cloned())
        }
    }

    fn tick() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 5, 0).unwrap()
    }

    #[test]
    fn parse_state_accepts_comma_decimals() {
        assert_eq!(parse_state(" 1,5 "), Ok(1.5));
        assert_eq!(parse_state("-230.25"), Ok(-230.25));
        assert_eq!(parse_state("unknown"), Err(ReadingError::Unavailable));
        assert_eq!(parse_state("unavailable"), Err(ReadingError::Unavailable));
        assert_eq!(parse_state(""), Err(ReadingError::Unavailable));
        assert!(matches!(parse_state("on"), Err(ReadingError::NotNumeric(_))));
        assert!(matches!(parse_state("nan"), Err(ReadingError::NotNumeric(_))));
    }

    #[tokio::test]
    async fn collect_normalizes_mapped_fields() {
        let mut config = connection_config("site-a");
        config
            .optional_fields
            .push(("bat_soc".to_string(), "sensor.soc".to_string()));
        config
            .optional_fields
            .push(("em_power_pv".to_string(), "sensor.pv".to_string()));
        let states = FakeStates::default();
        states.set("sensor.grid", "1,25", Some("kW"));
        states.set("sensor.soc", "0,5", None);
        states.set("sensor.pv", "unavailable", Some("W"));

        let item = ReadingCollector::new(&config, &states)
            .collect(tick())
            .await
            .unwrap();

        assert_eq!(item.datapoint_ts, "2025-03-01 12:05:00");
        assert_eq!(item.client, CLIENT_TAG);
        assert_eq!(item.fields["em_power_grid"], FieldValue::Int(1250));
        assert_eq!(item.fields["bat_soc"], FieldValue::Float(50.0));
        assert!(!item.fields.contains_key("em_power_pv"));
    }

    #[tokio::test]
    async fn missing_grid_power_skips_tick() {
        let config = connection_config("site-a");
        let states = FakeStates::default();
        assert!(ReadingCollector::new(&config, &states).collect(tick()).await.is_none());

        states.set("sensor.grid", "unknown", Some("W"));
        assert!(ReadingCollector::new(&config, &states).collect(tick()).await.is_none());

        states.set("sensor.grid", "12", Some("W"));
        states.failing.lock().unwrap().push("sensor.grid".to_string());
        assert!(ReadingCollector::new(&config, &states).collect(tick()).await.is_none());
    }

    #[tokio::test]
    async fn unmapped_grid_entity_skips_tick() {
        let mut config = connection_config("site-a");
        config.grid_entity = None;
        let states = FakeStates::default();
        states.set("sensor.grid", "12", Some("W"));
        assert!(ReadingCollector::new(&config, &states).collect(tick()).await.is_none());
    }

    #[tokio::test]
    async fn timestamp_entity_mode_falls_back_to_tick_time() {
        let mut config = connection_config("site-a");
        config.datapoint_ts_mode = DatapointTsMode::Entity("sensor.meter_ts".to_string());
        let states = FakeStates::default();
        states.set("sensor.grid", "100", Some("W"));

        let item = ReadingCollector::new(&config, &states).collect(tick()).await.unwrap();
        assert_eq!(item.datapoint_ts, "2025-03-01 12:05:00");

        states.set("sensor.meter_ts", "2025-03-01 12:04:30", None);
        let item = ReadingCollector::new(&config, &states).collect(tick()).await.unwrap();
        assert_eq!(item.datapoint_ts, "2025-03-01 12:04:30");
    }
}
