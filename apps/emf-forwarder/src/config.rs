use crate::fields::{optional_field_names, GRID_POWER_FIELD};
use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_CONFIG_PATH: &str = "/etc/emf-forwarder/config.json";
const DEFAULT_BASE_URL: &str = "http://ems001.amberquest.at:8444/api/submit_energy_data";
const DEFAULT_QUEUE_MAX_LEN: usize = 4032;
const DEFAULT_MAX_SEND_PER_TICK: usize = 144;
const ENV_CONNECTION_ID: &str = "default";

#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: String,
    pub state_dir: PathBuf,
    pub ha_url: String,
    pub ha_token: String,
    pub send_every: Duration,
    pub submit_timeout: Duration,
    pub connections: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapointTsMode {
    Now,
    Entity(String),
}

/// Fully resolved, immutable settings for one site connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub id: String,
    pub title: String,
    pub base_url: String,
    pub api_key: String,
    pub site_fid: String,
    pub datapoint_ts_mode: DatapointTsMode,
    pub grid_entity: Option<String>,
    /// (field name, entity id) pairs for the optional fields.
    pub optional_fields: Vec<(String, String)>,
    pub queue_max_len: usize,
    pub max_send_per_tick: usize,
}

impl ConnectionConfig {
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.site_fid.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionDefaults {
    pub base_url: String,
    pub queue_max_len: usize,
    pub max_send_per_tick: usize,
}

impl Default for ConnectionDefaults {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            queue_max_len: DEFAULT_QUEUE_MAX_LEN,
            max_send_per_tick: DEFAULT_MAX_SEND_PER_TICK,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionsFile {
    #[serde(default)]
    defaults: FileDefaults,
    #[serde(default)]
    connections: Vec<ConnectionEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct FileDefaults {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    queue_max_len: Option<usize>,
    #[serde(default)]
    max_send_per_tick: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionEntry {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    site_fid: Option<String>,
    #[serde(default)]
    datapoint_ts_mode: Option<String>,
    #[serde(default)]
    datapoint_ts_entity: Option<String>,
    #[serde(default)]
    em_power_grid_entity: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, String>,
    #[serde(default)]
    queue_max_len: Option<usize>,
    #[serde(default)]
    max_send_per_tick: Option<usize>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let config_path = PathBuf::from(env_string(
            "EMF_CONFIG_PATH",
            Some(DEFAULT_CONFIG_PATH.to_string()),
        )?);
        let http_bind = env_string("EMF_HTTP_BIND", Some("127.0.0.1:9102".to_string()))?;
        let state_dir = PathBuf::from(env_string(
            "EMF_STATE_DIR",
            Some("/var/lib/emf-forwarder".to_string()),
        )?);

        let ha_url = env_string("EMF_HA_URL", Some("http://localhost:8123".to_string()))?;
        Url::parse(&ha_url).context("invalid EMF_HA_URL")?;
        let ha_token = env_optional("EMF_HA_TOKEN")
            .or_else(|| env_optional("SUPERVISOR_TOKEN"))
            .ok_or_else(|| anyhow!("missing env var EMF_HA_TOKEN (or SUPERVISOR_TOKEN)"))?;

        let send_every_minutes = env_u64("EMF_SEND_EVERY_MINUTES", Some(5))?;
        if send_every_minutes == 0 {
            bail!("EMF_SEND_EVERY_MINUTES must be at least 1");
        }
        let submit_timeout =
            Duration::from_secs(env_u64("EMF_SUBMIT_TIMEOUT_SECONDS", Some(60))?);

        let defaults = ConnectionDefaults {
            base_url: env_string("EMF_BASE_URL", Some(DEFAULT_BASE_URL.to_string()))?,
            queue_max_len: env_u64("EMF_QUEUE_MAX_LEN", Some(DEFAULT_QUEUE_MAX_LEN as u64))?
                as usize,
            max_send_per_tick: env_u64(
                "EMF_MAX_SEND_PER_TICK",
                Some(DEFAULT_MAX_SEND_PER_TICK as u64),
            )? as usize,
        };

        let connections = if config_path.exists() {
            load_connections_file(&config_path, &defaults)?
        } else {
            tracing::info!(
                path = %config_path.display(),
                "connections file not found; using EMF_* environment connection"
            );
            vec![connection_from_env(&defaults, |key| env::var(key).ok())?]
        };

        Ok(Self {
            http_bind,
            state_dir,
            ha_url,
            ha_token,
            send_every: Duration::from_secs(send_every_minutes * 60),
            submit_timeout,
            connections,
        })
    }
}

fn load_connections_file(path: &Path, defaults: &ConnectionDefaults) -> Result<Vec<ConnectionConfig>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_connections(&raw, defaults).with_context(|| format!("invalid {}", path.display()))
}

/// Parses the connections document. Per-connection values win over the file's `defaults`,
/// which win over `env_defaults`.
pub fn parse_connections(raw: &str, env_defaults: &ConnectionDefaults) -> Result<Vec<ConnectionConfig>> {
    let file: ConnectionsFile = serde_json::from_str(raw).context("parse connections json")?;
    let defaults = ConnectionDefaults {
        base_url: file
            .defaults
            .base_url
            .clone()
            .unwrap_or_else(|| env_defaults.base_url.clone()),
        queue_max_len: file.defaults.queue_max_len.unwrap_or(env_defaults.queue_max_len),
        max_send_per_tick: file
            .defaults
            .max_send_per_tick
            .unwrap_or(env_defaults.max_send_per_tick),
    };

    if file.connections.is_empty() {
        bail!("no connections configured");
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(file.connections.len());
    for entry in file.connections {
        let resolved = resolve_connection(entry, &defaults)?;
        if !seen.insert(resolved.id.clone()) {
            bail!("duplicate connection id {:?}", resolved.id);
        }
        out.push(resolved);
    }
    Ok(out)
}

fn resolve_connection(entry: ConnectionEntry, defaults: &ConnectionDefaults) -> Result<ConnectionConfig> {
    let id = entry.id.trim().to_string();
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("connection id {:?} must be non-empty [A-Za-z0-9_-]", entry.id);
    }

    let base_url = trimmed(entry.base_url).unwrap_or_else(|| defaults.base_url.trim().to_string());
    if !base_url.is_empty() {
        let parsed = Url::parse(&base_url).with_context(|| format!("invalid base_url for {id}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("base_url for {id} must be http(s)");
        }
    }

    let datapoint_ts_mode = match trimmed(entry.datapoint_ts_mode).as_deref() {
        None | Some("now") => DatapointTsMode::Now,
        Some("entity") => {
            let entity = trimmed(entry.datapoint_ts_entity).ok_or_else(|| {
                anyhow!("connection {id}: datapoint_ts_mode \"entity\" needs datapoint_ts_entity")
            })?;
            DatapointTsMode::Entity(entity)
        }
        Some(other) => bail!("connection {id}: unknown datapoint_ts_mode {other:?}"),
    };

    let allowed: Vec<&str> = optional_field_names().collect();
    let mut optional_fields = Vec::new();
    for (field, entity) in entry.fields {
        if field == GRID_POWER_FIELD {
            bail!("connection {id}: map {GRID_POWER_FIELD} via em_power_grid_entity");
        }
        if !allowed.contains(&field.as_str()) {
            bail!("connection {id}: unknown field {field:?}");
        }
        if let Some(entity) = trimmed(Some(entity)) {
            optional_fields.push((field, entity));
        }
    }

    Ok(ConnectionConfig {
        title: trimmed(entry.title).unwrap_or_else(|| id.clone()),
        base_url,
        api_key: trimmed(entry.api_key).unwrap_or_default(),
        site_fid: trimmed(entry.site_fid).unwrap_or_default(),
        datapoint_ts_mode,
        grid_entity: trimmed(entry.em_power_grid_entity),
        optional_fields,
        queue_max_len: entry.queue_max_len.unwrap_or(defaults.queue_max_len),
        max_send_per_tick: entry.max_send_per_tick.unwrap_or(defaults.max_send_per_tick),
        id,
    })
}

/// Describes the single `default` connection through `EMF_*` variables, read via `lookup`.
fn connection_from_env(
    defaults: &ConnectionDefaults,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ConnectionConfig> {
    let var = |key: &str| trimmed(lookup(key));
    let mut fields = BTreeMap::new();
    for field in optional_field_names() {
        let key = format!("EMF_FIELD_{}", field.to_ascii_uppercase());
        if let Some(entity) = var(&key) {
            fields.insert(field.to_string(), entity);
        }
    }
    let datapoint_ts_entity = var("EMF_DATAPOINT_TS_ENTITY");
    let entry = ConnectionEntry {
        id: ENV_CONNECTION_ID.to_string(),
        title: var("EMF_TITLE"),
        base_url: None,
        api_key: var("EMF_API_KEY"),
        site_fid: var("EMF_SITE_FID"),
        datapoint_ts_mode: datapoint_ts_entity.as_ref().map(|_| "entity".to_string()),
        datapoint_ts_entity,
        em_power_grid_entity: var("EMF_GRID_ENTITY"),
        fields,
        queue_max_len: None,
        max_send_per_tick: None,
    };
    resolve_connection(entry, defaults)
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
