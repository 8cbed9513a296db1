use crate::collector::{EntityState, StateProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
    #[serde(default)]
    attributes: StateAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct StateAttributes {
    #[serde(default)]
    unit_of_measurement: Option<String>,
}

/// Reads entity states from the Home Assistant REST API.
pub struct HomeAssistantClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HomeAssistantClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build Home Assistant client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl StateProvider for HomeAssistantClient {
    async fn state(&self, entity_id: &str) -> Result<Option<EntityState>> {
        let url = format!("{}/api/states/{}", self.base_url, entity_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: StateResponse = response
            .error_for_status()
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .context("decode entity state")?;
        Ok(Some(EntityState {
            state: body.state,
            unit: body.attributes.unit_of_measurement,
        }))
    }
}
