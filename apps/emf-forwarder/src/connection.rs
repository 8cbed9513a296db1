use crate::pipeline::{Diagnostics, Pipeline};
use crate::status::DeliveryStatus;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub enum ConnectionCommand {
    Tick {
        at: DateTime<Utc>,
        respond_to: oneshot::Sender<()>,
    },
    SendNow {
        respond_to: oneshot::Sender<DeliveryStatus>,
    },
    GetStatus {
        respond_to: oneshot::Sender<DeliveryStatus>,
    },
    ClearQueue {
        respond_to: oneshot::Sender<DeliveryStatus>,
    },
    Diagnostics {
        respond_to: oneshot::Sender<Diagnostics>,
    },
}

/// Cloneable front for one connection task. Commands run one at a time, in order.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: String,
    tx: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn tick(&self, at: DateTime<Utc>) -> Result<()> {
        self.request(|respond_to| ConnectionCommand::Tick { at, respond_to })
            .await
    }

    pub async fn send_now(&self) -> Result<DeliveryStatus> {
        self.request(|respond_to| ConnectionCommand::SendNow { respond_to })
            .await
    }

    pub async fn status(&self) -> Result<DeliveryStatus> {
        self.request(|respond_to| ConnectionCommand::GetStatus { respond_to })
            .await
    }

    pub async fn clear_queue(&self) -> Result<DeliveryStatus> {
        self.request(|respond_to| ConnectionCommand::ClearQueue { respond_to })
            .await
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        self.request(|respond_to| ConnectionCommand::Diagnostics { respond_to })
            .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ConnectionCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(command(tx))
            .map_err(|_| anyhow!("connection {} task stopped", self.id))?;
        rx.await
            .with_context(|| format!("connection {} task dropped response", self.id))
    }
}

pub fn spawn_connection(mut pipeline: Pipeline) -> ConnectionHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionCommand>();
    let id = pipeline.id().to_string();

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                ConnectionCommand::Tick { at, respond_to } => {
                    pipeline.run_cycle(at, "tick").await;
                    let _ = respond_to.send(());
                }
                ConnectionCommand::SendNow { respond_to } => {
                    let _ = respond_to.send(pipeline.send_now().await);
                }
                ConnectionCommand::GetStatus { respond_to } => {
                    let _ = respond_to.send(pipeline.get_status());
                }
                ConnectionCommand::ClearQueue { respond_to } => {
                    let _ = respond_to.send(pipeline.clear_queue());
                }
                ConnectionCommand::Diagnostics { respond_to } => {
                    let _ = respond_to.send(pipeline.diagnostics());
                }
            }
        }
        tracing::debug!(connection = %pipeline.id(), "connection task finished");
    });

    ConnectionHandle { id, tx }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown connection {0:?}")]
pub struct UnknownConnection(pub String);

/// The configured connections, in configuration order.
pub struct Connections {
    handles: Vec<ConnectionHandle>,
}

impl Connections {
    pub fn new(handles: Vec<ConnectionHandle>) -> Self {
        Self { handles }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.handles.iter()
    }

    /// `None` selects every connection.
    pub fn select(&self, connection_id: Option<&str>) -> Result<Vec<&ConnectionHandle>, UnknownConnection> {
        match connection_id {
            None => Ok(self.handles.iter().collect()),
            Some(id) => self
                .handles
                .iter()
                .find(|handle| handle.id == id)
                .map(|handle| vec![handle])
                .ok_or_else(|| UnknownConnection(id.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::connection_config;
    use crate::pipeline::tests::Harness;
    use crate::scheduler::{run_tick, Clock};
    use crate::submit::SubmitResponse;

    /// A handle whose task has already exited.
    pub(crate) fn stopped_handle(id: &str) -> ConnectionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        ConnectionHandle {
            id: id.to_string(),
            tx,
        }
    }

    #[tokio::test]
    async fn stopped_task_reports_error() {
        let handle = stopped_handle("site-a");

        let err = handle.status().await.unwrap_err();

        assert!(err.to_string().contains("site-a task stopped"));
    }

    #[tokio::test]
    async fn commands_are_served_in_order() {
        let harness = Harness::new(connection_config("site-a"));
        harness.states.set("sensor.grid", "2", Some("kW"));
        harness.submitter.push(Ok(SubmitResponse {
            status: 500,
            text: "down".to_string(),
        }));
        let handle = spawn_connection(harness.pipeline());

        let status = handle.send_now().await.unwrap();
        assert_eq!(status.queue_len, 1);
        assert!(status.outage_since_utc.is_some());

        let status = handle.clear_queue().await.unwrap();
        assert_eq!(status.queue_len, 0);

        let diagnostics = handle.diagnostics().await.unwrap();
        assert_eq!(diagnostics.connection.api_key.as_deref(), Some("***********1234"));
        assert!(diagnostics.advisory.is_some());
    }

    #[tokio::test]
    async fn scheduler_tick_reaches_every_connection() {
        let a = Harness::new(connection_config("site-a"));
        let b = Harness::new(connection_config("site-b"));
        a.states.set("sensor.grid", "100", Some("W"));
        b.states.set("sensor.grid", "200", Some("W"));
        let connections = Connections::new(vec![
            spawn_connection(a.pipeline()),
            spawn_connection(b.pipeline()),
        ]);

        run_tick(&connections, a.clock.now()).await;

        assert_eq!(a.submitter.calls().len(), 1);
        assert_eq!(b.submitter.calls().len(), 1);
        assert_eq!(b.submitter.calls()[0]["em_power_grid"], 200);
    }

    #[tokio::test]
    async fn select_rejects_unknown_ids() {
        let harness = Harness::new(connection_config("site-a"));
        let connections = Connections::new(vec![spawn_connection(harness.pipeline())]);

        assert_eq!(connections.select(None).unwrap().len(), 1);
        assert_eq!(connections.select(Some("site-a")).unwrap()[0].id(), "site-a");
        assert_eq!(
            connections.select(Some("nope")).err(),
            Some(UnknownConnection("nope".to_string()))
        );
    }
}
