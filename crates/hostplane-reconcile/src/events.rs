//! Container lifecycle event sources.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use hostplane_cluster::INSTANCE_LABEL;
use hostplane_core::{Error, Result};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ContainerEvent>> + Send>>;

/// One container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub action: String,
    pub attributes: BTreeMap<String, String>,
    /// Epoch seconds reported by the runtime.
    pub time: i64,
}

impl ContainerEvent {
    pub fn destroy(container_id: &str, instance_id: &str) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(INSTANCE_LABEL.to_string(), instance_id.to_string());
        Self {
            container_id: container_id.to_string(),
            action: "destroy".into(),
            attributes,
            time: hostplane_core::now_millis() / 1000,
        }
    }

    pub fn is_destroy(&self) -> bool {
        self.action == "destroy"
    }

    /// Instance that owns the container, from its label.
    pub fn instance_id(&self) -> Option<&str> {
        self.attributes.get(INSTANCE_LABEL).map(String::as_str)
    }
}

/// A subscription to container events. Each call to `subscribe` opens a
/// new stream; the stream ends when the connection drops.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self) -> Result<EventStream>;

    fn describe(&self) -> String;
}

// ---------------------------------------------------------------
// Docker Engine
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DockerActor {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DockerMessage {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor")]
    actor: DockerActor,
    #[serde(default)]
    time: i64,
}

/// Parse one line of the `/events` stream. Non-container events yield `None`.
pub fn parse_docker_event(line: &str) -> Result<Option<ContainerEvent>> {
    let message: DockerMessage = serde_json::from_str(line)?;
    if message.kind != "container" {
        return Ok(None);
    }
    Ok(Some(ContainerEvent {
        container_id: message.actor.id,
        action: message.action,
        attributes: message.actor.attributes,
        time: message.time,
    }))
}

/// Streams destroy events for labelled containers from the Docker Engine API.
pub struct DockerEventSource {
    client: reqwest::Client,
    base_url: String,
}

impl DockerEventSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn filters() -> String {
        serde_json::json!({
            "type": ["container"],
            "event": ["destroy"],
            "label": [INSTANCE_LABEL],
        })
        .to_string()
    }
}

#[async_trait]
impl EventSource for DockerEventSource {
    async fn subscribe(&self) -> Result<EventStream> {
        let url = format!("{}/events", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("filters", Self::filters())])
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!("{} returned {}: {}", url, status, body)));
        }
        debug!(url = %url, "Subscribed to container events");

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(Error::Connectivity(format!("event stream read failed: {}", e)));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_docker_event(&line) {
                        Ok(Some(event)) => yield Ok(event),
                        Ok(None) => {}
                        Err(e) => warn!("Skipping malformed container event: {}", e),
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn describe(&self) -> String {
        format!("docker events at {}", self.base_url)
    }
}

// ---------------------------------------------------------------
// In-process channel
// ---------------------------------------------------------------

enum Signal {
    Event(ContainerEvent),
    Disconnect,
}

/// Event source fed by hand; used by tests and the memory cluster mode.
pub struct ChannelEventSource {
    tx: mpsc::UnboundedSender<Signal>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Signal>>>,
    subscriptions: AtomicU32,
}

impl Default for ChannelEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelEventSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            subscriptions: AtomicU32::new(0),
        }
    }

    pub fn push(&self, event: ContainerEvent) {
        let _ = self.tx.send(Signal::Event(event));
    }

    /// End the current subscription as a dropped connection would.
    pub fn disconnect(&self) {
        let _ = self.tx.send(Signal::Disconnect);
    }

    pub fn subscriptions(&self) -> u32 {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn subscribe(&self) -> Result<EventStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let rx = self.rx.clone();
        let stream = async_stream::stream! {
            loop {
                let signal = rx.lock().await.recv().await;
                match signal {
                    Some(Signal::Event(event)) => yield Ok(event),
                    Some(Signal::Disconnect) | None => return,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn describe(&self) -> String {
        "in-process event channel".into()
    }
}
