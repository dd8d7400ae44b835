//! Topic-based message bus.
//!
//! The control plane and the result plane both speak publish/subscribe
//! over slash-separated topics. Filters use MQTT wildcards: `+` matches
//! one level, `#` matches every remaining level.
//!
//! - [`LocalBus`]: in-process broker.
//! - [`BusServer`]: exposes a `LocalBus` on a Unix socket.
//! - [`SocketBusClient`]: talks to a running `BusServer`.

pub mod client;
pub mod local;
pub mod protocol;
pub mod server;

use crate::error::{Result, ScribeError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

pub use client::SocketBusClient;
pub use local::LocalBus;
pub use server::BusServer;

/// Messages buffered per subscription before new ones are dropped.
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

/// A message as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
}

/// Stream of messages matching one filter. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;

    async fn subscribe(&self, filter: &str) -> Result<Subscription>;
}

/// Whether `topic` matches the MQTT-style `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        if level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(t) if level == "+" || level == t => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

/// Rejects empty topics and topics containing wildcards.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(ScribeError::BusProtocol {
            message: format!("invalid topic {topic:?}"),
        });
    }
    Ok(())
}

/// Rejects filters whose wildcards do not occupy a whole level, or whose
/// `#` is not last.
pub fn validate_filter(filter: &str) -> Result<()> {
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    let valid = !filter.is_empty()
        && levels.iter().enumerate().all(|(i, level)| match *level {
            "#" => i == last,
            "+" => true,
            other => !other.contains(['+', '#']),
        });
    if valid {
        Ok(())
    } else {
        Err(ScribeError::BusProtocol {
            message: format!("invalid filter {filter:?}"),
        })
    }
}

/// Publishes with up to `attempts` tries, sleeping `backoff` between them.
///
/// # Errors
/// Returns `ScribeError::PublishExhausted` carrying the last failure.
pub async fn publish_with_retry(
    bus: &dyn MessageBus,
    topic: &str,
    payload: Value,
    attempts: u32,
    backoff: Duration,
) -> Result<()> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match bus.publish(topic, payload.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(%topic, attempt, error = %e, "publish attempt failed");
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(ScribeError::PublishExhausted {
        topic: topic.to_string(),
        attempts,
        message: last_error,
    })
}

/// Default bus socket: `$XDG_RUNTIME_DIR/rtpscribe.sock`, or a per-user
/// path under `/tmp`.
pub fn default_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join("rtpscribe.sock"),
        _ => {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/rtpscribe-{uid}.sock"))
        }
    }
}
