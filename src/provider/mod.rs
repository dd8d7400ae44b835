//! Speech-to-text providers.
//!
//! A [`Provider`] opens underlying recognition sessions. Everything a
//! session does after opening flows through two channels: PCM chunks in,
//! [`ProviderEvent`]s out. Restart and continuity logic lives above this
//! layer in [`crate::session`], so connectors stay small.

pub mod loopback;
pub mod scripted;
#[cfg(feature = "websocket")]
pub mod websocket;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use loopback::LoopbackProvider;
pub use scripted::ScriptedProvider;
#[cfg(feature = "websocket")]
pub use websocket::WebsocketProvider;

/// Chunks buffered between a provider session and its connector.
pub const AUDIO_CHANNEL_CAPACITY: usize = 64;

/// Events buffered between a connector and its provider session.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Time a connector gets to flush and say goodbye after its audio ends.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Mono 16-bit PCM at a fixed sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
}

impl AudioFormat {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Bytes of audio per second.
    pub fn byte_rate(&self) -> u64 {
        u64::from(self.sample_rate) * 2
    }

    /// Playback duration of `bytes` in milliseconds.
    pub fn millis_for(&self, bytes: usize) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        bytes as f64 * 1000.0 / self.byte_rate() as f64
    }

    /// Bytes covering `duration` of audio.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        (duration.as_secs_f64() * self.byte_rate() as f64) as usize
    }
}

/// Something an underlying session reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// The provider accepted the session.
    Ready,
    /// A recognition result. `end_ms` is relative to the start of this
    /// underlying session's audio.
    Result {
        end_ms: u64,
        is_final: bool,
        payload: Value,
    },
    /// The session failed. A restart follows.
    Error(String),
    /// The provider closed the session on its own.
    Closed,
}

/// One open recognition session.
///
/// Dropping the audio sender tells the connector no more audio follows;
/// connector tasks end on their own once it is gone.
pub struct UnderlyingSession {
    pub audio: mpsc::Sender<Bytes>,
    pub events: mpsc::Receiver<ProviderEvent>,
    task: Option<JoinHandle<()>>,
}

impl UnderlyingSession {
    pub fn new(audio: mpsc::Sender<Bytes>, events: mpsc::Receiver<ProviderEvent>) -> Self {
        Self {
            audio,
            events,
            task: None,
        }
    }

    /// Attaches the connector task so closing can wait for it.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Ends the audio and waits briefly for the connector to wind down.
    pub async fn close(self) {
        let Self { audio, events, task } = self;
        drop(audio);
        drop(events);
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

/// A speech-to-text backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable id, published as the result's `platform`.
    fn id(&self) -> &str;

    /// Longest an underlying session may run before it is replaced.
    fn session_limit(&self) -> Duration;

    /// Audio format the provider expects.
    fn format(&self) -> AudioFormat;

    /// Opens a fresh underlying session.
    async fn open(&self) -> Result<UnderlyingSession>;
}

/// Builds the connector described by `config`.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    match config.kind {
        ProviderKind::Loopback => Ok(Arc::new(LoopbackProvider::new(config))),
        #[cfg(feature = "websocket")]
        ProviderKind::Websocket => Ok(Arc::new(WebsocketProvider::new(config)?)),
        #[cfg(not(feature = "websocket"))]
        ProviderKind::Websocket => Err(crate::error::ScribeError::ConfigInvalidValue {
            key: format!("providers.{}", config.id),
            message: "built without websocket support".to_string(),
        }),
    }
}

/// Builds every enabled provider in configuration order.
pub fn build_enabled(configs: &[ProviderConfig]) -> Result<Vec<Arc<dyn Provider>>> {
    configs
        .iter()
        .filter(|c| c.enabled)
        .map(build_provider)
        .collect()
}
