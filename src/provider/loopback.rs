//! Synthetic provider for smoke tests and local runs.
//!
//! Produces results from audio *time* only: an interim result every
//! `interim_every` of audio and a final result every `final_every`. Nothing
//! is decoded, so a deployment can be exercised end to end without
//! credentials.

use super::{
    AUDIO_CHANNEL_CAPACITY, AudioFormat, EVENT_CHANNEL_CAPACITY, Provider, ProviderEvent,
    UnderlyingSession,
};
use crate::config::ProviderConfig;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct LoopbackProvider {
    id: String,
    session_limit: Duration,
    format: AudioFormat,
    interim_every_ms: f64,
    final_every_ms: f64,
}

impl LoopbackProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            id: config.id.clone(),
            session_limit: config.session_limit,
            format: AudioFormat::new(config.sample_rate),
            interim_every_ms: config.interim_every.as_secs_f64() * 1000.0,
            final_every_ms: config.final_every.as_secs_f64() * 1000.0,
        }
    }
}

#[async_trait]
impl Provider for LoopbackProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn session_limit(&self) -> Duration {
        self.session_limit
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn open(&self) -> Result<UnderlyingSession> {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let clock = AudioClock {
            format: self.format,
            interim_every_ms: self.interim_every_ms,
            final_every_ms: self.final_every_ms,
            elapsed_ms: 0.0,
            next_interim_ms: self.interim_every_ms,
            next_final_ms: self.final_every_ms,
            segment: 0,
        };
        let task = tokio::spawn(run(clock, audio_rx, events_tx));
        tracing::debug!(provider = %self.id, "loopback session opened");
        Ok(UnderlyingSession::new(audio_tx, events_rx).with_task(task))
    }
}

/// Tracks audio time and decides when a result is due.
struct AudioClock {
    format: AudioFormat,
    interim_every_ms: f64,
    final_every_ms: f64,
    elapsed_ms: f64,
    next_interim_ms: f64,
    next_final_ms: f64,
    segment: u64,
}

impl AudioClock {
    fn advance(&mut self, bytes: usize) -> Option<ProviderEvent> {
        self.elapsed_ms += self.format.millis_for(bytes);
        let end_ms = self.elapsed_ms.floor() as u64;

        if self.elapsed_ms >= self.next_final_ms {
            self.next_final_ms += self.final_every_ms;
            self.next_interim_ms = self.elapsed_ms + self.interim_every_ms;
            let segment = self.segment;
            self.segment += 1;
            return Some(result(end_ms, true, segment));
        }
        if self.elapsed_ms >= self.next_interim_ms {
            self.next_interim_ms += self.interim_every_ms;
            return Some(result(end_ms, false, self.segment));
        }
        None
    }
}

fn result(end_ms: u64, is_final: bool, segment: u64) -> ProviderEvent {
    ProviderEvent::Result {
        end_ms,
        is_final,
        payload: json!({
            "transcript": format!("loopback segment {segment}"),
            "audioMillis": end_ms,
            "isFinal": is_final,
        }),
    }
}

async fn run(
    mut clock: AudioClock,
    mut audio: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<ProviderEvent>,
) {
    if events.send(ProviderEvent::Ready).await.is_err() {
        return;
    }
    while let Some(chunk) = audio.recv().await {
        if let Some(event) = clock.advance(chunk.len()) {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}
