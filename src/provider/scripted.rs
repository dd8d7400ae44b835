//! Deterministic in-process provider.
//!
//! Records every chunk each underlying session receives, counts opens, and
//! lets the caller fail opens or push events into a live session. Used by
//! the session, orchestrator and end-to-end tests.

use super::{
    AUDIO_CHANNEL_CAPACITY, AudioFormat, EVENT_CHANNEL_CAPACITY, Provider, ProviderEvent,
    UnderlyingSession,
};
use crate::defaults;
use crate::error::{Result, ScribeError};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

struct SessionRecord {
    chunks: Vec<Bytes>,
    bytes: usize,
    emitted: u64,
    closed: bool,
    events: mpsc::Sender<ProviderEvent>,
}

struct Script {
    failing_opens: usize,
    ready_on_open: bool,
    result_every_ms: Option<f64>,
    finals: bool,
    /// Connector tasks keep running after their audio ends.
    linger: bool,
    opens: usize,
    sessions: Vec<SessionRecord>,
}

struct Shared {
    script: Mutex<Script>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mock provider driven by the test that owns it.
///
/// Clones share the same script and recordings.
#[derive(Clone)]
pub struct ScriptedProvider {
    id: String,
    session_limit: Duration,
    format: AudioFormat,
    shared: Arc<Shared>,
}

impl ScriptedProvider {
    /// Creates a provider that acknowledges every open and never produces
    /// results on its own.
    pub fn new(id: &str, session_limit: Duration) -> Self {
        Self {
            id: id.to_string(),
            session_limit,
            format: AudioFormat::new(defaults::SAMPLE_RATE),
            shared: Arc::new(Shared {
                script: Mutex::new(Script {
                    failing_opens: 0,
                    ready_on_open: true,
                    result_every_ms: None,
                    finals: false,
                    linger: false,
                    opens: 0,
                    sessions: Vec::new(),
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Emits a result every `interval` of audio received by a session,
    /// stamped with that session's audio time.
    pub fn with_results_every(self, interval: Duration, finals: bool) -> Self {
        {
            let mut script = self.shared.lock();
            script.result_every_ms = Some(interval.as_secs_f64() * 1000.0);
            script.finals = finals;
        }
        self
    }

    /// Makes the next `count` opens fail.
    pub fn with_failing_opens(self, count: usize) -> Self {
        self.shared.lock().failing_opens = count;
        self
    }

    /// Opens without sending `Ready`.
    pub fn without_ready(self) -> Self {
        self.shared.lock().ready_on_open = false;
        self
    }

    /// Connector tasks never finish on their own, so closing a session
    /// waits out the full grace period.
    pub fn with_lingering_close(self) -> Self {
        self.shared.lock().linger = true;
        self
    }

    /// Open attempts so far, failed ones included.
    pub fn opens(&self) -> usize {
        self.shared.lock().opens
    }

    /// Underlying sessions opened successfully.
    pub fn session_count(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    /// Chunks received by the `index`-th underlying session.
    pub fn chunks(&self, index: usize) -> Vec<Bytes> {
        self.shared
            .lock()
            .sessions
            .get(index)
            .map(|s| s.chunks.clone())
            .unwrap_or_default()
    }

    /// Whether the `index`-th underlying session has seen its audio end.
    pub fn is_closed(&self, index: usize) -> bool {
        self.shared
            .lock()
            .sessions
            .get(index)
            .is_some_and(|s| s.closed)
    }

    /// Pushes `event` into the `index`-th underlying session.
    ///
    /// Returns `false` if the session does not exist or stopped listening.
    pub fn inject(&self, index: usize, event: ProviderEvent) -> bool {
        let sender = match self.shared.lock().sessions.get(index) {
            Some(record) => record.events.clone(),
            None => return false,
        };
        sender.try_send(event).is_ok()
    }

    /// Waits until `ready` holds. Re-checked after every recorded change.
    pub async fn wait_for(&self, mut ready: impl FnMut(&Self) -> bool) {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready(self) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
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

        let (index, ready) = {
            let mut script = self.shared.lock();
            script.opens += 1;
            if script.failing_opens > 0 {
                script.failing_opens -= 1;
                drop(script);
                self.shared.changed.notify_waiters();
                return Err(ScribeError::ProviderOpen {
                    provider: self.id.clone(),
                    message: "scripted open failure".to_string(),
                });
            }
            script.sessions.push(SessionRecord {
                chunks: Vec::new(),
                bytes: 0,
                emitted: 0,
                closed: false,
                events: events_tx.clone(),
            });
            (script.sessions.len() - 1, script.ready_on_open)
        };
        self.shared.changed.notify_waiters();

        if ready && events_tx.try_send(ProviderEvent::Ready).is_err() {
            tracing::warn!(provider = %self.id, "scripted session dropped its ready event");
        }

        let task = tokio::spawn(record(
            self.shared.clone(),
            self.format,
            index,
            audio_rx,
            events_tx,
        ));
        Ok(UnderlyingSession::new(audio_tx, events_rx).with_task(task))
    }
}

async fn record(
    shared: Arc<Shared>,
    format: AudioFormat,
    index: usize,
    mut audio: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<ProviderEvent>,
) {
    while let Some(chunk) = audio.recv().await {
        let due = {
            let mut script = shared.lock();
            let every = script.result_every_ms;
            let finals = script.finals;
            let Some(session) = script.sessions.get_mut(index) else {
                break;
            };
            session.bytes += chunk.len();
            session.chunks.push(chunk);
            let elapsed_ms = format.millis_for(session.bytes);
            match every {
                Some(every) if every > 0.0 && elapsed_ms >= every * (session.emitted + 1) as f64 => {
                    session.emitted += 1;
                    Some(ProviderEvent::Result {
                        end_ms: elapsed_ms.floor() as u64,
                        is_final: finals,
                        payload: json!({
                            "session": index,
                            "chunks": session.chunks.len(),
                        }),
                    })
                }
                _ => None,
            }
        };
        shared.changed.notify_waiters();
        if let Some(event) = due {
            if events.send(event).await.is_err() {
                break;
            }
        }
    }

    let linger = {
        let mut script = shared.lock();
        if let Some(session) = script.sessions.get_mut(index) {
            session.closed = true;
        }
        script.linger
    };
    shared.changed.notify_waiters();
    if linger {
        std::future::pending::<()>().await;
    }
}
