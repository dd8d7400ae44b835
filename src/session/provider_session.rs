//! One provider's transcription of one call.
//!
//! A single task owns the underlying provider session, the continuity
//! buffer and the duration timer, so restarts are naturally serialised:
//! while the task is restarting it is not listening for further triggers.

use super::continuity::Continuity;
use super::state::SessionState;
use super::TranscriptEvent;
use crate::config::SessionConfig;
use crate::media::AudioConsumer;
use crate::provider::{Provider, ProviderEvent, UnderlyingSession};
use crate::publisher::EventSink;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Longest pause between retries, however many failures in a row.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Handle to a provider session task.
pub struct ProviderSession {
    provider: Arc<dyn Provider>,
    call_id: String,
    settings: SessionConfig,
    state: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ProviderSession {
    pub fn new(provider: Arc<dyn Provider>, call_id: &str, settings: SessionConfig) -> Self {
        let (state, state_rx) = watch::channel(SessionState::Idle);
        Self {
            provider,
            call_id: call_id.to_string(),
            settings,
            state: Arc::new(state),
            state_rx,
            shutdown: None,
            task: None,
        }
    }

    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Starts transcribing `audio`. Only valid from `Idle`; later calls are
    /// ignored.
    pub fn start(&mut self, audio: AudioConsumer, sink: EventSink) {
        if self.state() != SessionState::Idle || self.task.is_some() {
            tracing::warn!(
                provider = %self.provider.id(),
                channel_id = %self.call_id,
                state = %self.state(),
                "provider session already started"
            );
            return;
        }
        self.state.send_replace(SessionState::Starting);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let runner = Runner {
            continuity: Continuity::new(self.provider.format(), self.provider.session_limit()),
            provider: self.provider.clone(),
            call_id: self.call_id.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
            audio,
            sink,
            outbox: VecDeque::new(),
            failures: 0,
        };
        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(runner.run(shutdown_rx)));
    }

    /// Stops the session and waits for its task, up to the end timeout.
    ///
    /// Safe to call repeatedly and before `start`. A failed session stays
    /// `Failed`; anything else ends `Ended`.
    pub async fn end(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The task may already have exited.
            let _ = shutdown.send(());
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.settings.end_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        provider = %self.provider.id(),
                        channel_id = %self.call_id,
                        error = %e,
                        "provider session task died"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        provider = %self.provider.id(),
                        channel_id = %self.call_id,
                        timeout = ?self.settings.end_timeout,
                        "provider session did not stop in time, aborting"
                    );
                    task.abort();
                }
            }
        }
        self.state.send_modify(|state| {
            if !state.is_terminal() {
                *state = SessionState::Ended;
            }
        });
    }
}

impl Drop for ProviderSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Audio waiting to go to the current underlying session.
enum Outgoing {
    Replay(Bytes),
    Live(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    Limit,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Ended,
    Failed,
}

enum Step {
    Continue,
    Restart(Cause),
    Stop(Exit),
}

struct Runner {
    provider: Arc<dyn Provider>,
    call_id: String,
    settings: SessionConfig,
    state: Arc<watch::Sender<SessionState>>,
    continuity: Continuity,
    audio: AudioConsumer,
    sink: EventSink,
    outbox: VecDeque<Outgoing>,
    /// Consecutive error-driven restarts and failed opens.
    failures: u32,
}

impl Runner {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let exit = self.drive(&mut shutdown).await;
        self.continuity.release();
        self.outbox.clear();

        match exit {
            Exit::Ended => {
                tracing::info!(
                    provider = %self.provider.id(),
                    channel_id = %self.call_id,
                    restarts = self.continuity.restart_count(),
                    "provider session ended"
                );
                self.set_state(SessionState::Ended);
            }
            Exit::Failed => {
                tracing::error!(
                    provider = %self.provider.id(),
                    channel_id = %self.call_id,
                    failures = self.failures,
                    "provider session failed, giving up on this provider for the call"
                );
                self.set_state(SessionState::Failed);
            }
        }
    }

    async fn drive(&mut self, shutdown: &mut oneshot::Receiver<()>) -> Exit {
        let mut underlying = match self.open(shutdown).await {
            Ok(session) => session,
            Err(exit) => return exit,
        };
        let limit = self.provider.session_limit();
        let timer = tokio::time::sleep(limit);
        tokio::pin!(timer);
        let mut audio_ended = false;

        loop {
            let step = tokio::select! {
                biased;

                _ = &mut *shutdown => Step::Stop(Exit::Ended),

                () = &mut timer => Step::Restart(Cause::Limit),

                event = underlying.events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => Step::Restart(Cause::Error),
                },

                permit = underlying.audio.reserve(), if !self.outbox.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(item) = self.outbox.pop_front() {
                            let chunk = match item {
                                Outgoing::Replay(chunk) => chunk,
                                Outgoing::Live(chunk) => {
                                    self.continuity.record_live(chunk.clone());
                                    chunk
                                }
                            };
                            permit.send(chunk);
                        }
                        Step::Continue
                    }
                    Err(_) => {
                        tracing::warn!(
                            provider = %self.provider.id(),
                            channel_id = %self.call_id,
                            "provider stopped accepting audio"
                        );
                        Step::Restart(Cause::Error)
                    }
                },

                chunk = self.audio.recv(), if self.outbox.is_empty() && !audio_ended => match chunk {
                    Some(chunk) => {
                        self.outbox.push_back(Outgoing::Live(chunk));
                        Step::Continue
                    }
                    None => {
                        audio_ended = true;
                        Step::Stop(Exit::Ended)
                    }
                },
            };

            match step {
                Step::Continue => {}
                Step::Stop(exit) => {
                    if audio_ended {
                        tracing::debug!(
                            provider = %self.provider.id(),
                            channel_id = %self.call_id,
                            "audio stream ended"
                        );
                    }
                    underlying.close().await;
                    return exit;
                }
                Step::Restart(cause) => {
                    underlying = match self.restart(underlying, cause, shutdown).await {
                        Ok(session) => session,
                        Err(exit) => return exit,
                    };
                    timer.as_mut().reset(Instant::now() + limit);
                }
            }
        }
    }

    fn on_event(&mut self, event: ProviderEvent) -> Step {
        match event {
            ProviderEvent::Ready => {
                self.mark_streaming();
                Step::Continue
            }
            ProviderEvent::Result {
                end_ms,
                is_final,
                payload,
            } => {
                self.mark_streaming();
                self.failures = 0;
                let stamp = self.continuity.stamp(end_ms, is_final);
                tracing::trace!(
                    provider = %self.provider.id(),
                    channel_id = %self.call_id,
                    end_ms,
                    offset_ms = stamp.offset_ms,
                    is_final,
                    "provider result"
                );
                self.sink.emit(TranscriptEvent {
                    call_id: self.call_id.clone(),
                    provider_id: self.provider.id().to_string(),
                    session_ordinal: stamp.session_ordinal,
                    utterance_id: stamp.utterance_id,
                    offset_ms: stamp.offset_ms,
                    is_final,
                    payload,
                });
                Step::Continue
            }
            ProviderEvent::Error(message) => {
                tracing::warn!(
                    provider = %self.provider.id(),
                    channel_id = %self.call_id,
                    error = %message,
                    "provider session error"
                );
                Step::Restart(Cause::Error)
            }
            ProviderEvent::Closed => {
                tracing::info!(
                    provider = %self.provider.id(),
                    channel_id = %self.call_id,
                    "provider closed the session"
                );
                Step::Restart(Cause::Error)
            }
        }
    }

    /// Replaces the underlying session and queues the continuity replay
    /// ahead of any live audio not yet delivered.
    async fn restart(
        &mut self,
        old: UnderlyingSession,
        cause: Cause,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<UnderlyingSession, Exit> {
        self.set_state(SessionState::Restarting);
        tokio::spawn(old.close());

        // Undelivered replay is part of the new replay.
        let replay = self.continuity.begin_restart();
        self.outbox.retain(|item| matches!(item, Outgoing::Live(_)));

        match cause {
            Cause::Limit => self.failures = 0,
            Cause::Error => {
                self.failures += 1;
                if self.failures > self.settings.max_restart_attempts {
                    return Err(Exit::Failed);
                }
                self.pause(shutdown).await?;
            }
        }

        tracing::info!(
            provider = %self.provider.id(),
            channel_id = %self.call_id,
            ?cause,
            restart = self.continuity.restart_count(),
            replay_chunks = replay.len(),
            "restarting provider session"
        );

        let session = self.open(shutdown).await?;
        for chunk in replay.into_iter().rev() {
            self.outbox.push_front(Outgoing::Replay(chunk));
        }
        self.set_state(SessionState::Streaming);
        Ok(session)
    }

    /// Opens an underlying session, retrying with backoff while the failure
    /// budget lasts.
    async fn open(
        &mut self,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<UnderlyingSession, Exit> {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = &mut *shutdown => return Err(Exit::Ended),
                attempt = self.provider.open() => attempt,
            };
            match attempt {
                Ok(session) => return Ok(session),
                Err(e) => {
                    self.failures += 1;
                    tracing::warn!(
                        provider = %self.provider.id(),
                        channel_id = %self.call_id,
                        error = %e,
                        failures = self.failures,
                        "failed to open provider session"
                    );
                    if self.failures > self.settings.max_restart_attempts {
                        return Err(Exit::Failed);
                    }
                    self.pause(shutdown).await?;
                }
            }
        }
    }

    /// Backs off before the next attempt. Shutdown cuts the pause short.
    async fn pause(&self, shutdown: &mut oneshot::Receiver<()>) -> Result<(), Exit> {
        let delay = backoff(self.settings.restart_backoff, self.failures);
        tokio::select! {
            biased;
            _ = &mut *shutdown => Err(Exit::Ended),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn mark_streaming(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Starting {
                *state = SessionState::Streaming;
                true
            } else {
                false
            }
        });
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(
                provider = %self.provider.id(),
                channel_id = %self.call_id,
                from = %previous,
                to = %next,
                "provider session state"
            );
        }
    }
}

/// `base`, doubled for every failure after the first.
fn backoff(base: Duration, failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << doublings).min(MAX_BACKOFF)
}
