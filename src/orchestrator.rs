//! Call lifecycle: control messages in, audio streams and provider sessions
//! out.
//!
//! The orchestrator owns every active call, keyed by `channelId`. It is
//! driven by exactly one control task, which handles messages in arrival
//! order, so no locking is needed around the call table. Ending a call
//! never waits on a provider: session teardown runs on its own tasks.

use crate::bus::{BusMessage, Subscription};
use crate::config::SessionConfig;
use crate::control::{Call, ControlMessage, ControlTopics};
use crate::media::AudioStreamRegistry;
use crate::provider::Provider;
use crate::publisher::PublishQueue;
use crate::session::{ProviderSession, SessionState};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// An active call and its provider sessions.
struct ActiveCall {
    call: Arc<Call>,
    sessions: Vec<ProviderSession>,
}

pub struct Orchestrator {
    registry: AudioStreamRegistry,
    providers: Vec<Arc<dyn Provider>>,
    settings: SessionConfig,
    queue: PublishQueue,
    topics: ControlTopics,
    calls: HashMap<String, ActiveCall>,
    /// Calls whose sessions are still winding down.
    ending: JoinSet<()>,
}

impl Orchestrator {
    pub fn new(
        registry: AudioStreamRegistry,
        providers: Vec<Arc<dyn Provider>>,
        settings: SessionConfig,
        queue: PublishQueue,
        topics: ControlTopics,
    ) -> Self {
        Self {
            registry,
            providers,
            settings,
            queue,
            topics,
            calls: HashMap::new(),
            ending: JoinSet::new(),
        }
    }

    /// Starts transcribing `call` with every provider.
    ///
    /// Returns `false` when the channel or the port is already in use; the
    /// request is then ignored.
    pub fn start(&mut self, call: Call) -> bool {
        if self.calls.contains_key(&call.channel_id) {
            tracing::warn!(
                channel_id = %call.channel_id,
                port = call.port,
                "call already active, ignoring newStream"
            );
            return false;
        }
        let stream = match self.registry.create(call.port) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    channel_id = %call.channel_id,
                    port = call.port,
                    error = %e,
                    "ignoring newStream"
                );
                return false;
            }
        };
        if self.providers.is_empty() {
            tracing::warn!(channel_id = %call.channel_id, "no providers enabled, audio will be discarded");
        }

        let call = Arc::new(call);
        let sessions = self
            .providers
            .iter()
            .map(|provider| {
                // Subscribed before the session task runs so no audio is missed.
                let consumer = stream.subscribe();
                let mut session =
                    ProviderSession::new(provider.clone(), &call.channel_id, self.settings.clone());
                session.start(consumer, self.queue.sink_for(call.clone()));
                session
            })
            .collect();

        tracing::info!(
            channel_id = %call.channel_id,
            room = %call.room_name,
            port = call.port,
            providers = self.providers.len(),
            "call started"
        );
        self.calls.insert(
            call.channel_id.clone(),
            ActiveCall {
                call,
                sessions,
            },
        );
        true
    }

    /// Removes the call and destroys its stream, then ends its provider
    /// sessions in the background.
    ///
    /// An unknown channel is logged and ignored, but a stream left on `port`
    /// is still destroyed unless another call owns that port. Returns
    /// whether a call was ended. Use [`Orchestrator::wait_ended`] to wait for
    /// the sessions.
    pub fn end(&mut self, channel_id: &str, port: u16) -> bool {
        let Some(active) = self.calls.remove(channel_id) else {
            tracing::warn!(channel_id, port, "no active call, ignoring streamEnded");
            if !self.port_in_use(port) {
                self.registry.destroy(port);
            }
            return false;
        };
        if active.call.port != port {
            tracing::warn!(
                channel_id,
                port,
                call_port = active.call.port,
                "streamEnded port does not match the call"
            );
        }

        self.registry.destroy(active.call.port);
        self.retire(active);
        true
    }

    /// Ends the call's sessions on a task of their own.
    fn retire(&mut self, mut active: ActiveCall) {
        self.ending.spawn(async move {
            join_all(active.sessions.iter_mut().map(|session| session.end())).await;
            tracing::info!(
                channel_id = %active.call.channel_id,
                port = active.call.port,
                "call ended"
            );
        });
    }

    /// Waits until every ended call's sessions have stopped.
    pub async fn wait_ended(&mut self) {
        while let Some(joined) = self.ending.join_next().await {
            log_teardown(joined);
        }
    }

    /// Ends every active call and waits for their sessions.
    pub async fn shutdown(&mut self) {
        let calls: Vec<ActiveCall> = self.calls.drain().map(|(_, active)| active).collect();
        if !calls.is_empty() {
            tracing::info!(calls = calls.len(), "ending active calls");
        }
        self.registry.destroy_all();
        for active in calls {
            self.retire(active);
        }
        self.wait_ended().await;
    }

    /// Applies one control message.
    pub fn handle(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::NewStream(msg) => {
                self.start(Call::from(msg));
            }
            ControlMessage::StreamEnded(msg) => {
                self.end(&msg.channel_id, msg.port);
            }
        }
    }

    fn dispatch(&mut self, message: BusMessage) {
        match ControlMessage::parse(&self.topics, &message.topic, &message.payload) {
            Ok(Some(control)) => self.handle(control),
            Ok(None) => tracing::trace!(topic = %message.topic, "not a control topic"),
            Err(e) => tracing::warn!(error = %e, "ignoring control message"),
        }
    }

    /// Drains `control` until it closes or `shutdown` flips to `true`, then
    /// ends every call.
    pub async fn run(mut self, mut control: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = self.ending.join_next(), if !self.ending.is_empty() => {
                    log_teardown(joined);
                }
                message = control.recv() => match message {
                    Some(message) => self.dispatch(message),
                    None => {
                        tracing::warn!("control subscription closed");
                        break;
                    }
                },
            }
        }
        self.shutdown().await;
        tracing::debug!("control task stopped");
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn call(&self, channel_id: &str) -> Option<&Call> {
        self.calls.get(channel_id).map(|active| active.call.as_ref())
    }

    /// `(provider id, state)` for each session of the call.
    pub fn session_states(&self, channel_id: &str) -> Vec<(String, SessionState)> {
        self.calls
            .get(channel_id)
            .map(|active| {
                active
                    .sessions
                    .iter()
                    .map(|s| (s.provider_id().to_string(), s.state()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// State receivers for each session of the call.
    pub fn watch_sessions(&self, channel_id: &str) -> Vec<watch::Receiver<SessionState>> {
        self.calls
            .get(channel_id)
            .map(|active| active.sessions.iter().map(ProviderSession::watch_state).collect())
            .unwrap_or_default()
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.calls.values().any(|active| active.call.port == port)
    }
}

fn log_teardown(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "call teardown task died");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, MessageBus};
    use crate::provider::ScriptedProvider;
    use crate::publisher::{PublishRequest, publish_queue};
    use crate::stats::PublishStats;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn settings() -> SessionConfig {
        SessionConfig {
            max_restart_attempts: 1,
            restart_backoff: Duration::from_millis(5),
            end_timeout: Duration::from_secs(1),
        }
    }

    fn call(channel_id: &str, port: u16) -> Call {
        Call {
            channel_id: channel_id.to_string(),
            room_name: format!("room-{channel_id}"),
            caller_name: "Alice".to_string(),
            port,
        }
    }

    fn orchestrator(
        providers: &[ScriptedProvider],
    ) -> (Orchestrator, AudioStreamRegistry, mpsc::Receiver<PublishRequest>) {
        let registry = AudioStreamRegistry::new(1 << 20);
        let (queue, rx) = publish_queue(64, Arc::new(PublishStats::default()));
        let providers = providers
            .iter()
            .map(|p| Arc::new(p.clone()) as Arc<dyn Provider>)
            .collect();
        let orchestrator = Orchestrator::new(
            registry.clone(),
            providers,
            settings(),
            queue,
            ControlTopics::new("dana"),
        );
        (orchestrator, registry, rx)
    }

    async fn wait_all(orchestrator: &Orchestrator, channel_id: &str, wanted: SessionState) {
        for mut rx in orchestrator.watch_sessions(channel_id) {
            rx.wait_for(|s| *s == wanted).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_fans_out_to_every_provider() {
        let a = ScriptedProvider::new("a", Duration::from_secs(10));
        let b = ScriptedProvider::new("b", Duration::from_secs(10));
        let (mut orch, registry, _rx) = orchestrator(&[a.clone(), b.clone()]);

        assert!(orch.start(call("c1", 5000)));
        assert!(registry.contains(5000));
        let ids: Vec<String> = orch.session_states("c1").into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        wait_all(&orch, "c1", SessionState::Streaming).await;

        registry.route(5000, Bytes::from_static(&[1, 2, 3, 4]));
        a.wait_for(|p| p.chunks(0).len() == 1).await;
        b.wait_for(|p| p.chunks(0).len() == 1).await;

        assert!(orch.end("c1", 5000));
        assert!(!registry.contains(5000));
        assert_eq!(orch.active_calls(), 0);
        orch.wait_ended().await;
        assert!(a.is_closed(0));
        assert!(b.is_closed(0));
    }

    #[tokio::test]
    async fn test_duplicate_channel_and_port_are_ignored() {
        let a = ScriptedProvider::new("a", Duration::from_secs(10));
        let (mut orch, _registry, _rx) = orchestrator(&[a.clone()]);

        assert!(orch.start(call("c1", 5000)));
        assert!(!orch.start(call("c1", 5002)));
        assert!(!orch.start(call("c2", 5000)));
        assert_eq!(orch.active_calls(), 1);
        assert_eq!(orch.call("c1").map(|c| c.port), Some(5000));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_unknown_channel_keeps_other_calls_stream() {
        let a = ScriptedProvider::new("a", Duration::from_secs(10));
        let (mut orch, registry, _rx) = orchestrator(&[a]);
        orch.start(call("c1", 5000));

        assert!(!orch.end("ghost", 5000));
        assert!(registry.contains(5000));

        registry.create(6000).unwrap();
        assert!(!orch.end("ghost", 6000));
        assert!(!registry.contains(6000));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_provider_does_not_block_others_and_still_ends() {
        let good = ScriptedProvider::new("good", Duration::from_secs(10));
        let bad = ScriptedProvider::new("bad", Duration::from_secs(10)).with_failing_opens(100);
        let (mut orch, _registry, _rx) = orchestrator(&[good.clone(), bad.clone()]);

        orch.start(call("c1", 5000));
        let watches = orch.watch_sessions("c1");
        let mut good_state = watches[0].clone();
        let mut bad_state = watches[1].clone();
        good_state
            .wait_for(|s| *s == SessionState::Streaming)
            .await
            .unwrap();
        bad_state
            .wait_for(|s| *s == SessionState::Failed)
            .await
            .unwrap();

        assert!(orch.end("c1", 5000));
        orch.wait_ended().await;
        assert_eq!(*good_state.borrow(), SessionState::Ended);
        assert_eq!(*bad_state.borrow(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_control_task_applies_messages_in_order() {
        let a = ScriptedProvider::new("a", Duration::from_secs(10));
        let (orch, registry, _rx) = orchestrator(&[a.clone()]);
        let bus = LocalBus::new();
        let control = bus.subscribe("dana/+").await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(orch.run(control, stop_rx));

        bus.publish("dana/garbage", json!({})).await.unwrap();
        bus.publish("dana/newStream", json!({"channelId": "c1", "port": 0, "roomName": "r"}))
            .await
            .unwrap();
        bus.publish(
            "dana/newStream",
            json!({"channelId": "c1", "port": "5000", "roomName": "r", "callerName": "Bob"}),
        )
        .await
        .unwrap();
        a.wait_for(|p| p.session_count() == 1).await;
        assert!(registry.contains(5000));

        bus.publish("dana/streamEnded", json!({"channelId": "c1", "port": 5000}))
            .await
            .unwrap();
        a.wait_for(|p| p.is_closed(0)).await;

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_slow_teardown_does_not_delay_next_call() {
        let a = ScriptedProvider::new("a", Duration::from_secs(10)).with_lingering_close();
        let (orch, registry, _rx) = orchestrator(&[a.clone()]);
        let bus = LocalBus::new();
        let control = bus.subscribe("dana/+").await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(orch.run(control, stop_rx));

        bus.publish("dana/newStream", json!({"channelId": "c1", "port": 5000, "roomName": "r"}))
            .await
            .unwrap();
        a.wait_for(|p| p.session_count() == 1).await;

        let started = tokio::time::Instant::now();
        bus.publish("dana/streamEnded", json!({"channelId": "c1", "port": 5000}))
            .await
            .unwrap();
        bus.publish("dana/newStream", json!({"channelId": "c2", "port": 5002, "roomName": "r"}))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_millis(500), async {
            while !registry.contains(5002) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second call waited on the first call's teardown");
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!registry.contains(5000));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_ends_all_calls() {
        let a = ScriptedProvider::new("a", Duration::from_secs(10));
        let (mut orch, registry, _rx) = orchestrator(&[a.clone()]);
        orch.start(call("c1", 5000));
        orch.start(call("c2", 5002));
        a.wait_for(|p| p.session_count() == 2).await;

        orch.shutdown().await;
        assert_eq!(orch.active_calls(), 0);
        assert!(registry.is_empty());
        assert!(a.is_closed(0) && a.is_closed(1));
    }
}
