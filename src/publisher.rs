//! Result publisher.
//!
//! Provider sessions hand transcript events to an [`EventSink`], which never
//! waits: when the hand-off queue is full the event is dropped and counted.
//! A single [`ResultPublisher`] task drains the queue in order and
//! republishes each event on the call's room topic.

use crate::bus::{MessageBus, publish_with_retry};
use crate::control::{Call, ControlTopics};
use crate::session::TranscriptEvent;
use crate::stats::{PublishStats, bump};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One event waiting to be published, with the call it belongs to.
#[derive(Debug)]
pub struct PublishRequest {
    pub call: Arc<Call>,
    pub event: TranscriptEvent,
}

/// Sending half of the hand-off queue.
#[derive(Clone)]
pub struct PublishQueue {
    tx: mpsc::Sender<PublishRequest>,
    stats: Arc<PublishStats>,
}

/// Creates the hand-off queue between provider sessions and the publisher.
pub fn publish_queue(
    capacity: usize,
    stats: Arc<PublishStats>,
) -> (PublishQueue, mpsc::Receiver<PublishRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PublishQueue { tx, stats }, rx)
}

impl PublishQueue {
    /// Sink that tags every event with `call`.
    pub fn sink_for(&self, call: Arc<Call>) -> EventSink {
        EventSink {
            queue: self.clone(),
            call,
        }
    }
}

/// Where a provider session sends its transcript events.
#[derive(Clone)]
pub struct EventSink {
    queue: PublishQueue,
    call: Arc<Call>,
}

impl EventSink {
    /// Queues `event` without waiting. Returns `false` if it was dropped.
    pub fn emit(&self, event: TranscriptEvent) -> bool {
        let request = PublishRequest {
            call: self.call.clone(),
            event,
        };
        match self.queue.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                bump(&self.queue.stats.queue_dropped);
                tracing::warn!(
                    channel_id = %request.call.channel_id,
                    provider = %request.event.provider_id,
                    "publish queue full, dropping transcript event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                bump(&self.queue.stats.queue_dropped);
                tracing::debug!(
                    channel_id = %request.call.channel_id,
                    "publisher stopped, dropping transcript event"
                );
                false
            }
        }
    }
}

/// Wire payload of a published result.
pub fn result_payload(call: &Call, event: &TranscriptEvent) -> Value {
    json!({
        "correctedTime": event.offset_ms,
        "results": event.payload,
        "id": event.utterance_id,
        "platform": event.provider_id,
        "callerName": call.caller_name,
        "isFinal": event.is_final,
        "sessionOrdinal": event.session_ordinal,
        "channelId": call.channel_id,
    })
}

/// Drains the hand-off queue onto the bus.
pub struct ResultPublisher {
    bus: Arc<dyn MessageBus>,
    topics: ControlTopics,
    attempts: u32,
    backoff: Duration,
    stats: Arc<PublishStats>,
    rx: mpsc::Receiver<PublishRequest>,
}

impl ResultPublisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topics: ControlTopics,
        attempts: u32,
        backoff: Duration,
        stats: Arc<PublishStats>,
        rx: mpsc::Receiver<PublishRequest>,
    ) -> Self {
        Self {
            bus,
            topics,
            attempts,
            backoff,
            stats,
            rx,
        }
    }

    /// Publishes until every [`PublishQueue`] clone is dropped and the queue
    /// is drained.
    pub async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            self.publish(&request).await;
        }
        tracing::debug!("result publisher stopped");
    }

    async fn publish(&self, request: &PublishRequest) {
        let topic = self.topics.transcription(&request.call.room_name);
        let payload = result_payload(&request.call, &request.event);
        match publish_with_retry(
            self.bus.as_ref(),
            &topic,
            payload,
            self.attempts,
            self.backoff,
        )
        .await
        {
            Ok(()) => bump(&self.stats.published),
            Err(e) => {
                bump(&self.stats.publish_dropped);
                tracing::warn!(
                    channel_id = %request.call.channel_id,
                    provider = %request.event.provider_id,
                    error = %e,
                    "dropping transcript event"
                );
            }
        }
    }
}
