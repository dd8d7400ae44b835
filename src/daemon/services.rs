//! The long-running tasks of the daemon, wired together.

use crate::bus::{LocalBus, MessageBus};
use crate::config::Config;
use crate::control::ControlTopics;
use crate::defaults;
use crate::error::{Result, ScribeError};
use crate::media::{AudioStreamRegistry, PacketDemultiplexer};
use crate::orchestrator::Orchestrator;
use crate::provider::Provider;
use crate::publisher::{ResultPublisher, publish_queue};
use crate::stats::{IngestStats, PublishStats};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Media ingest, control task, result publisher and stats reporter.
///
/// Everything stops when [`Services::shutdown`] is called: the media loop
/// and the control task observe the shutdown signal, the control task ends
/// every call, and the publisher drains what those calls produced.
pub struct Services {
    media_addr: SocketAddr,
    registry: AudioStreamRegistry,
    ingest: Arc<IngestStats>,
    publish: Arc<PublishStats>,
    shutdown: watch::Sender<bool>,
    media_task: Option<JoinHandle<Result<()>>>,
    control_task: JoinHandle<()>,
    publisher_task: JoinHandle<()>,
    reporter_task: JoinHandle<()>,
}

impl Services {
    /// Binds the media socket and starts every task on `bus`.
    ///
    /// The control subscription is in place when this returns, so control
    /// messages published afterwards are never missed.
    pub async fn start(
        config: &Config,
        providers: Vec<Arc<dyn Provider>>,
        bus: LocalBus,
    ) -> Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let topics = ControlTopics::new(&config.bus.prefix);
        let registry = AudioStreamRegistry::new(config.stream.buffer_bytes);
        let ingest = Arc::new(IngestStats::default());
        let publish = Arc::new(PublishStats::default());

        let demux = PacketDemultiplexer::bind(&config.media, registry.clone(), ingest.clone()).await?;
        let media_addr = demux.local_addr()?;
        let control = bus.subscribe(&topics.filter()).await?;

        let (queue, requests) = publish_queue(config.publish.queue_capacity, publish.clone());
        let publisher = ResultPublisher::new(
            Arc::new(bus),
            topics.clone(),
            config.bus.publish_retries,
            config.bus.publish_backoff,
            publish.clone(),
            requests,
        );
        let provider_ids: Vec<&str> = providers.iter().map(|p| p.id()).collect();
        tracing::info!(providers = ?provider_ids, prefix = %config.bus.prefix, "providers enabled");
        let orchestrator = Orchestrator::new(
            registry.clone(),
            providers,
            config.session.clone(),
            queue,
            topics,
        );

        let media_task = tokio::spawn(demux.run(shutdown_rx.clone()));
        let control_task = tokio::spawn(orchestrator.run(control, shutdown_rx.clone()));
        let publisher_task = tokio::spawn(publisher.run());
        let reporter_task = tokio::spawn(report_stats(
            ingest.clone(),
            publish.clone(),
            Duration::from_secs(defaults::STATS_INTERVAL_SECS),
            shutdown_rx,
        ));

        Ok(Self {
            media_addr,
            registry,
            ingest,
            publish,
            shutdown,
            media_task: Some(media_task),
            control_task,
            publisher_task,
            reporter_task,
        })
    }

    /// Address the media socket is bound to.
    pub fn media_addr(&self) -> SocketAddr {
        self.media_addr
    }

    pub fn registry(&self) -> &AudioStreamRegistry {
        &self.registry
    }

    pub fn ingest_stats(&self) -> &Arc<IngestStats> {
        &self.ingest
    }

    pub fn publish_stats(&self) -> &Arc<PublishStats> {
        &self.publish
    }

    /// Receiver that flips to `true` when shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Resolves when the media loop stops on its own, which only happens
    /// on a fatal socket error. Pending forever once it has been reported.
    pub async fn media_stopped(&mut self) -> Result<()> {
        let Some(task) = self.media_task.as_mut() else {
            return std::future::pending().await;
        };
        let outcome = task.await;
        self.media_task = None;
        flatten(outcome)
    }

    /// Stops every task, ending all calls and draining the publisher.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.send_replace(true);

        let media = match self.media_task.take() {
            Some(task) => flatten(task.await),
            None => Ok(()),
        };
        if let Err(e) = self.control_task.await {
            tracing::error!(error = %e, "control task failed");
        }
        if let Err(e) = self.publisher_task.await {
            tracing::error!(error = %e, "publisher task failed");
        }
        self.reporter_task.abort();

        tracing::info!(
            ingest = ?self.ingest.snapshot(),
            publish = ?self.publish.snapshot(),
            "final counters"
        );
        media
    }
}

fn flatten(outcome: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match outcome {
        Ok(result) => result,
        Err(e) => Err(ScribeError::Other(format!("media task failed: {e}"))),
    }
}

async fn report_stats(
    ingest: Arc<IngestStats>,
    publish: Arc<PublishStats>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let ingest = ingest.snapshot();
                let publish = publish.snapshot();
                tracing::info!(
                    datagrams = ingest.datagrams,
                    short_dropped = ingest.short_dropped,
                    unrouted_dropped = ingest.unrouted_dropped,
                    routed_bytes = ingest.routed_bytes,
                    receive_errors = ingest.receive_errors,
                    published = publish.published,
                    queue_dropped = publish.queue_dropped,
                    publish_dropped = publish.publish_dropped,
                    "counters"
                );
            }
        }
    }
}
