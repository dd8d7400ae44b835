//! UDP packet demultiplexer.
//!
//! One socket carries every call. Each datagram's source port selects the
//! call's audio stream; everything else about the packet is ignored.

use crate::config::MediaConfig;
use crate::error::{Result, ScribeError};
use crate::media::packet::extract_payload;
use crate::media::registry::AudioStreamRegistry;
use crate::stats::{IngestStats, bump};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 65_536;

/// What happened to one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Payload of this many bytes was appended to a stream.
    Routed(usize),
    /// Shorter than the fixed header.
    TooShort,
    /// No stream registered for the source port.
    Unrouted,
}

/// Socket-free routing logic, shared by the receive loop and benchmarks.
#[derive(Clone)]
pub struct DatagramRouter {
    registry: AudioStreamRegistry,
    swap16: bool,
    stats: Arc<IngestStats>,
}

impl DatagramRouter {
    pub fn new(registry: AudioStreamRegistry, swap16: bool, stats: Arc<IngestStats>) -> Self {
        Self {
            registry,
            swap16,
            stats,
        }
    }

    /// Strips, optionally swaps, and routes one datagram by source port.
    pub fn dispatch(&self, datagram: &[u8], source_port: u16) -> Disposition {
        bump(&self.stats.datagrams);

        let Some(payload) = extract_payload(datagram, self.swap16) else {
            bump(&self.stats.short_dropped);
            tracing::debug!(
                source_port,
                len = datagram.len(),
                "dropping datagram shorter than RTP header"
            );
            return Disposition::TooShort;
        };

        let len = payload.len();
        if self.registry.route(source_port, payload) {
            self.stats
                .routed_bytes
                .fetch_add(len as u64, Ordering::Relaxed);
            Disposition::Routed(len)
        } else {
            bump(&self.stats.unrouted_dropped);
            tracing::trace!(source_port, "no stream for source port, dropping datagram");
            Disposition::Unrouted
        }
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }
}

/// Owns the media socket and feeds the registry.
pub struct PacketDemultiplexer {
    socket: UdpSocket,
    router: DatagramRouter,
}

impl PacketDemultiplexer {
    /// Binds the media socket.
    ///
    /// # Errors
    /// Returns `ScribeError::MediaBind` if the address cannot be bound. This
    /// is the one fatal error of the media plane.
    pub async fn bind(
        media: &MediaConfig,
        registry: AudioStreamRegistry,
        stats: Arc<IngestStats>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", media.host, media.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| ScribeError::MediaBind {
                addr: addr.clone(),
                message: e.to_string(),
            })?;
        tracing::info!(%addr, swap16 = media.swap16, "media socket bound");
        Ok(Self {
            socket,
            router: DatagramRouter::new(registry, media.swap16, stats),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives datagrams until shutdown is signalled.
    ///
    /// Transient receive errors are counted and skipped; any other receive
    /// error ends the loop with `ScribeError::MediaReceive`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.router.dispatch(&buf[..len], from.port());
                    }
                    Err(e) if is_transient(&e) => {
                        bump(&self.router.stats.receive_errors);
                        tracing::debug!(error = %e, "transient media receive error");
                    }
                    Err(e) => {
                        bump(&self.router.stats.receive_errors);
                        tracing::error!(error = %e, "media socket failed");
                        return Err(ScribeError::MediaReceive {
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        tracing::info!("media receive loop stopped");
        Ok(())
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn router(swap16: bool) -> (DatagramRouter, AudioStreamRegistry) {
        let registry = AudioStreamRegistry::new(4096);
        let router = DatagramRouter::new(registry.clone(), swap16, Arc::new(IngestStats::default()));
        (router, registry)
    }

    fn datagram(payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x80; 12];
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_short_datagram_is_counted_and_dropped() {
        let (router, registry) = router(false);
        registry.create(5000).unwrap();
        assert_eq!(router.dispatch(&[0u8; 5], 5000), Disposition::TooShort);
        let stats = router.stats().snapshot();
        assert_eq!(stats.datagrams, 1);
        assert_eq!(stats.short_dropped, 1);
        assert_eq!(stats.routed_bytes, 0);
    }

    #[test]
    fn test_unrouted_datagram_is_counted_and_dropped() {
        let (router, _registry) = router(false);
        assert_eq!(router.dispatch(&datagram(&[1, 2]), 5000), Disposition::Unrouted);
        assert_eq!(router.stats().snapshot().unrouted_dropped, 1);
    }

    #[tokio::test]
    async fn test_routed_payload_is_swapped() {
        let (router, registry) = router(true);
        let stream = registry.create(5000).unwrap();
        let mut consumer = stream.subscribe();

        assert_eq!(
            router.dispatch(&datagram(&[0x01, 0x02, 0x03, 0x04]), 5000),
            Disposition::Routed(4)
        );
        assert_eq!(consumer.recv().await.unwrap().as_ref(), &[0x02, 0x01, 0x04, 0x03]);
        assert_eq!(router.stats().snapshot().routed_bytes, 4);
    }

    #[tokio::test]
    async fn test_header_only_datagram_appends_nothing() {
        let (router, registry) = router(false);
        let stream = registry.create(5000).unwrap();
        let consumer = stream.subscribe();
        assert_eq!(router.dispatch(&[0u8; 12], 5000), Disposition::Routed(0));
        assert_eq!(consumer.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_receive_loop_routes_by_source_port() {
        let registry = AudioStreamRegistry::new(4096);
        let stats = Arc::new(IngestStats::default());
        let media = MediaConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            swap16: false,
        };
        let demux = PacketDemultiplexer::bind(&media, registry.clone(), stats.clone())
            .await
            .unwrap();
        let target = demux.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let source_port = sender.local_addr().unwrap().port();
        let stream = registry.create(source_port).unwrap();
        let mut consumer = stream.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(demux.run(shutdown_rx));

        sender.send_to(&datagram(&[9, 9, 9, 9]), target).await.unwrap();
        let chunk = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.as_ref(), &[9, 9, 9, 9]);

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(stats.snapshot().datagrams, 1);
    }

    #[tokio::test]
    async fn test_bind_failure_is_media_bind_error() {
        let occupied = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let media = MediaConfig {
            host: "127.0.0.1".to_string(),
            port: occupied.local_addr().unwrap().port(),
            swap16: false,
        };
        let result = PacketDemultiplexer::bind(
            &media,
            AudioStreamRegistry::new(16),
            Arc::new(IngestStats::default()),
        )
        .await;
        assert!(matches!(result, Err(ScribeError::MediaBind { .. })));
    }

    #[test]
    fn test_icmp_and_interrupt_errors_are_transient() {
        for kind in [
            io::ErrorKind::Interrupted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
        ] {
            assert!(is_transient(&io::Error::from(kind)), "{kind:?}");
        }
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::other("socket gone")));
    }
}
