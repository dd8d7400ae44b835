//! Per-call audio stream with one producer and many consumers.
//!
//! Every consumer owns a private queue bounded in bytes. The producer never
//! waits: when a consumer falls behind, its oldest chunks are discarded so
//! that ingest keeps running for everyone else.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

struct ConsumerQueue {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    notify: Arc<Notify>,
}

struct Inner {
    closed: bool,
    next_id: u64,
    consumers: HashMap<u64, ConsumerQueue>,
}

struct Shared {
    capacity_bytes: usize,
    inner: Mutex<Inner>,
    dropped_bytes: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side of a call's audio, registered under the call's source port.
#[derive(Clone)]
pub struct AudioStream {
    port: u16,
    shared: Arc<Shared>,
}

impl AudioStream {
    /// Creates an open stream whose consumers each buffer at most
    /// `capacity_bytes` (a single oversized chunk is still accepted).
    pub fn new(port: u16, capacity_bytes: usize) -> Self {
        Self {
            port,
            shared: Arc::new(Shared {
                capacity_bytes,
                inner: Mutex::new(Inner {
                    closed: false,
                    next_id: 0,
                    consumers: HashMap::new(),
                }),
                dropped_bytes: AtomicU64::new(0),
            }),
        }
    }

    /// Routing key of this stream.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Appends a chunk to every consumer queue.
    ///
    /// Returns `false` once the stream has been closed.
    pub fn push(&self, chunk: Bytes) -> bool {
        let mut inner = self.shared.lock();
        if inner.closed {
            return false;
        }
        let capacity = self.shared.capacity_bytes;
        let mut dropped = 0u64;
        for queue in inner.consumers.values_mut() {
            while queue.bytes + chunk.len() > capacity {
                match queue.chunks.pop_front() {
                    Some(old) => {
                        queue.bytes -= old.len();
                        dropped += old.len() as u64;
                    }
                    None => break,
                }
            }
            queue.bytes += chunk.len();
            queue.chunks.push_back(chunk.clone());
            queue.notify.notify_one();
        }
        drop(inner);
        if dropped > 0 {
            self.shared
                .dropped_bytes
                .fetch_add(dropped, Ordering::Relaxed);
            tracing::debug!(port = self.port, dropped, "slow consumer, dropped oldest audio");
        }
        true
    }

    /// Registers a new consumer that sees every chunk pushed from now on.
    pub fn subscribe(&self) -> AudioConsumer {
        let notify = Arc::new(Notify::new());
        let mut inner = self.shared.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.consumers.insert(
                id,
                ConsumerQueue {
                    chunks: VecDeque::new(),
                    bytes: 0,
                    notify: notify.clone(),
                },
            );
        }
        AudioConsumer {
            id,
            port: self.port,
            shared: self.shared.clone(),
            notify,
        }
    }

    /// Signals end-of-data. Consumers drain what is queued, then see `None`.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for queue in inner.consumers.values() {
            queue.notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.shared.lock().consumers.len()
    }

    /// Bytes discarded by the drop-oldest policy across all consumers.
    pub fn dropped_bytes(&self) -> u64 {
        self.shared.dropped_bytes.load(Ordering::Relaxed)
    }
}

/// Consumer side of an [`AudioStream`]. Dropping it deregisters the queue.
pub struct AudioConsumer {
    id: u64,
    port: u16,
    shared: Arc<Shared>,
    notify: Arc<Notify>,
}

impl AudioConsumer {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits for the next chunk. Returns `None` once the stream is closed
    /// and this consumer's queue is drained.
    ///
    /// Cancel safe: a chunk is only removed from the queue when returned.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            {
                let mut inner = self.shared.lock();
                let closed = inner.closed;
                match inner.consumers.get_mut(&self.id) {
                    Some(queue) => {
                        if let Some(chunk) = queue.chunks.pop_front() {
                            queue.bytes -= chunk.len();
                            return Some(chunk);
                        }
                    }
                    None => return None,
                }
                if closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Bytes waiting in this consumer's queue.
    pub fn queued_bytes(&self) -> usize {
        self.shared
            .lock()
            .consumers
            .get(&self.id)
            .map_or(0, |queue| queue.bytes)
    }
}

impl Drop for AudioConsumer {
    fn drop(&mut self) {
        self.shared.lock().consumers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chunk(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[tokio::test]
    async fn test_consumers_receive_same_sequence() {
        let stream = AudioStream::new(5000, 1024);
        let mut a = stream.subscribe();
        let mut b = stream.subscribe();

        for i in 0..3u8 {
            assert!(stream.push(chunk(i, 4)));
        }
        stream.close();

        for consumer in [&mut a, &mut b] {
            let mut seen = Vec::new();
            while let Some(c) = consumer.recv().await {
                seen.push(c[0]);
            }
            assert_eq!(seen, vec![0, 1, 2]);
        }
    }

    #[tokio::test]
    async fn test_close_drains_before_end() {
        let stream = AudioStream::new(5000, 1024);
        let mut consumer = stream.subscribe();
        stream.push(chunk(7, 2));
        stream.close();

        assert_eq!(consumer.recv().await.map(|c| c[0]), Some(7));
        assert!(consumer.recv().await.is_none());
        assert!(!stream.push(chunk(8, 2)), "push after close is refused");
    }

    #[tokio::test]
    async fn test_drop_oldest_when_consumer_is_slow() {
        let stream = AudioStream::new(5000, 10);
        let mut consumer = stream.subscribe();

        for i in 0..5u8 {
            stream.push(chunk(i, 4));
        }
        // Capacity 10 holds two 4-byte chunks.
        assert_eq!(consumer.queued_bytes(), 8);
        assert_eq!(stream.dropped_bytes(), 12);

        stream.close();
        let mut seen = Vec::new();
        while let Some(c) = consumer.recv().await {
            seen.push(c[0]);
        }
        assert_eq!(seen, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_affect_fast_consumer() {
        let stream = AudioStream::new(5000, 8);
        let _slow = stream.subscribe();
        let mut fast = stream.subscribe();

        for i in 0..6u8 {
            stream.push(chunk(i, 4));
            assert_eq!(fast.recv().await.map(|c| c[0]), Some(i));
        }
        assert!(stream.dropped_bytes() > 0);
    }

    #[tokio::test]
    async fn test_deregistering_consumer_keeps_others_queue() {
        let stream = AudioStream::new(5000, 1024);
        let first = stream.subscribe();
        let mut second = stream.subscribe();
        stream.push(chunk(1, 2));
        stream.push(chunk(2, 2));

        drop(first);
        assert_eq!(stream.consumer_count(), 1);
        assert_eq!(second.queued_bytes(), 4);
        assert_eq!(second.recv().await.map(|c| c[0]), Some(1));
        assert_eq!(second.recv().await.map(|c| c[0]), Some(2));
    }

    #[tokio::test]
    async fn test_subscribe_after_close_sees_end() {
        let stream = AudioStream::new(5000, 1024);
        stream.close();
        let mut consumer = stream.subscribe();
        assert!(consumer.recv().await.is_none());
        assert_eq!(stream.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let stream = AudioStream::new(5000, 1024);
        let mut consumer = stream.subscribe();
        let producer = stream.clone();

        let handle = tokio::spawn(async move { consumer.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.push(chunk(9, 2));

        let received = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.map(|c| c[0]), Some(9));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_close() {
        let stream = AudioStream::new(5000, 1024);
        let mut consumer = stream.subscribe();
        let producer = stream.clone();

        let handle = tokio::spawn(async move { consumer.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.close();

        let received = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_none());
    }
}
