//! Port-keyed registry of live audio streams.

use crate::error::{Result, ScribeError};
use crate::media::stream::AudioStream;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Maps a source port to the audio stream of the call using it.
///
/// Cloning shares the same routes. The demultiplexer only reads; the
/// orchestrator creates and destroys.
#[derive(Clone)]
pub struct AudioStreamRegistry {
    routes: Arc<RwLock<HashMap<u16, AudioStream>>>,
    buffer_bytes: usize,
}

impl AudioStreamRegistry {
    /// Creates an empty registry whose streams buffer `buffer_bytes` per consumer.
    pub fn new(buffer_bytes: usize) -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            buffer_bytes,
        }
    }

    /// Allocates the stream for `port`.
    ///
    /// # Errors
    /// Returns `ScribeError::StreamExists` when the port already has a stream.
    pub fn create(&self, port: u16) -> Result<AudioStream> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.contains_key(&port) {
            return Err(ScribeError::StreamExists { port });
        }
        let stream = AudioStream::new(port, self.buffer_bytes);
        routes.insert(port, stream.clone());
        tracing::info!(port, "created audio stream for source port");
        Ok(stream)
    }

    /// Ends the stream for `port` and removes its route.
    ///
    /// Returns `false` (and does nothing else) when no stream is registered.
    pub fn destroy(&self, port: u16) -> bool {
        let removed = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
        match removed {
            Some(stream) => {
                stream.close();
                tracing::info!(
                    port,
                    dropped_bytes = stream.dropped_bytes(),
                    "destroyed audio stream"
                );
                true
            }
            None => {
                tracing::debug!(port, "no audio stream to destroy");
                false
            }
        }
    }

    /// Appends `chunk` to the stream registered for `port`.
    ///
    /// Returns `false` when the port has no stream.
    pub fn route(&self, port: u16, chunk: Bytes) -> bool {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        match routes.get(&port) {
            Some(stream) => {
                if !chunk.is_empty() {
                    stream.push(chunk);
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ends every stream. Used on shutdown.
    pub fn destroy_all(&self) {
        let drained: Vec<_> = self
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, stream) in drained {
            stream.close();
        }
    }
}
