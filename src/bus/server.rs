//! Unix socket front end for a [`LocalBus`].
//!
//! Each connection may interleave any number of publish and subscribe
//! frames. Every frame gets an `ok` or `error` reply; after an `ok` to a
//! subscribe, matching messages stream down the same connection.

use super::protocol::{ClientFrame, ServerFrame};
use super::{LocalBus, MessageBus, SUBSCRIPTION_CAPACITY, Subscription};
use crate::error::{Result, ScribeError};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

pub struct BusServer {
    socket_path: PathBuf,
    listener: UnixListener,
    bus: LocalBus,
}

impl BusServer {
    /// Binds the socket, replacing a stale socket file left at `socket_path`.
    ///
    /// # Errors
    /// Returns `ScribeError::BusSocket` if the old file cannot be removed or
    /// the socket cannot be bound.
    pub fn bind(socket_path: PathBuf, bus: LocalBus) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| ScribeError::BusSocket {
                message: format!("Failed to remove existing socket: {e}"),
            })?;
        }
        let listener = UnixListener::bind(&socket_path).map_err(|e| ScribeError::BusSocket {
            message: format!("Failed to bind to {}: {e}", socket_path.display()),
        })?;
        tracing::info!(socket = %socket_path.display(), "bus socket listening");
        Ok(Self {
            socket_path,
            listener,
            bus,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serves connections until `shutdown` flips to `true`, then closes every
    /// connection and removes the socket file.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut connections = JoinSet::new();
        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let bus = self.bus.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_client(stream, bus).await {
                                tracing::debug!(error = %e, "bus client disconnected");
                            }
                        });
                    }
                    Err(e) => {
                        break Err(ScribeError::BusConnection {
                            message: format!("Failed to accept connection: {e}"),
                        });
                    }
                },
            }
        };
        connections.shutdown().await;
        self.stop()?;
        outcome
    }

    fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| ScribeError::BusSocket {
                message: format!("Failed to remove socket file: {e}"),
            })?;
        }
        Ok(())
    }
}

async fn handle_client(stream: UnixStream, bus: LocalBus) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
    let writer_task = tokio::spawn(write_frames(writer, out_rx));
    let mut forwarders = JoinSet::new();

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ScribeError::BusConnection {
            message: format!("Failed to read frame: {e}"),
        })?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (reply, subscription) = handle_frame(&bus, line).await;
        if out_tx.send(reply).await.is_err() {
            break;
        }
        // Started only after the ok is queued so it precedes every message.
        if let Some(subscription) = subscription {
            forwarders.spawn(forward(subscription, out_tx.clone()));
        }
    }

    forwarders.shutdown().await;
    drop(out_tx);
    match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(ScribeError::Other(format!("bus writer task failed: {e}"))),
    }
}

async fn handle_frame(bus: &LocalBus, line: &str) -> (ServerFrame, Option<Subscription>) {
    match ClientFrame::from_json(line) {
        Ok(ClientFrame::Publish { topic, payload }) => match bus.publish(&topic, payload).await {
            Ok(()) => (ServerFrame::Ok, None),
            Err(e) => (error_frame(e), None),
        },
        Ok(ClientFrame::Subscribe { filter }) => match bus.subscribe(&filter).await {
            Ok(subscription) => (ServerFrame::Ok, Some(subscription)),
            Err(e) => (error_frame(e), None),
        },
        Err(e) => (
            ServerFrame::Error {
                message: format!("Invalid frame: {e}"),
            },
            None,
        ),
    }
}

fn error_frame(e: ScribeError) -> ServerFrame {
    ServerFrame::Error {
        message: e.to_string(),
    }
}

async fn forward(mut subscription: Subscription, out: mpsc::Sender<ServerFrame>) {
    while let Some(message) = subscription.recv().await {
        let frame = ServerFrame::Message {
            topic: message.topic,
            payload: message.payload,
        };
        if out.send(frame).await.is_err() {
            break;
        }
    }
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<ServerFrame>) -> Result<()> {
    while let Some(frame) = rx.recv().await {
        let mut json = frame.to_json().map_err(|e| ScribeError::BusProtocol {
            message: format!("Failed to serialize frame: {e}"),
        })?;
        json.push('\n');
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| ScribeError::BusConnection {
                message: format!("Failed to write frame: {e}"),
            })?;
        writer.flush().await.map_err(|e| ScribeError::BusConnection {
            message: format!("Failed to flush writer: {e}"),
        })?;
    }
    Ok(())
}
