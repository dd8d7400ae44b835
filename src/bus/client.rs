//! Client side of the bus socket.

use super::protocol::{ClientFrame, ServerFrame};
use super::{BusMessage, MessageBus, SUBSCRIPTION_CAPACITY, Subscription};
use crate::error::{Result, ScribeError};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

/// [`MessageBus`] backed by a remote [`super::BusServer`].
///
/// Each publish uses a short-lived connection, so a restarted daemon is
/// picked up without reconnect logic. Each subscription holds its own
/// connection for as long as the [`Subscription`] lives.
#[derive(Debug, Clone)]
pub struct SocketBusClient {
    socket_path: PathBuf,
}

impl SocketBusClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn connect(&self) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| ScribeError::BusConnection {
                message: format!(
                    "Failed to connect to {}: {e}",
                    self.socket_path.display()
                ),
            })?;
        let (reader, writer) = stream.into_split();
        Ok((BufReader::new(reader), writer))
    }
}

async fn send_frame(writer: &mut OwnedWriteHalf, frame: &ClientFrame) -> Result<()> {
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
    })
}

/// Next frame from the server, or `None` on a clean close.
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<ServerFrame>> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| ScribeError::BusConnection {
            message: format!("Failed to read frame: {e}"),
        })?;
    if n == 0 {
        return Ok(None);
    }
    ServerFrame::from_json(line.trim())
        .map(Some)
        .map_err(|e| ScribeError::BusProtocol {
            message: format!("Failed to deserialize frame: {e}"),
        })
}

async fn expect_ok(reader: &mut BufReader<OwnedReadHalf>) -> Result<()> {
    match read_frame(reader).await? {
        Some(ServerFrame::Ok) => Ok(()),
        Some(ServerFrame::Error { message }) => Err(ScribeError::BusProtocol { message }),
        Some(other) => Err(ScribeError::BusProtocol {
            message: format!("Unexpected reply: {other:?}"),
        }),
        None => Err(ScribeError::BusConnection {
            message: "Connection closed before reply".to_string(),
        }),
    }
}

#[async_trait]
impl MessageBus for SocketBusClient {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        let (mut reader, mut writer) = self.connect().await?;
        let frame = ClientFrame::Publish {
            topic: topic.to_string(),
            payload,
        };
        send_frame(&mut writer, &frame).await?;
        expect_ok(&mut reader).await
    }

    async fn subscribe(&self, filter: &str) -> Result<Subscription> {
        let (mut reader, mut writer) = self.connect().await?;
        let frame = ClientFrame::Subscribe {
            filter: filter.to_string(),
        };
        send_frame(&mut writer, &frame).await?;
        expect_ok(&mut reader).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let filter = filter.to_string();
        tokio::spawn(async move {
            // Keeps the write half open; the server treats EOF as a hang-up.
            let _writer = writer;
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    frame = read_frame(&mut reader) => frame,
                };
                match message {
                    Ok(Some(ServerFrame::Message { topic, payload })) => {
                        if tx.send(BusMessage { topic, payload }).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(other)) => {
                        tracing::debug!(%filter, frame = ?other, "ignoring frame on subscription");
                    }
                    Ok(None) => {
                        tracing::debug!(%filter, "bus closed subscription");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(%filter, error = %e, "subscription ended");
                        break;
                    }
                }
            }
        });
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusServer, LocalBus, publish_with_retry};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::watch;

    fn start_server(temp_dir: &TempDir, bus: LocalBus) -> (PathBuf, watch::Sender<bool>) {
        let socket_path = temp_dir.path().join("bus.sock");
        let server = BusServer::bind(socket_path.clone(), bus).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.run(stop_rx));
        (socket_path, stop_tx)
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_through_server() {
        let temp_dir = TempDir::new().unwrap();
        let (socket_path, _stop) = start_server(&temp_dir, LocalBus::new());
        let client = SocketBusClient::new(socket_path);

        let mut sub = client.subscribe("dana/+/transcription").await.unwrap();
        client
            .publish("dana/r1/transcription", json!({"id": "u1"}))
            .await
            .unwrap();
        client.publish("dana/newStream", json!({})).await.unwrap();
        client
            .publish("dana/r2/transcription", json!({"id": "u2"}))
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.topic, "dana/r1/transcription");
        assert_eq!(first.payload["id"], "u1");
        let second = sub.recv().await.unwrap();
        assert_eq!(second.topic, "dana/r2/transcription");
    }

    #[tokio::test]
    async fn test_server_rejection_is_protocol_error() {
        let temp_dir = TempDir::new().unwrap();
        let (socket_path, _stop) = start_server(&temp_dir, LocalBus::new());
        let client = SocketBusClient::new(socket_path);

        let result = client.publish("dana/#", json!(1)).await;
        assert!(matches!(result, Err(ScribeError::BusProtocol { .. })));
        let result = client.subscribe("dana/#/x").await;
        assert!(matches!(result, Err(ScribeError::BusProtocol { .. })));
    }

    #[tokio::test]
    async fn test_missing_daemon_is_connection_error() {
        let temp_dir = TempDir::new().unwrap();
        let client = SocketBusClient::new(temp_dir.path().join("absent.sock"));
        let result = client.publish("a/b", json!(1)).await;
        assert!(matches!(result, Err(ScribeError::BusConnection { .. })));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_attempts() {
        let temp_dir = TempDir::new().unwrap();
        let client = SocketBusClient::new(temp_dir.path().join("absent.sock"));
        let result =
            publish_with_retry(&client, "a/b", json!(1), 3, Duration::from_millis(1)).await;
        match result {
            Err(ScribeError::PublishExhausted { attempts, topic, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(topic, "a/b");
            }
            other => panic!("expected PublishExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscription_ends_when_server_stops() {
        let temp_dir = TempDir::new().unwrap();
        let (socket_path, stop) = start_server(&temp_dir, LocalBus::new());
        let client = SocketBusClient::new(socket_path);
        let mut sub = client.subscribe("#").await.unwrap();

        stop.send(true).unwrap();
        assert!(sub.recv().await.is_none());
    }
}
