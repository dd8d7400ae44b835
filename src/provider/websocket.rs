//! Generic streaming speech-to-text over a websocket.
//!
//! Wire protocol, one connection per underlying session:
//!
//! ```text
//! client → {"type":"start","encoding":"LINEAR16","sampleRate":16000,"language":"en-GB"}
//! client → <binary PCM frame> ...
//! server → {"type":"ready"}
//! server → {"type":"result","endMs":1840,"isFinal":false,"payload":{...}}
//! server → {"type":"error","message":"..."}
//! client → {"type":"stop"}
//! ```

use super::{
    AUDIO_CHANNEL_CAPACITY, AudioFormat, EVENT_CHANNEL_CAPACITY, Provider, ProviderEvent,
    UnderlyingSession,
};
use crate::config::ProviderConfig;
use crate::error::{Result, ScribeError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame<'a> {
    Start {
        encoding: &'a str,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        language: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        region: Option<&'a str>,
    },
    Stop,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Ready,
    Result {
        #[serde(rename = "endMs")]
        end_ms: u64,
        #[serde(rename = "isFinal", default)]
        is_final: bool,
        #[serde(default)]
        payload: Value,
    },
    Error {
        message: String,
    },
}

impl From<ServerFrame> for ProviderEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::Ready => ProviderEvent::Ready,
            ServerFrame::Result {
                end_ms,
                is_final,
                payload,
            } => ProviderEvent::Result {
                end_ms,
                is_final,
                payload,
            },
            ServerFrame::Error { message } => ProviderEvent::Error(message),
        }
    }
}

pub struct WebsocketProvider {
    id: String,
    url: String,
    credentials: Option<String>,
    region: Option<String>,
    encoding: String,
    language: String,
    session_limit: Duration,
    format: AudioFormat,
}

impl WebsocketProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| ScribeError::ConfigInvalidValue {
                key: format!("providers.{}", config.id),
                message: "websocket providers need a url".to_string(),
            })?;
        Ok(Self {
            id: config.id.clone(),
            url,
            credentials: config.credentials.clone(),
            region: config.region.clone(),
            encoding: config.encoding.clone(),
            language: config.language.clone(),
            session_limit: config.session_limit,
            format: AudioFormat::new(config.sample_rate),
        })
    }

    fn open_error(&self, message: impl ToString) -> ScribeError {
        ScribeError::ProviderOpen {
            provider: self.id.clone(),
            message: message.to_string(),
        }
    }

    fn start_frame(&self) -> Result<String> {
        let frame = ClientFrame::Start {
            encoding: &self.encoding,
            sample_rate: self.format.sample_rate,
            language: &self.language,
            region: self.region.as_deref(),
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

#[async_trait]
impl Provider for WebsocketProvider {
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
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| self.open_error(e))?;
        if let Some(token) = &self.credentials {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| self.open_error(e))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| self.open_error(e))?;
        let (mut sink, stream) = ws.split();
        sink.send(Message::Text(self.start_frame()?))
            .await
            .map_err(|e| self.open_error(e))?;
        tracing::debug!(provider = %self.id, url = %self.url, "websocket session opened");

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task = tokio::spawn(pump(self.id.clone(), sink, stream, audio_rx, events_tx));
        Ok(UnderlyingSession::new(audio_tx, events_rx).with_task(task))
    }
}

/// Forwards audio to the socket and frames from the socket, until either
/// side goes away.
async fn pump(
    provider: String,
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    mut audio: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<ProviderEvent>,
) {
    let mut audio_done = false;
    loop {
        tokio::select! {
            chunk = audio.recv(), if !audio_done => match chunk {
                Some(chunk) => {
                    if let Err(e) = sink.send(Message::Binary(chunk.to_vec())).await {
                        // The session restarts on this, so losing the send is fine.
                        let _ = events.send(ProviderEvent::Error(e.to_string())).await;
                        return;
                    }
                }
                None => {
                    audio_done = true;
                    let stop = serde_json::to_string(&ClientFrame::Stop).unwrap_or_default();
                    if sink.send(Message::Text(stop)).await.is_err() {
                        return;
                    }
                }
            },
            frame = stream.next() => {
                let event = match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => ProviderEvent::from(frame),
                        Err(e) => {
                            tracing::warn!(%provider, error = %e, "ignoring unrecognised provider frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => ProviderEvent::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => ProviderEvent::Error(e.to_string()),
                };
                let terminal = matches!(event, ProviderEvent::Closed | ProviderEvent::Error(_));
                if events.send(event).await.is_err() || terminal {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
