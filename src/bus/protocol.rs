//! Newline-delimited JSON frames spoken on the bus socket.
//!
//! ```text
//! client → {"type":"publish","topic":"dana/newStream","payload":{...}}
//! server → {"type":"ok"}
//! client → {"type":"subscribe","filter":"dana/+/transcription"}
//! server → {"type":"ok"}
//! server → {"type":"message","topic":"dana/r1/transcription","payload":{...}}
//! server → {"type":"error","message":"..."}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Publish { topic: String, payload: Value },
    Subscribe { filter: String },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ok,
    Message { topic: String, payload: Value },
    Error { message: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
