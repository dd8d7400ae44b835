//! Control-plane messages.
//!
//! Two topics under the bus prefix start and stop transcription of a call:
//!
//! ```text
//! <prefix>/newStream    {"channelId":"c1","port":5000,"roomName":"r1","callerName":"Alice"}
//! <prefix>/streamEnded  {"channelId":"c1","port":5000}
//! ```
//!
//! `port` may arrive as a number or as a numeric string.

use crate::defaults;
use crate::error::{Result, ScribeError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A call being transcribed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub channel_id: String,
    pub room_name: String,
    pub caller_name: String,
    /// Source port of the call's RTP; the media routing key.
    pub port: u16,
}

/// Request to start transcribing a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStream {
    pub channel_id: String,
    #[serde(deserialize_with = "port_number_or_string")]
    pub port: u16,
    pub room_name: String,
    #[serde(default)]
    pub caller_name: String,
}

/// Request to stop transcribing a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnded {
    pub channel_id: String,
    #[serde(deserialize_with = "port_number_or_string")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    NewStream(NewStream),
    StreamEnded(StreamEnded),
}

impl From<NewStream> for Call {
    fn from(msg: NewStream) -> Self {
        Call {
            channel_id: msg.channel_id,
            room_name: msg.room_name,
            caller_name: msg.caller_name,
            port: msg.port,
        }
    }
}

/// Fully qualified topic names for one bus prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTopics {
    prefix: String,
    pub new_stream: String,
    pub stream_ended: String,
}

impl ControlTopics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            new_stream: format!("{prefix}/{}", defaults::NEW_STREAM_TOPIC),
            stream_ended: format!("{prefix}/{}", defaults::STREAM_ENDED_TOPIC),
        }
    }

    /// Filter matching both control topics and nothing deeper.
    pub fn filter(&self) -> String {
        format!("{}/+", self.prefix)
    }

    /// Result topic of a room.
    pub fn transcription(&self, room_name: &str) -> String {
        format!("{}/{room_name}/{}", self.prefix, defaults::TRANSCRIPTION_TOPIC)
    }

    /// Filter matching the result topics of every room.
    pub fn transcription_filter(&self) -> String {
        format!("{}/+/{}", self.prefix, defaults::TRANSCRIPTION_TOPIC)
    }
}

impl ControlMessage {
    /// Decodes and validates a control message.
    ///
    /// Returns `Ok(None)` for topics that are not control topics.
    pub fn parse(topics: &ControlTopics, topic: &str, payload: &Value) -> Result<Option<Self>> {
        let message = if topic == topics.new_stream {
            let msg: NewStream = decode(topic, payload)?;
            require_non_empty(topic, "channelId", &msg.channel_id)?;
            require_port(topic, msg.port)?;
            require_room(topic, &msg.room_name)?;
            ControlMessage::NewStream(msg)
        } else if topic == topics.stream_ended {
            let msg: StreamEnded = decode(topic, payload)?;
            require_non_empty(topic, "channelId", &msg.channel_id)?;
            require_port(topic, msg.port)?;
            ControlMessage::StreamEnded(msg)
        } else {
            return Ok(None);
        };
        Ok(Some(message))
    }

    pub fn channel_id(&self) -> &str {
        match self {
            ControlMessage::NewStream(msg) => &msg.channel_id,
            ControlMessage::StreamEnded(msg) => &msg.channel_id,
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(topic: &str, payload: &Value) -> Result<T> {
    T::deserialize(payload).map_err(|e| control_error(topic, e.to_string()))
}

fn require_non_empty(topic: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(control_error(topic, format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_port(topic: &str, port: u16) -> Result<()> {
    if port == 0 {
        return Err(control_error(topic, "port must not be 0".to_string()));
    }
    Ok(())
}

/// Room names become a topic level, so they may not contain separators or
/// wildcards.
fn require_room(topic: &str, room: &str) -> Result<()> {
    require_non_empty(topic, "roomName", room)?;
    if room.contains(['/', '+', '#']) {
        return Err(control_error(
            topic,
            format!("roomName {room:?} is not usable as a topic level"),
        ));
    }
    Ok(())
}

fn control_error(topic: &str, message: String) -> ScribeError {
    ScribeError::ControlMessage {
        topic: topic.to_string(),
        message,
    }
}

fn port_number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u64),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => u16::try_from(n)
            .map_err(|_| serde::de::Error::custom(format!("port {n} is out of range"))),
        Port::Text(s) => s
            .trim()
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("port {s:?} is not a port number"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topics() -> ControlTopics {
        ControlTopics::new("dana")
    }

    #[test]
    fn test_topic_names() {
        let t = topics();
        assert_eq!(t.new_stream, "dana/newStream");
        assert_eq!(t.stream_ended, "dana/streamEnded");
        assert_eq!(t.filter(), "dana/+");
        assert_eq!(t.transcription("room-1"), "dana/room-1/transcription");
        assert_eq!(t.transcription_filter(), "dana/+/transcription");
    }

    #[test]
    fn test_parse_new_stream_with_numeric_port() {
        let msg = ControlMessage::parse(
            &topics(),
            "dana/newStream",
            &json!({"channelId": "c1", "port": 5000, "roomName": "r1", "callerName": "Alice"}),
        )
        .unwrap()
        .unwrap();
        let ControlMessage::NewStream(msg) = msg else {
            panic!("expected newStream");
        };
        assert_eq!(msg.port, 5000);
        let call = Call::from(msg);
        assert_eq!(call.caller_name, "Alice");
        assert_eq!(call.room_name, "r1");
    }

    #[test]
    fn test_parse_accepts_string_port() {
        let msg = ControlMessage::parse(
            &topics(),
            "dana/streamEnded",
            &json!({"channelId": "c1", "port": "5000"}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::StreamEnded(StreamEnded {
                channel_id: "c1".to_string(),
                port: 5000
            })
        );
    }

    #[test]
    fn test_caller_name_is_optional() {
        let msg = ControlMessage::parse(
            &topics(),
            "dana/newStream",
            &json!({"channelId": "c1", "port": 5000, "roomName": "r1"}),
        )
        .unwrap();
        assert!(matches!(msg, Some(ControlMessage::NewStream(m)) if m.caller_name.is_empty()));
    }

    #[test]
    fn test_parse_rejects_bad_ports() {
        for port in [json!(70000), json!("abc"), json!(0), json!(-1)] {
            let result = ControlMessage::parse(
                &topics(),
                "dana/streamEnded",
                &json!({"channelId": "c1", "port": port}),
            );
            assert!(
                matches!(result, Err(ScribeError::ControlMessage { .. })),
                "port {port} accepted"
            );
        }
    }

    #[test]
    fn test_parse_rejects_missing_and_empty_fields() {
        let t = topics();
        assert!(ControlMessage::parse(&t, "dana/newStream", &json!({"port": 5000})).is_err());
        assert!(ControlMessage::parse(
            &t,
            "dana/newStream",
            &json!({"channelId": " ", "port": 5000, "roomName": "r1"})
        )
        .is_err());
        assert!(ControlMessage::parse(&t, "dana/newStream", &json!("not an object")).is_err());
    }

    #[test]
    fn test_parse_rejects_room_with_topic_separators() {
        for room in ["a/b", "a+", "#", ""] {
            let result = ControlMessage::parse(
                &topics(),
                "dana/newStream",
                &json!({"channelId": "c1", "port": 5000, "roomName": room}),
            );
            assert!(result.is_err(), "room {room:?} accepted");
        }
    }

    #[test]
    fn test_other_topics_are_not_control() {
        let result =
            ControlMessage::parse(&topics(), "dana/r1/transcription", &json!({})).unwrap();
        assert!(result.is_none());
    }
}
