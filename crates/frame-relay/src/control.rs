//! Quality control requests and the JSON messages exchanged with
//! WebSocket clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::channel::{Channel, QualityLevel};

/// Level assumed when a request does not name one.
pub const DEFAULT_LEVEL: &str = "medium";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
/// Acknowledgement sent back to the requesting client only.
pub struct QualityAck {
    pub level: String,
    pub quality_value: u8,
}

/// Apply a named quality level to `channel`. Unknown levels fall back to the
/// channel's default quality; the result is clamped to the channel bounds
/// and picked up by the next emit cycle.
pub fn set_quality_level(channel: &Channel, level: &str) -> QualityAck {
    let mut state = channel.lock();
    let requested = QualityLevel::parse(level)
        .map(QualityLevel::quality)
        .unwrap_or(state.default_quality);
    let applied = state.set_quality(requested);
    drop(state);

    metrics::gauge!("relay_quality").set(applied as f64);
    info!("Quality for {} set to {applied} ({level})", channel.id());
    QualityAck {
        level: level.to_string(),
        quality_value: applied,
    }
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Message received from a client.
pub enum ClientMessage {
    QualityAdjustment { level: String },
    /// Any event the relay does not handle.
    Unsupported(String),
}

impl ClientMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let Envelope { event, data } = serde_json::from_str(text)?;
        Ok(match event.as_str() {
            "quality_adjustment" => ClientMessage::QualityAdjustment {
                level: data
                    .get("level")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_LEVEL)
                    .to_string(),
            },
            _ => ClientMessage::Unsupported(event),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
/// Text message sent to a client.
pub enum ServerMessage<'a> {
    ConnectionAck { camera: &'a str, quality: u8 },
    QualityUpdated(QualityAck),
    Detections(&'a Value),
}

impl ServerMessage<'_> {
    pub fn to_json(&self) -> String {
        // Serialising these variants cannot fail: every key is a string.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::channel::{ChannelSettings, QualityBounds};

    fn channel(min: u8, max: u8) -> std::sync::Arc<Channel> {
        Channel::new(
            "MainCam",
            &ChannelSettings {
                default_quality: 65,
                quality_bounds: QualityBounds::new(min, max),
                target_scale: None,
                buffer_capacity: 1,
            },
        )
    }

    #[test]
    fn named_levels_set_their_quality() {
        let channel = channel(30, 95);
        assert_eq!(
            set_quality_level(&channel, "low"),
            QualityAck {
                level: "low".into(),
                quality_value: 30
            }
        );
        assert_eq!(channel.lock().quality, 30);
        assert_eq!(set_quality_level(&channel, "high").quality_value, 75);
    }

    #[test]
    fn unknown_levels_use_the_default_quality() {
        let channel = channel(30, 95);
        set_quality_level(&channel, "low");
        let ack = set_quality_level(&channel, "ultra");
        assert_eq!(ack.level, "ultra");
        assert_eq!(ack.quality_value, 65);
    }

    #[test]
    fn requests_are_clamped_to_bounds() {
        let channel = channel(40, 60);
        assert_eq!(set_quality_level(&channel, "low").quality_value, 40);
        assert_eq!(set_quality_level(&channel, "high").quality_value, 60);
    }

    #[test]
    fn quality_adjustment_defaults_to_medium() {
        assert_eq!(
            ClientMessage::parse(r#"{"event":"quality_adjustment","data":{"level":"low"}}"#).ok(),
            Some(ClientMessage::QualityAdjustment { level: "low".into() })
        );
        assert_eq!(
            ClientMessage::parse(r#"{"event":"quality_adjustment"}"#).ok(),
            Some(ClientMessage::QualityAdjustment {
                level: "medium".into()
            })
        );
        assert_eq!(
            ClientMessage::parse(r#"{"event":"join","data":"MainCam"}"#).ok(),
            Some(ClientMessage::Unsupported("join".into()))
        );
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn server_messages_use_event_and_data_keys() {
        let ack = ServerMessage::ConnectionAck {
            camera: "MainCam",
            quality: 65,
        };
        assert_eq!(
            serde_json::from_str::<Value>(&ack.to_json()).ok(),
            Some(json!({"event": "connection_ack", "data": {"camera": "MainCam", "quality": 65}}))
        );

        let updated = ServerMessage::QualityUpdated(QualityAck {
            level: "low".into(),
            quality_value: 30,
        });
        assert_eq!(
            serde_json::from_str::<Value>(&updated.to_json()).ok(),
            Some(json!({"event": "quality_updated", "data": {"level": "low", "quality_value": 30}}))
        );

        let detections = json!({"people": 2});
        assert_eq!(
            serde_json::from_str::<Value>(&ServerMessage::Detections(&detections).to_json()).ok(),
            Some(json!({"event": "detections", "data": {"people": 2}}))
        );
    }
}
