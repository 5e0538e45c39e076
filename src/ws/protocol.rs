//! Wire frames for the presence and signaling channels.
//!
//! Every frame is a JSON object with a string `type` discriminator. A frame
//! that fails to parse, or whose `type` is unknown, is dropped without a
//! reply; both channels are lenient by design.

use crate::registry::AudioStatus;
use serde::Deserialize;
use serde_json::Value;

/// Incoming presence-channel frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum PresenceFrame {
    #[serde(rename = "identify")]
    Identify { flat_id: String },

    #[serde(rename = "broadcast:start")]
    BroadcastStart,

    #[serde(rename = "broadcast:stop")]
    BroadcastStop,

    /// Audio telemetry. Field values come from browser-side state and are
    /// coerced rather than validated.
    #[serde(rename = "broadcast:status")]
    BroadcastStatus {
        #[serde(default, rename = "micOn")]
        mic_on: Value,
        #[serde(default, rename = "sysOn")]
        sys_on: Value,
        #[serde(default)]
        ptt: Value,
        #[serde(default)]
        speaking: Value,
        #[serde(default, rename = "micLevel")]
        mic_level: Value,
    },

    #[serde(rename = "listen:start")]
    ListenStart {
        #[serde(rename = "targetFlat")]
        target_flat: String,
    },

    #[serde(rename = "listen:stop")]
    ListenStop,
}

/// Incoming signaling-channel frames. The router never looks inside `sdp`
/// or `candidate`; they are relayed as opaque JSON.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum SignalFrame {
    #[serde(rename = "identify")]
    Identify {
        flat_id: String,
        #[serde(default)]
        role: Option<String>,
    },

    #[serde(rename = "listen:join")]
    ListenJoin {
        #[serde(rename = "targetFlat")]
        target_flat: String,
    },

    #[serde(rename = "listen:leave")]
    ListenLeave,

    #[serde(rename = "webrtc:offer")]
    Offer {
        #[serde(rename = "listenerId")]
        listener_id: String,
        sdp: Value,
    },

    #[serde(rename = "webrtc:answer")]
    Answer {
        #[serde(rename = "broadcasterFlat")]
        broadcaster_flat: String,
        sdp: Value,
    },

    /// Direction is inferred from which peer field is present.
    #[serde(rename = "webrtc:ice")]
    Ice {
        #[serde(default, rename = "listenerId")]
        listener_id: Option<String>,
        #[serde(default, rename = "broadcasterFlat")]
        broadcaster_flat: Option<String>,
        candidate: Value,
    },
}

/// Parse a presence frame; `None` means drop.
pub fn parse_presence(text: &str) -> Option<PresenceFrame> {
    serde_json::from_str(text).ok()
}

/// Parse a signaling frame; `None` means drop.
pub fn parse_signal(text: &str) -> Option<SignalFrame> {
    serde_json::from_str(text).ok()
}

/// Coerce an arbitrary JSON value to a boolean, JS-truthiness style.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Coerce an arbitrary JSON value to a number; anything non-numeric is 0.
pub fn coerce_number(value: &Value) -> f64 {
    let n = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// Build the coerced audio status from a `broadcast:status` payload.
pub fn audio_status(
    mic_on: &Value,
    sys_on: &Value,
    ptt: &Value,
    speaking: &Value,
    mic_level: &Value,
) -> AudioStatus {
    AudioStatus {
        mic_on: coerce_bool(mic_on),
        sys_on: coerce_bool(sys_on),
        ptt: coerce_bool(ptt),
        speaking: coerce_bool(speaking),
        mic_level: coerce_number(mic_level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_identify() {
        let frame = parse_presence(r#"{"type":"identify","flat_id":" a1 "}"#);
        match frame {
            Some(PresenceFrame::Identify { flat_id }) => assert_eq!(flat_id, " a1 "),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn parses_bare_control_frames() {
        assert!(matches!(
            parse_presence(r#"{"type":"broadcast:start"}"#),
            Some(PresenceFrame::BroadcastStart)
        ));
        assert!(matches!(
            parse_presence(r#"{"type":"listen:stop"}"#),
            Some(PresenceFrame::ListenStop)
        ));
    }

    #[test]
    fn unknown_and_malformed_frames_drop() {
        assert!(parse_presence(r#"{"type":"nope"}"#).is_none());
        assert!(parse_presence("not json").is_none());
        assert!(parse_presence(r#"{"flat_id":"A1"}"#).is_none());
        assert!(parse_signal(r#"{"type":"listen:join"}"#).is_none());
    }

    #[test]
    fn status_fields_are_optional() {
        let frame = parse_presence(r#"{"type":"broadcast:status","micOn":true}"#).unwrap();
        match frame {
            PresenceFrame::BroadcastStatus {
                mic_on, mic_level, ..
            } => {
                assert!(coerce_bool(&mic_on));
                assert_eq!(coerce_number(&mic_level), 0.0);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn signal_ice_carries_either_peer_field() {
        let from_broadcaster =
            parse_signal(r#"{"type":"webrtc:ice","listenerId":"abcd","candidate":{}}"#).unwrap();
        match from_broadcaster {
            SignalFrame::Ice {
                listener_id,
                broadcaster_flat,
                ..
            } => {
                assert_eq!(listener_id.as_deref(), Some("abcd"));
                assert!(broadcaster_flat.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let from_listener =
            parse_signal(r#"{"type":"webrtc:ice","broadcasterFlat":"a1","candidate":null}"#)
                .unwrap();
        assert!(matches!(
            from_listener,
            SignalFrame::Ice {
                listener_id: None,
                ..
            }
        ));
    }

    #[test]
    fn bool_coercion_follows_truthiness() {
        assert!(!coerce_bool(&json!(null)));
        assert!(!coerce_bool(&json!(false)));
        assert!(!coerce_bool(&json!(0)));
        assert!(!coerce_bool(&json!("")));
        assert!(coerce_bool(&json!(1)));
        assert!(coerce_bool(&json!("on")));
        assert!(coerce_bool(&json!({})));
    }

    #[test]
    fn number_coercion_defaults_to_zero() {
        assert_eq!(coerce_number(&json!(0.25)), 0.25);
        assert_eq!(coerce_number(&json!("0.5")), 0.5);
        assert_eq!(coerce_number(&json!("loud")), 0.0);
        assert_eq!(coerce_number(&json!(null)), 0.0);
        assert_eq!(coerce_number(&json!(true)), 1.0);
        assert_eq!(coerce_number(&json!([1])), 0.0);
    }
}
