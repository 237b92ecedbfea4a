//! Wire protocol between the link and the dashboard.
//!
//! All frames are JSON text messages with case-sensitive field names.
//!
//! Inbound frames are commands (`{"action": ..., "payload": ...}`) or
//! heartbeat acknowledgements (`{"type": "heartbeat_ack"}`). Outbound frames
//! are tagged by `type`, see [`Outbound`].

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::{Error, Result};

pub mod snapshot;

pub use snapshot::{PlaybackSnapshot, QueueEntry, QueueSnapshot, TrackInfo};

/// Commands the dashboard may issue.
#[derive(Clone, Eq, PartialEq, Hash, Debug, SerializeDisplay, DeserializeFromStr)]
pub enum Action {
    PlayPause,
    Skip,
    Previous,
    Stop,
    Loop,
    Shuffle,
    Search,

    /// Any action this side doesn't know. Ignored, never answered.
    Unknown(String),
}

impl Action {
    const PLAY_PAUSE: &str = "play_pause";
    const SKIP: &str = "skip";
    const PREVIOUS: &str = "previous";
    const STOP: &str = "stop";
    const LOOP: &str = "loop";
    const SHUFFLE: &str = "shuffle";
    const SEARCH: &str = "search";
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlayPause => write!(f, "{}", Self::PLAY_PAUSE),
            Self::Skip => write!(f, "{}", Self::SKIP),
            Self::Previous => write!(f, "{}", Self::PREVIOUS),
            Self::Stop => write!(f, "{}", Self::STOP),
            Self::Loop => write!(f, "{}", Self::LOOP),
            Self::Shuffle => write!(f, "{}", Self::SHUFFLE),
            Self::Search => write!(f, "{}", Self::SEARCH),
            Self::Unknown(action) => write!(f, "{action}"),
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    /// Parses an action name. Matching is case-sensitive and never fails:
    /// unrecognized names become [`Action::Unknown`].
    fn from_str(s: &str) -> Result<Self> {
        let action = match s {
            Self::PLAY_PAUSE => Self::PlayPause,
            Self::SKIP => Self::Skip,
            Self::PREVIOUS => Self::Previous,
            Self::STOP => Self::Stop,
            Self::LOOP => Self::Loop,
            Self::SHUFFLE => Self::Shuffle,
            Self::SEARCH => Self::Search,
            other => Self::Unknown(other.to_owned()),
        };

        Ok(action)
    }
}

/// A decoded inbound frame.
#[derive(Clone, PartialEq, Debug)]
pub enum Inbound {
    /// The dashboard acknowledged a heartbeat.
    HeartbeatAck,

    /// A command with its (possibly empty) payload.
    Command { action: Action, payload: Value },

    /// Well-formed JSON that carries neither an action nor a known type.
    Ignored,
}

/// Raw shape of inbound frames before classification.
#[derive(Deserialize)]
struct RawInbound {
    #[serde(rename = "type")]
    typ: Option<String>,
    action: Option<Action>,
    #[serde(default)]
    payload: Value,
}

impl Inbound {
    const HEARTBEAT_ACK: &str = "heartbeat_ack";

    /// Decodes a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if `frame` is not a JSON object.
    pub fn decode(frame: &str) -> Result<Self> {
        let raw: RawInbound = serde_json::from_str(frame)?;

        if raw.typ.as_deref() == Some(Self::HEARTBEAT_ACK) {
            return Ok(Self::HeartbeatAck);
        }

        Ok(match raw.action {
            Some(action) => Self::Command {
                action,
                payload: raw.payload,
            },
            None => Self::Ignored,
        })
    }
}

/// Extracts a non-empty search query from a command payload.
#[must_use]
pub fn query(payload: &Value) -> Option<&str> {
    payload
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|query| !query.is_empty())
}

/// Frames sent to the dashboard.
#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// What is playing right now; "nothing" is [`PlaybackSnapshot::idle`].
    NowPlaying(PlaybackSnapshot),

    /// The upcoming tracks, already truncated for transmission.
    QueueUpdate(QueueSnapshot),

    /// Liveness ping.
    Heartbeat,

    /// Correlated answer to a dashboard command.
    CommandResponse {
        action: Action,
        success: bool,
        message: String,
    },

    /// Answer to a `search` command.
    SearchResult {
        success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        track: Option<TrackInfo>,
    },
}

impl Outbound {
    /// Serializes the frame to its JSON text form.
    ///
    /// # Errors
    ///
    /// Serialization of these types does not fail in practice; errors are
    /// propagated for completeness.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NowPlaying(_) => "now_playing",
            Self::QueueUpdate(_) => "queue_update",
            Self::Heartbeat => "heartbeat",
            Self::CommandResponse { .. } => "command_response",
            Self::SearchResult { .. } => "search_result",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_commands() {
        let inbound = Inbound::decode(r#"{"action":"search","payload":{"query":" test "}}"#).unwrap();
        match inbound {
            Inbound::Command { action, payload } => {
                assert_eq!(action, Action::Search);
                assert_eq!(query(&payload), Some("test"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let inbound = Inbound::decode(r#"{"action":"skip"}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Command {
                action: Action::Skip,
                payload: Value::Null
            }
        );
    }

    #[test]
    fn classifies_acks_and_actionless_frames() {
        assert_eq!(
            Inbound::decode(r#"{"type":"heartbeat_ack"}"#).unwrap(),
            Inbound::HeartbeatAck
        );
        assert_eq!(Inbound::decode("{}").unwrap(), Inbound::Ignored);
        assert_eq!(
            Inbound::decode(r#"{"type":"something_else"}"#).unwrap(),
            Inbound::Ignored
        );
    }

    #[test]
    fn action_names_are_case_sensitive() {
        assert_eq!("SKIP".parse::<Action>().unwrap(), Action::Unknown("SKIP".into()));
        assert_eq!("play_pause".parse::<Action>().unwrap(), Action::PlayPause);
        assert_eq!(Action::PlayPause.to_string(), "play_pause");
    }

    #[test]
    fn rejects_malformed_frames() {
        for frame in ["", "not json", "[1,2]", "42", r#"{"action":7}"#, "{\"action\":"] {
            assert!(Inbound::decode(frame).is_err(), "{frame:?} decoded");
        }
    }

    #[test]
    fn query_requires_text() {
        assert_eq!(query(&json!({"query": ""})), None);
        assert_eq!(query(&json!({"query": 5})), None);
        assert_eq!(query(&Value::Null), None);
    }

    #[test]
    fn encodes_tagged_frames() {
        let heartbeat = Outbound::Heartbeat.encode().unwrap();
        assert_eq!(heartbeat, r#"{"type":"heartbeat"}"#);

        let response = Outbound::CommandResponse {
            action: Action::Skip,
            success: false,
            message: "Nothing is playing".to_owned(),
        };
        let value: Value = serde_json::from_str(&response.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "command_response",
                "action": "skip",
                "success": false,
                "message": "Nothing is playing",
            })
        );

        let failure = Outbound::SearchResult {
            success: false,
            message: "No tracks found".to_owned(),
            track: None,
        };
        let value: Value = serde_json::from_str(&failure.encode().unwrap()).unwrap();
        assert!(value.get("track").is_none());
    }
}
