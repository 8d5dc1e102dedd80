//! JSON wire protocol for co-creation meetings.
//!
//! Every frame, in both directions, is a single text frame carrying one
//! envelope:
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ { "type": "<event name>", "payload": { ...fields... } }  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound envelopes decode into [`InboundEvent`]. Event names this crate
//! does not know about are kept verbatim in [`InboundEvent::Other`] so that
//! consumers can interpret application-specific traffic themselves.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Free-form JSON object, used for shared context documents.
pub type JsonObject = Map<String, Value>;

/// Event names used on the wire.
pub mod kinds {
    pub const JOIN_MEETING: &str = "join_meeting";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const LEAVE_MEETING: &str = "leave_meeting";
    pub const UPDATE_PHASE: &str = "update_phase";
    pub const UPDATE_SHARED_CONTEXT: &str = "update_shared_context";

    pub const PARTICIPANTS_STATE: &str = "participants_state";
    pub const HEART_RATE_UPDATE: &str = "heart_rate_update";
    pub const PHASE_CHANGED: &str = "phase_changed";
    pub const SHARED_CONTEXT_UPDATED: &str = "shared_context_updated";
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("malformed `{kind}` payload: {source}")]
    MalformedPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("unknown {what} `{value}`")]
    UnknownVariant { what: &'static str, value: String },
}

/// Participant role within a meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Local,
    Remote,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Local => "local",
            Role::Remote => "remote",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Role::Host),
            "local" => Ok(Role::Local),
            "remote" => Ok(Role::Remote),
            other => Err(ProtocolError::UnknownVariant {
                what: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// Stage of the meeting workflow.
///
/// `lobby → shared_context_setup → cocreation → showcase`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingPhase {
    #[default]
    Lobby,
    SharedContextSetup,
    Cocreation,
    Showcase,
}

impl MeetingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingPhase::Lobby => "lobby",
            MeetingPhase::SharedContextSetup => "shared_context_setup",
            MeetingPhase::Cocreation => "cocreation",
            MeetingPhase::Showcase => "showcase",
        }
    }
}

impl fmt::Display for MeetingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeetingPhase {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lobby" => Ok(MeetingPhase::Lobby),
            "shared_context_setup" => Ok(MeetingPhase::SharedContextSetup),
            "cocreation" => Ok(MeetingPhase::Cocreation),
            "showcase" => Ok(MeetingPhase::Showcase),
            other => Err(ProtocolError::UnknownVariant {
                what: "meeting phase",
                value: other.to_string(),
            }),
        }
    }
}

/// Online/offline status the server reports for a participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    #[default]
    Online,
    Offline,
}

/// One heart-rate reading attributed to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartRateSample {
    /// Empty when the reading was embedded in a participant entry
    /// without its own `userId`.
    #[serde(default)]
    pub user_id: String,
    pub bpm: u32,
    /// ISO-8601 string or epoch milliseconds, whichever the sender used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Any other fields the sender attached (source, confidence, ...).
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl HeartRateSample {
    pub fn new(user_id: impl Into<String>, bpm: u32) -> Self {
        Self {
            user_id: user_id.into(),
            bpm,
            timestamp: None,
            extra: JsonObject::new(),
        }
    }
}

/// Server view of one participant, as carried by `participants_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub avatar_seed: Option<String>,
    #[serde(default)]
    pub status: ParticipantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<HeartRateSample>,
    /// Server bookkeeping (joinedAt, lastHeartbeat, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: JsonObject,
}

/// Payload of `participants_state`: a full resync of the meeting roster.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsState {
    #[serde(default)]
    pub participants: Option<BTreeMap<String, ParticipantView>>,
    #[serde(default)]
    pub phase: Option<MeetingPhase>,
    #[serde(default)]
    pub shared_context: Option<JsonObject>,
}

#[derive(Debug, Deserialize)]
struct PhasePayload {
    #[serde(default)]
    phase: Option<MeetingPhase>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharedContextPayload {
    #[serde(default)]
    shared_context: Option<JsonObject>,
}

/// Wire envelope, identical in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::MalformedEnvelope)
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        // A missing payload reads as an empty object so that all-optional
        // payloads still decode.
        let payload = match &self.payload {
            Value::Null => Value::Object(JsonObject::new()),
            other => other.clone(),
        };
        serde_json::from_value(payload).map_err(|source| ProtocolError::MalformedPayload {
            kind: self.kind.clone(),
            source,
        })
    }
}

/// Decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Full roster resync.
    ParticipantsState(ParticipantsState),
    /// Single heart-rate reading.
    HeartRateUpdate(HeartRateSample),
    /// Meeting moved to another phase.
    PhaseChanged {
        phase: Option<MeetingPhase>,
        envelope: Envelope,
    },
    /// Shared context document replaced.
    SharedContextUpdated {
        shared_context: Option<JsonObject>,
        envelope: Envelope,
    },
    /// Any event type this crate does not interpret.
    Other(Envelope),
}

impl InboundEvent {
    /// Parse a text frame into a typed event.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(Envelope::decode(text)?)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        match envelope.kind.as_str() {
            kinds::PARTICIPANTS_STATE => Ok(Self::ParticipantsState(envelope.payload_as()?)),
            kinds::HEART_RATE_UPDATE => Ok(Self::HeartRateUpdate(envelope.payload_as()?)),
            kinds::PHASE_CHANGED => {
                let PhasePayload { phase } = envelope.payload_as()?;
                Ok(Self::PhaseChanged { phase, envelope })
            }
            kinds::SHARED_CONTEXT_UPDATED => {
                let SharedContextPayload { shared_context } = envelope.payload_as()?;
                Ok(Self::SharedContextUpdated {
                    shared_context,
                    envelope,
                })
            }
            _ => Ok(Self::Other(envelope)),
        }
    }

    /// The wire event name.
    pub fn kind(&self) -> &str {
        match self {
            Self::ParticipantsState(_) => kinds::PARTICIPANTS_STATE,
            Self::HeartRateUpdate(_) => kinds::HEART_RATE_UPDATE,
            Self::PhaseChanged { envelope, .. }
            | Self::SharedContextUpdated { envelope, .. }
            | Self::Other(envelope) => &envelope.kind,
        }
    }
}

/// Commands the client writes to the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    JoinMeeting {
        role: Role,
        avatar_seed: String,
        phase: MeetingPhase,
    },
    Heartbeat {
        phase: MeetingPhase,
    },
    LeaveMeeting {
        reason: String,
    },
    UpdatePhase {
        phase: MeetingPhase,
    },
    UpdateSharedContext {
        shared_context: JsonObject,
    },
    /// Application-defined event; the payload is sent as given plus a
    /// timestamp when it is an object without one.
    Custom {
        kind: String,
        payload: Value,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> &str {
        match self {
            Self::JoinMeeting { .. } => kinds::JOIN_MEETING,
            Self::Heartbeat { .. } => kinds::HEARTBEAT,
            Self::LeaveMeeting { .. } => kinds::LEAVE_MEETING,
            Self::UpdatePhase { .. } => kinds::UPDATE_PHASE,
            Self::UpdateSharedContext { .. } => kinds::UPDATE_SHARED_CONTEXT,
            Self::Custom { kind, .. } => kind,
        }
    }

    /// Wrap into a wire envelope stamped with `timestamp`.
    pub fn into_envelope(self, timestamp: &str) -> Envelope {
        let kind = self.kind().to_string();
        let mut payload = match self {
            Self::JoinMeeting {
                role,
                avatar_seed,
                phase,
            } => object([
                ("role", Value::from(role.as_str())),
                ("avatarSeed", Value::from(avatar_seed)),
                ("phase", Value::from(phase.as_str())),
            ]),
            Self::Heartbeat { phase } | Self::UpdatePhase { phase } => {
                object([("phase", Value::from(phase.as_str()))])
            }
            Self::LeaveMeeting { reason } => object([("reason", Value::from(reason))]),
            Self::UpdateSharedContext { shared_context } => {
                object([("sharedContext", Value::Object(shared_context))])
            }
            Self::Custom { payload, .. } => payload,
        };

        match &mut payload {
            Value::Object(fields) => {
                fields
                    .entry("timestamp")
                    .or_insert_with(|| Value::from(timestamp));
            }
            Value::Null => payload = object([("timestamp", Value::from(timestamp))]),
            _ => {}
        }

        Envelope::new(kind, payload)
    }
}

fn object<const N: usize>(fields: [(&str, Value); N]) -> Value {
    Value::Object(
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

/// Current time as an ISO-8601 UTC string with millisecond precision.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
