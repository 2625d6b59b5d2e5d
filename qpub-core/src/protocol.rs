//! Wire protocol frames for the QPub streaming transport.
//!
//! Every frame on the wire is a JSON object carrying an integer `action`
//! discriminant plus the fields that action requires. [`Frame`] models the
//! discriminated union; the JSON mapping goes through an internal raw mirror
//! struct so that missing required fields surface as typed [`FrameError`]s
//! rather than panics or silent defaults.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Protocol action codes. The numeric values are fixed by the server and must
/// never be re-ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Connect = 0,
    Connected = 1,
    Disconnect = 2,
    Disconnected = 3,
    Subscribe = 4,
    Subscribed = 5,
    Unsubscribe = 6,
    Unsubscribed = 7,
    Publish = 8,
    Published = 9,
    Message = 10,
    Error = 11,
    Ping = 12,
    Pong = 13,
}

impl Action {
    /// The integer code exchanged on the wire.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Action::code`].
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Action::Connect,
            1 => Action::Connected,
            2 => Action::Disconnect,
            3 => Action::Disconnected,
            4 => Action::Subscribe,
            5 => Action::Subscribed,
            6 => Action::Unsubscribe,
            7 => Action::Unsubscribed,
            8 => Action::Publish,
            9 => Action::Published,
            10 => Action::Message,
            11 => Action::Error,
            12 => Action::Ping,
            13 => Action::Pong,
            _ => return None,
        })
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u64::deserialize(deserializer)?;
        Action::from_code(code)
            .ok_or_else(|| de::Error::custom(format_args!("unknown action code {code}")))
    }
}

/// Error payload carried by an ERROR frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Protocol-level error code.
    pub code: i64,
    /// Link to documentation for this error, when the server provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// Human-readable description.
    pub message: String,
    /// The closest HTTP status code, when applicable.
    #[serde(rename = "statusCode", default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl ErrorInfo {
    /// A client-side error payload, used when surfacing local failures
    /// through the same event path as server errors.
    pub fn local(code: i64, message: impl Into<String>) -> Self {
        Self { code, href: None, message: message.into(), status_code: None }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(code: {}, message: {}", self.code, self.message)?;
        if let Some(status) = self.status_code {
            write!(f, ", status: {status}")?;
        }
        if let Some(href) = &self.href {
            write!(f, ", see: {href}")?;
        }
        write!(f, ")")
    }
}

/// Session details reported by the server in a CONNECTED frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// One application payload inside a PUBLISH or MESSAGE frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MessagePayload {
    pub fn from_data(data: impl Into<Value>) -> Self {
        Self { alias: None, event: None, data: Some(data.into()) }
    }

    pub fn with_event(event: impl Into<String>, data: impl Into<Value>) -> Self {
        Self { alias: None, event: Some(event.into()), data: Some(data.into()) }
    }
}

/// Body of an inbound MESSAGE frame.
///
/// `timestamp` is an opaque server-assigned string; the client orders
/// messages by arrival and payload index, never by parsing it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageFrame {
    pub id: String,
    pub timestamp: String,
    pub channel: String,
    pub messages: Vec<MessagePayload>,
}

/// A protocol frame, outbound or inbound.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Connect,
    Connected { connection_id: String, connection_details: Option<ConnectionDetails> },
    Disconnect,
    Disconnected { reason: Option<String>, code: Option<i64> },
    Subscribe { channel: String },
    Subscribed { channel: String, subscription_id: Option<String> },
    Unsubscribe { channel: String },
    Unsubscribed { channel: String, subscription_id: Option<String> },
    Publish { channel: String, messages: Vec<MessagePayload> },
    Published { channel: String },
    Message(MessageFrame),
    Error { channel: Option<String>, error: ErrorInfo },
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

impl Frame {
    pub fn action(&self) -> Action {
        match self {
            Frame::Connect => Action::Connect,
            Frame::Connected { .. } => Action::Connected,
            Frame::Disconnect => Action::Disconnect,
            Frame::Disconnected { .. } => Action::Disconnected,
            Frame::Subscribe { .. } => Action::Subscribe,
            Frame::Subscribed { .. } => Action::Subscribed,
            Frame::Unsubscribe { .. } => Action::Unsubscribe,
            Frame::Unsubscribed { .. } => Action::Unsubscribed,
            Frame::Publish { .. } => Action::Publish,
            Frame::Published { .. } => Action::Published,
            Frame::Message(_) => Action::Message,
            Frame::Error { .. } => Action::Error,
            Frame::Ping { .. } => Action::Ping,
            Frame::Pong { .. } => Action::Pong,
        }
    }

    /// The channel this frame is scoped to, when it is channel-scoped.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Frame::Subscribe { channel }
            | Frame::Subscribed { channel, .. }
            | Frame::Unsubscribe { channel }
            | Frame::Unsubscribed { channel, .. }
            | Frame::Publish { channel, .. }
            | Frame::Published { channel } => Some(channel),
            Frame::Message(m) => Some(&m.channel),
            Frame::Error { channel, .. } => channel.as_deref(),
            _ => None,
        }
    }

    /// Encodes the frame as a JSON text frame.
    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(&RawFrame::from(self)).map_err(FrameError::Json)
    }

    /// Decodes a JSON text frame, with typed errors for unknown actions and
    /// missing required fields.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text).map_err(FrameError::Json)?;
        Frame::try_from(raw)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel() {
            Some(channel) => write!(f, "{:?} frame for channel {channel:?}", self.action()),
            None => write!(f, "{:?} frame", self.action()),
        }
    }
}

/// Failure to map between [`Frame`] and its JSON representation.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown action code {0}")]
    UnknownAction(u64),

    #[error("{action:?} frame is missing required field `{field}`")]
    MissingField { action: Action, field: &'static str },

    #[error("{action:?} frame has an invalid `{field}` field")]
    InvalidField { action: Action, field: &'static str },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Flat mirror of the wire object. All action-specific fields are optional
/// here; [`Frame::try_from`] enforces which ones each action requires.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawFrame {
    action: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    // MESSAGE carries an opaque string timestamp, PING/PONG an integer one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    messages: Option<Vec<MessagePayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

impl From<&Frame> for RawFrame {
    fn from(frame: &Frame) -> Self {
        let mut raw = RawFrame { action: frame.action().code() as u64, ..Default::default() };
        match frame {
            Frame::Connect | Frame::Disconnect => {}
            Frame::Connected { connection_id, connection_details } => {
                raw.connection_id = Some(connection_id.clone());
                raw.connection_details = connection_details.clone();
            }
            Frame::Disconnected { reason, code } => {
                raw.reason = reason.clone();
                raw.code = *code;
            }
            Frame::Subscribe { channel } | Frame::Unsubscribe { channel } => {
                raw.channel = Some(channel.clone());
            }
            Frame::Subscribed { channel, subscription_id }
            | Frame::Unsubscribed { channel, subscription_id } => {
                raw.channel = Some(channel.clone());
                raw.subscription_id = subscription_id.clone();
            }
            Frame::Publish { channel, messages } => {
                raw.channel = Some(channel.clone());
                raw.messages = Some(messages.clone());
            }
            Frame::Published { channel } => {
                raw.channel = Some(channel.clone());
            }
            Frame::Message(m) => {
                raw.id = Some(m.id.clone());
                raw.timestamp = Some(Value::String(m.timestamp.clone()));
                raw.channel = Some(m.channel.clone());
                raw.messages = Some(m.messages.clone());
            }
            Frame::Error { channel, error } => {
                raw.channel = channel.clone();
                raw.error = Some(error.clone());
            }
            Frame::Ping { timestamp } | Frame::Pong { timestamp } => {
                raw.timestamp = Some(Value::from(*timestamp));
            }
        }
        raw
    }
}

fn require<T>(value: Option<T>, action: Action, field: &'static str) -> Result<T, FrameError> {
    value.ok_or(FrameError::MissingField { action, field })
}

fn string_timestamp(value: Option<Value>, action: Action) -> Result<String, FrameError> {
    match require(value, action, "timestamp")? {
        Value::String(s) => Ok(s),
        // Some servers report epoch numbers here; keep them as opaque text.
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(FrameError::InvalidField { action, field: "timestamp" }),
    }
}

fn int_timestamp(value: Option<Value>, action: Action) -> Result<i64, FrameError> {
    require(value, action, "timestamp")?
        .as_i64()
        .ok_or(FrameError::InvalidField { action, field: "timestamp" })
}

impl TryFrom<RawFrame> for Frame {
    type Error = FrameError;

    fn try_from(raw: RawFrame) -> Result<Self, FrameError> {
        let action =
            Action::from_code(raw.action).ok_or(FrameError::UnknownAction(raw.action))?;
        Ok(match action {
            Action::Connect => Frame::Connect,
            Action::Connected => Frame::Connected {
                connection_id: require(raw.connection_id, action, "connection_id")?,
                connection_details: raw.connection_details,
            },
            Action::Disconnect => Frame::Disconnect,
            Action::Disconnected => {
                Frame::Disconnected { reason: raw.reason, code: raw.code }
            }
            Action::Subscribe => {
                Frame::Subscribe { channel: require(raw.channel, action, "channel")? }
            }
            Action::Subscribed => Frame::Subscribed {
                channel: require(raw.channel, action, "channel")?,
                subscription_id: raw.subscription_id,
            },
            Action::Unsubscribe => {
                Frame::Unsubscribe { channel: require(raw.channel, action, "channel")? }
            }
            Action::Unsubscribed => Frame::Unsubscribed {
                channel: require(raw.channel, action, "channel")?,
                subscription_id: raw.subscription_id,
            },
            Action::Publish => Frame::Publish {
                channel: require(raw.channel, action, "channel")?,
                messages: require(raw.messages, action, "messages")?,
            },
            Action::Published => {
                Frame::Published { channel: require(raw.channel, action, "channel")? }
            }
            Action::Message => Frame::Message(MessageFrame {
                id: require(raw.id, action, "id")?,
                timestamp: string_timestamp(raw.timestamp, action)?,
                channel: require(raw.channel, action, "channel")?,
                messages: require(raw.messages, action, "messages")?,
            }),
            Action::Error => Frame::Error {
                channel: raw.channel,
                error: require(raw.error, action, "error")?,
            },
            Action::Ping => Frame::Ping { timestamp: int_timestamp(raw.timestamp, action)? },
            Action::Pong => Frame::Pong { timestamp: int_timestamp(raw.timestamp, action)? },
        })
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawFrame::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawFrame::deserialize(deserializer)?;
        Frame::try_from(raw).map_err(de::Error::custom)
    }
}
