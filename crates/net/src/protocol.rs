//! Envelope codec
//!
//! One envelope is one JSON object on one line. Decoding is strict about
//! the fields routing depends on (`type`, `from`) and lenient about
//! everything else: unknown fields are ignored and unknown `type` values
//! are kept as opaque strings.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Envelope type tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// `MSG`, carries a payload
    Message,
    /// `TYPING`, carries no payload
    Typing,
    /// `HEARTBEAT`, sent only when a caller chooses to
    Heartbeat,
    /// Any other tag, passed through untouched
    Other(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeKind::Message => "MSG",
            EnvelopeKind::Typing => "TYPING",
            EnvelopeKind::Heartbeat => "HEARTBEAT",
            EnvelopeKind::Other(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "MSG" => EnvelopeKind::Message,
            "TYPING" => EnvelopeKind::Typing,
            "HEARTBEAT" => EnvelopeKind::Heartbeat,
            other => EnvelopeKind::Other(other.to_string()),
        }
    }
}

/// Payload content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Text,
    Image,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Text => "TEXT",
            ContentType::Image => "IMAGE",
        }
    }
}

/// Body of a `MSG` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub content_type: ContentType,
    /// UTF-8 text, or Base64 image bytes
    pub content: String,
    /// Caller-assigned reference to an earlier message, never interpreted here
    #[serde(default)]
    pub reply_id: Option<i64>,
}

impl Payload {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            content: content.into(),
            reply_id: None,
        }
    }

    pub fn image(base64: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Image,
            content: base64.into(),
            reply_id: None,
        }
    }

    pub fn with_reply(mut self, reply_id: Option<i64>) -> Self {
        self.reply_id = reply_id;
        self
    }
}

/// One transport message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    /// Sender identifier, never empty
    pub from: String,
    /// Target identifier; `None` means everyone
    pub to: Option<String>,
    pub payload: Option<Payload>,
    /// Producer wall clock, milliseconds since the epoch
    pub timestamp: i64,
}

/// Reasons a line is not a usable envelope
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("empty sender identifier")]
    EmptySender,

    #[error("MSG envelope without payload")]
    MissingPayload,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    from: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Payload>,
    timestamp: i64,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<i64>,
}

impl Envelope {
    /// Build a `MSG` envelope stamped with the current time
    pub fn message(from: impl Into<String>, to: Option<&str>, payload: Payload) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            from: from.into(),
            to: normalize_target(to),
            payload: Some(payload),
            timestamp: now_millis(),
        }
    }

    /// Build a `TYPING` envelope stamped with the current time
    pub fn typing(from: impl Into<String>, to: Option<&str>) -> Self {
        Self {
            kind: EnvelopeKind::Typing,
            from: from.into(),
            to: normalize_target(to),
            payload: None,
            timestamp: now_millis(),
        }
    }

    /// Build a `HEARTBEAT` envelope stamped with the current time
    pub fn heartbeat(from: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Heartbeat,
            from: from.into(),
            to: None,
            payload: None,
            timestamp: now_millis(),
        }
    }

    /// Whether the envelope is addressed to every peer
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Serialize to a single line (without the terminator)
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireOut {
            kind: self.kind.as_str(),
            from: &self.from,
            to: self.to.as_deref(),
            payload: self.payload.as_ref(),
            timestamp: self.timestamp,
        })
    }

    /// Parse one line
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let wire: WireIn = serde_json::from_str(line)?;

        let kind = wire
            .kind
            .map(|tag| EnvelopeKind::parse(&tag))
            .ok_or(DecodeError::MissingField("type"))?;
        let from = wire.from.ok_or(DecodeError::MissingField("from"))?;
        if from.is_empty() {
            return Err(DecodeError::EmptySender);
        }

        let payload = match (&kind, wire.payload) {
            (EnvelopeKind::Message, None | Some(serde_json::Value::Null)) => {
                return Err(DecodeError::MissingPayload)
            }
            (EnvelopeKind::Message, Some(value)) => Some(serde_json::from_value(value)?),
            // Other types must not depend on a payload; keep one only if it parses
            (_, Some(value)) => serde_json::from_value(value).ok(),
            (_, None) => None,
        };

        Ok(Self {
            kind,
            from,
            to: normalize_target(wire.to.as_deref()),
            payload,
            timestamp: wire.timestamp.unwrap_or_default(),
        })
    }
}

/// The one place that decides whether a frame came back from ourselves
///
/// The hub echoes every frame to every peer, sender included.
pub fn is_self_origin(envelope: &Envelope, own_id: &str) -> bool {
    envelope.from == own_id
}

/// Current wall clock in milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn normalize_target(to: Option<&str>) -> Option<String> {
    to.filter(|t| !t.is_empty()).map(str::to_string)
}
