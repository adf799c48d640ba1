//! JSON envelope parsing and construction.
//!
//! Every WebSocket text frame carries exactly one JSON object. The relay reads
//! only the structural fields `type`, `id` and `to`; everything else is opaque
//! payload that travels with the original text.

use crate::types::{kind, ClientId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while reading an inbound envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The frame is not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The frame is valid JSON but not an object.
    #[error("envelope is not a json object")]
    NotAnObject,
}

/// Structural fields of an inbound envelope.
///
/// A field that is absent or not a JSON string reads as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    kind: Option<String>,
    id: Option<String>,
    to: Option<String>,
}

impl Envelope {
    /// Parses the structural fields out of a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if the text is not a JSON object.
    ///
    /// # Examples
    ///
    /// ```
    /// use sigrelay_common::Envelope;
    /// let env = Envelope::parse(r#"{"type":"offer","to":"bob","sdp":"v=0"}"#).unwrap();
    /// assert_eq!(env.kind(), Some("offer"));
    /// assert_eq!(env.to(), Some("bob"));
    /// ```
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let Value::Object(mut fields) = serde_json::from_str::<Value>(text)? else {
            return Err(EnvelopeError::NotAnObject);
        };
        Ok(Self {
            kind: take_string(&mut fields, "type"),
            id: take_string(&mut fields, "id"),
            to: take_string(&mut fields, "to"),
        })
    }

    /// The `type` tag.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// The `id` field, meaningful on `register` only.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The routing target.
    #[must_use]
    pub fn to(&self) -> Option<&str> {
        self.to.as_deref()
    }

    /// Returns `true` for a `register` envelope, whatever its `id`.
    #[must_use]
    pub fn is_register(&self) -> bool {
        self.kind() == Some(kind::REGISTER)
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Envelopes synthesized by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Server-issued identifier the new connection may claim.
    Welcome {
        /// Suggested identifier.
        id: ClientId,
    },
    /// An identifier became active.
    Registered {
        /// The newly registered identifier.
        id: ClientId,
    },
    /// Identifiers registered before the recipient joined.
    AlreadyRegistered {
        /// Every other registered identifier.
        ids: Vec<ClientId>,
    },
    /// Protocol violation notice.
    Error {
        /// Machine-readable reason, one of [`crate::types::close_reason`].
        reason: String,
        /// Human-readable detail.
        msg: String,
    },
}

impl ServerEnvelope {
    /// Builds an `error` envelope.
    #[must_use]
    pub fn error(reason: &str, msg: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.to_string(),
            msg: msg.into(),
        }
    }
}

impl fmt::Display for ServerEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl FromStr for ServerEnvelope {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

/// Envelopes a client sends that the relay acts on itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Claim an identifier.
    Register {
        /// Requested identifier.
        id: ClientId,
    },
}

impl fmt::Display for ClientEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::close_reason;

    #[test]
    fn parse_reads_structural_fields() {
        let env =
            Envelope::parse(r#"{"type":"candidate","to":"b","candidate":{"sdpMid":"0"}}"#).unwrap();
        assert_eq!(env.kind(), Some("candidate"));
        assert_eq!(env.to(), Some("b"));
        assert_eq!(env.id(), None);
        assert!(!env.is_register());
    }

    #[test]
    fn parse_register() {
        let env = Envelope::parse(r#"{"type":"register","id":"alice"}"#).unwrap();
        assert!(env.is_register());
        assert_eq!(env.id(), Some("alice"));
    }

    #[test]
    fn non_string_fields_read_as_absent() {
        let env = Envelope::parse(r#"{"type":"register","id":42,"to":null}"#).unwrap();
        assert!(env.is_register());
        assert_eq!(env.id(), None);
        assert_eq!(env.to(), None);
    }

    #[test]
    fn missing_type_is_not_an_error() {
        let env = Envelope::parse(r#"{"to":"b"}"#).unwrap();
        assert_eq!(env.kind(), None);
        assert_eq!(env.to(), Some("b"));
    }

    #[test]
    fn invalid_json_is_error() {
        assert!(matches!(
            Envelope::parse("not json"),
            Err(EnvelopeError::InvalidJson(_))
        ));
    }

    #[test]
    fn non_object_is_error() {
        assert!(matches!(
            Envelope::parse(r#"["register","alice"]"#),
            Err(EnvelopeError::NotAnObject)
        ));
        assert!(matches!(
            Envelope::parse(r#""register""#),
            Err(EnvelopeError::NotAnObject)
        ));
    }

    #[test]
    fn registered_wire_format() {
        let text = ServerEnvelope::Registered { id: "b".into() }.to_string();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, serde_json::json!({"type": "registered", "id": "b"}));
    }

    #[test]
    fn already_registered_wire_format() {
        let text = ServerEnvelope::AlreadyRegistered {
            ids: vec!["a".into(), "c".into()],
        }
        .to_string();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "already_registered", "ids": ["a", "c"]})
        );
    }

    #[test]
    fn error_wire_format() {
        let text = ServerEnvelope::error(close_reason::MUST_REGISTER_FIRST, "id required").to_string();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "error",
                "reason": "must_register_first",
                "msg": "id required",
            })
        );
    }

    #[test]
    fn server_envelope_from_str() {
        let env: ServerEnvelope = r#"{"type":"welcome","id":"x-1"}"#.parse().unwrap();
        assert_eq!(env, ServerEnvelope::Welcome { id: "x-1".into() });
    }

    #[test]
    fn client_register_is_understood_by_parser() {
        let text = ClientEnvelope::Register { id: "alice".into() }.to_string();
        let env = Envelope::parse(&text).unwrap();
        assert!(env.is_register());
        assert_eq!(env.id(), Some("alice"));
    }
}
