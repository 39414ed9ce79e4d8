//! The JSON envelope exchanged between testers, apps and the broker.
//!
//! Every message is a single text frame holding
//! `{"type": <string>, "messageId": <integer|null>, "params": <object|null>}`.
//! Only `type` is mandatory. The broker never looks inside `params` except
//! for the login handshake.

use crate::types::message_type;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Correlation id carried in `messageId`.
pub type MessageId = i64;

/// A parsed wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Selects the handler on the receiving side.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlates a reply with its request. `None` for unsolicited events.
    #[serde(rename = "messageId", default)]
    pub message_id: Option<MessageId>,
    /// Action-specific payload, opaque to the transport.
    #[serde(default)]
    pub params: Option<Value>,
}

/// Errors that can occur while parsing an envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The frame is not valid JSON.
    #[error("the payload received is not a valid JSON: {0}")]
    InvalidJson(String),
    /// The frame is JSON but not an object.
    #[error("the payload received is not a JSON object")]
    NotAnObject,
    /// The object has no usable `type` field.
    #[error("invalid action received, it has no type, cannot process")]
    MissingType {
        /// The `messageId` of the offending frame, if it had one.
        message_id: Option<MessageId>,
    },
}

impl EnvelopeError {
    /// The `messageId` recovered from the offending frame, if any.
    #[must_use]
    pub const fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::MissingType { message_id } => *message_id,
            _ => None,
        }
    }
}

impl Envelope {
    /// Creates an envelope with no id and no params.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message_id: None,
            params: None,
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Sets the params object.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Builds the `error` envelope reported to a tester.
    #[must_use]
    pub fn error(message: &str, message_id: Option<MessageId>) -> Self {
        Self {
            kind: message_type::ERROR.to_string(),
            message_id,
            params: Some(json!({ "error": message })),
        }
    }

    /// Parses a text frame.
    ///
    /// A `messageId` that is not an integer is treated as absent rather than
    /// rejecting the whole frame.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if the frame is not a JSON object with a
    /// non-empty string `type`.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Builds an envelope from an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// Same rules as [`Envelope::parse`].
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut map) = value else {
            return Err(EnvelopeError::NotAnObject);
        };
        let message_id = map.get("messageId").and_then(Value::as_i64);
        let kind = match map.remove("type") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(EnvelopeError::MissingType { message_id }),
        };
        let params = match map.remove("params") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        };
        Ok(Self {
            kind,
            message_id,
            params,
        })
    }

    /// The envelope as a JSON value, with `messageId`/`params` as `null` when absent.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "type": self.kind,
            "messageId": self.message_id,
            "params": self.params,
        })
    }

    /// Serializes to the wire text form.
    #[must_use]
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    /// Looks up a string field in `params`.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }

    /// Looks up any field in `params`.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref()?.get(key)
    }

    /// Returns `true` if this is the given message type.
    #[must_use]
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn parse_never_panics(input in ".{0,256}") {
            let _ = Envelope::parse(&input);
        }

        #[test]
        fn message_id_survives_the_wire(
            kind in "[a-zA-Z]{1,24}",
            id in proptest::option::of(any::<i64>()),
            text in ".{0,64}",
        ) {
            let mut env = Envelope::new(kind).with_params(json!({ "text": text }));
            env.message_id = id;
            let parsed = Envelope::parse(&env.to_json()).unwrap();
            prop_assert_eq!(parsed, env);
        }
    }
}
