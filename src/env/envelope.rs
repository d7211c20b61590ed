//! Wire-level message units
//!
//! An [`Envelope`] is one JSON object exchanged over the transport. The
//! correlation id lives inside the object under a dialect-specific key; the
//! codec lifts it out on decode and puts it back on encode so the rest of the
//! client sees `request_id` and `payload` separately.

use serde_json::{Map, Value};

use super::error::ProtocolError;

/// Correlation identifier assigned by the dispatcher
pub type RequestId = u64;

/// One message exchanged over the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Present on responses, absent on push notifications
    pub request_id: Option<RequestId>,
    /// Backend-specific body with the correlation key removed
    pub payload: Value,
}

impl Envelope {
    /// A request/response envelope.
    pub fn request(request_id: RequestId, payload: Value) -> Self {
        Self {
            request_id: Some(request_id),
            payload,
        }
    }

    /// A push notification envelope.
    pub fn notification(payload: Value) -> Self {
        Self {
            request_id: None,
            payload,
        }
    }

    /// Whether this envelope answers a request.
    pub fn is_response(&self) -> bool {
        self.request_id.is_some()
    }
}

/// Serializes and parses envelopes for one dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeCodec {
    request_id_key: &'static str,
}

impl EnvelopeCodec {
    /// Codec that stores the correlation id under `request_id_key`.
    pub const fn new(request_id_key: &'static str) -> Self {
        Self { request_id_key }
    }

    /// Key carrying the correlation id.
    pub fn request_id_key(&self) -> &'static str {
        self.request_id_key
    }

    /// Render an envelope as a JSON text frame.
    ///
    /// Non-object payloads are wrapped so the correlation key has somewhere
    /// to live.
    pub fn encode(&self, envelope: &Envelope) -> String {
        let mut map = match &envelope.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        if let Some(id) = envelope.request_id {
            map.insert(self.request_id_key.to_string(), Value::Number(id.into()));
        }
        Value::Object(map).to_string()
    }

    /// Parse a JSON text frame.
    pub fn decode(&self, text: &str) -> Result<Envelope, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let request_id = match map.remove(self.request_id_key) {
            None | Some(Value::Null) => None,
            Some(Value::Number(number)) => Some(
                number
                    .as_u64()
                    .ok_or_else(|| ProtocolError::InvalidRequestId(number.to_string()))?,
            ),
            Some(other) => return Err(ProtocolError::InvalidRequestId(other.to_string())),
        };

        Ok(Envelope {
            request_id,
            payload: Value::Object(map),
        })
    }
}
