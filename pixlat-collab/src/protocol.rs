//! JSON request/reply protocol carried over WebSocket text frames.
//!
//! Wire format:
//! ```text
//! client → server   {"id": 7, "method": "POST", "endpoint": "pixel",
//!                    "query": {...}, "body": {...}}
//!
//! server → client   {"type": "reply", "id": 7, "status": 200, "body": {...}}
//!                   [binary frame]            ← only after a binary export reply
//!
//! server → all      {"type": "pixel", "x": 1, "y": 2, "r": 255, "g": 0,
//!                    "b": 0, "timestamp": 1700000000}
//! ```
//!
//! Status codes follow HTTP: 200, 400, 404, 405, 429, 500.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use pixlat_core::{Pixel, PixelRecord};

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    /// Anything else; always answered with 405
    #[serde(other)]
    Other,
}

/// Request target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    State,
    Pixel,
    Export,
    Stats,
}

impl Endpoint {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "state" => Some(Endpoint::State),
            "pixel" => Some(Endpoint::Pixel),
            "export" => Some(Endpoint::Export),
            "stats" => Some(Endpoint::Stats),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::State => "state",
            Endpoint::Pixel => "pixel",
            Endpoint::Export => "export",
            Endpoint::Stats => "stats",
        }
    }

    /// Whether `method` is accepted.
    pub fn allows(&self, method: Method) -> bool {
        match (self, method) {
            (_, Method::Other) => false,
            (Endpoint::Pixel, Method::Get) => false,
            _ => true,
        }
    }
}

/// Client request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    /// Kept as text so an unknown name can be answered with 404
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub query: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

impl Request {
    pub fn new(id: u64, method: Method, endpoint: Endpoint) -> Self {
        Self {
            id,
            method,
            endpoint: endpoint.as_str().to_string(),
            query: Value::Null,
            body: Value::Null,
        }
    }

    pub fn with_query(mut self, query: &impl Serialize) -> Result<Self, ProtocolError> {
        self.query = to_value(query)?;
        Ok(self)
    }

    pub fn with_body(mut self, body: &impl Serialize) -> Result<Self, ProtocolError> {
        self.body = to_value(body)?;
        Ok(self)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Query parameters, or their defaults when none were sent.
    pub fn query_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, ProtocolError> {
        from_optional(&self.query)
    }

    /// Body, or its default when none was sent.
    pub fn body_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, ProtocolError> {
        from_optional(&self.body)
    }

    /// Body that must be present.
    pub fn body_required<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        if self.body.is_null() {
            return Err(ProtocolError::DeserializationError("missing request body".into()));
        }
        T::deserialize(&self.body).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

fn to_value(value: &impl Serialize) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn from_optional<T: DeserializeOwned + Default>(value: &Value) -> Result<T, ProtocolError> {
    if value.is_null() {
        return Ok(T::default());
    }
    T::deserialize(value).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

/// A committed pixel, pushed to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelEvent {
    pub x: u32,
    pub y: u32,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub timestamp: u64,
}

impl PixelEvent {
    pub fn pixel(&self) -> Pixel {
        Pixel {
            x: self.x,
            y: self.y,
            r: self.r,
            g: self.g,
            b: self.b,
        }
    }
}

impl From<&PixelRecord> for PixelEvent {
    fn from(record: &PixelRecord) -> Self {
        let p = record.pixel;
        Self {
            x: p.x,
            y: p.y,
            r: p.r,
            g: p.g,
            b: p.b,
            timestamp: record.updated_at,
        }
    }
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Reply { id: u64, status: u16, body: Value },
    Pixel(PixelEvent),
}

impl ServerMessage {
    /// Successful reply carrying `body`.
    pub fn ok(id: u64, body: &impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self::reply(id, 200, to_value(body)?))
    }

    pub fn reply(id: u64, status: u16, body: Value) -> Self {
        ServerMessage::Reply { id, status, body }
    }

    /// Error reply with the `{success: false, error}` body.
    pub fn error(id: u64, status: u16, message: impl Into<String>) -> Self {
        Self::reply(
            id,
            status,
            json!({ "success": false, "error": message.into() }),
        )
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Body of a reply that is followed by a binary frame.
pub fn binary_follows(len: usize) -> Value {
    json!({ "success": true, "format": "binary", "bytes": len })
}

/// Whether a reply body announces a binary frame.
pub fn announces_binary(body: &Value) -> bool {
    body.get("format").and_then(Value::as_str) == Some("binary")
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Reply status was not the one the caller expected
    UnexpectedReply { status: u16, body: String },
    /// Mirror used before the canvas was loaded
    NotBootstrapped,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedReply { status, body } => {
                write!(f, "Unexpected reply ({status}): {body}")
            }
            Self::NotBootstrapped => write!(f, "Canvas not loaded yet"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Request timed out"),
        }
    }
}

impl std::error::Error for ProtocolError {}
