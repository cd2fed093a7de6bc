//! Framing codec for plugin messages.
//!
//! Converts a ([`RoutingKey`], [`Payload`]) pair to and from a wire unit.
//! Two encodings share one WebSocket connection:
//!
//! ```text
//! fast path (text frame, the overwhelming majority of devtools traffic):
//!     {"routingKey":{"pluginName":"...","method":"..."},"payload":...}
//!
//! slow path (binary frame, self-describing layout):
//!     ┌────────────┬───────────────┬─────────┬──────────────┐
//!     │ u32 BE len │ key JSON utf8 │ u8 tag  │ payload bytes│
//!     └────────────┴───────────────┴─────────┴──────────────┘
//! ```
//!
//! The payload kind is an explicit tagged union chosen by the caller; the
//! codec never inspects a value to guess its kind. Plain values
//! (null/undefined/number/string/object) always take the fast path; byte
//! buffers, raw binary, and blobs always take the binary layout.
//!
//! The codec enforces no payload size limit; framing guarantees come from the
//! underlying WebSocket transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

// Payload type tags of the binary layout. Tags 2-6 are never produced by
// `pack` (those kinds ride the fast path) but must decode, since other
// senders on the wire may use them.
const TAG_BYTE_BUFFER: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_NULL: u8 = 4;
const TAG_UNDEFINED: u8 = 5;
const TAG_PLAIN_OBJECT: u8 = 6;
const TAG_RAW_BINARY: u8 = 7;
const TAG_BLOB: u8 = 8;

/// Identifies a logical message class within one connection.
///
/// Tags outbound frames and filters inbound frames to the correct listener
/// set. An absent plugin name means the frame is global and is delivered to
/// every plugin client on the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingKey {
    /// Owning plugin, or `None` for a global frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,
    /// Method name within the plugin's message namespace.
    pub method: String,
}

impl RoutingKey {
    /// Key scoped to a plugin.
    pub fn new(plugin_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            plugin_name: Some(plugin_name.into()),
            method: method.into(),
        }
    }

    /// Key with no plugin scope (delivered to every client).
    pub fn global(method: impl Into<String>) -> Self {
        Self {
            plugin_name: None,
            method: method.into(),
        }
    }
}

/// A binary large object, materialized to a byte buffer.
///
/// Construction from an async reader is the only asynchronous step of the
/// packing path: the blob's backing stream is read to completion up front,
/// and packing itself stays synchronous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    bytes: Bytes,
}

impl Blob {
    /// Wrap already-materialized bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Materialize a blob by reading a stream to completion.
    pub async fn from_reader(mut reader: impl AsyncRead + Unpin) -> Result<Self, Error> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(Self::from_bytes(buf))
    }

    /// The blob's raw bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A message payload. The caller states the kind; the codec picks the wire
/// encoding from it.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON `null`.
    Null,
    /// Absent value; serialized as a missing `payload` member.
    Undefined,
    /// A double-precision number.
    Number(f64),
    /// A plain text string.
    Text(String),
    /// A plain JSON-able object (or array, or bool).
    Json(Value),
    /// A byte buffer (binary layout, tag 1).
    Buffer(Vec<u8>),
    /// Raw binary data (binary layout, tag 7).
    Binary(Bytes),
    /// A binary large object (binary layout, tag 8).
    Blob(Blob),
}

/// The wire-representable unit produced by the codec; maps 1:1 onto
/// WebSocket text/binary frames.
#[derive(Debug, Clone, PartialEq)]
pub enum WireUnit {
    /// A text frame (fast path, or a handshake message).
    Text(String),
    /// A binary frame in the length-prefixed layout.
    Binary(Vec<u8>),
}

/// A decoded message: routing key plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Where the message is addressed.
    pub routing_key: RoutingKey,
    /// The message body.
    pub payload: Payload,
}

/// Encode a routing key and payload into a wire unit.
pub fn pack(key: &RoutingKey, payload: Payload) -> Result<WireUnit, Error> {
    match payload {
        Payload::Null => pack_text(key, Some(Value::Null)),
        Payload::Undefined => pack_text(key, None),
        Payload::Number(n) => pack_text(key, Some(Value::from(n))),
        Payload::Text(s) => pack_text(key, Some(Value::String(s))),
        Payload::Json(v) => pack_text(key, Some(v)),
        Payload::Buffer(bytes) => pack_binary(key, TAG_BYTE_BUFFER, &bytes),
        Payload::Binary(bytes) => pack_binary(key, TAG_RAW_BINARY, &bytes),
        Payload::Blob(blob) => pack_binary(key, TAG_BLOB, blob.as_bytes()),
    }
}

/// Decode a wire unit back into a frame.
///
/// Text units are parsed as the fast-path JSON envelope; binary units are
/// read field by field, with payload reconstruction dispatched on the type
/// tag. Unknown tags are a hard error.
pub fn unpack(unit: &WireUnit) -> Result<Frame, Error> {
    match unit {
        WireUnit::Text(text) => unpack_text(text),
        WireUnit::Binary(data) => unpack_binary(data),
    }
}

fn pack_text(key: &RoutingKey, payload: Option<Value>) -> Result<WireUnit, Error> {
    let key_value =
        serde_json::to_value(key).map_err(|e| Error::MalformedFrame(e.to_string()))?;
    let mut envelope = serde_json::Map::with_capacity(2);
    envelope.insert("routingKey".to_string(), key_value);
    if let Some(value) = payload {
        envelope.insert("payload".to_string(), value);
    }
    Ok(WireUnit::Text(Value::Object(envelope).to_string()))
}

fn pack_binary(key: &RoutingKey, tag: u8, body: &[u8]) -> Result<WireUnit, Error> {
    let key_json = serde_json::to_vec(key).map_err(|e| Error::MalformedFrame(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(4 + key_json.len() + 1 + body.len());
    buf.put_u32(key_json.len() as u32);
    buf.put_slice(&key_json);
    buf.put_u8(tag);
    buf.put_slice(body);
    Ok(WireUnit::Binary(buf.to_vec()))
}

fn unpack_text(text: &str) -> Result<Frame, Error> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| Error::MalformedFrame(e.to_string()))?;
    let Value::Object(mut envelope) = value else {
        return Err(Error::MalformedFrame("expected a JSON object".to_string()));
    };
    let key_value = envelope
        .remove("routingKey")
        .ok_or_else(|| Error::MalformedFrame("missing routingKey".to_string()))?;
    let routing_key: RoutingKey =
        serde_json::from_value(key_value).map_err(|e| Error::MalformedFrame(e.to_string()))?;

    // An absent member is `Undefined`, an explicit null is `Null`.
    let payload = match envelope.remove("payload") {
        None => Payload::Undefined,
        Some(Value::Null) => Payload::Null,
        Some(Value::Number(n)) => Payload::Number(n.as_f64().unwrap_or_default()),
        Some(Value::String(s)) => Payload::Text(s),
        Some(other) => Payload::Json(other),
    };

    Ok(Frame {
        routing_key,
        payload,
    })
}

fn unpack_binary(data: &[u8]) -> Result<Frame, Error> {
    let mut buf = data;
    if buf.remaining() < 4 {
        return Err(Error::MalformedFrame("missing key length".to_string()));
    }
    let key_len = buf.get_u32() as usize;
    if buf.remaining() < key_len + 1 {
        return Err(Error::MalformedFrame(format!(
            "truncated: key length {key_len} exceeds remaining {}",
            buf.remaining()
        )));
    }
    let key_bytes = buf.copy_to_bytes(key_len);
    let routing_key: RoutingKey =
        serde_json::from_slice(&key_bytes).map_err(|e| Error::MalformedFrame(e.to_string()))?;
    let tag = buf.get_u8();
    let body = buf.copy_to_bytes(buf.remaining());

    let payload = match tag {
        TAG_BYTE_BUFFER => Payload::Buffer(body.to_vec()),
        TAG_STRING => Payload::Text(
            String::from_utf8(body.to_vec()).map_err(|e| Error::MalformedFrame(e.to_string()))?,
        ),
        TAG_NUMBER => {
            let bytes: [u8; 8] = body
                .as_ref()
                .try_into()
                .map_err(|_| Error::MalformedFrame("number payload must be 8 bytes".to_string()))?;
            Payload::Number(f64::from_be_bytes(bytes))
        }
        TAG_NULL => Payload::Null,
        TAG_UNDEFINED => Payload::Undefined,
        TAG_PLAIN_OBJECT => Payload::Json(
            serde_json::from_slice(&body).map_err(|e| Error::MalformedFrame(e.to_string()))?,
        ),
        TAG_RAW_BINARY => Payload::Binary(body),
        TAG_BLOB => Payload::Blob(Blob::from_bytes(body)),
        other => return Err(Error::UnsupportedPayloadType(other)),
    };

    Ok(Frame {
        routing_key,
        payload,
    })
}
