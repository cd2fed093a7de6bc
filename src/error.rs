//! Error types for the plugin channel.
//!
//! A single [`Error`] enum covers every failure the crate can report.
//! Transient connectivity problems (socket drops, connect timeouts that still
//! have retry budget left) are recovered internally by the transport and never
//! surface here; what does surface is either a protocol error returned from a
//! decoding call site, or a terminal transport condition delivered through the
//! transport's error callback.

use std::fmt;

/// Errors that can occur during channel operations.
#[derive(Debug)]
pub enum Error {
    /// Failed to establish the WebSocket connection.
    ConnectionFailed(String),

    /// The transport gave up after exhausting its retry budget.
    RetriesExhausted {
        /// Number of reconnect attempts that were made.
        attempts: u32,
    },

    /// A send was attempted on a transport that is closed or out of retries.
    /// The data is dropped, never queued.
    SendOnClosed,

    /// Failed to hand a frame to the connection task.
    SendFailed(String),

    /// A binary wire unit carried a payload type tag this implementation
    /// does not understand. Indicates a corrupted or incompatible stream.
    UnsupportedPayloadType(u8),

    /// A wire unit could not be decoded (truncated binary layout, invalid
    /// UTF-8, unparseable JSON).
    MalformedFrame(String),

    /// A message carried the handshake marker but did not parse as a
    /// handshake.
    MalformedHandshake(String),

    /// Reading a blob's backing stream failed.
    BlobRead(std::io::Error),

    /// The channel was closed.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::RetriesExhausted { attempts } => {
                write!(f, "Connection retries exhausted after {attempts} attempts")
            }
            Self::SendOnClosed => write!(f, "Send on closed transport; data dropped"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::UnsupportedPayloadType(tag) => {
                write!(f, "Unsupported payload type tag: {tag}")
            }
            Self::MalformedFrame(msg) => write!(f, "Malformed frame: {msg}"),
            Self::MalformedHandshake(msg) => write!(f, "Malformed handshake: {msg}"),
            Self::BlobRead(err) => write!(f, "Blob read failed: {err}"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BlobRead(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::BlobRead(err)
    }
}
