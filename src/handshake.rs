//! Ownership-arbitration handshake protocol.
//!
//! Handshake messages share the transport with regular frames but bypass the
//! routing-key dispatch entirely: they are plain JSON text tagged with the
//! reserved `isHandshakeMessage` marker so receivers can peel them off before
//! frame decoding.
//!
//! The protocol has two verbs: a browser announces itself with `handshake`,
//! and an app evicts a conflicting or incompatible browser with
//! `terminateBrowserClient`. Terminate delivery is not retried - if the
//! addressed browser already disconnected there is no owner left to evict.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::WireUnit;
use crate::error::Error;

/// The handshake protocol's verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMethod {
    /// A browser announcing ownership of a plugin conversation.
    #[serde(rename = "handshake")]
    Handshake,
    /// An app evicting the addressed browser client.
    #[serde(rename = "terminateBrowserClient")]
    TerminateBrowserClient,
}

/// A control message of the ownership-arbitration sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    /// Reserved marker distinguishing handshakes from frames. Always `true`.
    is_handshake_message: bool,
    /// Protocol version the sender speaks.
    pub protocol_version: u32,
    /// What the sender wants.
    pub method: HandshakeMethod,
    /// Plugin conversation this message concerns.
    pub plugin_name: String,
    /// The browser client announcing itself, or being evicted.
    pub browser_client_id: String,
}

impl HandshakeMessage {
    /// A browser's ownership announcement.
    pub fn handshake(
        protocol_version: u32,
        plugin_name: impl Into<String>,
        browser_client_id: impl Into<String>,
    ) -> Self {
        Self {
            is_handshake_message: true,
            protocol_version,
            method: HandshakeMethod::Handshake,
            plugin_name: plugin_name.into(),
            browser_client_id: browser_client_id.into(),
        }
    }

    /// An app's eviction notice addressed to `browser_client_id`.
    pub fn terminate(
        protocol_version: u32,
        plugin_name: impl Into<String>,
        browser_client_id: impl Into<String>,
    ) -> Self {
        Self {
            is_handshake_message: true,
            protocol_version,
            method: HandshakeMethod::TerminateBrowserClient,
            plugin_name: plugin_name.into(),
            browser_client_id: browser_client_id.into(),
        }
    }

    /// Detect and parse a handshake in an inbound text unit.
    ///
    /// Returns `Ok(None)` for anything without the marker (regular frames,
    /// non-JSON text); a message that carries the marker but fails to parse
    /// is a protocol error.
    pub fn try_parse(text: &str) -> Result<Option<Self>, Error> {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Ok(None);
        };
        if value.get("isHandshakeMessage").and_then(Value::as_bool) != Some(true) {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::MalformedHandshake(e.to_string()))
    }

    /// Encode for the wire. Handshakes are always text units.
    pub fn to_wire(&self) -> WireUnit {
        WireUnit::Text(serde_json::to_string(self).expect("serializable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let msg = HandshakeMessage::handshake(1, "inspector", "1700000000000");
        let WireUnit::Text(text) = msg.to_wire() else {
            panic!("handshakes must be text units");
        };
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["isHandshakeMessage"], true);
        assert_eq!(value["protocolVersion"], 1);
        assert_eq!(value["method"], "handshake");
        assert_eq!(value["pluginName"], "inspector");
        assert_eq!(value["browserClientId"], "1700000000000");
    }

    #[test]
    fn test_terminate_method_wire_name() {
        let msg = HandshakeMessage::terminate(1, "inspector", "id");
        let WireUnit::Text(text) = msg.to_wire() else {
            panic!("handshakes must be text units");
        };
        assert!(text.contains("\"terminateBrowserClient\""));
    }

    #[test]
    fn test_try_parse_roundtrip() {
        let msg = HandshakeMessage::terminate(3, "p", "42");
        let WireUnit::Text(text) = msg.to_wire() else {
            panic!("handshakes must be text units");
        };
        let parsed = HandshakeMessage::try_parse(&text)
            .expect("parse")
            .expect("is a handshake");
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_regular_frames_are_not_handshakes() {
        let frame = r#"{"routingKey":{"pluginName":"p","method":"m"},"payload":1}"#;
        assert!(HandshakeMessage::try_parse(frame).expect("parse").is_none());
        assert!(HandshakeMessage::try_parse("not json").expect("parse").is_none());
    }

    #[test]
    fn test_marker_without_fields_is_protocol_error() {
        let err = HandshakeMessage::try_parse(r#"{"isHandshakeMessage":true}"#)
            .expect_err("must fail");
        assert!(matches!(err, Error::MalformedHandshake(_)));
    }

    #[test]
    fn test_marker_false_is_not_a_handshake() {
        let text = r#"{"isHandshakeMessage":false,"protocolVersion":1,"method":"handshake","pluginName":"p","browserClientId":"x"}"#;
        assert!(HandshakeMessage::try_parse(text).expect("parse").is_none());
    }
}
