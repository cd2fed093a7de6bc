//! Crate-wide constants for the plugin channel.
//!
//! This module centralizes the channel's magic numbers and wire-level
//! identifiers. Constants are grouped by domain with documentation explaining
//! their purpose.
//!
//! # Categories
//!
//! - **Reconnection**: retry budget and pacing for the resilient transport
//! - **Wire**: endpoint path and WebSocket close codes

use std::time::Duration;

// ============================================================================
// Reconnection
// ============================================================================

/// Delay between reconnect attempts.
///
/// The transport waits this long after a socket drop before opening a new
/// connection. Fixed pacing (no backoff): the dev server is local, so rapid
/// flapping is cheap and a quick recovery matters more than politeness.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1500);

/// Maximum number of reconnect attempts before the transport gives up.
///
/// 200 attempts at the default interval covers roughly five minutes of dev
/// server downtime (a Metro restart, a laptop sleep) before the channel is
/// declared dead.
pub const DEFAULT_MAX_RETRIES: u32 = 200;

/// Timeout guarding each individual connection attempt.
///
/// An attempt that neither completes nor fails within this window is
/// abandoned and counted like any other failed attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Wire
// ============================================================================

/// Dev-server endpoint every plugin connection attaches to.
///
/// The server relays each frame received on this endpoint to all other
/// sockets attached to it; multiplexing happens above, via routing keys.
pub const BROADCAST_ENDPOINT: &str = "/expo-dev-plugins/broadcast";

/// WebSocket close code for a normal, deliberate closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// WebSocket close code meaning "no status code was present".
///
/// Used when the peer's close frame carried no code at all.
pub const NO_STATUS_CLOSE_CODE: u16 = 1005;
