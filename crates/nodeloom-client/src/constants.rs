//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default WebSocket endpoint for local development.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/api/v1/ws";

/// Default snapshot API base for local development.
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1/";

/// Fixed delay between reconnect attempts. The connection never gives up —
/// it retries at this cadence indefinitely.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Broadcast buffer for link events. Sized so inbound operations queued
/// while a snapshot fetch is in flight are never dropped.
pub const LINK_EVENT_BUFFER: usize = 256;

/// Broadcast buffer for session observer notifications.
pub const SYNC_EVENT_BUFFER: usize = 64;
