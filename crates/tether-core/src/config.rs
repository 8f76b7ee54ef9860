//! Centralized configuration for tether.
//!
//! Protocol constants are shared by both peers and must match exactly.
//! Transport limits only affect the bundled TCP transport.

use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Field carrying the marker on every protocol message.
    pub const MARKER_FIELD: &'static str = "rpc_marker";
    /// Marker value distinguishing tether traffic on a shared channel.
    pub const MARKER: &'static str = "tether";
    /// Key identifying a reference token inside a serialized value.
    ///
    /// Reserved: any JSON object carrying this key is read as a token, so
    /// plain data using it as a map key cannot cross the channel.
    pub const TOKEN_TAG: &'static str = "_rpc_type";
    /// Class id used for deferred (promise-like) reference tokens.
    pub const PROMISE_CLASS_ID: &'static str = "Promise";
}

/// Limits for the bundled TCP transport.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 64;
}

/// Service-level defaults.
pub struct ServiceDefaults;

impl ServiceDefaults {
    /// Replies held for call ids that are not known yet.
    pub const EARLY_REPLY_CAPACITY: usize = 256;
}
