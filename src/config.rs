use std::time::Duration;

/// Which side of the handshake this endpoint took. Clients mask every egress
/// frame and must never receive a masked one; servers are the exact mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub role: Role,
    /// Subprotocol agreed during the upgrade handshake, if any. Carried
    /// verbatim for the caller to inspect.
    pub subprotocol: Option<String>,
    /// Interval between unsolicited keep-alive Pings while the send path is
    /// idle. `None` (or a zero duration) disables them.
    pub keep_alive_interval: Option<Duration>,
    /// Receive buffer capacity. Values below 14 bytes, the largest possible
    /// frame header, are raised to 14.
    pub receive_buffer_size: usize,
    /// Caller-supplied backing region for the receive buffer. The whole
    /// region is used as-is and must be at least 14 bytes long; when set,
    /// `receive_buffer_size` is ignored.
    pub receive_buffer: Option<Vec<u8>>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        WebSocketConfig {
            role: Role::Client,
            subprotocol: None,
            keep_alive_interval: None,
            receive_buffer_size: 4096,
            receive_buffer: None,
        }
    }
}
