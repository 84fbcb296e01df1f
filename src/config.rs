use std::time::Duration;

/// 64 MiB, the default `MaxFrameSize`.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Default server-side handshake window (the "zombie defense" timeout).
pub const DEFAULT_ZOMBIE_DEFENSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default internal read/write buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Largest UDP datagram this crate will attempt to send or receive.
pub const DEFAULT_MAX_UDP_PAYLOAD: usize = 65507;

/// Plaintext that `send_str`/`send_bytes` emit for a `None` message, and that
/// `receive_str`/`receive_bytes` recognize as the sentinel on the way back.
pub(crate) const SENTINEL_BYTE: u8 = 0x04;

/// Knobs shared by both the stream and datagram secure channels.
///
/// Mirrors the configuration table in the design doc: every field has the
/// same default a caller gets from `ChannelConfig::default()`.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Frames (stream) or packets (datagram) above this plaintext size are
    /// rejected before any allocation happens.
    pub max_frame_size: u32,
    /// Internal read/write buffering, in bytes.
    pub buffer_size: usize,
    /// When set, handshake public-key payloads are HMAC-authenticated with
    /// this pre-shared key.
    pub psk: Option<Vec<u8>>,
    /// TCP keepalive. Ignored by the datagram channel.
    pub keep_alive: bool,
    /// TCP_NODELAY. Ignored by the datagram channel.
    pub tcp_no_delay: bool,
    /// Largest single UDP payload. Ignored by the stream channel.
    pub max_udp_payload: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            psk: None,
            keep_alive: true,
            tcp_no_delay: true,
            max_udp_payload: DEFAULT_MAX_UDP_PAYLOAD,
        }
    }
}

/// Knobs for the accepting side of a stream listener.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Bound to each accepted stream's read timeout until the handshake
    /// resolves, so a peer that never advances the handshake does not tie up
    /// a worker indefinitely.
    pub zombie_defense_timeout: Duration,
    /// Channel configuration applied to every accepted connection.
    pub channel: ChannelConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            zombie_defense_timeout: DEFAULT_ZOMBIE_DEFENSE_TIMEOUT,
            channel: ChannelConfig::default(),
        }
    }
}

/// Which side of the handshake a channel ended up playing.
///
/// Decided implicitly by whichever operation (send vs. receive) the caller
/// invokes first, and immutable afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Lifecycle state of a channel. Monotonic except for the `Init -> Closing`
/// shortcut taken when a channel is closed before any handshake traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    Handshaking,
    Established,
    Closing,
    Closed,
}
