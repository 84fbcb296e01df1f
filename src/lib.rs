//! Authenticated, encrypted, length-framed message transport over streams
//! and datagrams.
//!
//! An ephemeral X25519 handshake (optionally PSK-authenticated) derives a
//! session key that both sides feed into an AES-128-GCM envelope. Stream
//! channels frame messages with a 4-byte big-endian length prefix; datagram
//! channels use the UDP packet boundary as the frame. Neither channel
//! performs the handshake until the caller's first `send`/`receive` —
//! construction and acceptance stay cheap.

mod config;
mod envelope;
mod error;
mod frame;
mod handshake;

mod datagram_channel;
mod listener;
mod stream_channel;

pub use config::{ChannelConfig, ListenerConfig, Role, State};
pub use datagram_channel::DatagramSecureChannel;
pub use error::{Error, Result, SendOutcome};
pub use listener::Listener;
pub use stream_channel::StreamSecureChannel;
