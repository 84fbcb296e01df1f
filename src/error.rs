use std::io;

/// Kinds of failures that can occur while handshaking or moving frames.
///
/// Every variant here is fatal to the channel it occurred on unless noted
/// otherwise; see the propagation policy on each operation for details.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O error not otherwise classified below.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Server-side zombie-defense window elapsed before the handshake
    /// finished.
    #[error("handshake did not complete within the zombie-defense window")]
    HandshakeTimeout,

    /// PSK-HMAC over the remote public key did not verify.
    #[error("PSK authentication of the handshake payload failed")]
    HandshakeAuthFailed,

    /// Any other handshake failure: malformed key, short read, bad point.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// AEAD tag did not verify on an established channel.
    #[error("authentication failed: message was tampered with")]
    AuthenticationFailed,

    /// Envelope shorter than the 12-byte nonce prefix.
    #[error("envelope shorter than the nonce prefix")]
    MalformedEnvelope,

    /// Frame body shorter than its length header promised.
    #[error("frame body truncated after a complete header was read")]
    Truncated,

    /// Frame header declared a length above `MaxFrameSize`.
    #[error("frame length {0} exceeds the configured maximum {1}")]
    FrameTooLarge(u32, u32),

    /// Clean end-of-stream observed before any header byte arrived.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The underlying socket is broken (reset, pipe closed, etc).
    /// Surfaced once as this error; subsequent sends report it via
    /// `SendOutcome::Broken` instead of re-raising this variant, while
    /// subsequent receives keep returning `PeerClosed`.
    #[error("connection broken")]
    ConnectionBroken,

    /// A caller-configured read timeout elapsed before a header byte was read.
    /// Recoverable: the caller may retry the operation.
    #[error("receive timed out before any data arrived")]
    Timeout,
}

/// Outcome of a `send_*` call on a channel that may already be broken.
///
/// A broken channel never raises `ConnectionBroken` more than once; every
/// later send degrades to `Broken` so callers can treat repeated sends as a
/// no-op rather than handling the same error over and over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The frame was written and flushed in full.
    Sent,
    /// The channel was already broken; nothing was written.
    Broken,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns true if `err` is one of the platform's "connection gone" errors,
/// which this crate canonicalizes into `ConnectionBroken` rather than
/// surfacing verbatim (broken pipe, connection reset, not connected).
pub(crate) fn is_broken_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}
