//! Reliable, ordered, bidirectional encrypted message channel over a
//! connected byte stream.
//!
//! Grounded on the poll-based `Outgoing`/`Incoming` wrappers in the upstream
//! handshake module this crate descends from, generalized from a ratcheting
//! Ristretto transcript to a one-shot X25519 handshake with a fixed session
//! key, and from `async fn`s instead of hand-rolled `Future`/`Sink` impls —
//! the locking discipline (one handshake mutex, one lock per direction) is
//! the same shape either way.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{self, split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};

use crate::config::{ChannelConfig, Role, State, SENTINEL_BYTE};
use crate::envelope::SessionKey;
use crate::error::{Error, Result, SendOutcome};
use crate::frame::{read_frame, write_frame};
use crate::handshake::{client_handshake_stream, server_handshake_stream};

/// A secure channel over any connected, ordered byte stream.
///
/// `S` is almost always `tokio::net::TcpStream`; it is generic so that the
/// handshake and framing logic can be exercised in tests over
/// `tokio::io::DuplexStream` without a socket.
pub struct StreamSecureChannel<S> {
    read_half: AsyncMutex<ReadHalf<S>>,
    write_half: AsyncMutex<WriteHalf<S>>,
    handshake_lock: AsyncMutex<()>,
    session_key: OnceCell<SessionKey>,
    role: Role,
    state: StdMutex<State>,
    broken: AtomicBool,
    closed: AtomicBool,
    read_timeout: StdMutex<Option<Duration>>,
    handshake_timeout: Option<Duration>,
    peer_addr: Option<SocketAddr>,
    config: ChannelConfig,
}

impl<S> StreamSecureChannel<S>
where
    S: io::AsyncRead + io::AsyncWrite + Unpin,
{
    /// Wraps an already-connected stream. `handshake_timeout` is the
    /// server-side zombie-defense window; pass `None` on the client side,
    /// where the handshake instead inherits the caller's read timeout.
    pub(crate) fn from_parts(
        stream: S,
        role: Role,
        peer_addr: Option<SocketAddr>,
        handshake_timeout: Option<Duration>,
        config: ChannelConfig,
    ) -> Self {
        let (read_half, write_half) = split(stream);
        StreamSecureChannel {
            read_half: AsyncMutex::new(read_half),
            write_half: AsyncMutex::new(write_half),
            handshake_lock: AsyncMutex::new(()),
            session_key: OnceCell::new(),
            role,
            state: StdMutex::new(State::Init),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_timeout: StdMutex::new(None),
            handshake_timeout,
            peer_addr,
            config,
        }
    }

    fn state(&self) -> State {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn set_state(&self, state: State) {
        *self.state.lock().expect("state mutex poisoned") = state;
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.set_state(State::Closing);
    }

    /// Which side of the handshake this channel plays. Fixed at
    /// construction: a stream socket always knows whether it connected out
    /// or was accepted.
    pub fn local_role(&self) -> Role {
        self.role
    }

    /// The peer's address, if known at construction time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// True once a fatal error (tamper, truncation, broken pipe) has
    /// occurred. Never clears.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Sets the read timeout applied to the next `receive_*` call. `None`
    /// means block indefinitely. Restored to this value after every call —
    /// it is not a one-shot override.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock().expect("read_timeout mutex poisoned") = timeout;
    }

    fn session_key(&self) -> &SessionKey {
        self.session_key
            .get()
            .expect("send/receive always call ensure_established first")
    }

    /// Drives the handshake exactly once, the first time it is needed.
    /// Concurrent callers serialize on `handshake_lock` and all observe the
    /// same outcome.
    async fn ensure_established(&self) -> Result<()> {
        if self.session_key.get().is_some() {
            return Ok(());
        }
        if self.is_broken() || self.state() == State::Closed {
            return Err(Error::ConnectionBroken);
        }

        let _guard = self.handshake_lock.lock().await;
        if self.session_key.get().is_some() {
            return Ok(());
        }
        if self.is_broken() || self.state() == State::Closed {
            return Err(Error::ConnectionBroken);
        }

        self.set_state(State::Handshaking);
        let psk = self.config.psk.as_deref();
        let max_frame_size = self.config.max_frame_size;

        let mut read_guard = self.read_half.lock().await;
        let mut write_guard = self.write_half.lock().await;
        let mut joined = io::join(&mut *read_guard, &mut *write_guard);

        let outcome = match self.role {
            Role::Client => client_handshake_stream(&mut joined, psk, max_frame_size).await,
            Role::Server => match self.handshake_timeout {
                Some(d) => match tokio::time::timeout(
                    d,
                    server_handshake_stream(&mut joined, psk, max_frame_size),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_elapsed) => Err(Error::HandshakeTimeout),
                },
                None => server_handshake_stream(&mut joined, psk, max_frame_size).await,
            },
        };
        drop(write_guard);
        drop(read_guard);

        match outcome {
            Ok(key) => {
                let _ = self.session_key.set(key);
                self.set_state(State::Established);
                Ok(())
            }
            Err(e) => {
                self.broken.store(true, Ordering::SeqCst);
                self.set_state(State::Closed);
                Err(e)
            }
        }
    }

    /// Writes a length-framed payload with no encryption. Used only to
    /// carry handshake key payloads and (internally) established-session
    /// envelopes; never exposed outside the crate, keeping unencrypted
    /// framing out of the public surface entirely.
    async fn send_raw(&self, payload: &[u8]) -> Result<SendOutcome> {
        if self.is_broken() {
            return Ok(SendOutcome::Broken);
        }
        let mut guard = self.write_half.lock().await;
        match write_frame(&mut *guard, payload, self.config.max_frame_size).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(Error::ConnectionBroken) => {
                self.mark_broken();
                Ok(SendOutcome::Broken)
            }
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    async fn receive_raw(&self) -> Result<Vec<u8>> {
        if self.is_broken() {
            return Err(Error::PeerClosed);
        }
        let mut guard = self.read_half.lock().await;
        let timeout = *self.read_timeout.lock().expect("read_timeout mutex poisoned");
        match read_frame(&mut *guard, self.config.max_frame_size, timeout).await {
            Ok(payload) => Ok(payload),
            Err(Error::PeerClosed) => {
                drop(guard);
                self.set_state(State::Closed);
                Err(Error::PeerClosed)
            }
            Err(Error::Timeout) => Err(Error::Timeout),
            Err(e) => {
                drop(guard);
                self.mark_broken();
                Err(e)
            }
        }
    }

    async fn send_envelope(&self, plaintext: &[u8]) -> Result<SendOutcome> {
        self.ensure_established().await?;
        let envelope = self.session_key().encrypt(plaintext);
        self.send_raw(&envelope).await
    }

    async fn receive_plaintext(&self) -> Result<Vec<u8>> {
        self.ensure_established().await?;
        let envelope = self.receive_raw().await?;
        match self.session_key().decrypt(&envelope) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// Sends `msg`, or the string sentinel when `msg` is `None`.
    pub async fn send_str(&self, msg: Option<&str>) -> Result<SendOutcome> {
        match msg {
            Some(s) => self.send_envelope(s.as_bytes()).await,
            None => self.send_envelope(&[SENTINEL_BYTE]).await,
        }
    }

    /// Receives one string frame. A plaintext matching the sentinel decodes
    /// to `Ok(None)` rather than `Ok(Some(...))`.
    pub async fn receive_str(&self) -> Result<Option<String>> {
        let plaintext = self.receive_plaintext().await?;
        if plaintext == [SENTINEL_BYTE] {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&plaintext).into_owned()))
    }

    /// Sends `msg`, or the byte sentinel when `msg` is `None`.
    pub async fn send_bytes(&self, msg: Option<&[u8]>) -> Result<SendOutcome> {
        match msg {
            Some(b) => self.send_envelope(b).await,
            None => self.send_envelope(&[SENTINEL_BYTE]).await,
        }
    }

    /// Receives one byte frame. A plaintext matching the sentinel decodes
    /// to `Ok(None)`.
    pub async fn receive_bytes(&self) -> Result<Option<Vec<u8>>> {
        let plaintext = self.receive_plaintext().await?;
        if plaintext == [SENTINEL_BYTE] {
            return Ok(None);
        }
        Ok(Some(plaintext))
    }

    /// Sends a 4-byte big-endian integer inside an envelope.
    pub async fn send_int32(&self, value: i32) -> Result<SendOutcome> {
        self.send_envelope(&value.to_be_bytes()).await
    }

    /// Receives a 4-byte big-endian integer.
    pub async fn receive_int32(&self) -> Result<i32> {
        let plaintext = self.receive_plaintext().await?;
        let bytes: [u8; 4] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| Error::MalformedEnvelope)?;
        Ok(i32::from_be_bytes(bytes))
    }

    /// Idempotent. The first call shuts the stream down and transitions to
    /// `Closed`; later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(State::Closing);
        {
            let mut guard = self.write_half.lock().await;
            let _ = guard.shutdown().await;
        }
        self.set_state(State::Closed);
        Ok(())
    }
}

impl StreamSecureChannel<TcpStream> {
    /// Connects to `addr`, applies the usual long-lived-connection socket
    /// options, and returns a channel with `Role::Client`. The handshake is
    /// not performed here — it happens lazily on first `send`/`receive`.
    pub async fn connect(addr: impl ToSocketAddrs, config: ChannelConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(config.tcp_no_delay)?;
        let peer_addr = stream.peer_addr().ok();
        Ok(Self::from_parts(stream, Role::Client, peer_addr, None, config))
    }

    /// Wraps an accepted `TcpStream` as a server-role channel. Used by
    /// `Listener::accept`; not typically called directly.
    pub(crate) fn from_accepted(
        stream: TcpStream,
        peer_addr: SocketAddr,
        handshake_timeout: Duration,
        config: ChannelConfig,
    ) -> Self {
        Self::from_parts(stream, Role::Server, Some(peer_addr), Some(handshake_timeout), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn paired(config: ChannelConfig) -> (StreamSecureChannel<io::DuplexStream>, StreamSecureChannel<io::DuplexStream>) {
        let (client_half, server_half) = duplex(64 * 1024);
        let client = StreamSecureChannel::from_parts(client_half, Role::Client, None, None, config.clone());
        let server = StreamSecureChannel::from_parts(
            server_half,
            Role::Server,
            None,
            Some(Duration::from_millis(500)),
            config,
        );
        (client, server)
    }

    #[tokio::test]
    async fn round_trips_string_bytes_int_and_sentinels() {
        let (client, server) = paired(ChannelConfig::default());

        let send = async {
            client.send_str(Some("你好123ABbc")).await.unwrap();
            client.send_bytes(Some(&[3, 4, 5, 6, 7])).await.unwrap();
            client.send_int32(11223344).await.unwrap();
            client.send_str(None).await.unwrap();
            client.send_bytes(None).await.unwrap();
        };
        let recv = async {
            assert_eq!(server.receive_str().await.unwrap().as_deref(), Some("你好123ABbc"));
            assert_eq!(server.receive_bytes().await.unwrap(), Some(vec![3, 4, 5, 6, 7]));
            assert_eq!(server.receive_int32().await.unwrap(), 11223344);
            assert_eq!(server.receive_str().await.unwrap(), None);
            assert_eq!(server.receive_bytes().await.unwrap(), None);
        };
        tokio::join!(send, recv);
    }

    #[tokio::test]
    async fn matching_psk_round_trips() {
        let mut config = ChannelConfig::default();
        config.psk = Some(b"0123456789abcdef".to_vec());
        let (client, server) = paired(config);

        let (_, recv) = tokio::join!(client.send_str(Some("ping")), server.receive_str());
        assert_eq!(recv.unwrap().as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn mismatched_psk_fails_handshake_and_closes() {
        let (client_half, server_half) = duplex(64 * 1024);
        let mut client_config = ChannelConfig::default();
        client_config.psk = Some(b"client-side-psk-".to_vec());
        let mut server_config = ChannelConfig::default();
        server_config.psk = Some(b"server-side-psk!".to_vec());

        let client = StreamSecureChannel::from_parts(client_half, Role::Client, None, None, client_config);
        let server = StreamSecureChannel::from_parts(
            server_half,
            Role::Server,
            None,
            Some(Duration::from_millis(500)),
            server_config,
        );

        let (client_res, server_res) = tokio::join!(client.send_str(Some("hi")), server.receive_str());
        assert!(client_res.is_err());
        assert!(matches!(server_res, Err(Error::HandshakeAuthFailed)));
        assert!(server.is_broken());
    }

    #[tokio::test]
    async fn zombie_client_times_out_and_releases_the_slot() {
        let (_client_half, server_half) = duplex(64 * 1024);
        let server = StreamSecureChannel::from_parts(
            server_half,
            Role::Server,
            None,
            Some(Duration::from_millis(20)),
            ChannelConfig::default(),
        );
        let err = server.receive_str().await.unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout));
        assert!(server.is_broken());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _server) = paired(ChannelConfig::default());
        client.close().await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn broken_pipe_coalesces_subsequent_sends() {
        let (client, server) = paired(ChannelConfig::default());
        tokio::join!(client.send_str(Some("hello")), server.receive_str());
        drop(server);

        let mut last = SendOutcome::Sent;
        for _ in 0..50 {
            match client.send_str(Some("still talking")).await.unwrap() {
                SendOutcome::Broken => {
                    last = SendOutcome::Broken;
                    break;
                }
                SendOutcome::Sent => {}
            }
        }
        assert_eq!(last, SendOutcome::Broken);
        assert!(client.is_broken());
        assert_eq!(client.send_str(Some("noop")).await.unwrap(), SendOutcome::Broken);
    }
}
