//! Unreliable, packet-oriented encrypted channel over a UDP socket.
//!
//! Unlike the stream channel, a bare UDP socket has no inherent client/server
//! directionality — two sockets can both be un-connected at the OS level —
//! so here, unlike `StreamSecureChannel`, the role really is decided by
//! whichever operation is called first, exactly as the data model table
//! describes it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};

use crate::config::{ChannelConfig, Role, State, SENTINEL_BYTE};
use crate::envelope::{SessionKey, NONCE_LEN, TAG_LEN};
use crate::error::{is_broken_pipe, Error, Result, SendOutcome};
use crate::handshake::{datagram_key_packet, datagram_session_key};

/// A secure channel over a UDP socket.
///
/// Packet loss and reordering are the caller's problem — there are no acks
/// and no retries, matching plain UDP's own delivery guarantee.
pub struct DatagramSecureChannel {
    socket: UdpSocket,
    session_key: OnceCell<SessionKey>,
    role: OnceCell<Role>,
    peer_addr: StdMutex<Option<SocketAddr>>,
    state: StdMutex<State>,
    broken: AtomicBool,
    closed: AtomicBool,
    handshake_lock: AsyncMutex<()>,
    read_timeout: StdMutex<Option<Duration>>,
    config: ChannelConfig,
}

impl DatagramSecureChannel {
    /// Binds a UDP socket. The handshake does not happen here; it runs
    /// lazily the first time a caller sends or receives.
    pub async fn bind(addr: impl ToSocketAddrs, config: ChannelConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, config))
    }

    pub(crate) fn from_socket(socket: UdpSocket, config: ChannelConfig) -> Self {
        DatagramSecureChannel {
            socket,
            session_key: OnceCell::new(),
            role: OnceCell::new(),
            peer_addr: StdMutex::new(None),
            state: StdMutex::new(State::Init),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handshake_lock: AsyncMutex::new(()),
            read_timeout: StdMutex::new(None),
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

    fn learn_peer(&self, from: SocketAddr) {
        let mut guard = self.peer_addr.lock().expect("peer_addr mutex poisoned");
        if guard.is_none() {
            *guard = Some(from);
        }
    }

    /// Which side of the handshake this channel ended up playing, or `None`
    /// if neither `send` nor `receive` has been called yet.
    pub fn local_role(&self) -> Option<Role> {
        self.role.get().copied()
    }

    /// The peer address learned from the handshake, or from the first
    /// packet received, whichever happened first.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().expect("peer_addr mutex poisoned")
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock().expect("read_timeout mutex poisoned") = timeout;
    }

    fn session_key(&self) -> &SessionKey {
        self.session_key
            .get()
            .expect("send/receive always call ensure_established first")
    }

    async fn handshake_as_client(&self, target: SocketAddr) -> Result<()> {
        let psk = self.config.psk.as_deref();
        let (secret, own_payload) = datagram_key_packet(psk);
        self.socket.send_to(&own_payload, target).await?;

        let mut buf = vec![0u8; self.config.max_udp_payload];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        let key = datagram_session_key(secret, &buf[..n], psk)?;
        self.learn_peer(from);
        let _ = self.session_key.set(key);
        Ok(())
    }

    async fn handshake_as_server(&self) -> Result<()> {
        let psk = self.config.psk.as_deref();
        let mut buf = vec![0u8; self.config.max_udp_payload];
        let (n, from) = self.socket.recv_from(&mut buf).await?;

        let (secret, own_payload) = datagram_key_packet(psk);
        let key = datagram_session_key(secret, &buf[..n], psk)?;
        self.socket.send_to(&own_payload, from).await?;
        self.learn_peer(from);
        let _ = self.session_key.set(key);
        Ok(())
    }

    async fn ensure_established(&self, is_send: bool, target: Option<SocketAddr>) -> Result<()> {
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

        self.set_state(State::Handshaking);
        let role = if is_send { Role::Client } else { Role::Server };
        let _ = self.role.set(role);

        let outcome = if is_send {
            match target.or_else(|| self.peer_addr()) {
                Some(target) => self.handshake_as_client(target).await,
                None => Err(Error::HandshakeFailed(
                    "first send on a datagram channel needs a target address".into(),
                )),
            }
        } else {
            self.handshake_as_server().await
        };

        match outcome {
            Ok(()) => {
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

    fn max_plaintext_len(&self) -> usize {
        self.config.max_udp_payload.saturating_sub(NONCE_LEN + TAG_LEN)
    }

    async fn send_envelope(&self, target: Option<SocketAddr>, plaintext: &[u8]) -> Result<SendOutcome> {
        if plaintext.len() > self.max_plaintext_len() {
            return Err(Error::FrameTooLarge(
                plaintext.len() as u32,
                self.max_plaintext_len() as u32,
            ));
        }
        self.ensure_established(true, target).await?;
        if self.is_broken() {
            return Ok(SendOutcome::Broken);
        }

        let dest = target
            .or_else(|| self.peer_addr())
            .ok_or_else(|| Error::HandshakeFailed("no peer address known".into()))?;
        let envelope = self.session_key().encrypt(plaintext);
        match self.socket.send_to(&envelope, dest).await {
            Ok(_) => Ok(SendOutcome::Sent),
            Err(e) if is_broken_pipe(&e) => {
                self.mark_broken();
                Ok(SendOutcome::Broken)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn receive_plaintext(&self) -> Result<Vec<u8>> {
        self.ensure_established(false, None).await?;
        if self.is_broken() {
            return Err(Error::PeerClosed);
        }

        let mut buf = vec![0u8; self.config.max_udp_payload];
        let timeout = *self.read_timeout.lock().expect("read_timeout mutex poisoned");
        let (n, from) = match timeout {
            Some(d) => match tokio::time::timeout(d, self.socket.recv_from(&mut buf)).await {
                Ok(res) => res?,
                Err(_elapsed) => return Err(Error::Timeout),
            },
            None => self.socket.recv_from(&mut buf).await?,
        };
        self.learn_peer(from);

        match self.session_key().decrypt(&buf[..n]) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// Sends `msg` (or the string sentinel) to `target`, falling back to the
    /// learned peer address when `target` is `None`.
    pub async fn send_str(&self, target: Option<SocketAddr>, msg: Option<&str>) -> Result<SendOutcome> {
        match msg {
            Some(s) => self.send_envelope(target, s.as_bytes()).await,
            None => self.send_envelope(target, &[SENTINEL_BYTE]).await,
        }
    }

    /// Receives one packet and decodes it as a string. The sentinel
    /// plaintext decodes to `Ok(None)`.
    pub async fn receive_str(&self) -> Result<Option<String>> {
        let plaintext = self.receive_plaintext().await?;
        if plaintext == [SENTINEL_BYTE] {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&plaintext).into_owned()))
    }

    /// Sends `msg` (or the byte sentinel) to `target`.
    pub async fn send_bytes(&self, target: Option<SocketAddr>, msg: Option<&[u8]>) -> Result<SendOutcome> {
        match msg {
            Some(b) => self.send_envelope(target, b).await,
            None => self.send_envelope(target, &[SENTINEL_BYTE]).await,
        }
    }

    /// Receives one packet. The sentinel plaintext decodes to `Ok(None)`.
    pub async fn receive_bytes(&self) -> Result<Option<Vec<u8>>> {
        let plaintext = self.receive_plaintext().await?;
        if plaintext == [SENTINEL_BYTE] {
            return Ok(None);
        }
        Ok(Some(plaintext))
    }

    /// Sends a 4-byte big-endian integer to `target`.
    pub async fn send_int32(&self, target: Option<SocketAddr>, value: i32) -> Result<SendOutcome> {
        self.send_envelope(target, &value.to_be_bytes()).await
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

    /// Idempotent; a UDP socket has no graceful shutdown handshake of its
    /// own, so this only flips local bookkeeping.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(State::Closing);
        self.set_state(State::Closed);
        Ok(())
    }
}
