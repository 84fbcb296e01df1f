//! Accepts raw TCP connections, applies socket hygiene, enforces the
//! zombie-defense handshake window and an IP deny-set, and hands back a
//! `StreamSecureChannel` whose handshake has not yet run.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::ListenerConfig;
use crate::error::Result;
use crate::stream_channel::StreamSecureChannel;

/// A bound TCP listener producing lazily-handshaken `StreamSecureChannel`s.
///
/// `accept` never performs cryptographic work itself — that keeps the
/// accept loop O(1) so one task can feed an arbitrary number of
/// per-connection workers that each drive their own handshake.
pub struct Listener {
    raw: TcpListener,
    deny_set: RwLock<HashSet<IpAddr>>,
    config: ListenerConfig,
    closed: AtomicBool,
}

impl Listener {
    pub async fn bind(addr: impl ToSocketAddrs, config: ListenerConfig) -> Result<Self> {
        let raw = TcpListener::bind(addr).await?;
        apply_reuseaddr(&raw);
        Ok(Listener {
            raw,
            deny_set: RwLock::new(HashSet::new()),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Blocks for the next connection not on the deny-set, applies socket
    /// options and the zombie-defense read timeout, and returns it with
    /// `Role::Server`. The handshake has not run yet.
    pub async fn accept(&self) -> Result<StreamSecureChannel<tokio::net::TcpStream>> {
        loop {
            let (stream, peer_addr) = self.raw.accept().await?;

            if self.deny_set.read().await.contains(&peer_addr.ip()) {
                debug!(%peer_addr, "rejecting connection from denied address");
                drop(stream);
                continue;
            }

            if let Err(e) = configure_accepted_socket(&stream, &self.config) {
                warn!(%peer_addr, error = %e, "failed to configure accepted socket, dropping it");
                drop(stream);
                continue;
            }

            return Ok(StreamSecureChannel::from_accepted(
                stream,
                peer_addr,
                self.config.zombie_defense_timeout,
                self.config.channel.clone(),
            ));
        }
    }

    /// Adds `addr` to the deny-set; future `accept` calls silently drop
    /// connections from it.
    pub async fn add_deny(&self, addr: IpAddr) {
        self.deny_set.write().await.insert(addr);
    }

    /// Removes `addr` from the deny-set, if present.
    pub async fn remove_deny(&self, addr: IpAddr) {
        self.deny_set.write().await.remove(&addr);
    }

    /// True if `addr` is currently denied.
    pub async fn is_denied(&self, addr: IpAddr) -> bool {
        self.deny_set.read().await.contains(&addr)
    }

    /// Idempotent; drops the underlying listening socket on first call.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.raw.local_addr()?)
    }
}

fn apply_reuseaddr(listener: &TcpListener) {
    let sock_ref = socket2::SockRef::from(listener);
    if let Err(e) = sock_ref.set_reuse_address(true) {
        warn!(error = %e, "failed to set SO_REUSEADDR on listener");
    }
}

fn configure_accepted_socket(
    stream: &tokio::net::TcpStream,
    config: &ListenerConfig,
) -> std::io::Result<()> {
    stream.set_nodelay(config.channel.tcp_no_delay)?;

    let sock_ref = socket2::SockRef::from(stream);
    sock_ref.set_recv_buffer_size(config.channel.buffer_size)?;

    if config.channel.keep_alive {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(30));
        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::error::Error;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn denied_peer_never_reaches_the_caller() {
        let listener = Listener::bind("127.0.0.1:0", ListenerConfig::default())
            .await
            .unwrap();
        let addr = listener.raw.local_addr().unwrap();
        listener
            .add_deny(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
            .await;

        let connector = tokio::spawn(async move {
            let _ = tokio::net::TcpStream::connect(addr).await.unwrap();
        });

        let accept_fut = tokio::time::timeout(Duration::from_millis(200), listener.accept());
        assert!(accept_fut.await.is_err(), "denied connection should never be accepted");
        connector.abort();
    }

    #[tokio::test]
    async fn zombie_client_releases_the_slot_for_the_next_accept() {
        let mut config = ListenerConfig::default();
        config.zombie_defense_timeout = Duration::from_millis(20);
        let listener = Listener::bind("127.0.0.1:0", config).await.unwrap();
        let addr = listener.raw.local_addr().unwrap();

        let _zombie = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server_channel = listener.accept().await.unwrap();
        let err = server_channel.receive_str().await.unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout));

        let client = StreamSecureChannel::connect(addr, ChannelConfig::default())
            .await
            .unwrap();
        let server_task = tokio::spawn(async move {
            let server_channel2 = listener.accept().await.unwrap();
            server_channel2.receive_str().await.unwrap()
        });
        client.send_str(Some("still accepting")).await.unwrap();
        assert_eq!(server_task.await.unwrap().as_deref(), Some("still accepting"));
    }
}
