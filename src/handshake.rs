//! Ephemeral X25519 key agreement with an optional PSK-authenticated public
//! key payload, and HKDF-SHA256 session key derivation.
//!
//! There is no long-term identity here — every handshake generates a fresh
//! ephemeral keypair and is forgotten once `SessionKey` is derived. This is
//! deliberately simpler than a mutually-authenticated identity handshake:
//! the only authentication asked of this handshake is "does the other side
//! know the PSK", not "who is the other side".

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::envelope::SessionKey;
use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};

/// Info string for the stream channel's session key derivation.
pub const STREAM_KDF_INFO: &[u8] = b"Secure Channel Session Key";
/// Info string for the datagram channel's session key derivation.
pub const DATAGRAM_KDF_INFO: &[u8] = b"SecureDatagramSocket Session Key";

const PUBKEY_LEN: usize = 32;
const HMAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

fn build_key_payload(public: &x25519_dalek::PublicKey, psk: Option<&[u8]>) -> Vec<u8> {
    match psk {
        None => public.as_bytes().to_vec(),
        Some(psk) => {
            let mut mac = HmacSha256::new_from_slice(psk).expect("HMAC accepts any key length");
            mac.update(public.as_bytes());
            let tag = mac.finalize().into_bytes();
            let mut payload = Vec::with_capacity(HMAC_LEN + PUBKEY_LEN);
            payload.extend_from_slice(&tag);
            payload.extend_from_slice(public.as_bytes());
            payload
        }
    }
}

fn parse_key_payload(data: &[u8], psk: Option<&[u8]>) -> Result<x25519_dalek::PublicKey> {
    let expected_len = match psk {
        None => PUBKEY_LEN,
        Some(_) => HMAC_LEN + PUBKEY_LEN,
    };
    if data.len() != expected_len {
        return Err(Error::HandshakeFailed(format!(
            "expected a {}-byte key payload, got {}",
            expected_len,
            data.len()
        )));
    }

    let pubkey_bytes = match psk {
        None => data,
        Some(psk) => {
            let (tag, pubkey_bytes) = data.split_at(HMAC_LEN);
            let mut mac =
                HmacSha256::new_from_slice(psk).expect("HMAC accepts any key length");
            mac.update(pubkey_bytes);
            let expected = mac.finalize().into_bytes();
            if expected.ct_eq(tag).unwrap_u8() != 1 {
                return Err(Error::HandshakeAuthFailed);
            }
            pubkey_bytes
        }
    };

    let mut buf = [0u8; PUBKEY_LEN];
    buf.copy_from_slice(pubkey_bytes);
    Ok(x25519_dalek::PublicKey::from(buf))
}

fn derive_session_key(shared: &x25519_dalek::SharedSecret, info: &[u8]) -> SessionKey {
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 16];
    hk.expand(info, &mut okm)
        .expect("16 bytes is within HKDF-SHA256's output size limit");
    SessionKey::from_bytes(okm)
}

/// Server side of the stream handshake: send first, then read the client's
/// reply.
pub async fn server_handshake_stream<S>(
    stream: &mut S,
    psk: Option<&[u8]>,
    max_frame_size: u32,
) -> Result<SessionKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);

    write_frame(stream, &build_key_payload(&public, psk), max_frame_size).await?;
    let payload = read_frame(stream, max_frame_size, None).await?;
    let peer_public = parse_key_payload(&payload, psk)?;

    let shared = secret.diffie_hellman(&peer_public);
    Ok(derive_session_key(&shared, STREAM_KDF_INFO))
}

/// Client side of the stream handshake: read the server's greeting first,
/// then reply.
pub async fn client_handshake_stream<S>(
    stream: &mut S,
    psk: Option<&[u8]>,
    max_frame_size: u32,
) -> Result<SessionKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = read_frame(stream, max_frame_size, None).await?;
    let peer_public = parse_key_payload(&payload, psk)?;

    let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    write_frame(stream, &build_key_payload(&public, psk), max_frame_size).await?;

    let shared = secret.diffie_hellman(&peer_public);
    Ok(derive_session_key(&shared, STREAM_KDF_INFO))
}

/// Builds the raw bytes of a datagram handshake packet (no length prefix:
/// the UDP datagram boundary is the frame).
pub fn datagram_key_packet(psk: Option<&[u8]>) -> (x25519_dalek::EphemeralSecret, Vec<u8>) {
    let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    (secret, build_key_payload(&public, psk))
}

/// Completes the datagram handshake given our ephemeral secret and the
/// peer's key payload packet.
pub fn datagram_session_key(
    secret: x25519_dalek::EphemeralSecret,
    peer_payload: &[u8],
    psk: Option<&[u8]>,
) -> Result<SessionKey> {
    let peer_public = parse_key_payload(peer_payload, psk)?;
    let shared = secret.diffie_hellman(&peer_public);
    Ok(derive_session_key(&shared, DATAGRAM_KDF_INFO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_handshake_agrees_on_a_key() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let (client_key, server_key) = tokio::join!(
            client_handshake_stream(&mut client, None, 1 << 20),
            server_handshake_stream(&mut server, None, 1 << 20),
        );
        assert_eq!(client_key.unwrap(), server_key.unwrap());
    }

    #[tokio::test]
    async fn stream_handshake_with_matching_psk_agrees() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let psk = b"0123456789abcdef";
        let (client_key, server_key) = tokio::join!(
            client_handshake_stream(&mut client, Some(psk), 1 << 20),
            server_handshake_stream(&mut server, Some(psk), 1 << 20),
        );
        assert_eq!(client_key.unwrap(), server_key.unwrap());
    }

    #[tokio::test]
    async fn stream_handshake_with_mismatched_psk_fails() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let (client_res, server_res) = tokio::join!(
            client_handshake_stream(&mut client, Some(b"client-side-psk-"), 1 << 20),
            server_handshake_stream(&mut server, Some(b"server-side-psk!"), 1 << 20),
        );
        assert!(matches!(client_res, Err(Error::HandshakeAuthFailed)));
        assert!(matches!(server_res, Err(Error::HandshakeAuthFailed)));
    }

    #[test]
    fn datagram_handshake_agrees_on_a_key() {
        let (client_secret, client_packet) = datagram_key_packet(None);
        let (server_secret, server_packet) = datagram_key_packet(None);

        let client_key = datagram_session_key(client_secret, &server_packet, None).unwrap();
        let server_key = datagram_session_key(server_secret, &client_packet, None).unwrap();

        let probe = client_key.encrypt(b"ping");
        assert_eq!(server_key.decrypt(&probe).unwrap(), b"ping");
    }
}
