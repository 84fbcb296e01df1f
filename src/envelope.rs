//! The crypto envelope: `nonce(12) ‖ ciphertext ‖ tag(16)` over AES-128-GCM.
//!
//! The cipher instance is constructed fresh from the session key on every
//! call rather than cached, and the nonce is drawn from a thread-local CSPRNG
//! per call (never a counter) — there is no shared, lockable state here at
//! all, which is the point: this type is `Send + Sync` and callable
//! concurrently from any number of threads or tasks without contention.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::{Error, Result};

/// Length of the random nonce prefix.
pub const NONCE_LEN: usize = 12;
/// Length of the AEAD authentication tag appended to the ciphertext.
pub const TAG_LEN: usize = 16;
/// Length of a session key.
pub const SESSION_KEY_LEN: usize = 16;

/// A 16-byte symmetric key shared by both ends of an established channel.
///
/// Immutable and `Copy` once derived; the handshake is the only place a
/// `SessionKey` is produced.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub(crate) fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        SessionKey(bytes)
    }

    fn cipher(&self) -> Aes128Gcm {
        Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&self.0))
    }

    /// Encrypts `plaintext`, returning `nonce ‖ ciphertext ‖ tag`.
    ///
    /// The nonce is drawn fresh from the thread-local CSPRNG; for a
    /// single-session key this gives a negligible collision probability well
    /// under the message-count bound a 96-bit random nonce tolerates.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
        out.extend_from_slice(&nonce_bytes);
        // AES-128-GCM never fails to encrypt; the Result is infallible here.
        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .expect("AES-128-GCM encryption is infallible for valid key/nonce sizes");
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Parses the leading 12 bytes of `envelope` as the nonce, verifies the
    /// tag, and returns the plaintext.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < NONCE_LEN {
            return Err(Error::MalformedEnvelope);
        }
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::AuthenticationFailed)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_bytes([7u8; SESSION_KEY_LEN])
    }

    #[test]
    fn round_trips() {
        let k = key();
        let pt = b"hello there, secure world";
        let env = k.encrypt(pt);
        assert_eq!(env.len(), NONCE_LEN + pt.len() + TAG_LEN);
        let decrypted = k.decrypt(&env).unwrap();
        assert_eq!(decrypted, pt);
    }

    #[test]
    fn tampered_tag_fails() {
        let k = key();
        let mut env = k.encrypt(b"do not tamper with me");
        let last = env.len() - 1;
        env[last] ^= 0xff;
        assert!(matches!(k.decrypt(&env), Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let k = key();
        let mut env = k.encrypt(b"do not tamper with me either");
        let mid = NONCE_LEN + 2;
        env[mid] ^= 0xff;
        assert!(matches!(k.decrypt(&env), Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn short_input_is_malformed() {
        let k = key();
        let err = k.decrypt(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::MalformedEnvelope));
    }

    #[test]
    fn nonces_do_not_repeat_in_a_sample() {
        let k = key();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            let env = k.encrypt(b"x");
            let nonce = env[..NONCE_LEN].to_vec();
            assert!(seen.insert(nonce), "nonce repeated within 10_000 sends");
        }
    }
}
