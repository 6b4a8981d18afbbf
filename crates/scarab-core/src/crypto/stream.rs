//! XChaCha20 session transform.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::XChaCha20;
use thiserror::Error;

/// Session key length: 32 cipher-key bytes followed by 24 nonce bytes.
pub const SESSION_KEY_LEN: usize = 56;

const CIPHER_KEY_LEN: usize = 32;

/// The keystream starts at block 1, not block 0. Both ends of the wire
/// must agree on this offset.
const KEYSTREAM_START: u64 = 64;

/// Error applying the session transform.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// The session key is not `SESSION_KEY_LEN` bytes.
    #[error("session key must be {SESSION_KEY_LEN} bytes, got {len}")]
    KeyLength {
        /// Length of the rejected key.
        len: usize,
    },
}

/// Applies the XChaCha20 keystream for `key` to `data`.
///
/// The same call encrypts and decrypts: the transform is a XOR against the
/// keystream derived from `key[..32]` with nonce `key[32..56]`, starting at
/// block 1. No authentication tag is produced or checked.
///
/// # Errors
///
/// Returns [`CipherError::KeyLength`] unless `key` is exactly
/// [`SESSION_KEY_LEN`] bytes.
pub fn xchacha20(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CipherError> {
    if key.len() != SESSION_KEY_LEN {
        return Err(CipherError::KeyLength { len: key.len() });
    }

    let cipher_key = chacha20::Key::from_slice(&key[..CIPHER_KEY_LEN]);
    let nonce = chacha20::XNonce::from_slice(&key[CIPHER_KEY_LEN..]);

    let mut cipher = XChaCha20::new(cipher_key, nonce);
    cipher.seek(KEYSTREAM_START);

    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}
