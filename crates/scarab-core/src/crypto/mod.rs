//! Cryptographic primitives for the beacon session plane.
//!
//! Two pieces only: the RSA keypair the server publishes for key exchange
//! ([`RsaKeyPair`]) and the XChaCha20 stream transform that carries every
//! established session ([`xchacha20`]). The stream cipher is used without a
//! MAC; frames carry no authentication tag.

mod rsa;
mod stream;

pub use rsa::{KeyError, RsaKeyPair, DEFAULT_KEY_BITS};
pub use stream::{xchacha20, CipherError, SESSION_KEY_LEN};
