//! RSA keypair holder for the session key exchange.
//!
//! The keypair is loaded from PEM files (SPKI public key, PKCS#1 private
//! key) or generated on first start. The public modulus and exponent are
//! exported as `0x`-prefixed lowercase hex strings, which is the exact
//! representation beacons receive during key exchange and feed back into
//! their own RSA implementation.

use std::fs;
use std::path::Path;

use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

/// Default modulus size when generating a fresh pair.
pub const DEFAULT_KEY_BITS: usize = 1024;

/// Errors raised while loading, generating, or using the keypair.
#[derive(Debug, Error)]
pub enum KeyError {
    /// I/O error reading or writing a PEM file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The public key PEM could not be parsed.
    #[error("invalid public key: {0}")]
    PublicKey(#[from] rsa::pkcs8::spki::Error),

    /// The private key PEM could not be parsed.
    #[error("invalid private key: {0}")]
    PrivateKey(#[from] rsa::pkcs1::Error),

    /// Key generation or an encrypt/decrypt operation failed.
    #[error("rsa operation failed: {0}")]
    Rsa(#[from] rsa::Error),
}

/// The server's RSA keypair plus the hex exports sent to beacons.
pub struct RsaKeyPair {
    public: RsaPublicKey,
    private: RsaPrivateKey,
    n_hex: String,
    e_hex: String,
}

impl RsaKeyPair {
    /// Builds a keypair from PEM text (SPKI public, PKCS#1 private).
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] when either PEM fails to parse.
    pub fn from_pem(public_pem: &str, private_pem: &str) -> Result<Self, KeyError> {
        let public = RsaPublicKey::from_public_key_pem(public_pem)?;
        let private = RsaPrivateKey::from_pkcs1_pem(private_pem)?;
        Ok(Self::assemble(public, private))
    }

    /// Generates a fresh keypair with a `bits`-bit modulus.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Rsa`] when generation fails.
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self::assemble(public, private))
    }

    /// Loads the keypair from the given PEM files, generating and writing a
    /// [`DEFAULT_KEY_BITS`]-bit pair when either file is missing or empty.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] on unparseable PEM, failed generation, or
    /// failure to write the freshly generated files.
    pub fn load_or_generate(public_path: &Path, private_path: &Path) -> Result<Self, KeyError> {
        let public_pem = fs::read_to_string(public_path).unwrap_or_default();
        let private_pem = fs::read_to_string(private_path).unwrap_or_default();

        if public_pem.is_empty() || private_pem.is_empty() {
            let pair = Self::generate(DEFAULT_KEY_BITS)?;
            pair.write_pem_files(public_path, private_path)?;
            return Ok(pair);
        }

        Self::from_pem(&public_pem, &private_pem)
    }

    /// Writes the keypair as PEM: SPKI public key and PKCS#1 private key.
    ///
    /// The private key file is created with mode 0600 on Unix.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] on serialization or I/O failure.
    pub fn write_pem_files(&self, public_path: &Path, private_path: &Path) -> Result<(), KeyError> {
        let public_pem = self.public.to_public_key_pem(LineEnding::LF)?;
        fs::write(public_path, public_pem)?;

        let private_pem = self.private.to_pkcs1_pem(LineEnding::LF)?;
        fs::write(private_path, private_pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(private_path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Public modulus as a `0x`-prefixed lowercase hex string.
    #[must_use]
    pub fn n_hex(&self) -> &str {
        &self.n_hex
    }

    /// Public exponent as a `0x`-prefixed lowercase hex string.
    #[must_use]
    pub fn e_hex(&self) -> &str {
        &self.e_hex
    }

    /// Encrypts `data` with the public key using PKCS#1 v1.5 padding.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Rsa`] when `data` is too long for the modulus.
    pub fn public_encrypt(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let mut rng = rand::thread_rng();
        Ok(self.public.encrypt(&mut rng, Pkcs1v15Encrypt, data)?)
    }

    /// Decrypts a PKCS#1 v1.5 ciphertext with the private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Rsa`] on a malformed ciphertext.
    pub fn private_decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        Ok(self.private.decrypt(Pkcs1v15Encrypt, ciphertext)?)
    }

    fn assemble(public: RsaPublicKey, private: RsaPrivateKey) -> Self {
        let n_hex = format!("0x{:x}", public.n());
        let e_hex = format!("0x{:x}", public.e());
        Self {
            public,
            private,
            n_hex,
            e_hex,
        }
    }
}

impl std::fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose private key material through Debug.
        f.debug_struct("RsaKeyPair")
            .field("n_hex", &self.n_hex)
            .field("e_hex", &self.e_hex)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: usize = DEFAULT_KEY_BITS;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let pair = RsaKeyPair::generate(TEST_BITS).unwrap();
        let secret: Vec<u8> = (0..56).collect();
        let ciphertext = pair.public_encrypt(&secret).unwrap();
        assert_ne!(ciphertext, secret);
        assert_eq!(pair.private_decrypt(&ciphertext).unwrap(), secret);
    }

    #[test]
    fn hex_exports_are_prefixed_lowercase() {
        let pair = RsaKeyPair::generate(TEST_BITS).unwrap();
        for hex in [pair.n_hex(), pair.e_hex()] {
            assert!(hex.starts_with("0x"));
            assert!(hex[2..].chars().all(|c| c.is_ascii_hexdigit()));
            assert_eq!(hex, &hex.to_lowercase());
        }
        // The common public exponent.
        assert_eq!(pair.e_hex(), "0x10001");
    }

    #[test]
    fn pem_round_trip_preserves_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let public_path = dir.path().join("publickey.pem");
        let private_path = dir.path().join("privatekey.pem");

        let pair = RsaKeyPair::generate(TEST_BITS).unwrap();
        pair.write_pem_files(&public_path, &private_path).unwrap();

        let reloaded = RsaKeyPair::load_or_generate(&public_path, &private_path).unwrap();
        assert_eq!(reloaded.n_hex(), pair.n_hex());

        let ciphertext = pair.public_encrypt(b"cross-load check").unwrap();
        assert_eq!(
            reloaded.private_decrypt(&ciphertext).unwrap(),
            b"cross-load check"
        );
    }

    #[test]
    fn missing_files_generate_a_pair() {
        let dir = tempfile::tempdir().unwrap();
        let public_path = dir.path().join("publickey.pem");
        let private_path = dir.path().join("privatekey.pem");

        let pair = RsaKeyPair::load_or_generate(&public_path, &private_path).unwrap();
        assert!(public_path.exists());
        assert!(private_path.exists());

        // A second load must pick up the same pair, not regenerate.
        let again = RsaKeyPair::load_or_generate(&public_path, &private_path).unwrap();
        assert_eq!(again.n_hex(), pair.n_hex());
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(RsaKeyPair::from_pem("not a pem", "also not a pem").is_err());
    }
}
