//! Teamserver configuration.

use std::path::PathBuf;

use scarab_core::crypto::{KeyError, RsaKeyPair};

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Operator control-plane listen address.
    pub bind_addr: String,
    /// Shared operator secret; operators present its hash at login.
    pub operator_secret: String,
    /// `SQLite` database file.
    pub db_path: PathBuf,
    /// PEM file holding the beacon-facing RSA public key.
    pub public_key_path: PathBuf,
    /// PEM file holding the beacon-facing RSA private key.
    pub private_key_path: PathBuf,
}

impl ServerConfig {
    /// Loads the RSA keypair from the configured PEM files, generating and
    /// writing a fresh pair when either file is missing.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] on unreadable or unparseable key material.
    pub fn load_keys(&self) -> Result<RsaKeyPair, KeyError> {
        RsaKeyPair::load_or_generate(&self.public_key_path, &self.private_key_path)
    }
}
