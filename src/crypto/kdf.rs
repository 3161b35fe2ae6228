//! Key derivation from the pre-shared passphrase.
//!
//! The tunnel key is the SHA-256 digest of the trimmed passphrase, so both
//! halves only need to agree on the passphrase text.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::KEY_SIZE;

/// A 256-bit tunnel key.
///
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TunnelKey([u8; KEY_SIZE]);

impl TunnelKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Bytes 8..16 of the key, sent encrypted as the tunnel verification block.
    pub fn verification_bytes(&self) -> &[u8] {
        &self.0[8..16]
    }
}

impl std::fmt::Debug for TunnelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TunnelKey(..)")
    }
}

/// Derive a tunnel key from a passphrase.
///
/// Surrounding whitespace is ignored, so a key file with a trailing newline
/// yields the same key as the bare passphrase.
pub fn derive_key(passphrase: &str) -> TunnelKey {
    let digest = Sha256::digest(passphrase.trim().as_bytes());
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&digest);
    TunnelKey(bytes)
}
