//! Cryptographic primitives for the tunnel.
//!
//! This module provides:
//! - The [`Cipher`] capability used by the framing protocol
//! - A ChaCha20-Poly1305 implementation of it ([`TunnelCipher`])
//! - Passphrase → key derivation (SHA-256)
//! - Nonces and generated passphrases
//!
//! Key material is zeroized on drop.

mod aead;
mod kdf;
mod random;

pub use aead::{Cipher, TunnelCipher};
pub use kdf::{derive_key, TunnelKey};
pub use random::{generate_passphrase, random_nonce, PASSPHRASE_ENTROPY};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Bytes added to every plaintext by [`TunnelCipher::encrypt`].
pub const CIPHER_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_to_cipher_roundtrip() {
        // Both halves derive the key from the same passphrase
        let local = TunnelCipher::new(&derive_key("correct horse battery staple\n"));
        let remote = TunnelCipher::new(&derive_key("  correct horse battery staple"));

        let ciphertext = local.encrypt(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(ciphertext.len(), 18 + CIPHER_OVERHEAD);

        let plaintext = remote.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"GET / HTTP/1.1\r\n\r\n");
    }
}
