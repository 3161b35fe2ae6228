//! The cipher capability used by the tunnel.
//!
//! Callers only rely on two things: `decrypt(encrypt(p)) == p` under the same
//! key, and decryption failures being reported explicitly. Ciphertext length
//! is not fixed by the contract.
//!
//! [`TunnelCipher`] implements it with ChaCha20-Poly1305. Every message gets
//! a fresh random nonce, carried in front of the ciphertext:
//!
//! ```text
//! [12: nonce][n: ciphertext][16: tag]
//! ```

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit},
    ChaCha20Poly1305, Nonce,
};

use crate::crypto::{random_nonce, TunnelKey, CIPHER_OVERHEAD, NONCE_SIZE};
use crate::error::{Error, Result};

/// Symmetric encryption bound to one tunnel key.
pub trait Cipher: Send + Sync {
    /// Encrypt a message.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a message produced by [`Cipher::encrypt`] under the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is truncated, was produced under a
    /// different key, or was tampered with.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// ChaCha20-Poly1305 cipher with per-message random nonces.
pub struct TunnelCipher {
    cipher: ChaCha20Poly1305,
}

impl TunnelCipher {
    /// Create a new cipher with the given key.
    pub fn new(key: &TunnelKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }
}

impl Cipher for TunnelCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = random_nonce();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::crypto("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < CIPHER_OVERHEAD {
            return Err(Error::crypto(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::crypto::KEY_SIZE;

    fn test_key() -> TunnelKey {
        TunnelKey::from_bytes([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
            0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
            0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17,
            0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f,
        ])
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = TunnelCipher::new(&test_key());

        let plaintext = b"Hello, World!";
        let ciphertext = cipher.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + CIPHER_OVERHEAD);

        let decrypted = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = TunnelCipher::new(&test_key());

        let ciphertext = cipher.encrypt(b"").unwrap();
        assert_eq!(ciphertext.len(), CIPHER_OVERHEAD);
        assert!(cipher.decrypt(&ciphertext).unwrap().is_empty());
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let cipher = TunnelCipher::new(&test_key());

        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher1 = TunnelCipher::new(&test_key());
        let cipher2 = TunnelCipher::new(&TunnelKey::from_bytes([0x42u8; KEY_SIZE]));

        let ciphertext = cipher1.encrypt(b"secret data").unwrap();
        assert!(cipher2.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = TunnelCipher::new(&test_key());

        let mut ciphertext = cipher.encrypt(b"secret data").unwrap();
        ciphertext[NONCE_SIZE] ^= 0x01;

        assert!(cipher.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let cipher = TunnelCipher::new(&test_key());

        assert!(cipher.decrypt(&[]).is_err());
        assert!(cipher.decrypt(&[0u8; CIPHER_OVERHEAD - 1]).is_err());
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(
            key in any::<[u8; KEY_SIZE]>(),
            plaintext in proptest::collection::vec(any::<u8>(), 0..4096),
        ) {
            let cipher = TunnelCipher::new(&TunnelKey::from_bytes(key));
            let ciphertext = cipher.encrypt(&plaintext).unwrap();
            prop_assert_eq!(cipher.decrypt(&ciphertext).unwrap(), plaintext);
        }
    }
}
