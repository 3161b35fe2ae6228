//! Randomness for AEAD nonces and generated passphrases.
//!
//! Everything is drawn from the operating system's entropy source.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use rand_core::OsRng;

use crate::crypto::NONCE_SIZE;

/// Random bytes behind a generated passphrase.
pub const PASSPHRASE_ENTROPY: usize = 24;

/// A fresh nonce for one sealed message.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// A shared passphrase for a new local/remote pair, base64 encoded so it
/// survives JSON and TOML quoting.
pub fn generate_passphrase() -> String {
    let mut raw = [0u8; PASSPHRASE_ENTROPY];
    OsRng.fill_bytes(&mut raw);
    STANDARD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonces_differ() {
        assert_ne!(random_nonce(), random_nonce());
    }

    #[test]
    fn test_generated_passphrase() {
        let passphrase = generate_passphrase();
        let raw = STANDARD.decode(&passphrase).unwrap();
        assert_eq!(raw.len(), PASSPHRASE_ENTROPY);
        assert!(!passphrase.contains(char::is_whitespace));
        assert_ne!(passphrase, generate_passphrase());
    }
}
