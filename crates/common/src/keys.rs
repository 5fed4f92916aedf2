//! Tunnel key material
//!
//! Key pairs are generated with x25519-dalek and carried as standard
//! base64 text, the form `wg` reads and writes.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a base64-encoded 32-byte key
pub const KEY_TEXT_LEN: usize = 44;

/// A tunnel key pair, both halves base64-encoded
#[derive(Clone)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl WgKeyPair {
    /// Generate a fresh key pair from the OS RNG
    pub fn generate() -> Self {
        let mut private_key_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut private_key_bytes);

        // Curve25519 clamping
        private_key_bytes[0] &= 248;
        private_key_bytes[31] &= 127;
        private_key_bytes[31] |= 64;

        let secret = StaticSecret::from(private_key_bytes);
        let public = PublicKey::from(&secret);

        Self {
            private_key: STANDARD.encode(secret.to_bytes()),
            public_key: STANDARD.encode(public.as_bytes()),
        }
    }

    /// Derive the public half from an existing base64 private key
    pub fn from_private(private_key: &str) -> Result<Self> {
        let bytes = decode_key(private_key).ok_or_else(|| {
            Error::validation("private_key", "must be a 44-character base64 key")
        })?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self {
            private_key: private_key.to_string(),
            public_key: STANDARD.encode(public.as_bytes()),
        })
    }
}

fn decode_key(text: &str) -> Option<[u8; 32]> {
    if text.len() != KEY_TEXT_LEN {
        return None;
    }
    let bytes = STANDARD.decode(text).ok()?;
    bytes.try_into().ok()
}

/// Check the shape of a peer public key. Only the format is validated.
pub fn validate_public_key(text: &str) -> Result<()> {
    decode_key(text.trim())
        .map(|_| ())
        .ok_or(Error::InvalidPublicKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = WgKeyPair::generate();
        assert_eq!(kp.private_key.len(), KEY_TEXT_LEN);
        assert_eq!(kp.public_key.len(), KEY_TEXT_LEN);
        assert_ne!(kp.private_key, kp.public_key);
        assert!(validate_public_key(&kp.public_key).is_ok());

        let again = WgKeyPair::from_private(&kp.private_key).unwrap();
        assert_eq!(again.public_key, kp.public_key);
    }

    #[test]
    fn test_debug_hides_private_key() {
        let kp = WgKeyPair::generate();
        let shown = format!("{:?}", kp);
        assert!(!shown.contains(&kp.private_key));
    }

    #[test]
    fn test_public_key_validation() {
        assert!(validate_public_key("too-short").is_err());
        // 44 chars but not base64
        assert!(validate_public_key(&"!".repeat(44)).is_err());
        // Padded 31-byte value is also 44 chars
        let short = STANDARD.encode([7u8; 31]);
        assert!(validate_public_key(&short).is_err());
        let ok = STANDARD.encode([7u8; 32]);
        assert!(validate_public_key(&ok).is_ok());
    }
}
