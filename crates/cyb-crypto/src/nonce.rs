//! High-entropy per-message nonces.

use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;

/// A 128-bit nonce used for replay protection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; 16]);

impl Nonce {
    /// Generate a fresh nonce from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encode as hex for the envelope security block.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from the hex form carried on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not 16 bytes.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonces_are_unique() {
        let a = Nonce::generate();
        let b = Nonce::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_round_trip() {
        let nonce = Nonce::generate();
        let hex = nonce.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(Nonce::from_hex(&hex).unwrap(), nonce);
    }

    #[test]
    fn test_from_hex_rejects_wrong_length() {
        assert!(Nonce::from_hex("abcd").is_err());
        assert!(Nonce::from_hex(&"ff".repeat(17)).is_err());
    }
}
