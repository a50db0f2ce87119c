//! `WireGuard` key types.
//!
//! Keys are Curve25519, 32 bytes, and travel as standard base64 everywhere
//! (datastore, `wg` tooling, status reports).

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::WireguardError;

/// `WireGuard` key size in bytes.
pub const KEY_SIZE: usize = 32;

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE], WireguardError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| WireguardError::InvalidKey(e.to_string()))?;
    <[u8; KEY_SIZE]>::try_from(bytes.as_slice()).map_err(|_| {
        WireguardError::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", bytes.len()))
    })
}

/// A peer or device public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or not 32 bytes.
    pub fn from_base64(s: &str) -> Result<Self, WireguardError> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        write!(f, "PublicKey({}...)", &b64[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = WireguardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// The device private key.
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PrivateKey {
    /// Generates a new random private key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    /// Creates a private key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derives the matching public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(*X25519PublicKey::from(&secret).as_bytes())
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decodes a key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or not 32 bytes.
    pub fn from_base64(s: &str) -> Result<Self, WireguardError> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PrivateKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_is_deterministic() {
        let private = PrivateKey::generate();
        assert_eq!(private.public_key(), private.public_key());
        assert_ne!(private.public_key(), PrivateKey::generate().public_key());
    }

    #[test]
    fn private_key_debug_redacts() {
        let debug = format!("{:?}", PrivateKey::generate());
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn public_key_parses_wg_tool_output() {
        // `wg genkey | wg pubkey` style input, with trailing newline.
        let key = PublicKey::from_bytes([7u8; KEY_SIZE]);
        let parsed: PublicKey = format!("{key}\n").parse().expect("parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn invalid_keys_rejected() {
        assert!(PublicKey::from_base64("not base64!").is_err());
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(PrivateKey::from_base64(&short), Err(WireguardError::InvalidKey(_))));
    }

    #[test]
    fn public_key_serde_uses_base64() {
        let key = PrivateKey::generate().public_key();
        let json = serde_json::to_string(&key).expect("serialize");
        assert_eq!(json, format!("\"{}\"", key.to_base64()));
        let back: PublicKey = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, key);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn public_key_base64_roundtrip(bytes in prop::array::uniform32(any::<u8>())) {
                let key = PublicKey::from_bytes(bytes);
                prop_assert_eq!(PublicKey::from_base64(&key.to_base64()).ok(), Some(key));
            }
        }
    }
}
