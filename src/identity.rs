//! # Identity and Keypairs
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as the peer id
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key.** The peer id string is the lowercase hex
//! encoding of those 32 bytes, so it is a deterministic function of the key.
//! Daemons, clients and zones all use the same type: a zone's public identity
//! is derived from its own freshly generated keypair exactly like a peer's.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - `Identity::from_hex(id.to_hex()) == Ok(id)`
//! - `Keypair::from_secret_key_bytes(kp.secret_key_bytes()).identity() == kp.identity()`

use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Length of an escrowed secret key.
pub const SECRET_KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Rebuild a keypair from bytes fetched out of key escrow.
    ///
    /// Returns `None` unless exactly [`SECRET_KEY_LEN`] bytes are given.
    pub fn from_escrow_bytes(bytes: &[u8]) -> Option<Self> {
        let secret: [u8; SECRET_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self::from_secret_key_bytes(&secret))
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check that this identity is a usable Ed25519 public key.
    ///
    /// Rejects the all-zero and all-0xFF patterns outright, then requires a
    /// valid curve point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    /// Abbreviated form for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Identity {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
