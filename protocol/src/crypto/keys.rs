//! # Writer Keys
//!
//! Ed25519 keys that authenticate tree upgrades, and the [`Authority`] that
//! decides who may append and which upgrades a log will trust.
//!
//! ## Trust rules
//!
//! - `Unsigned` accepts a longer tree from any peer as long as it provably
//!   extends the roots we already hold. Nobody signs anything.
//! - `Writer` signs the tree hash after every local append and requires a
//!   valid signature on upgrades from peers.
//! - `Reader` cannot append and requires a valid writer signature.
//!
//! Key bytes are never logged. The `Debug` impl prints the public half only.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::hash::{signable, Hash};
use crate::config::SIGNATURE_LENGTH;

/// Errors that can occur while parsing key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,
}

/// The writer's signing keypair.
pub struct Keypair {
    signing_key: SigningKey,
}

/// The public half of a writer keypair. This is the log's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; 32],
}

/// A 64-byte Ed25519 signature over a tree hash and length.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    bytes: Vec<u8>,
}

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Handy in tests.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Hex-encoded secret key. Handle with care.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Sign an arbitrary message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            bytes: self.signing_key.sign(message).to_bytes().to_vec(),
        }
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair(pub={})", self.public_key().to_hex())
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Parse a hex-encoded public key, rejecting points off the curve.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidPublicKey)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Verify `signature` over `message`. Any malformed input is just `false`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let Ok(bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(signature.bytes.as_slice()) else {
            return false;
        };
        verifying_key
            .verify(message, &DalekSignature::from_bytes(&bytes))
            .is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl Signature {
    /// Rebuild a signature from persisted bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.bytes))
    }
}

// ---------------------------------------------------------------------------
// Authority
// ---------------------------------------------------------------------------

/// Who may append to a log and how upgrades from peers are authenticated.
#[derive(Debug, Clone, Default)]
pub enum Authority {
    /// No keys. Upgrades are accepted if they extend the local roots.
    #[default]
    Unsigned,
    /// Local writer: signs appends, checks upgrade signatures.
    Writer(Keypair),
    /// Read-only replica of the writer with this key.
    Reader(PublicKey),
}

impl Authority {
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::Reader(_))
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        match self {
            Self::Unsigned => None,
            Self::Writer(keypair) => Some(keypair.public_key()),
            Self::Reader(public_key) => Some(*public_key),
        }
    }

    /// Sign a tree of `length` blocks. `None` for unsigned logs.
    pub fn sign_tree(&self, tree_hash: &Hash, length: u64) -> Option<Signature> {
        match self {
            Self::Writer(keypair) => Some(keypair.sign(&signable(tree_hash, length))),
            Self::Unsigned | Self::Reader(_) => None,
        }
    }

    /// Decide whether an upgrade to a tree with this hash and length is
    /// authentic.
    pub fn verify_tree(&self, tree_hash: &Hash, length: u64, signature: Option<&Signature>) -> bool {
        match self.public_key() {
            None => true,
            Some(public_key) => signature
                .map(|sig| public_key.verify(&signable(tree_hash, length), sig))
                .unwrap_or(false),
        }
    }
}
