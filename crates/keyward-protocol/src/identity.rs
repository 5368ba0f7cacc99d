/// Device identities.
///
/// An `Identity` is an Ed25519 public key. Stewards, owners and recovery
/// initiators are all addressed by one; payloads are sealed to it.
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

use crate::error::{KeywardError, Result, ValidationError};

/// Ed25519 public key identifying one device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity([u8; 32]);

impl Identity {
    /// Build from raw key bytes. Rejects bytes that are not a valid Ed25519 point.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ValidationError::InvalidIdentity(format!("not an Ed25519 key: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl FromStr for Identity {
    type Err = KeywardError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ValidationError::InvalidIdentity(format!("bad hex: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            ValidationError::InvalidIdentity(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Self::from_bytes(bytes)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Resolves the local identity and converts identities to and from text.
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Identity;

    fn encode(&self, identity: &Identity) -> String {
        identity.to_string()
    }

    fn decode(&self, encoded: &str) -> Result<Identity> {
        encoded.parse()
    }
}

/// Local keypair: the Ed25519 seed plus its public identity.
#[derive(Clone)]
pub struct KeyIdentity {
    seed: Zeroizing<[u8; 32]>,
    identity: Identity,
}

impl KeyIdentity {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let identity = Identity(signing.verifying_key().to_bytes());
        Self {
            seed: Zeroizing::new(seed),
            identity,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub(crate) fn seed(&self) -> &[u8; 32] {
        &self.seed
    }
}

impl fmt::Debug for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyIdentity")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl IdentityProvider for KeyIdentity {
    fn current_identity(&self) -> Identity {
        self.identity
    }
}
