/// Payload sealing for custody messages.
///
/// Uses ephemeral X25519 Diffie-Hellman + XChaCha20-Poly1305 AEAD.
/// Every sealed payload gets a fresh ephemeral keypair, so a relay
/// carrying a shard never sees it in the clear.
///
/// Key derivation: Ed25519 identity → X25519 via the standard
/// Edwards→Montgomery conversion (same as libsodium).
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::identity::{Identity, KeyIdentity};

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"keyward-seal-xchacha20poly1305-v1";

/// Sealed payload with ephemeral key exchange metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedPayload {
    /// XChaCha20-Poly1305 ciphertext (includes 16-byte auth tag).
    pub ciphertext: Vec<u8>,
    /// 24-byte nonce (XChaCha20 extended nonce, random).
    pub nonce: [u8; 24],
    /// Sender's ephemeral X25519 public key.
    pub ephemeral_pk: [u8; 32],
}

impl SealedPayload {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

/// Convert an Ed25519 public key to an X25519 public key.
pub fn ed25519_to_x25519_public(ed25519_pk: &[u8; 32]) -> Result<[u8; 32]> {
    let edwards = CompressedEdwardsY(*ed25519_pk)
        .decompress()
        .ok_or_else(|| CryptoError::Seal("invalid Ed25519 public key".into()))?;
    Ok(edwards.to_montgomery().to_bytes())
}

/// Convert an Ed25519 seed to an X25519 secret: SHA-512(seed), first 32 bytes, clamped.
pub fn ed25519_to_x25519_secret(ed25519_seed: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let hash = Sha512::digest(ed25519_seed);
    let mut secret = Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(&hash[..32]);
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

fn derive_key(shared_secret: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(HKDF_INFO, &mut key[..])
        .map_err(|e| CryptoError::Seal(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Seal plaintext to a recipient identity.
pub fn seal(plaintext: &[u8], recipient: &Identity) -> Result<SealedPayload> {
    let recipient_x25519 = X25519PublicKey::from(ed25519_to_x25519_public(recipient.as_bytes())?);

    let ephemeral_secret = X25519Secret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let shared_secret = ephemeral_secret.diffie_hellman(&recipient_x25519);
    let key = derive_key(shared_secret.as_bytes())?;
    let cipher = XChaCha20Poly1305::new(&(*key).into());

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Seal(format!("encryption failed: {e}")))?;

    Ok(SealedPayload {
        ciphertext,
        nonce: nonce_bytes,
        ephemeral_pk: ephemeral_public.to_bytes(),
    })
}

/// Open a payload sealed to the local identity.
pub fn open(payload: &SealedPayload, local: &KeyIdentity) -> Result<Vec<u8>> {
    let secret_bytes = ed25519_to_x25519_secret(local.seed());
    let secret = X25519Secret::from(*secret_bytes);

    let ephemeral_pk = X25519PublicKey::from(payload.ephemeral_pk);
    let shared_secret = secret.diffie_hellman(&ephemeral_pk);
    let key = derive_key(shared_secret.as_bytes())?;
    let cipher = XChaCha20Poly1305::new(&(*key).into());

    let nonce = XNonce::from(payload.nonce);
    cipher
        .decrypt(&nonce, payload.ciphertext.as_ref())
        .map_err(|_| CryptoError::Unseal("authentication failed".into()).into())
}

/// Lowercase hex SHA-256, used as a content fingerprint.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
