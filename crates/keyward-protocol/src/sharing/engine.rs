use std::collections::BTreeSet;

use curve25519_dalek::scalar::Scalar;
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::{CryptoError, ProtocolError, Result, ValidationError};
use crate::identity::Identity;
use crate::types::MAX_SHARES;

use super::ShardData;

/// Secret bytes per field element. 31 bytes always fit below the modulus.
pub const CHUNK_SIZE: usize = 31;

/// Encoded size of one field element.
pub const SCALAR_SIZE: usize = 32;

/// ℓ = 2^252 + 27742317777372353535851937790883648493, big-endian hex.
pub const PRIME_MODULUS_HEX: &str =
    "1000000000000000000000000000000014def9dea2f79cd65812631a5cf5d3ed";

pub(crate) fn chunk_count(secret_len: usize) -> usize {
    secret_len.div_ceil(CHUNK_SIZE)
}

fn validate_threshold(threshold: usize, total: usize) -> Result<()> {
    if threshold == 0 || threshold > total || total > MAX_SHARES {
        return Err(ValidationError::InvalidThreshold {
            threshold,
            total,
            max: MAX_SHARES,
        }
        .into());
    }
    Ok(())
}

fn random_scalar() -> Scalar {
    let mut wide = Zeroizing::new([0u8; 64]);
    OsRng.fill_bytes(&mut wide[..]);
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn chunk_to_scalar(chunk: &[u8]) -> Scalar {
    let mut bytes = Zeroizing::new([0u8; SCALAR_SIZE]);
    bytes[..chunk.len()].copy_from_slice(chunk);
    Scalar::from_bytes_mod_order(*bytes)
}

/// Horner evaluation of `coefficients[0] + coefficients[1]·x + …`.
fn evaluate(coefficients: &[Scalar], x: Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, c| acc * x + c)
}

/// Lagrange basis values at x = 0 for distinct non-zero points.
fn lagrange_at_zero(xs: &[Scalar]) -> Vec<Scalar> {
    xs.iter()
        .enumerate()
        .map(|(i, xi)| {
            let (num, den) = xs
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .fold((Scalar::ONE, Scalar::ONE), |(num, den), (_, xj)| {
                    (num * xj, den * (xj - xi))
                });
            num * den.invert()
        })
        .collect()
}

/// Split `secret` into `total` shares, any `threshold` of which reconstruct it.
pub fn split(
    secret: &[u8],
    threshold: usize,
    total: usize,
    creator: Identity,
    now: u64,
) -> Result<Vec<ShardData>> {
    validate_threshold(threshold, total)?;
    let secret_len = u32::try_from(secret.len())
        .map_err(|_| ValidationError::InvalidShard("secret too large".into()))?;

    let mut values: Vec<Vec<u8>> = (0..total)
        .map(|_| Vec::with_capacity(chunk_count(secret.len()) * SCALAR_SIZE))
        .collect();
    let xs: Vec<Scalar> = (1..=total as u64).map(Scalar::from).collect();

    for chunk in secret.chunks(CHUNK_SIZE) {
        let mut coefficients = Zeroizing::new(Vec::with_capacity(threshold));
        coefficients.push(chunk_to_scalar(chunk));
        coefficients.extend((1..threshold).map(|_| random_scalar()));

        for (value, x) in values.iter_mut().zip(&xs) {
            value.extend_from_slice(evaluate(&coefficients, *x).as_bytes());
        }
    }

    Ok(values
        .into_iter()
        .enumerate()
        .map(|(i, share)| {
            ShardData::new(
                share,
                threshold as u8,
                (i + 1) as u8,
                total as u8,
                secret_len,
                creator,
                now,
            )
        })
        .collect())
}

fn check_consistent(shards: &[ShardData]) -> Result<()> {
    let Some(first) = shards.first() else {
        return Ok(());
    };
    let expected_len = chunk_count(first.secret_len as usize) * SCALAR_SIZE;
    for shard in shards {
        let mismatch = if shard.prime_mod != PRIME_MODULUS_HEX {
            Some(format!("unsupported modulus {}", shard.prime_mod))
        } else if shard.threshold != first.threshold || shard.total_shards != first.total_shards
        {
            Some("threshold/total metadata differs".to_string())
        } else if shard.secret_len != first.secret_len {
            Some("secret length metadata differs".to_string())
        } else if shard.share.len() != expected_len {
            Some(format!(
                "share {} is {} bytes, expected {expected_len}",
                shard.shard_index,
                shard.share.len()
            ))
        } else if shard.shard_index == 0 || shard.threshold == 0 {
            Some("zero index or threshold".to_string())
        } else {
            None
        };
        if let Some(reason) = mismatch {
            return Err(CryptoError::InconsistentShares(reason).into());
        }
    }
    Ok(())
}

fn decode_scalar(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; SCALAR_SIZE] = bytes
        .try_into()
        .map_err(|_| CryptoError::InconsistentShares("truncated scalar".into()))?;
    Option::<Scalar>::from(Scalar::from_canonical_bytes(array))
        .ok_or_else(|| CryptoError::InconsistentShares("non-canonical scalar".into()).into())
}

/// Reconstruct the secret from at least `threshold` distinct shares.
///
/// Only the first `threshold` shares take part in interpolation.
pub fn reconstruct(shards: &[ShardData]) -> Result<Vec<u8>> {
    let Some(first) = shards.first() else {
        return Err(ProtocolError::InsufficientShares { have: 0, need: 1 }.into());
    };
    check_consistent(shards)?;

    let mut seen = BTreeSet::new();
    for shard in shards {
        if !seen.insert(shard.shard_index) {
            return Err(ProtocolError::DuplicateShardIndex(shard.shard_index).into());
        }
    }

    let threshold = first.threshold as usize;
    if shards.len() < threshold {
        return Err(ProtocolError::InsufficientShares {
            have: shards.len(),
            need: threshold,
        }
        .into());
    }

    let used = &shards[..threshold];
    let xs: Vec<Scalar> = used
        .iter()
        .map(|s| Scalar::from(s.shard_index as u64))
        .collect();
    let basis = lagrange_at_zero(&xs);

    let secret_len = first.secret_len as usize;
    let mut secret = Zeroizing::new(Vec::with_capacity(chunk_count(secret_len) * CHUNK_SIZE));
    for c in 0..chunk_count(secret_len) {
        let range = c * SCALAR_SIZE..(c + 1) * SCALAR_SIZE;
        let mut acc = Scalar::ZERO;
        for (shard, lambda) in used.iter().zip(&basis) {
            acc += lambda * decode_scalar(&shard.share[range.clone()])?;
        }
        let bytes = Zeroizing::new(acc.to_bytes());
        if bytes[CHUNK_SIZE] != 0 {
            return Err(
                CryptoError::InconsistentShares("chunk exceeds 31 bytes".into()).into(),
            );
        }
        secret.extend_from_slice(&bytes[..CHUNK_SIZE]);
    }
    secret.truncate(secret_len);
    Ok(secret.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeywardError;
    use crate::identity::KeyIdentity;

    fn owner() -> Identity {
        KeyIdentity::from_seed([1; 32]).identity()
    }

    #[test]
    fn modulus_constant_matches_field() {
        let mut le = hex::decode(PRIME_MODULUS_HEX).unwrap();
        le.reverse();
        le[0] -= 1;
        assert_eq!(le, (-Scalar::ONE).to_bytes().to_vec());
    }

    #[test]
    fn two_of_three_any_pair() {
        let shards = split(b"K", 2, 3, owner(), 0).unwrap();
        assert_eq!(shards.len(), 3);
        for (a, b) in [(0, 1), (0, 2), (1, 2), (2, 0)] {
            let pair = vec![shards[a].clone(), shards[b].clone()];
            assert_eq!(reconstruct(&pair).unwrap(), b"K");
        }
    }

    #[test]
    fn multi_chunk_secret() {
        let secret: Vec<u8> = (0..100u8).collect();
        let shards = split(&secret, 3, 5, owner(), 0).unwrap();
        assert_eq!(shards[0].share.len(), 4 * SCALAR_SIZE);
        assert_eq!(reconstruct(&shards[2..5]).unwrap(), secret);
    }

    #[test]
    fn high_bytes_survive() {
        let secret = [0xffu8; 62];
        let shards = split(&secret, 2, 2, owner(), 0).unwrap();
        assert_eq!(reconstruct(&shards).unwrap(), secret);
    }

    #[test]
    fn empty_secret() {
        let shards = split(b"", 1, 1, owner(), 0).unwrap();
        assert!(shards[0].share.is_empty());
        assert!(reconstruct(&shards).unwrap().is_empty());
    }

    #[test]
    fn threshold_one_shares_equal_secret_chunk() {
        let shards = split(b"abc", 1, 3, owner(), 0).unwrap();
        assert_eq!(shards[0].share, shards[2].share);
        assert_eq!(reconstruct(&shards[1..2]).unwrap(), b"abc");
    }

    #[test]
    fn split_rejects_bad_parameters() {
        for (t, n) in [(0, 3), (4, 3), (2, 11)] {
            let err = split(b"x", t, n, owner(), 0).unwrap_err();
            assert!(matches!(
                err,
                KeywardError::Validation(ValidationError::InvalidThreshold { .. })
            ));
        }
    }

    #[test]
    fn too_few_shares() {
        let shards = split(b"secret", 3, 5, owner(), 0).unwrap();
        let err = reconstruct(&shards[..2]).unwrap_err();
        assert!(matches!(
            err,
            KeywardError::Protocol(ProtocolError::InsufficientShares { have: 2, need: 3 })
        ));
    }

    #[test]
    fn duplicate_index_rejected() {
        let shards = split(b"secret", 2, 3, owner(), 0).unwrap();
        let dup = vec![shards[0].clone(), shards[0].clone()];
        let err = reconstruct(&dup).unwrap_err();
        assert!(matches!(
            err,
            KeywardError::Protocol(ProtocolError::DuplicateShardIndex(1))
        ));
    }

    #[test]
    fn mixed_secret_lengths_rejected() {
        let a = split(b"short", 2, 3, owner(), 0).unwrap();
        let b = split(b"a much longer secret value that spans chunks", 2, 3, owner(), 0).unwrap();
        let err = reconstruct(&[a[0].clone(), b[1].clone()]).unwrap_err();
        assert!(matches!(
            err,
            KeywardError::Crypto(CryptoError::InconsistentShares(_))
        ));
    }

    #[test]
    fn foreign_modulus_rejected() {
        let mut shards = split(b"secret", 2, 3, owner(), 0).unwrap();
        shards[1].prime_mod = "ff".into();
        assert!(matches!(
            reconstruct(&shards).unwrap_err(),
            KeywardError::Crypto(_)
        ));
    }

    #[test]
    fn non_canonical_scalar_rejected() {
        let mut shards = split(b"secret", 2, 3, owner(), 0).unwrap();
        shards[0].share[..SCALAR_SIZE].copy_from_slice(&[0xff; SCALAR_SIZE]);
        assert!(matches!(
            reconstruct(&shards[..2]).unwrap_err(),
            KeywardError::Crypto(CryptoError::InconsistentShares(_))
        ));
    }

    #[test]
    fn fresh_polynomials_each_split() {
        let a = split(b"same secret", 2, 3, owner(), 0).unwrap();
        let b = split(b"same secret", 2, 3, owner(), 0).unwrap();
        assert_ne!(a[0].share, b[0].share);
    }

    #[test]
    fn metadata_is_filled() {
        let shards = split(b"secret", 2, 3, owner(), 42).unwrap();
        for (i, shard) in shards.iter().enumerate() {
            assert_eq!(shard.shard_index as usize, i + 1);
            assert_eq!(shard.threshold, 2);
            assert_eq!(shard.total_shards, 3);
            assert_eq!(shard.secret_len, 6);
            assert_eq!(shard.creator, owner());
            assert_eq!(shard.created_at, 42);
            assert_eq!(shard.prime_mod, PRIME_MODULUS_HEX);
        }
    }
}
