//! Shamir secret sharing over the Ed25519 scalar field.
//!
//! The secret is cut into 31-byte chunks; every chunk is the constant term
//! of its own random polynomial of degree `threshold - 1`. A share holds the
//! evaluations of all chunk polynomials at its index.

mod engine;
mod shard;

pub use engine::{reconstruct, split, CHUNK_SIZE, PRIME_MODULUS_HEX, SCALAR_SIZE};
pub use shard::ShardData;
