//! Content digests, used as cache keys by the trust layer.

#[cfg(feature = "crypto_hash_ring_sha2")]
mod ring_sha2;

#[cfg(feature = "crypto_hash_ring_sha2")]
pub use ring_sha2::{digest, Digest};
