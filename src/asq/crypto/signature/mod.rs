//! Signatures over prehashed messages, used by the envelope layer.

#[cfg(feature = "crypto_signature_p256_ecdsa")]
mod p256_ecdsa;

#[cfg(feature = "crypto_signature_p256_ecdsa")]
pub use p256_ecdsa::{KeyPair, PublicKey, Signature};
