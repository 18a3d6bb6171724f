use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};

use crate::asq::error::*;

/// A fixed-form (P1363) ECDSA P-256 signature.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Signature([u8; Signature::LENGTH]);

impl Signature {
    /// Two field elements, 32 bytes each.
    pub const LENGTH: usize = 64;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != Self::LENGTH {
            return Err("Signature has an invalid length")
                .wrapped(ErrorKind::CryptoSignatureP256Ecdsa);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(raw_bytes);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A signing key with its public half.
pub struct KeyPair {
    sk: SigningKey,
}

impl KeyPair {
    /// Loads a key pair from a raw 32-byte scalar.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        let sk = SigningKey::from_slice(raw_bytes)
            .simple_msg(ErrorKind::CryptoSignatureP256Ecdsa, "Invalid signing key")?;
        Ok(Self { sk })
    }

    /// The public half of this key pair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            vk: *self.sk.verifying_key(),
        }
    }

    /// Signs a prehashed message. Deterministic per RFC 6979.
    pub fn sign_prehash(&self, prehash: &[u8]) -> Result<Signature> {
        let signature: EcdsaSignature = self
            .sk
            .sign_prehash(prehash)
            .simple_msg(ErrorKind::CryptoSignatureP256Ecdsa, "Signing failed")?;
        Signature::from_bytes(signature.to_bytes().as_slice())
    }
}

/// The verifying half of a key pair.
#[derive(Clone)]
pub struct PublicKey {
    vk: VerifyingKey,
}

impl PublicKey {
    /// Loads a public key from a SEC1-encoded point.
    pub fn from_sec1_bytes(raw_bytes: &[u8]) -> Result<Self> {
        let vk = VerifyingKey::from_sec1_bytes(raw_bytes)
            .simple_msg(ErrorKind::CryptoSignatureP256Ecdsa, "Invalid public key")?;
        Ok(Self { vk })
    }

    /// Verifies a signature over a prehashed message.
    pub fn verify_prehash(&self, prehash: &[u8], signature: &Signature) -> Result<()> {
        let signature = EcdsaSignature::from_slice(&signature.0)
            .simple_msg(ErrorKind::CryptoSignatureP256Ecdsa, "Malformed signature")?;
        self.vk
            .verify_prehash(prehash, &signature)
            .simple_msg(ErrorKind::CryptoSignatureP256Ecdsa, "Signature mismatch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_a_prehash() {
        let key = KeyPair::from_bytes(&[7; 32]).expect("valid scalar");
        let prehash = [0xAB; 64];

        let signature = key.sign_prehash(&prehash).expect("signing works");
        key.public_key()
            .verify_prehash(&prehash, &signature)
            .expect("signature verifies");

        let mut other = prehash;
        other[0] ^= 1;
        assert!(key.public_key().verify_prehash(&other, &signature).is_err());
    }
}
