//! Authenticated, signed containers for out-of-band payloads.
//!
//! An envelope binds an arbitrary payload to the X.509 certificate of
//! its signer. The algorithm id selects how the signature was
//! produced; id `0` is a SHA-512 digest signed with ECDSA P-256 in
//! fixed (P1363) form. Envelopes are immutable values: `verify`
//! recomputes everything from the stored bytes.

use rustls::Certificate;
use sha2::{Digest as _, Sha512};
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use crate::asq::crypto::signature::{KeyPair, PublicKey, Signature};
use crate::asq::error::*;

/// A signed payload and the certificate vouching for it.
#[derive(Clone)]
pub struct Envelope {
    payload: Vec<u8>,
    sig_type: u8,
    signature: Vec<u8>,
    signer: Certificate,
}

impl Envelope {
    /// Algorithm id 0: SHA-512 digest, ECDSA P-256, P1363 form,
    /// 64-byte signature. Other ids are reserved.
    pub const SIG_SHA512_ECDSA: u8 = 0;

    /// Signs `payload` under `key`, vouched for by `signer`.
    ///
    /// The caller is responsible for `signer` actually carrying the
    /// public half of `key`; a mismatched pair produces an envelope
    /// that never verifies.
    pub fn seal(payload: Vec<u8>, signer: Certificate, key: &KeyPair) -> Result<Envelope> {
        let digest = Sha512::digest(&payload);
        let signature = key.sign_prehash(&digest)?;
        Ok(Envelope {
            payload,
            sig_type: Self::SIG_SHA512_ECDSA,
            signature: signature.as_ref().to_vec(),
            signer,
        })
    }

    /// The signed payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The signature algorithm id.
    pub fn sig_type(&self) -> u8 {
        self.sig_type
    }

    /// The raw signature bytes.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The signer's certificate.
    pub fn signer(&self) -> &Certificate {
        &self.signer
    }

    /// Checks the signature against the signer certificate's public
    /// key. Fails on any mismatch, and on unknown algorithm ids.
    pub fn verify(&self) -> Result<()> {
        let (_, parsed) = X509Certificate::from_der(&self.signer.0)
            .simple_msg(ErrorKind::Envelope, "Malformed signer certificate")?;
        let spki = parsed.public_key();
        let key = PublicKey::from_sec1_bytes(&spki.subject_public_key.data)
            .map_err(|e| e.swap_kind(ErrorKind::Envelope))?;
        self.verify_with_key(&key)
    }

    /// Checks the signature under an explicitly supplied public key,
    /// bypassing certificate parsing.
    pub fn verify_with_key(&self, key: &PublicKey) -> Result<()> {
        match self.sig_type {
            Self::SIG_SHA512_ECDSA => {
                let signature = Signature::from_bytes(&self.signature)
                    .map_err(|e| e.swap_kind(ErrorKind::Envelope))?;
                let digest = Sha512::digest(&self.payload);
                key.verify_prehash(&digest, &signature)
                    .map_err(|e| e.swap_kind(ErrorKind::Envelope))
            }
            _ => Err("Unknown signature algorithm id").wrapped(ErrorKind::Envelope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> KeyPair {
        KeyPair::from_bytes(&[9; 32]).expect("valid scalar")
    }

    fn seal(payload: &[u8]) -> Envelope {
        // the certificate bytes are irrelevant under verify_with_key
        Envelope::seal(payload.to_vec(), Certificate(vec![0x30]), &key()).expect("seal works")
    }

    #[test]
    fn sealed_envelopes_verify() {
        let envelope = seal(b"attested payload");
        envelope
            .verify_with_key(&key().public_key())
            .expect("envelope verifies");
        assert_eq!(envelope.sig_type(), Envelope::SIG_SHA512_ECDSA);
        assert_eq!(envelope.signature().len(), Signature::LENGTH);
    }

    #[test]
    fn payload_mutation_breaks_verification() {
        let envelope = seal(b"attested payload");
        for i in 0..envelope.payload().len() {
            let mut tampered = envelope.clone();
            tampered.payload[i] ^= 0x01;
            assert!(tampered.verify_with_key(&key().public_key()).is_err());
        }
    }

    #[test]
    fn signature_mutation_breaks_verification() {
        let envelope = seal(b"attested payload");
        for i in 0..envelope.signature().len() {
            let mut tampered = envelope.clone();
            tampered.signature[i] ^= 0x01;
            assert!(tampered.verify_with_key(&key().public_key()).is_err());
        }
    }

    #[test]
    fn unknown_algorithm_ids_are_rejected() {
        let mut envelope = seal(b"attested payload");
        envelope.sig_type = 0x7F;
        assert!(envelope.verify_with_key(&key().public_key()).is_err());
    }

    #[test]
    fn garbage_signer_certificates_fail_full_verification() {
        let envelope = seal(b"attested payload");
        assert!(envelope.verify().is_err());
    }
}
