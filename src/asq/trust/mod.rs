//! The trust context backing peer verification.
//!
//! A context holds this node's identity material, the set of trusted
//! certificate authorities with their revocation lists, and a local
//! blocked set. Peer chains presented by the transport are verified
//! against all three. Verification results are cached under a
//! content hash of the input chain and revalidated on a short
//! window, so the TLS stack can consult the context per connection
//! without re-walking signatures every time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustls::{Certificate, ClientConfig};
use tracing::debug;
use uuid::Uuid;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;

use crate::asq::crypto::hash::{self, Digest};
use crate::asq::crypto::signature::KeyPair;
use crate::asq::error::*;

/// A trusted certificate authority: its chain (leaf first), and any
/// revocation lists it published.
pub struct TrustedCA {
    chain: Vec<Certificate>,
    crls: Vec<Vec<u8>>,
    expiry: i64,
}

impl TrustedCA {
    /// Builds a trusted CA from a leaf-first DER chain and raw DER
    /// revocation lists. The material is parsed eagerly so malformed
    /// files surface here, not per verification.
    pub fn new(chain: Vec<Certificate>, crls: Vec<Vec<u8>>) -> Result<Self> {
        if chain.is_empty() {
            return Err("A trusted CA needs at least one certificate").wrapped(ErrorKind::Trust);
        }
        for cert in &chain {
            X509Certificate::from_der(&cert.0)
                .simple_msg(ErrorKind::Trust, "Malformed CA certificate")?;
        }
        for crl in &crls {
            CertificateRevocationList::from_der(crl)
                .simple_msg(ErrorKind::Trust, "Malformed revocation list")?;
        }
        // refresh is scheduled off the anchor's inception; a restated
        // anchor always moves it forward
        let anchor = chain.last().expect("chain is non-empty");
        let (_, parsed) = X509Certificate::from_der(&anchor.0)
            .simple_msg(ErrorKind::Trust, "Malformed CA certificate")?;
        let expiry = parsed.validity().not_before.timestamp() * 1000;
        Ok(Self {
            chain,
            crls,
            expiry,
        })
    }

    /// Millis timestamp used to schedule a refresh of this CA.
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    /// Whether this CA's issuing certificate signed `cert`.
    fn issued(&self, cert: &X509Certificate<'_>) -> bool {
        let (_, issuer) = match X509Certificate::from_der(&self.chain[0].0) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        cert.verify_signature(Some(issuer.public_key())).is_ok()
    }

    /// Whether `cert` is one of this CA's own chain certificates.
    fn contains(&self, der: &[u8]) -> bool {
        self.chain.iter().any(|cert| cert.0 == der)
    }

    /// Looks `cert` up in the revocation lists, reporting the
    /// revocation date as a display string.
    fn revocation(&self, cert: &X509Certificate<'_>) -> Option<String> {
        for crl in &self.crls {
            let (_, parsed) = match CertificateRevocationList::from_der(crl) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            for revoked in parsed.iter_revoked_certificates() {
                if revoked.user_certificate == cert.tbs_certificate.serial {
                    return Some(revoked.revocation_date.to_string());
                }
            }
        }
        None
    }
}

struct CacheEntry {
    at: Instant,
    failure: Option<String>,
}

/// Identity, trust anchors, revocations and the verifier cache.
pub struct TrustContext {
    identity: Option<(Certificate, KeyPair)>,
    trusted: RwLock<Vec<Arc<TrustedCA>>>,
    blocked: RwLock<Vec<Certificate>>,
    cache: Mutex<crate::asq::collections::HashMap<Digest, CacheEntry>>,
    reverify_window: Duration,
}

impl TrustContext {
    /// How long a cached verification result stays fresh.
    pub const REVERIFY_WINDOW: Duration = Duration::from_secs(2);

    /// Creates an anonymous context with no trust anchors.
    pub fn new() -> Self {
        Self {
            identity: None,
            trusted: RwLock::new(Vec::new()),
            blocked: RwLock::new(Vec::new()),
            cache: Mutex::new(crate::asq::collections::hash_map()),
            reverify_window: Self::REVERIFY_WINDOW,
        }
    }

    /// Creates a context carrying this node's identity material.
    pub fn with_identity(certificate: Certificate, key: KeyPair) -> Self {
        let mut context = Self::new();
        context.identity = Some((certificate, key));
        context
    }

    /// This node's certificate and signing key, if any.
    pub fn identity(&self) -> Option<(&Certificate, &KeyPair)> {
        self.identity.as_ref().map(|(cert, key)| (cert, key))
    }

    /// Registers a trusted CA.
    pub fn add_trusted(&self, ca: TrustedCA) {
        self.trusted.write().push(Arc::new(ca));
    }

    /// Blocks a certificate by local policy, regardless of its chain.
    pub fn block(&self, certificate: Certificate) {
        self.blocked.write().push(certificate);
    }

    /// Verifies a peer's certificate chain, leaf first.
    ///
    /// The chain must be internally consistent (each certificate
    /// signed by the next, all within their validity windows, the
    /// final one self-signed or issued by a trusted CA), anchored at
    /// some registered CA, absent from every revocation list, and
    /// absent from the local blocked set.
    pub fn verify(&self, chain: &[Certificate]) -> Result<()> {
        let key = cache_key(chain);
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(&key) {
                if entry.at.elapsed() < self.reverify_window {
                    return match &entry.failure {
                        None => Ok(()),
                        Some(reason) => Err(Error::wrapped(ErrorKind::Trust, reason.clone())),
                    };
                }
            }
        }

        let outcome = self.verify_uncached(chain);
        let failure = outcome.as_ref().err().map(|e| e.to_string());
        self.cache.lock().insert(
            key,
            CacheEntry {
                at: Instant::now(),
                failure,
            },
        );
        outcome
    }

    fn verify_uncached(&self, chain: &[Certificate]) -> Result<()> {
        if chain.is_empty() {
            return Err("The peer presented an empty certificate chain")
                .wrapped(ErrorKind::Trust);
        }

        let mut parsed = Vec::with_capacity(chain.len());
        for cert in chain {
            let (_, cert) = X509Certificate::from_der(&cert.0)
                .simple_msg(ErrorKind::Trust, "Malformed certificate in the peer chain")?;
            parsed.push(cert);
        }

        // validity windows
        for cert in &parsed {
            if !cert.validity().is_valid() {
                return Err(Error::wrapped(
                    ErrorKind::Trust,
                    format!(
                        "certificate '{}' (issued by '{}') is outside its validity window",
                        cert.subject(),
                        cert.issuer(),
                    ),
                ));
            }
        }

        // each certificate signed by the next
        for pair in parsed.windows(2) {
            if pair[0].verify_signature(Some(pair[1].public_key())).is_err() {
                return Err(Error::wrapped(
                    ErrorKind::Trust,
                    format!(
                        "certificate '{}' is not signed by its chain successor '{}'",
                        pair[0].subject(),
                        pair[1].subject(),
                    ),
                ));
            }
        }

        // the tail is self-signed or chains to a registered CA
        let trusted = self.trusted.read().clone();
        let tail = parsed.last().expect("chain is non-empty");
        let tail_der = &chain[chain.len() - 1].0[..];
        let self_signed = tail.verify_signature(None).is_ok();
        if !self_signed
            && !trusted
                .iter()
                .any(|ca| ca.contains(tail_der) || ca.issued(tail))
        {
            return Err(Error::wrapped(
                ErrorKind::Trust,
                format!("certificate '{}' does not chain to a trusted CA", tail.subject()),
            ));
        }

        // the leaf must anchor at some registered CA
        let leaf = &parsed[0];
        let anchored = trusted.iter().any(|ca| {
            parsed
                .iter()
                .zip(chain.iter())
                .any(|(cert, der)| ca.contains(&der.0) || ca.issued(cert))
        });
        if !anchored {
            return Err(Error::wrapped(
                ErrorKind::Trust,
                format!(
                    "certificate '{}' (issued by '{}') does not anchor at any trusted CA",
                    leaf.subject(),
                    leaf.issuer(),
                ),
            ));
        }

        // revocations
        for cert in &parsed {
            for ca in trusted.iter() {
                if let Some(date) = ca.revocation(cert) {
                    return Err(Error::wrapped(
                        ErrorKind::Trust,
                        format!(
                            "certificate '{}' (serial {}) was revoked at {}",
                            cert.subject(),
                            cert.raw_serial_as_string(),
                            date,
                        ),
                    ));
                }
            }
        }

        // local policy
        let blocked = self.blocked.read();
        for (cert, der) in parsed.iter().zip(chain.iter()) {
            if blocked.iter().any(|b| b.0 == der.0) {
                return Err(Error::wrapped(
                    ErrorKind::Trust,
                    format!("certificate '{}' is blocked by local policy", cert.subject()),
                ));
            }
        }

        debug!(subject = %leaf.subject(), "peer chain verified");
        Ok(())
    }

    #[cfg(test)]
    fn cached_results(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for TrustContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the TLS client configuration consuming this context as its
/// certificate verifier.
pub fn client_config(context: Arc<TrustContext>) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(ContextVerifier { context }));
    config
}

struct ContextVerifier {
    context: Arc<TrustContext>,
}

impl rustls::ServerCertVerifier for ContextVerifier {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        presented_certs: &[Certificate],
        _dns_name: webpki::DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> std::result::Result<rustls::ServerCertVerified, rustls::TLSError> {
        self.context
            .verify(presented_certs)
            .map(|_| rustls::ServerCertVerified::assertion())
            .map_err(|e| rustls::TLSError::General(e.to_string()))
    }
}

/// Whether the certificate's subject common name matches the node id
/// the peer claimed during the handshake.
pub fn certificate_names_node(certificate: &Certificate, node_id: &Uuid) -> Result<bool> {
    let (_, parsed) = X509Certificate::from_der(&certificate.0)
        .simple_msg(ErrorKind::Trust, "Malformed peer certificate")?;
    let expected = node_id.to_string();
    for attribute in parsed.subject().iter_common_name() {
        if let Ok(name) = attribute.as_str() {
            if name.eq_ignore_ascii_case(&expected) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn cache_key(chain: &[Certificate]) -> Digest {
    let mut material = Vec::new();
    for cert in chain {
        material.extend_from_slice(&(cert.0.len() as u64).to_be_bytes());
        material.extend_from_slice(&cert.0);
    }
    hash::digest(&material)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chains_are_refused() {
        let context = TrustContext::new();
        assert!(context.verify(&[]).is_err());
    }

    #[test]
    fn malformed_chains_are_refused() {
        let context = TrustContext::new();
        let garbage = vec![Certificate(vec![0xDE, 0xAD, 0xBE, 0xEF])];
        assert!(context.verify(&garbage).is_err());
    }

    #[test]
    fn verification_results_are_cached_by_content() {
        let context = TrustContext::new();
        let garbage = vec![Certificate(vec![1, 2, 3])];

        assert!(context.verify(&garbage).is_err());
        assert_eq!(context.cached_results(), 1);

        // the second failure is served out of the cache
        assert!(context.verify(&garbage).is_err());
        assert_eq!(context.cached_results(), 1);

        let other = vec![Certificate(vec![4, 5, 6])];
        assert!(context.verify(&other).is_err());
        assert_eq!(context.cached_results(), 2);
    }

    #[test]
    fn trusted_cas_require_parseable_material() {
        assert!(TrustedCA::new(vec![], vec![]).is_err());
        assert!(TrustedCA::new(vec![Certificate(vec![0x30, 0x00])], vec![]).is_err());
    }

    #[test]
    fn node_id_checks_fail_on_garbage_certificates() {
        let err = certificate_names_node(&Certificate(vec![0]), &Uuid::new_v4());
        assert!(err.is_err());
    }
}
