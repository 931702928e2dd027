//! The DNS-based automated issuance protocol is an external black box
//! (SPEC_FULL.md §1); this module only states the interface it must
//! present, plus a self-signed fallback for local use and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{ProxyError, Result};

/// What the Certificate Manager asks of the issuance service for one
/// configured domain (SPEC_FULL.md §4.5 step 1).
#[derive(Debug, Clone)]
pub struct IssuanceRequest {
    pub hostname: String,
    pub additional_name: String,
    pub key_seed: String,
    pub dns_server: String,
    pub dns_key: String,
}

impl IssuanceRequest {
    pub fn for_domain(domain: &str, global_key_seed: &str, dns_server: &str, dns_key: &str) -> Self {
        Self {
            hostname: domain.to_string(),
            additional_name: format!("*.{domain}"),
            key_seed: format!("{domain}:{global_key_seed}"),
            dns_server: dns_server.to_string(),
            dns_key: dns_key.to_string(),
        }
    }
}

/// One issued chain: the certificate DER chain, its private key, and the
/// leaf's expiry, which drives the renewal clamp (SPEC_FULL.md §4.5 step 5).
pub struct IssuedCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub not_after: DateTime<Utc>,
}

/// Black-box collaborator: "give me a chain for these names."
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuedCertificate>;
}

/// Local fallback issuer used when no real DNS issuance endpoint is
/// configured: generates a self-signed leaf good for 90 days, mirroring
/// the corpus's own self-signed fallback for development deployments.
pub struct SelfSignedIssuer;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuedCertificate> {
        let subject_alt_names = vec![request.hostname.clone(), request.additional_name.clone()];
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(subject_alt_names)
                .map_err(|e| ProxyError::Tls(format!("self-signed generation failed: {e}")))?;

        let not_after = Utc::now() + chrono::Duration::days(90);
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(signing_key.serialize_der().into());

        Ok(IssuedCertificate {
            chain: vec![cert_der],
            key: key_der,
            not_after,
        })
    }
}
