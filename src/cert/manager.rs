//! Startup + periodic certificate retrieval, TLS configuration assembly,
//! and the renewal-delay clamp (SPEC_FULL.md §4.5).

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{error, info};

use crate::cert::issuer::{CertificateIssuer, IssuanceRequest, IssuedCertificate};
use crate::error::{ProxyError, Result};

/// The clamp from SPEC_FULL.md §4.5 step 5: renewal never sleeps less
/// than this, so a near-expiry or failed renewal can't hot-spin.
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(3600);
const RENEWAL_MARGIN: chrono::Duration = chrono::Duration::days(7);

/// One issued chain plus its expiry, kept around so the renewal loop can
/// compute the next sleep without re-parsing certificates.
pub struct CertificateChain {
    pub domain: String,
    pub certified_key: Arc<CertifiedKey>,
    pub not_after: DateTime<Utc>,
}

/// Resolves the certificate to present during a handshake: by SNI against
/// each configured domain's chain, falling back to the first (default)
/// chain when SNI is absent or unrecognized. This mirrors rustls's own
/// `ResolvesServerCertUsingSni` plus the spec's `Multiple_default` shape,
/// which has no exact match in `rustls::server` (SNI-absent traffic there
/// yields no certificate at all).
struct CertResolver {
    by_name: std::collections::HashMap<String, Arc<CertifiedKey>>,
    default: Arc<CertifiedKey>,
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            if let Some(key) = self.by_name.get(name) {
                return Some(key.clone());
            }
        }
        Some(self.default.clone())
    }
}

/// Builds the active TLS configuration from an ordered list of chains; the
/// first chain is the default (SPEC_FULL.md §4.5 step 3).
pub fn build_tls_config(chains: &[CertificateChain]) -> Result<Arc<ServerConfig>> {
    let default = chains
        .first()
        .ok_or_else(|| ProxyError::Tls("no certificate chains configured".into()))?
        .certified_key
        .clone();

    let by_name = chains
        .iter()
        .map(|c| (c.domain.clone(), c.certified_key.clone()))
        .collect();

    let resolver = Arc::new(CertResolver { by_name, default });

    // No ALPN protocols are advertised: routing is by SNI alone (§1 Non-goals
    // rule out ALPN-based routing), so pinning `http/1.1` here would abort
    // the handshake for any client offering ALPN without it (e.g. h2-only
    // clients) even though the pump is byte-transparent and doesn't care.
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    Ok(Arc::new(config))
}

/// Owns the issuer, the configured domains, and the handle the SNI Proxy
/// reads the active TLS configuration from.
pub struct CertificateManager {
    domains: Vec<String>,
    global_key_seed: String,
    dns_server: String,
    dns_key: String,
    issuer: Arc<dyn CertificateIssuer>,
    tls_config: Arc<ArcSwap<ServerConfig>>,
}

impl CertificateManager {
    pub fn new(
        domains: Vec<String>,
        global_key_seed: String,
        dns_server: String,
        dns_key: String,
        issuer: Arc<dyn CertificateIssuer>,
        tls_config: Arc<ArcSwap<ServerConfig>>,
    ) -> Self {
        Self {
            domains,
            global_key_seed,
            dns_server,
            dns_key,
            issuer,
            tls_config,
        }
    }

    /// Retrieves a chain for every configured domain. A single failure is
    /// fatal — no partial rotation (SPEC_FULL.md §4.5 step 2).
    async fn retrieve_all(&self) -> Result<Vec<CertificateChain>> {
        let mut chains = Vec::with_capacity(self.domains.len());
        for domain in &self.domains {
            let request = IssuanceRequest::for_domain(
                domain,
                &self.global_key_seed,
                &self.dns_server,
                &self.dns_key,
            );
            let IssuedCertificate {
                chain,
                key,
                not_after,
            } = self.issuer.issue(&request).await.map_err(|e| {
                ProxyError::CertificateIssuance {
                    domain: domain.clone(),
                    reason: e.to_string(),
                }
            })?;

            let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
                .map_err(|e| ProxyError::Tls(format!("unsupported private key: {e}")))?;
            let certified_key = Arc::new(CertifiedKey::new(chain, signing_key));

            chains.push(CertificateChain {
                domain: domain.clone(),
                certified_key,
                not_after,
            });
        }
        Ok(chains)
    }

    /// One full iteration: retrieve, install, compute the next sleep.
    /// Returns the clamped delay before the next renewal should run.
    async fn renew_once(&self) -> Result<Duration> {
        let chains = self.retrieve_all().await?;
        let config = build_tls_config(&chains)?;
        self.tls_config.store(config);
        info!(domains = ?self.domains, "TLS configuration installed");
        Ok(next_renewal_delay(&chains))
    }

    /// Runs the retrieve/install/sleep loop forever. Fatal at startup if
    /// the first retrieval fails (SPEC_FULL.md §4.5 failure semantics);
    /// the caller is expected to treat a mid-loop failure as fatal too and
    /// let the process be restarted under supervision.
    pub async fn run(&self) -> Result<()> {
        let delay = self.renew_once().await?;
        let mut sleep_for = delay;
        loop {
            tokio::time::sleep(sleep_for).await;
            match self.renew_once().await {
                Ok(delay) => sleep_for = delay,
                Err(e) => {
                    error!("certificate renewal failed: {e}");
                    return Err(e);
                }
            }
        }
    }
}

/// Minimum positive remaining span across all chains, minus the renewal
/// margin, clamped to at least one hour.
fn next_renewal_delay(chains: &[CertificateChain]) -> Duration {
    let now = Utc::now();
    let min_remaining = chains
        .iter()
        .map(|c| c.not_after - now)
        .filter(|span| *span > chrono::Duration::zero())
        .min();

    let target = match min_remaining {
        Some(span) => span - RENEWAL_MARGIN,
        None => chrono::Duration::zero(),
    };

    target
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(MIN_RENEWAL_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::issuer::SelfSignedIssuer;

    fn chain_with_expiry(domain: &str, days: i64) -> CertificateChain {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(signing_key.serialize_der().into());
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der).unwrap();
        let certified_key = Arc::new(CertifiedKey::new(vec![cert.der().clone()], signing_key));
        CertificateChain {
            domain: domain.to_string(),
            certified_key,
            not_after: Utc::now() + chrono::Duration::days(days),
        }
    }

    #[test]
    fn clamp_enforces_minimum_one_hour() {
        let chains = vec![chain_with_expiry("a.example", 1)];
        let delay = next_renewal_delay(&chains);
        assert_eq!(delay, MIN_RENEWAL_DELAY);
    }

    #[test]
    fn clamp_subtracts_margin_from_minimum_expiry() {
        let chains = vec![
            chain_with_expiry("a.example", 30),
            chain_with_expiry("b.example", 100),
        ];
        let delay = next_renewal_delay(&chains);
        // min expiry (30 days) - 7 day margin ~ 23 days, well above the floor.
        assert!(delay > MIN_RENEWAL_DELAY);
        assert!(delay < Duration::from_secs(23 * 24 * 3600 + 3600));
    }

    #[test]
    fn build_tls_config_requires_at_least_one_chain() {
        let chains: Vec<CertificateChain> = vec![];
        assert!(build_tls_config(&chains).is_err());
    }

    #[tokio::test]
    async fn self_signed_issuer_produces_usable_chain() {
        let issuer = SelfSignedIssuer;
        let request = IssuanceRequest::for_domain("a.example", "seed", "127.0.0.1", "key");
        let issued = issuer.issue(&request).await.unwrap();
        assert!(!issued.chain.is_empty());
        assert!(issued.not_after > Utc::now());
    }
}
