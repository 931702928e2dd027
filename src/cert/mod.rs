//! Certificate lifecycle: issuance abstraction and the renewal loop.

pub mod issuer;
pub mod manager;

pub use issuer::{CertificateIssuer, IssuanceRequest, SelfSignedIssuer};
pub use manager::{build_tls_config, CertificateChain, CertificateManager};
