//! Error types shared across the proxy's components.

use thiserror::Error;

/// Result alias for fallible library operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors surfaced by the Blob Store, Codec, Control Channel and
/// Certificate Manager. Per-connection I/O errors in the SNI Proxy are
/// logged and torn down locally rather than funneled through this type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Superblock checksum did not verify on read. The caller's policy is
    /// to treat this as "uninitialized" and call `BlobStore::init`.
    #[error("blob store: checksum mismatch")]
    BadChecksum,

    /// Payload or command bytes could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Underlying device or network I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control-channel request failed HMAC authentication.
    #[error("authentication failure")]
    Auth,

    /// Control-channel request was truncated (short read).
    #[error("truncated request")]
    Truncated,

    /// The certificate issuer failed to produce a chain for a domain.
    #[error("certificate issuance failed for {domain}: {reason}")]
    CertificateIssuance { domain: String, reason: String },

    /// TLS configuration could not be built from the fetched chains.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Process configuration was missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
}
