//! Process configuration (SPEC_FULL.md §6 "Startup keys" + §2a ambient
//! stack additions), loaded the way `gate-tlsforward`'s own
//! `TlsForwardConfig` is: a TOML file layered with `SNIGATE__`-prefixed
//! environment variables.

use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Top-level process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Control listener port (`configuration_port`).
    #[serde(default = "default_control_port")]
    pub configuration_port: u16,

    /// HMAC key for the control channel, as a UTF-8 string (`key`).
    pub key: String,

    /// Apex domains this proxy issues certificates for and routes.
    pub domains: Vec<String>,

    /// Global key seed combined with each domain for issuance.
    pub key_seed: String,

    /// DNS update credentials for the issuance service.
    pub dns_key: String,

    /// Issuance DNS server address (host only; port is conventionally 53).
    pub dns_server: String,

    /// Public TLS listener port.
    #[serde(default = "default_frontend_port")]
    pub frontend_port: u16,

    /// Public plaintext redirect port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS handshake deadline in seconds (SPEC_FULL.md §9 open question).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Path to the Blob Store's backing file. Defaults under the
    /// platform state directory when unset.
    #[serde(default)]
    pub blob_store_path: Option<PathBuf>,

    /// Logging configuration.
    #[serde(default)]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    /// Use a locally generated self-signed certificate instead of the
    /// DNS issuance service. Intended for local runs and tests.
    #[serde(default)]
    pub self_signed: bool,
}

fn default_control_port() -> u16 {
    9443
}

fn default_frontend_port() -> u16 {
    443
}

fn default_http_port() -> u16 {
    80
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

impl ProxyConfig {
    /// Loads configuration from the common file-path probing list plus
    /// `SNIGATE__`-prefixed environment variables (e.g.
    /// `SNIGATE__DOMAINS=a.example,b.example`).
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let candidate_paths = [
            "snigate.toml",
            "config/snigate.toml",
            "/etc/snigate/snigate.toml",
        ];
        for path in candidate_paths {
            if std::path::Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SNIGATE")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Loads configuration from an explicit file path, still allowing
    /// environment overrides.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("SNIGATE")
                    .separator("__")
                    .try_parsing(true),
            );
        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domains.is_empty() {
            return Err(ConfigError::Message("domains must not be empty".into()));
        }
        if self.key.is_empty() {
            return Err(ConfigError::Message(
                "key (control channel HMAC key) must not be empty".into(),
            ));
        }
        if self.configuration_port == 0 {
            return Err(ConfigError::Message(
                "configuration_port must not be 0".into(),
            ));
        }
        if self.frontend_port == 0 {
            return Err(ConfigError::Message("frontend_port must not be 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_domains() {
        let config = ProxyConfig {
            configuration_port: 9443,
            key: "k".into(),
            domains: vec![],
            key_seed: "seed".into(),
            dns_key: "dns".into(),
            dns_server: "1.1.1.1".into(),
            frontend_port: 443,
            http_port: 80,
            handshake_timeout_secs: 10,
            blob_store_path: None,
            log_level: "info".into(),
            log_json: false,
            self_signed: true,
        };
        assert!(config.validate().is_err());
    }
}
