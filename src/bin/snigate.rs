//! snigate: an SNI-dispatched, TLS-terminating reverse proxy with
//! self-managed certificates and a live-reconfigurable routing table.

use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use snigate::blob_store::{BlobStore, FileDevice};
use snigate::cert::{CertificateManager, SelfSignedIssuer};
use snigate::codec::{self, SniMap};
use snigate::config::ProxyConfig;
use snigate::control::ControlChannel;
use snigate::proxy::{serve_redirect, serve_tls, SniProxyConfig};
use snigate::state_dir::StateDir;
use snigate::tracing_init::{init_tracing, InstrumentationConfig};
use snigate::ProxyError;

#[derive(Parser, Debug)]
#[command(author, version, about = "SNI-dispatched TLS-terminating reverse proxy")]
struct Cli {
    /// Configuration file path.
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Force-initialize the Blob Store even if it already holds data.
    #[arg(long)]
    init_blob_store: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if let Some(path) = &cli.config {
        ProxyConfig::load_from_file(path).context("failed to load configuration file")?
    } else {
        ProxyConfig::load().context("failed to load configuration")?
    };
    config.validate().context("invalid configuration")?;

    init_tracing(&InstrumentationConfig {
        log_level: config.log_level.clone(),
        json: config.log_json,
    })?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default rustls crypto provider"))?;

    info!("starting snigate for domains {:?}", config.domains);

    let state_dir = StateDir::new();
    state_dir.create_directories().await?;

    let blob_store_path = config
        .blob_store_path
        .clone()
        .unwrap_or_else(|| state_dir.blob_store_path());
    if let Some(parent) = blob_store_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let device = FileDevice::open(&blob_store_path)
        .await
        .context("failed to open blob store device")?;
    let mut blob_store = BlobStore::new(device);

    let (superblock, sni_map) = if cli.init_blob_store {
        let sb = blob_store.init().await.context("failed to init blob store")?;
        (sb, SniMap::new())
    } else {
        match blob_store.read_data().await {
            Ok((sb, payload)) => {
                let map = codec::decode_data(&payload).context("failed to decode SNI map")?;
                (sb, map)
            }
            Err(ProxyError::BadChecksum) => {
                info!("blob store uninitialized, initializing");
                let sb = blob_store.init().await.context("failed to init blob store")?;
                (sb, SniMap::new())
            }
            Err(e) => return Err(e).context("failed to read blob store"),
        }
    };
    info!(
        super_counter = superblock.super_counter,
        entries = sni_map.len(),
        "SNI map loaded"
    );

    let sni_map = Arc::new(ArcSwap::from_pointee(sni_map));

    let control_listener = TcpListener::bind(("0.0.0.0", config.configuration_port))
        .await
        .context("failed to bind control listener")?;
    let mut control_channel = ControlChannel::new(
        control_listener,
        blob_store,
        superblock,
        sni_map.clone(),
        config.key.clone().into_bytes(),
    );
    let control_handle = tokio::spawn(async move {
        control_channel.run().await;
    });

    let issuer: Arc<dyn snigate::cert::CertificateIssuer> = if config.self_signed {
        Arc::new(SelfSignedIssuer)
    } else {
        // The DNS-based issuance protocol itself is an external black box
        // (SPEC_FULL.md §1); this build only ships the self-signed
        // fallback issuer. See DESIGN.md.
        return Err(anyhow::anyhow!(
            "real DNS-01 issuance is not wired into this build; set self_signed = true"
        ));
    };

    // Placeholder TLS configuration until the first renewal completes, so
    // the listener can bind immediately; the Certificate Manager installs
    // the real configuration before any connection is accepted.
    let bootstrap_issuer = SelfSignedIssuer;
    let bootstrap_request = snigate::cert::IssuanceRequest::for_domain(
        config.domains.first().context("no domains configured")?,
        &config.key_seed,
        &config.dns_server,
        &config.dns_key,
    );
    let bootstrap_cert = {
        use snigate::cert::CertificateIssuer;
        bootstrap_issuer
            .issue(&bootstrap_request)
            .await
            .context("failed to bootstrap placeholder certificate")?
    };
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&bootstrap_cert.key)
        .context("unsupported placeholder private key")?;
    let certified_key = Arc::new(rustls::sign::CertifiedKey::new(
        bootstrap_cert.chain,
        signing_key,
    ));
    let bootstrap_chain = snigate::cert::CertificateChain {
        domain: bootstrap_request.hostname.clone(),
        certified_key,
        not_after: bootstrap_cert.not_after,
    };
    let initial_tls_config = snigate::cert::build_tls_config(&[bootstrap_chain])
        .context("failed to build bootstrap TLS configuration")?;
    let tls_config = Arc::new(ArcSwap::from(initial_tls_config));

    let cert_manager = CertificateManager::new(
        config.domains.clone(),
        config.key_seed.clone(),
        config.dns_server.clone(),
        config.dns_key.clone(),
        issuer,
        tls_config.clone(),
    );
    let cert_handle = tokio::spawn(async move {
        if let Err(e) = cert_manager.run().await {
            error!("certificate manager exited fatally: {e}");
        }
    });

    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .context("failed to bind HTTP redirect listener")?;
    let redirect_handle = tokio::spawn(serve_redirect(http_listener));

    let tls_listener = TcpListener::bind(("0.0.0.0", config.frontend_port))
        .await
        .context("failed to bind TLS listener")?;
    let sni_proxy_config = SniProxyConfig {
        handshake_timeout: std::time::Duration::from_secs(config.handshake_timeout_secs),
    };
    let tls_handle = tokio::spawn(serve_tls(
        tls_listener,
        tls_config,
        sni_map,
        sni_proxy_config,
    ));

    info!("snigate running: control={}, http={}, tls={}",
        config.configuration_port, config.http_port, config.frontend_port);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    control_handle.abort();
    cert_handle.abort();
    redirect_handle.abort();
    tls_handle.abort();

    Ok(())
}
