//! The TLS-terminating public listener: handshake, SNI dispatch, backend
//! dial, bidirectional pump (SPEC_FULL.md §4.4).

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::codec::{Backend, SniMap};
use crate::proxy::pump::bidirectional_pump;

const DEFAULT_KEY: &str = "default";

/// Tunables for the TLS listener; `handshake_timeout` resolves the open
/// question in SPEC_FULL.md §4.4/§9 (no timeout existed upstream).
#[derive(Debug, Clone)]
pub struct SniProxyConfig {
    pub handshake_timeout: Duration,
}

impl Default for SniProxyConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

pub async fn serve_tls(
    listener: TcpListener,
    tls_config: Arc<ArcSwap<ServerConfig>>,
    sni_map: Arc<ArcSwap<SniMap>>,
    config: SniProxyConfig,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("tls listener accept failed: {e}");
                continue;
            }
        };

        let acceptor = TlsAcceptor::from(tls_config.load_full());
        let sni_map = sni_map.clone();
        let handshake_timeout = config.handshake_timeout;

        tokio::spawn(async move {
            handle_connection(stream, addr, acceptor, sni_map, handshake_timeout).await;
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: std::net::SocketAddr,
    acceptor: TlsAcceptor,
    sni_map: Arc<ArcSwap<SniMap>>,
    handshake_timeout: Duration,
) {
    let tls_stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("TLS handshake with {addr} failed: {e}");
            return;
        }
        Err(_) => {
            debug!("TLS handshake with {addr} timed out");
            return;
        }
    };

    let own_name = tls_stream
        .get_ref()
        .1
        .server_name()
        .map(|name| name.to_string());

    let map = sni_map.load();
    let backend = resolve_backend(&map, own_name.as_deref());

    let backend = match backend {
        Some(backend) => backend,
        None => {
            debug!("no backend for connection from {addr} (sni={own_name:?}); closing");
            return;
        }
    };

    let backend_stream = match TcpStream::connect((backend.host, backend.port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("backend dial to {}:{} failed: {e}", backend.host, backend.port);
            return;
        }
    };

    info!(
        "proxying {addr} (sni={own_name:?}) -> {}:{}",
        backend.host, backend.port
    );
    bidirectional_pump(tls_stream, backend_stream).await;
}

/// SPEC_FULL.md §4.4 dispatch: SNI present and known -> its backend; SNI
/// absent or unknown -> `"default"`; nothing resolves -> `None`. The
/// negotiated name is lowercased before lookup to match the map's
/// case-insensitive keys (SPEC_FULL.md §3).
fn resolve_backend(map: &SniMap, own_name: Option<&str>) -> Option<Backend> {
    if let Some(name) = own_name {
        if let Some(backend) = map.get(&name.to_ascii_lowercase()) {
            return Some(backend.clone());
        }
    }
    map.get(DEFAULT_KEY).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(ip: &str, port: u16) -> Backend {
        Backend {
            host: ip.parse().unwrap(),
            port,
        }
    }

    #[test]
    fn known_sni_resolves_directly() {
        let mut map = SniMap::new();
        map.insert("a.example".to_string(), backend("10.0.0.1", 4443));
        assert_eq!(
            resolve_backend(&map, Some("a.example")),
            Some(backend("10.0.0.1", 4443))
        );
    }

    #[test]
    fn absent_sni_falls_back_to_default() {
        let mut map = SniMap::new();
        map.insert(DEFAULT_KEY.to_string(), backend("10.0.0.9", 4443));
        assert_eq!(resolve_backend(&map, None), Some(backend("10.0.0.9", 4443)));
    }

    #[test]
    fn unknown_sni_falls_back_to_default() {
        let mut map = SniMap::new();
        map.insert(DEFAULT_KEY.to_string(), backend("10.0.0.9", 4443));
        assert_eq!(
            resolve_backend(&map, Some("x.example")),
            Some(backend("10.0.0.9", 4443))
        );
    }

    #[test]
    fn unknown_sni_without_default_resolves_to_none() {
        let map = SniMap::new();
        assert_eq!(resolve_backend(&map, Some("x.example")), None);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut map = SniMap::new();
        map.insert("a.example".to_string(), backend("10.0.0.1", 4443));
        assert_eq!(
            resolve_backend(&map, Some("A.Example")),
            Some(backend("10.0.0.1", 4443))
        );
    }
}
