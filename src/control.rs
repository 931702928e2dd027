//! The private control listener: one HMAC-authenticated request per
//! connection, serialized against the Blob Store by never handling more
//! than one connection at a time.

use std::sync::Arc;

use arc_swap::ArcSwap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::blob_store::{BlobDevice, BlobStore, Superblock};
use crate::codec::{self, Command, Reply, SniMap};
use crate::error::Result;

type HmacSha256 = Hmac<Sha256>;

const HMAC_LEN: usize = 32;
const MAX_REQUEST_LEN: u64 = 1 << 20;

/// Runs the control channel's accept loop against an owned Blob Store and
/// a shared handle to the live SNI map. Connections are handled strictly
/// one at a time, which is what gives the Control-Channel-serialization
/// invariant (§4.3) for free.
pub struct ControlChannel<D: BlobDevice> {
    listener: TcpListener,
    blob_store: BlobStore<D>,
    superblock: Superblock,
    sni_map: Arc<ArcSwap<SniMap>>,
    hmac_key: Vec<u8>,
}

impl<D: BlobDevice> ControlChannel<D> {
    pub fn new(
        listener: TcpListener,
        blob_store: BlobStore<D>,
        superblock: Superblock,
        sni_map: Arc<ArcSwap<SniMap>>,
        hmac_key: Vec<u8>,
    ) -> Self {
        Self {
            listener,
            blob_store,
            superblock,
            sni_map,
            hmac_key,
        }
    }

    pub async fn run(&mut self) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("control channel accept failed: {e}");
                    continue;
                }
            };
            debug!("control channel connection from {addr}");
            if let Err(e) = self.handle_connection(stream).await {
                warn!("control channel request from {addr} failed: {e}");
            }
        }
    }

    async fn handle_connection(&mut self, mut stream: TcpStream) -> Result<()> {
        let payload = match read_framed(&mut stream).await? {
            Some(payload) => payload,
            None => return Ok(()), // truncated: close with no reply
        };

        let reply = self.authenticate_and_dispatch(&payload).await;
        let reply_bytes = codec::reply_to_bytes(&reply);
        write_framed(&mut stream, &reply_bytes).await?;
        Ok(())
    }

    async fn authenticate_and_dispatch(&mut self, payload: &[u8]) -> Reply {
        if payload.len() < HMAC_LEN {
            return Reply::Result {
                code: 3,
                message: "authentication failure".to_string(),
            };
        }
        let (mac_bytes, message) = payload.split_at(HMAC_LEN);

        let mut mac = match HmacSha256::new_from_slice(&self.hmac_key) {
            Ok(mac) => mac,
            Err(_) => {
                return Reply::Result {
                    code: 3,
                    message: "authentication failure".to_string(),
                }
            }
        };
        mac.update(message);
        if mac.verify_slice(mac_bytes).is_err() {
            return Reply::Result {
                code: 3,
                message: "authentication failure".to_string(),
            };
        }

        let command = match codec::cmd_of_bytes(message) {
            Ok(cmd) => cmd,
            Err(e) => {
                return Reply::Result {
                    code: 2,
                    message: e.to_string(),
                }
            }
        };

        self.dispatch(command).await
    }

    async fn dispatch(&mut self, command: Command) -> Reply {
        match command {
            Command::Add { sni, host, port } => {
                let mut map: SniMap = (**self.sni_map.load()).clone();
                map.insert(sni.to_ascii_lowercase(), crate::codec::Backend { host, port });
                self.sni_map.store(Arc::new(map.clone()));

                match self.persist(&map).await {
                    Ok(()) => Reply::Result {
                        code: 0,
                        message: format!("{sni} was successfully added"),
                    },
                    Err(e) => Reply::Result {
                        code: 1,
                        message: format!("error {e} adding {sni}"),
                    },
                }
            }
            Command::Remove { sni } => {
                let mut map: SniMap = (**self.sni_map.load()).clone();
                map.remove(&sni.to_ascii_lowercase());
                self.sni_map.store(Arc::new(map.clone()));

                match self.persist(&map).await {
                    Ok(()) => Reply::Result {
                        code: 0,
                        message: format!("{sni} was successfully removed"),
                    },
                    Err(e) => Reply::Result {
                        code: 1,
                        message: format!("error {e} removing {sni}"),
                    },
                }
            }
            Command::List => {
                let map = self.sni_map.load();
                let entries = map
                    .iter()
                    .map(|(sni, b)| (sni.clone(), b.host, b.port))
                    .collect();
                Reply::Snis(entries)
            }
        }
    }

    /// Flushes `map` through the Blob Store. The in-memory map (already
    /// published via `ArcSwap`) is *not* rolled back on failure — this
    /// preserves the source's documented quirk (SPEC_FULL.md §9) rather
    /// than inventing stronger semantics unasked.
    async fn persist(&mut self, map: &SniMap) -> Result<()> {
        let payload = codec::encode_data(map);
        let new_sb = self.blob_store.write_data(&self.superblock, &payload).await?;
        self.superblock = new_sb;
        info!(
            super_counter = self.superblock.super_counter,
            "SNI map persisted"
        );
        Ok(())
    }
}

/// Reads `uint64_be length || payload`. Returns `Ok(None)` when the
/// connection does not yield exactly `8 + length` bytes.
async fn read_framed(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 8];
    if stream.read_exact(&mut len_bytes).await.is_err() {
        return Ok(None);
    }
    let len = u64::from_be_bytes(len_bytes);
    if len > MAX_REQUEST_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    if stream.read_exact(&mut payload).await.is_err() {
        return Ok(None);
    }
    Ok(Some(payload))
}

async fn write_framed(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    stream.write_all(&(payload.len() as u64).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}
