//! The bidirectional byte pump between a terminated TLS session and its
//! backend TCP connection (SPEC_FULL.md §4.4, Design Notes §9).
//!
//! Two concurrent copy loops race in a `select!`, generalizing the
//! corpus's own `client_to_p2p` / `p2p_to_client` select pattern. Whichever
//! loop ends first wins the race; the loser is dropped (the standard
//! `select!` cancellation), and the two real endpoints are then closed in
//! the documented order — backend TCP first, then the TLS session — so a
//! remote peer still mid-read observes a clean close rather than a reset.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::debug;

/// Copies bytes from `backend` to `tls` and `tls` to `backend` until
/// either direction ends, then tears down both endpoints.
pub async fn bidirectional_pump(tls: TlsStream<TcpStream>, mut backend: TcpStream) {
    let (mut tls_read, mut tls_write) = tokio::io::split(tls);
    let (mut backend_read, mut backend_write) = backend.split();

    let tls_to_backend = copy_loop(&mut tls_read, &mut backend_write);
    let backend_to_tls = copy_loop(&mut backend_read, &mut tls_write);

    tokio::select! {
        bytes = tls_to_backend => debug!(bytes, "tls->backend loop ended"),
        bytes = backend_to_tls => debug!(bytes, "backend->tls loop ended"),
    }

    let _ = backend_write.shutdown().await;
    let _ = tls_write.shutdown().await;
}

/// Reads a chunk, writes it in full to the other side, and repeats. Ends
/// on read EOF/error or write error, returning the number of bytes moved.
async fn copy_loop<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return total,
            Ok(n) => n,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            return total;
        }
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::copy_loop;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn copy_loop_moves_bytes_until_eof() {
        let (mut client, server) = duplex(64);
        let (mut server_read, _server_write) = tokio::io::split(server);

        let handle = tokio::spawn(async move {
            let mut sink = tokio::io::sink();
            copy_loop(&mut server_read, &mut sink).await
        });

        client.write_all(b"hello world").await.unwrap();
        drop(client);

        let total = handle.await.unwrap();
        assert_eq!(total, 11);
    }
}
