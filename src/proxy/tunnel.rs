//! Bidirectional tunnel plumbing
//!
//! Pumps bytes between the client and the upstream tunnel and accounts for
//! in-flight connections so rotations can drain instead of kill.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::models::Upstream;

/// Copy data bidirectionally between two streams until either side hits
/// EOF. Each finished direction half-closes the opposite peer's write
/// side to unblock the other copy.
pub async fn copy_bidirectional<C, S>(client: C, server: S) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let client_to_server = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (client_to_server_result, server_to_client_result) =
        tokio::join!(client_to_server, server_to_client);

    let bytes_sent = client_to_server_result.unwrap_or_else(|e| {
        debug!("client to server copy ended: {}", e);
        0
    });

    let bytes_received = server_to_client_result.unwrap_or_else(|e| {
        debug!("server to client copy ended: {}", e);
        0
    });

    debug!(bytes_sent, bytes_received, "tunnel closed");

    (bytes_sent, bytes_received)
}

/// Drain accounting for one client connection.
///
/// Holds the upstream captured at selection time; a rotation never
/// redirects the connection, it only sees the count while this guard
/// lives. The decrement runs on every exit path, panics included.
pub struct ConnGuard {
    upstream: Arc<Upstream>,
}

impl ConnGuard {
    pub fn new(upstream: Arc<Upstream>) -> Self {
        upstream.active_conns.fetch_add(1, Ordering::SeqCst);
        Self { upstream }
    }

    /// The upstream this connection captured.
    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.upstream.active_conns.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UpstreamScheme;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_copy_bidirectional_half_close() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut server_peer, server) = tokio::io::duplex(1024);

        let copy_handle = tokio::spawn(async move { copy_bidirectional(client, server).await });

        client_peer.write_all(b"hello from client").await.unwrap();
        client_peer.shutdown().await.unwrap();

        server_peer.write_all(b"hello from server").await.unwrap();
        server_peer.shutdown().await.unwrap();

        let mut buf = vec![0u8; 100];
        let n = server_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from client");

        let mut buf = vec![0u8; 100];
        let n = client_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello from server");

        // Both directions saw EOF; the pump must terminate.
        let (sent, received) = tokio::time::timeout(Duration::from_secs(1), copy_handle)
            .await
            .expect("copy_bidirectional timed out")
            .unwrap();
        assert_eq!(sent, 17);
        assert_eq!(received, 17);
    }

    #[tokio::test]
    async fn test_conn_guard_counts() {
        let up = Arc::new(Upstream::new(
            1,
            UpstreamScheme::Http,
            "1.2.3.4:8080".to_string(),
            None,
            None,
        ));

        assert_eq!(up.active_conns.load(Ordering::SeqCst), 0);
        {
            let _a = ConnGuard::new(up.clone());
            let _b = ConnGuard::new(up.clone());
            assert_eq!(up.active_conns.load(Ordering::SeqCst), 2);
        }
        assert_eq!(up.active_conns.load(Ordering::SeqCst), 0);
    }
}
