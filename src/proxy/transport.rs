//! Upstream transport layer for HTTP CONNECT and SOCKS5 proxies
//!
//! Establishes raw bidirectional byte streams to a destination through one
//! upstream proxy.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{Result, RotorError};
use crate::models::{Upstream, UpstreamScheme};

/// Upper bound on a CONNECT response head.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Upstream transport handler
///
/// Dispatches on the upstream's scheme; the scheme set is closed.
pub struct ProxyTransport;

impl ProxyTransport {
    /// Open a tunnel to `destination` ("host:port") through the upstream.
    ///
    /// The timeout bounds the TCP dial and the protocol handshake
    /// together. Every failure mode surfaces as a dial error; callers
    /// count them uniformly.
    #[instrument(skip(upstream), fields(upstream_id = upstream.id, destination))]
    pub async fn dial(
        upstream: &Upstream,
        destination: &str,
        timeout: Duration,
    ) -> Result<UpstreamStream> {
        tokio::time::timeout(timeout, Self::establish(upstream, destination))
            .await
            .map_err(|_| {
                RotorError::Dial(format!(
                    "dial {} through {} timed out",
                    destination, upstream
                ))
            })?
    }

    async fn establish(upstream: &Upstream, destination: &str) -> Result<UpstreamStream> {
        match upstream.scheme {
            UpstreamScheme::Http | UpstreamScheme::Https => {
                Self::connect_http(upstream, destination).await
            }
            UpstreamScheme::Socks5 => Self::connect_socks5(upstream, destination).await,
        }
    }

    /// Establish a tunnel via HTTP CONNECT.
    async fn connect_http(upstream: &Upstream, destination: &str) -> Result<UpstreamStream> {
        debug!("connecting to HTTP proxy at {}", upstream.addr);

        let mut stream = TcpStream::connect(&upstream.addr)
            .await
            .map_err(|e| RotorError::Dial(format!("tcp connect {}: {}", upstream.addr, e)))?;

        let request = Self::build_connect_request(upstream, destination);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| RotorError::Dial(format!("send CONNECT: {}", e)))?;

        let leftover = Self::read_connect_response(&mut stream).await?;

        debug!("HTTP CONNECT tunnel established to {}", destination);
        Ok(UpstreamStream::new(stream, leftover))
    }

    /// Build the HTTP CONNECT request head
    fn build_connect_request(upstream: &Upstream, destination: &str) -> String {
        let mut request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
            destination, destination
        );

        if let Some(username) = &upstream.username {
            let password = upstream.password.as_deref().unwrap_or("");
            let credentials = format!("{}:{}", username, password);
            let encoded = BASE64.encode(credentials.as_bytes());
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
        }

        request.push_str("\r\n");
        request
    }

    /// Read the CONNECT response head and return any bytes the proxy sent
    /// beyond it. Succeeds only on a 200 status.
    async fn read_connect_response(stream: &mut TcpStream) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(256);
        let head_end = loop {
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
            if buf.len() > MAX_CONNECT_RESPONSE {
                return Err(RotorError::Dial(
                    "CONNECT response head too large".to_string(),
                ));
            }
            let mut chunk = [0u8; 512];
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| RotorError::Dial(format!("read CONNECT response: {}", e)))?;
            if n == 0 {
                return Err(RotorError::Dial(
                    "connection closed during CONNECT response".to_string(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..head_end]);
        let status_line = head.lines().next().unwrap_or("");
        if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
            return Err(RotorError::UpstreamRefused(status_line.to_string()));
        }

        // Rare but legal: bytes past the response head were already
        // buffered; they must be replayed on first read.
        Ok(Bytes::copy_from_slice(&buf[head_end..]))
    }

    /// Establish a tunnel via SOCKS5 (RFC 1928), with username/password
    /// sub-negotiation (RFC 1929) when credentials are present.
    async fn connect_socks5(upstream: &Upstream, destination: &str) -> Result<UpstreamStream> {
        debug!("connecting to SOCKS5 proxy at {}", upstream.addr);

        let stream = if let Some(username) = &upstream.username {
            let password = upstream.password.as_deref().unwrap_or("");
            Socks5Stream::connect_with_password(
                upstream.addr.as_str(),
                destination,
                username,
                password,
            )
            .await?
        } else {
            Socks5Stream::connect(upstream.addr.as_str(), destination).await?
        };

        debug!("SOCKS5 tunnel established to {}", destination);
        Ok(UpstreamStream::new(stream.into_inner(), Bytes::new()))
    }
}

/// Position one past the `\r\n\r\n` header terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// A tunnel to the destination through an upstream proxy.
///
/// Replays bytes that were read past the CONNECT response head before
/// handing reads to the underlying socket.
#[derive(Debug)]
pub struct UpstreamStream {
    head: Bytes,
    io: TcpStream,
}

impl UpstreamStream {
    fn new(io: TcpStream, head: Bytes) -> Self {
        Self { head, io }
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.head.is_empty() {
            let n = self.head.len().min(buf.remaining());
            buf.put_slice(&self.head.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
