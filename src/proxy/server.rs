//! The local forward-proxy server that clients connect to.
//!
//! Speaks HTTP/1.1 and supports:
//!   - CONNECT tunnelling (HTTPS and any raw TCP tunnel)
//!   - Plain HTTP forwarding for http:// targets
//!   - Optional Proxy-Authorization basic auth
//!   - Drain-on-rotate: a connection keeps the upstream it captured at
//!     selection time; new connections always pick the fresh current.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{Result, RotorError};
use crate::proxy::auth::ProxyAuth;
use crate::proxy::transport::ProxyTransport;
use crate::proxy::tunnel::{copy_bidirectional, ConnGuard};
use crate::rotator::Rotator;

/// Largest request head the server will buffer.
const MAX_REQUEST_HEAD: usize = 32 * 1024;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Proxy auth credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Proxy server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind on, e.g. "0.0.0.0:8080".
    pub listen_addr: String,
    /// Credentials for Proxy-Authorization. None disables auth.
    pub credentials: Option<Credentials>,
    /// Maximum time to dial through an upstream proxy.
    pub dial_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            credentials: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// The local proxy server.
pub struct ProxyServer {
    listener: TcpListener,
    rotator: Arc<Rotator>,
    auth: ProxyAuth,
    dial_timeout: Duration,
}

impl ProxyServer {
    /// Bind the listener. Call `run` to start accepting connections.
    pub async fn bind(cfg: ServerConfig, rotator: Arc<Rotator>) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.listen_addr)
            .await
            .map_err(|e| RotorError::InvalidConfig(format!("listen {}: {}", cfg.listen_addr, e)))?;

        let auth = match cfg.credentials {
            Some(creds) => ProxyAuth::new(creds.username, creds.password),
            None => ProxyAuth::disabled(),
        };

        let dial_timeout = if cfg.dial_timeout.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            cfg.dial_timeout
        };

        Ok(Self {
            listener,
            rotator,
            auth,
            dial_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until the shutdown signal flips.
    /// In-flight tunnels are not forcibly terminated.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("proxy server listening on {}", self.listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            let rotator = self.rotator.clone();
                            let auth = self.auth.clone();
                            let dial_timeout = self.dial_timeout;
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_conn(stream, rotator, auth, dial_timeout).await
                                {
                                    debug!(client = %client_addr, "connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Parsed HTTP/1.1 request head.
struct RequestHead {
    method: String,
    target: String,
    version: u8,
    headers: Vec<(String, Vec<u8>)>,
    /// Bytes the head occupies in the read buffer; anything beyond it is
    /// body that was read ahead.
    head_len: usize,
}

impl RequestHead {
    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    rotator: Arc<Rotator>,
    auth: ProxyAuth,
    dial_timeout: Duration,
) -> Result<()> {
    let (buf, head) = match read_request_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(RotorError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            // Client connected and went away; nothing to log loudly.
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    // Auth gate before anything else.
    if !auth.validate(head.header_str("proxy-authorization")) {
        stream
            .write_all(ProxyAuth::challenge_response().as_bytes())
            .await?;
        return Ok(());
    }

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, head, rotator, dial_timeout).await
    } else {
        handle_http(stream, buf, head, rotator, dial_timeout).await
    }
}

/// CONNECT path: establish a raw tunnel through the upstream proxy.
async fn handle_connect(
    mut stream: TcpStream,
    head: RequestHead,
    rotator: Arc<Rotator>,
    dial_timeout: Duration,
) -> Result<()> {
    let mut destination = head.target.clone();
    if !has_port(&destination) {
        destination.push_str(":443");
    }

    let Some(upstream) = rotator.select_for(&destination) else {
        warn!(%destination, "no available upstream proxy");
        write_error(&mut stream, 502, "Bad Gateway").await;
        return Ok(());
    };

    // The connection owns this upstream for its whole life; rotations
    // only redirect connections selected after them.
    let guard = ConnGuard::new(upstream);

    let upstream_conn =
        match ProxyTransport::dial(guard.upstream(), &destination, dial_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                rotator.record_conn_error();
                warn!(
                    upstream = %guard.upstream(),
                    %destination,
                    "CONNECT upstream dial failed: {}", e
                );
                write_error(&mut stream, 502, "Bad Gateway").await;
                return Ok(());
            }
        };

    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;

    rotator.record_request();
    copy_bidirectional(stream, upstream_conn).await;
    Ok(())
}

/// Plain HTTP path: tunnel to the destination through the upstream, write
/// the scrubbed request head, then relay bytes both ways like CONNECT.
async fn handle_http(
    mut stream: TcpStream,
    buf: BytesMut,
    head: RequestHead,
    rotator: Arc<Rotator>,
    dial_timeout: Duration,
) -> Result<()> {
    let Some(destination) = http_destination(&head) else {
        write_error(&mut stream, 400, "Bad Request").await;
        return Ok(());
    };

    let Some(upstream) = rotator.select_for(&destination) else {
        warn!(%destination, "no available upstream proxy");
        write_error(&mut stream, 502, "Bad Gateway").await;
        return Ok(());
    };

    let guard = ConnGuard::new(upstream);

    let mut upstream_conn =
        match ProxyTransport::dial(guard.upstream(), &destination, dial_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                rotator.record_conn_error();
                warn!(
                    upstream = %guard.upstream(),
                    %destination,
                    "HTTP upstream dial failed: {}", e
                );
                write_error(&mut stream, 502, "Bad Gateway").await;
                return Ok(());
            }
        };

    let serialized = serialize_head(&head);
    if let Err(e) = upstream_conn.write_all(&serialized).await {
        rotator.record_conn_error();
        warn!("write HTTP request to upstream: {}", e);
        return Ok(());
    }
    // Body bytes that arrived with the head.
    if buf.len() > head.head_len {
        upstream_conn.write_all(&buf[head.head_len..]).await?;
    }

    rotator.record_request();
    copy_bidirectional(stream, upstream_conn).await;
    Ok(())
}

/// Read from the client until a full request head is buffered, then parse
/// it.
async fn read_request_head(stream: &mut TcpStream) -> Result<(BytesMut, RequestHead)> {
    let mut buf = BytesMut::with_capacity(4096);
    let head_len = loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break end + 4;
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(RotorError::InvalidRequest(
                "request head too large".to_string(),
            ));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(RotorError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client closed before sending a full request head",
            )));
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&buf[..head_len]) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(RotorError::InvalidRequest(
                "incomplete request head".to_string(),
            ));
        }
        Err(e) => {
            return Err(RotorError::InvalidRequest(format!(
                "malformed request: {}",
                e
            )));
        }
    }

    let method = req
        .method
        .ok_or_else(|| RotorError::InvalidRequest("missing method".to_string()))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| RotorError::InvalidRequest("missing request target".to_string()))?
        .to_string();
    let version = req.version.unwrap_or(1);
    let parsed_headers = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect();

    Ok((
        buf,
        RequestHead {
            method,
            target,
            version,
            headers: parsed_headers,
            head_len,
        },
    ))
}

/// Destination for a plain-HTTP request: the absolute-form target's host,
/// falling back to the Host header, defaulting the port to 80.
fn http_destination(head: &RequestHead) -> Option<String> {
    let from_target = if head.target.starts_with("http://") || head.target.starts_with("https://")
    {
        Url::parse(&head.target).ok().and_then(|url| {
            let host = url.host_str()?.to_string();
            Some(match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            })
        })
    } else {
        None
    };

    let mut destination = from_target.or_else(|| head.header_str("host").map(str::to_string))?;
    if !has_port(&destination) {
        destination.push_str(":80");
    }
    Some(destination)
}

/// Re-serialize the request head for the origin, dropping the
/// proxy-specific headers. The absolute-form target the client sent is
/// rewritten to origin-form since the tunnel already ends at the origin.
fn serialize_head(head: &RequestHead) -> Vec<u8> {
    let target = origin_form(&head.target);
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!("{} {} HTTP/1.{}\r\n", head.method, target, head.version).as_bytes(),
    );
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("proxy-authorization")
            || name.eq_ignore_ascii_case("proxy-connection")
        {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Origin-form request target (`/path?query`) for an absolute-form one;
/// anything else passes through unchanged.
fn origin_form(target: &str) -> String {
    if !target.starts_with("http://") && !target.starts_with("https://") {
        return target.to_string();
    }
    let Ok(url) = Url::parse(target) else {
        return target.to_string();
    };
    let mut out = url.path().to_string();
    if out.is_empty() {
        out.push('/');
    }
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Whether `host` ends in a `:port` suffix. A bare IPv6 literal has
/// colons but no port; its last segment only counts as a port when the
/// rest of the string is not itself colon-separated (or is bracketed).
fn has_port(host: &str) -> bool {
    match host.rfind(':') {
        None => false,
        Some(idx) => {
            let (head, port) = (&host[..idx], &host[idx + 1..]);
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                return false;
            }
            !head.contains(':') || head.ends_with(']')
        }
    }
}

async fn write_error(stream: &mut TcpStream, code: u16, reason: &str) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        code, reason
    );
    let _ = stream.write_all(response.as_bytes()).await;
}
