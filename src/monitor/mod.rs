//! Background health checks and latency measurement
//!
//! Probes every pool member through its own tunnel on an interval. With
//! liveness updating enabled, dead upstreams drop out of the alive
//! snapshot and recovered ones come back automatically; without it only
//! latency is refreshed, which keeps latency-sort meaningful while never
//! evicting anyone.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, RotorError};
use crate::models::Upstream;
use crate::pool::Pool;
use crate::proxy::transport::ProxyTransport;

const DEFAULT_CHECK_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONCURRENCY: usize = 10;

/// Monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between full-pool health passes.
    pub interval: Duration,
    /// Pass interval when running latency-only (liveness updates off).
    /// Zero means "same as `interval`".
    pub latency_interval: Duration,
    /// URL probed through each upstream.
    pub check_url: String,
    /// Timeout per individual probe.
    pub timeout: Duration,
    /// How many upstreams are probed in parallel.
    pub concurrency: usize,
    /// Whether probe outcomes flip the alive flag. When false the
    /// monitor still measures latency.
    pub update_liveness: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            latency_interval: Duration::ZERO,
            check_url: DEFAULT_CHECK_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
            update_liveness: false,
        }
    }
}

/// Orchestrates background probes over the pool.
pub struct Monitor {
    pool: Arc<Pool>,
    cfg: MonitorConfig,
}

impl Monitor {
    pub fn new(pool: Arc<Pool>, mut cfg: MonitorConfig) -> Self {
        if cfg.check_url.is_empty() {
            cfg.check_url = DEFAULT_CHECK_URL.to_string();
        }
        if cfg.timeout.is_zero() {
            cfg.timeout = DEFAULT_TIMEOUT;
        }
        if cfg.concurrency == 0 {
            cfg.concurrency = DEFAULT_CONCURRENCY;
        }
        if cfg.latency_interval.is_zero() {
            cfg.latency_interval = cfg.interval;
        }
        Self { pool, cfg }
    }

    /// Launch the background ticker loop.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> MonitorHandle {
        let monitor = self.clone();
        let task = tokio::spawn(async move {
            monitor.run(shutdown).await;
        });
        MonitorHandle { task }
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = if self.cfg.update_liveness {
            self.cfg.interval
        } else {
            self.cfg.latency_interval
        };
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One health-check pass over the whole pool, bounded to
    /// `concurrency` probes in flight.
    pub async fn run_once(&self) {
        debug!("health check pass started");
        let upstreams = self.pool.all();

        let results = futures::stream::iter(upstreams)
            .map(|up| async move { self.check(&up).await })
            .buffer_unordered(self.cfg.concurrency)
            .collect::<Vec<bool>>()
            .await;

        let healthy = results.iter().filter(|&&ok| ok).count();
        info!(
            healthy,
            total = results.len(),
            alive = self.pool.alive_len(),
            "health check pass complete"
        );
    }

    /// Probe one upstream and update its alive/latency fields.
    async fn check(&self, upstream: &Upstream) -> bool {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.cfg.timeout, self.probe(upstream)).await;
        let latency = started.elapsed();

        let result = match outcome {
            Ok(inner) => inner,
            Err(_) => Err(RotorError::Dial("probe timed out".to_string())),
        };

        match result {
            Err(e) => {
                if self.cfg.update_liveness {
                    if upstream.is_alive() {
                        warn!(upstream = %upstream, "upstream DEAD: {}", e);
                    }
                    upstream.set_alive(false);
                }
                upstream.set_latency(Duration::ZERO);
                false
            }
            Ok(()) => {
                if self.cfg.update_liveness && !upstream.is_alive() {
                    info!(upstream = %upstream, latency_ms = latency.as_millis() as u64, "upstream RECOVERED");
                }
                if self.cfg.update_liveness {
                    upstream.set_alive(true);
                }
                upstream.set_latency(latency);
                true
            }
        }
    }

    /// Dial through the upstream and issue a minimal GET; any response of
    /// at least a status line's worth of bytes counts as healthy.
    async fn probe(&self, upstream: &Upstream) -> Result<()> {
        let check_url = url::Url::parse(&self.cfg.check_url)
            .map_err(|e| RotorError::InvalidConfig(format!("bad check URL: {}", e)))?;
        let host = check_url
            .host_str()
            .ok_or_else(|| RotorError::InvalidConfig("check URL has no host".to_string()))?;
        let port = check_url.port_or_known_default().unwrap_or(80);
        let destination = format!("{}:{}", host, port);

        let mut conn = ProxyTransport::dial(upstream, &destination, self.cfg.timeout).await?;

        let mut request_uri = check_url.path().to_string();
        if request_uri.is_empty() {
            request_uri.push('/');
        }
        if let Some(query) = check_url.query() {
            request_uri.push('?');
            request_uri.push_str(query);
        }

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            request_uri, host
        );
        conn.write_all(request.as_bytes())
            .await
            .map_err(|e| RotorError::Dial(format!("write probe request: {}", e)))?;

        // Just enough to cover "HTTP/1.1 xxx".
        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).await.unwrap_or(0);
        if n < 9 {
            return Err(RotorError::Dial(format!("short probe response ({} bytes)", n)));
        }
        Ok(())
    }
}

/// Handle for the monitor's background task.
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Wait for the loop to observe the shutdown signal and exit.
    pub async fn stopped(self) {
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Fake upstream proxy that also plays origin: answers CONNECT with
    /// 200, then answers the probe GET with 204.
    async fn spawn_probe_target() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 512];
                    loop {
                        let n = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    assert!(buf.starts_with(b"CONNECT "));
                    socket
                        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await
                        .unwrap();

                    buf.clear();
                    loop {
                        let n = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let head = String::from_utf8_lossy(&buf);
                    assert!(head.starts_with("GET /generate_204 HTTP/1.1\r\n"));
                    assert!(head.contains("Host: check.invalid\r\n"));
                    socket
                        .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                        .await
                        .unwrap();
                });
            }
        });
        addr
    }

    fn pool_for(addr: std::net::SocketAddr) -> Arc<Pool> {
        let pool = Pool::new(false);
        let line = format!("http://{}", addr);
        pool.load([line.as_str()]).unwrap();
        Arc::new(pool)
    }

    fn monitor_config(update_liveness: bool) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(30),
            latency_interval: Duration::ZERO,
            check_url: "http://check.invalid/generate_204".to_string(),
            timeout: Duration::from_secs(5),
            concurrency: 4,
            update_liveness,
        }
    }

    #[test]
    fn test_config_defaults_filled() {
        let pool = Arc::new(Pool::new(false));
        let monitor = Monitor::new(
            pool,
            MonitorConfig {
                interval: Duration::from_secs(7),
                latency_interval: Duration::ZERO,
                check_url: String::new(),
                timeout: Duration::ZERO,
                concurrency: 0,
                update_liveness: true,
            },
        );
        assert_eq!(monitor.cfg.check_url, DEFAULT_CHECK_URL);
        assert_eq!(monitor.cfg.timeout, DEFAULT_TIMEOUT);
        assert_eq!(monitor.cfg.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(monitor.cfg.latency_interval, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_probe_success_updates_latency() {
        let addr = spawn_probe_target().await;
        let pool = pool_for(addr);
        let monitor = Monitor::new(pool.clone(), monitor_config(true));

        monitor.run_once().await;

        let up = &pool.all()[0];
        assert!(up.is_alive());
        assert!(!up.latency().is_zero());
    }

    #[tokio::test]
    async fn test_probe_failure_marks_dead_when_updating_liveness() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool_for(dead_addr);
        pool.set_latency(1, Duration::from_millis(42));
        let monitor = Monitor::new(pool.clone(), monitor_config(true));

        monitor.run_once().await;

        let up = &pool.all()[0];
        assert!(!up.is_alive());
        assert!(up.latency().is_zero());
    }

    #[tokio::test]
    async fn test_probe_failure_latency_only_mode() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool_for(dead_addr);
        pool.set_latency(1, Duration::from_millis(42));
        let monitor = Monitor::new(pool.clone(), monitor_config(false));

        monitor.run_once().await;

        // Liveness untouched, latency still zeroed.
        let up = &pool.all()[0];
        assert!(up.is_alive());
        assert!(up.latency().is_zero());
    }

    #[tokio::test]
    async fn test_recovery_flips_alive_back() {
        let addr = spawn_probe_target().await;
        let pool = pool_for(addr);
        pool.set_alive(1, false);
        let monitor = Monitor::new(pool.clone(), monitor_config(true));

        monitor.run_once().await;

        assert!(pool.all()[0].is_alive());
    }
}
