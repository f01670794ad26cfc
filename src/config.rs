//! CLI flags and their conversion into typed runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::api::ApiConfig;
use crate::error::{Result, RotorError};
use crate::monitor::MonitorConfig;
use crate::proxy::server::{Credentials, ServerConfig};
use crate::rotator::RotatorConfig;

/// rotor: a rotating forward proxy for HTTP/HTTPS traffic.
///
/// Listens for HTTP CONNECT (and plain HTTP) requests and forwards them
/// through a pool of upstream HTTP, HTTPS, or SOCKS5 proxies. The active
/// upstream is swapped automatically based on configurable triggers;
/// existing connections drain gracefully on the upstream they started on.
#[derive(Debug, Parser)]
#[command(name = "rotor", version, about)]
pub struct Cli {
    /// Path to the proxy list file (one URI per line)
    #[arg(short, long)]
    pub file: PathBuf,

    /// Local proxy listen address (host:port)
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Port for the management API server (loopback only)
    #[arg(long, default_value_t = 9090)]
    pub api_port: u16,

    /// Proxy auth credentials (user:pass). Omit to disable auth.
    #[arg(long)]
    pub auth: Option<String>,

    /// Enable background health monitoring (evict/re-add dead proxies)
    #[arg(long)]
    pub monitor: bool,

    /// Seconds between health check passes
    #[arg(long, default_value_t = 30)]
    pub monitor_interval: u64,

    /// URL used for health checks
    #[arg(
        long,
        default_value = "http://connectivitycheck.gstatic.com/generate_204"
    )]
    pub monitor_url: String,

    /// Rotate the upstream on this schedule, in seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub rotate_interval: u64,

    /// Rotate after this many requests (0 disables)
    #[arg(long, default_value_t = 0)]
    pub rotate_requests: i64,

    /// Rotate after this many connection errors (0 disables)
    #[arg(long, default_value_t = 5)]
    pub rotate_conn_errors: i64,

    /// Rotate after this many bad HTTP status reports via the API (0 disables)
    #[arg(long, default_value_t = 3)]
    pub rotate_http_errors: i64,

    /// Milliseconds within which repeated HTTP error reports for the same
    /// destination count only once
    #[arg(long, default_value_t = 2000)]
    pub dedup_window_ms: u64,

    /// Disable latency-based upstream prioritisation
    #[arg(long)]
    pub no_latency_sort: bool,

    /// Seconds between latency re-measurements when liveness monitoring
    /// is off
    #[arg(long, default_value_t = 30)]
    pub latency_interval: u64,

    /// Timeout in seconds for dialling through an upstream proxy
    #[arg(long, default_value_t = 30)]
    pub dial_timeout: u64,
}

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub file: PathBuf,
    pub latency_sort: bool,
    pub server: ServerConfig,
    pub api: ApiConfig,
    pub monitor: MonitorConfig,
    pub rotator: RotatorConfig,
}

impl Cli {
    /// Validate the flags and build the runtime configuration.
    pub fn into_config(self) -> Result<Config> {
        let credentials = match &self.auth {
            None => None,
            Some(raw) => {
                let (username, password) = raw.split_once(':').ok_or_else(|| {
                    RotorError::InvalidConfig("--auth must be in user:pass format".to_string())
                })?;
                if username.is_empty() || password.is_empty() {
                    return Err(RotorError::InvalidConfig(
                        "--auth must be in user:pass format".to_string(),
                    ));
                }
                Some(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
        };

        Ok(Config {
            file: self.file,
            latency_sort: !self.no_latency_sort,
            server: ServerConfig {
                listen_addr: self.listen,
                credentials,
                dial_timeout: Duration::from_secs(self.dial_timeout),
            },
            api: ApiConfig {
                port: self.api_port,
            },
            monitor: MonitorConfig {
                interval: Duration::from_secs(self.monitor_interval),
                latency_interval: Duration::from_secs(self.latency_interval),
                check_url: self.monitor_url,
                timeout: Duration::from_secs(10),
                concurrency: 10,
                update_liveness: self.monitor,
            },
            rotator: RotatorConfig {
                rotate_interval: Duration::from_secs(self.rotate_interval),
                rotate_requests: self.rotate_requests,
                rotate_conn_errors: self.rotate_conn_errors,
                rotate_http_errors: self.rotate_http_errors,
                dedup_window: Duration::from_millis(self.dedup_window_ms),
            },
        })
    }
}
