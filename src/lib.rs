//! rotor: rotating forward proxy with upstream pool management
//!
//! A local HTTP/1.1 forward proxy that multiplexes client traffic across a
//! pool of upstream HTTP, HTTPS, and SOCKS5 proxies.
//!
//! ## Features
//!
//! - Rotation triggers: fixed interval, request count, connection errors,
//!   reported HTTP errors, and manual rotation via the management API
//! - Graceful drain: in-flight connections finish on the upstream they
//!   captured while new connections use the freshly selected one
//! - Domain pinning: destinations stick to one upstream for the session
//! - Background health monitoring with latency-ordered selection
//! - Management API for rotation, status reports, and pool inspection

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod monitor;
pub mod pool;
pub mod proxy;
pub mod rotator;

pub use config::{Cli, Config};
pub use error::{Result, RotorError};
