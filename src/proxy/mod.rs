//! Client-facing forward proxy: listener, auth, upstream transport, and
//! the byte tunnel between them.

pub mod auth;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use auth::ProxyAuth;
pub use server::{ProxyServer, ServerConfig};
