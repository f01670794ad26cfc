//! Management API
//!
//! Loopback-bound HTTP surface for external integrations:
//!
//!   POST /api/rotate   Force an immediate rotation.
//!   POST /api/status   Report an HTTP status seen by the client app.
//!   GET  /api/pool     List all upstreams and their state.
//!   GET  /api/current  The currently active upstream.

mod handlers;
mod routes;
mod server;

pub use routes::create_router;
pub use server::{ApiConfig, ApiServer, AppState};
