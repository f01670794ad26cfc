//! Domain models shared across the proxy, rotator, and API layers.

mod upstream;

pub use upstream::{Upstream, UpstreamInfo, UpstreamScheme};
