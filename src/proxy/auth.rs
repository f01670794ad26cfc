//! Proxy authentication
//!
//! Basic authentication on the Proxy-Authorization header.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::warn;

/// Basic-auth gate for the proxy listener
#[derive(Clone)]
pub struct ProxyAuth {
    enabled: bool,
    username: String,
    password: String,
}

impl ProxyAuth {
    /// Create an enabled auth handler.
    pub fn new(username: String, password: String) -> Self {
        Self {
            enabled: true,
            username,
            password,
        }
    }

    /// Create a disabled auth handler.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Validate a Proxy-Authorization header value. Always passes when
    /// auth is disabled.
    pub fn validate(&self, header: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }

        let Some(value) = header else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            warn!("invalid proxy auth scheme, expected Basic");
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = credentials.split_once(':') else {
            return false;
        };

        user == self.username && pass == self.password
    }

    /// The 407 challenge sent to unauthenticated clients.
    pub fn challenge_response() -> &'static str {
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
         Proxy-Authenticate: Basic realm=\"proxyrotator\"\r\n\
         Content-Length: 0\r\n\r\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", user, pass)))
    }

    #[test]
    fn test_disabled_accepts_anything() {
        let auth = ProxyAuth::disabled();
        assert!(auth.validate(None));
        assert!(auth.validate(Some("Basic nonsense")));
    }

    #[test]
    fn test_missing_header_rejected() {
        let auth = ProxyAuth::new("user".to_string(), "pass".to_string());
        assert!(!auth.validate(None));
    }

    #[test]
    fn test_valid_credentials() {
        let auth = ProxyAuth::new("user".to_string(), "pass".to_string());
        assert!(auth.validate(Some(&basic("user", "pass"))));
    }

    #[test]
    fn test_invalid_credentials() {
        let auth = ProxyAuth::new("user".to_string(), "pass".to_string());
        assert!(!auth.validate(Some(&basic("wrong", "wrong"))));
        assert!(!auth.validate(Some(&basic("user", ""))));
    }

    #[test]
    fn test_invalid_scheme_and_encoding() {
        let auth = ProxyAuth::new("user".to_string(), "pass".to_string());
        assert!(!auth.validate(Some("Bearer token123")));
        assert!(!auth.validate(Some("Basic not-base64!!!")));
    }

    #[test]
    fn test_challenge_framing() {
        let challenge = ProxyAuth::challenge_response();
        assert!(challenge.starts_with("HTTP/1.1 407 "));
        assert!(challenge.contains("Proxy-Authenticate: Basic realm=\"proxyrotator\""));
        assert!(challenge.ends_with("\r\n\r\n"));
    }
}
