//! Session configuration.

use std::time::Duration;

/// SOCKS5 proxy settings. Username and password are optional together; when
/// present the username/password sub-negotiation is offered.
#[derive(Debug, Clone, Default)]
pub struct SocksProxy {
    /// Proxy address (host:port).
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Configuration for one logged-in identity.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Our screen name.
    pub screen_name: String,
    /// Optional SOCKS5 proxy applied to every outbound connection.
    pub proxy: Option<SocksProxy>,
    /// Idle interval after which a FLAP keepalive is sent on the BOS
    /// connection.
    pub keepalive_interval: Duration,
    /// Message cookies older than this are swept.
    pub cookie_max_age: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            screen_name: String::new(),
            proxy: None,
            keepalive_interval: Duration::from_secs(60),
            cookie_max_age: Duration::from_secs(60),
        }
    }
}
