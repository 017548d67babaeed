//! Limiter key composition.

use std::net::SocketAddr;

/// Key used for peers whose address is not known.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A key that identifies one token bucket.
///
/// Keys are opaque strings composed from a client address, user, organization
/// and/or method name. Equal keys always resolve to the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimiterKey(String);

impl LimiterKey {
    /// Wrap an already composed key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a client address, with any port stripped.
    ///
    /// Accepts `host:port`, `[v6]:port`, or a bare host. An empty address
    /// maps to [`UNKNOWN_CLIENT`].
    pub fn client(addr: &str) -> Self {
        Self(client_host(addr))
    }

    /// Key for an optional peer socket address.
    pub fn peer(addr: Option<SocketAddr>) -> Self {
        match addr {
            Some(addr) => Self(addr.ip().to_string()),
            None => Self(UNKNOWN_CLIENT.to_string()),
        }
    }

    /// Key for a user identifier.
    pub fn user(user_id: &str) -> Self {
        Self(user_id.to_string())
    }

    /// Key for an organization identifier.
    pub fn organization(organization_id: &str) -> Self {
        Self(organization_id.to_string())
    }

    /// Composite key for a method called by a client.
    pub fn method(method: &str, client: &str) -> Self {
        Self(format!("{}:{}", method, client))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LimiterKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for LimiterKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

fn client_host(addr: &str) -> String {
    let addr = addr.trim();
    if addr.is_empty() {
        return UNKNOWN_CLIENT.to_string();
    }

    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }

    // Bare IPv6 addresses contain colons but no port.
    if addr.parse::<std::net::IpAddr>().is_ok() {
        return addr.to_string();
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            host.to_string()
        }
        _ => addr.to_string(),
    }
}
