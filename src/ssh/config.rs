//! SSH connection descriptors.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Bound on dialing plus the SSH handshake and authentication.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default SSH port used when an address carries none.
pub const DEFAULT_PORT: u16 = 22;

/// Address, credentials and optional jump host for one remote device.
///
/// Descriptors are built once by the config loader and shared read-only
/// between workers. Only one proxy hop is resolved: a proxy's own `proxy`
/// is never followed.
#[derive(Clone, Default)]
pub struct ConnInfo {
    /// `host:port` of the device.
    pub addr: String,

    /// SSH username.
    pub user: String,

    /// Password; empty means no password auth.
    pub password: String,

    /// Private key material (PEM/OpenSSH), shared by every descriptor of a run.
    pub private_key: Option<Arc<[u8]>>,

    /// Jump host the connection is tunneled through.
    pub proxy: Option<Arc<ConnInfo>>,
}

impl ConnInfo {
    pub fn new(addr: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_private_key(mut self, key: Arc<[u8]>) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn with_proxy(mut self, proxy: Arc<ConnInfo>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Split `addr` into host and port, defaulting the port to 22.
    pub fn host_port(&self) -> (String, u16) {
        split_host_port(&self.addr)
    }
}

impl fmt::Debug for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnInfo")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .field("password", &(!self.password.is_empty()).then_some("<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("proxy", &self.proxy)
            .finish()
    }
}

fn split_host_port(addr: &str) -> (String, u16) {
    // Bracketed IPv6: [::1]:2222
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT);
            return (host.to_string(), port);
        }
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (addr.to_string(), DEFAULT_PORT),
        },
        _ => (addr.to_string(), DEFAULT_PORT),
    }
}
