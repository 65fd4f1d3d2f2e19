use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{FleetError, Result};
use crate::ssh::config::DEFAULT_PORT;
use crate::ssh::ConnInfo;
use crate::task::CopyInfo;

/// A run file: who to reach, what to upload, what to execute.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub configs: SharedConfig,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub copy: Vec<CopyInfo>,
    #[serde(default)]
    pub execute: Vec<String>,
    /// Concurrent workers; the CLI flag takes precedence.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Settings shared by every device.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SharedConfig {
    #[serde(default, rename = "privateKey")]
    pub private_key: Option<String>,
    #[serde(default)]
    pub proxy: Option<Device>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub user: String,
    pub addr: String,
    #[serde(default, deserialize_with = "port_as_string")]
    pub port: Option<String>,
    #[serde(default)]
    pub password: String,
}

fn default_workers() -> usize {
    1
}

// Ports show up both as `22` and `"22"` in hand-written files.
fn port_as_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    Ok(Option::<Port>::deserialize(deserializer)?.map(|port| match port {
        Port::Number(n) => n.to_string(),
        Port::Text(s) => s,
    }))
}

impl Device {
    fn address(&self) -> String {
        match self.port.as_deref().filter(|p| !p.is_empty()) {
            Some(port) => format!("{}:{}", self.addr, port),
            None => format!("{}:{}", self.addr, DEFAULT_PORT),
        }
    }

    fn conn_info(&self, private_key: Option<&Arc<[u8]>>) -> ConnInfo {
        let info = ConnInfo::new(self.address(), &self.user).with_password(&self.password);
        match private_key {
            Some(key) => info.with_private_key(key.clone()),
            None => info,
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| FleetError::Config(format!("Invalid config: {}", e)))
    }

    /// Expanded path of the shared private key, if one is configured.
    pub fn private_key_path(&self) -> Option<PathBuf> {
        self.configs
            .private_key
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }

    /// Build one descriptor per device.
    ///
    /// The private key is read once and shared; if it cannot be read the run
    /// goes on with password auth only. All devices share the proxy.
    pub fn conn_infos(&self) -> Vec<Arc<ConnInfo>> {
        let private_key = self.private_key_path().and_then(|path| {
            std::fs::read(&path)
                .map(Arc::<[u8]>::from)
                .map_err(|e| {
                    tracing::warn!("Failed to read private key {}: {}", path.display(), e);
                })
                .ok()
        });

        let proxy = self
            .configs
            .proxy
            .as_ref()
            .map(|proxy| Arc::new(proxy.conn_info(private_key.as_ref())));

        self.devices
            .iter()
            .map(|device| {
                let info = device.conn_info(private_key.as_ref());
                Arc::new(match &proxy {
                    Some(proxy) => info.with_proxy(proxy.clone()),
                    None => info,
                })
            })
            .collect()
    }
}
