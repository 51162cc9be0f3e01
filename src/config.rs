//! Bridge connection settings.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_BPUP_PORT;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Expected bridge id. Empty disables the origin check.
    #[serde(default)]
    pub bond_id: String,

    /// Host name or IP of the bridge. Falls back to `<bond_id>.local`.
    #[serde(default)]
    pub bridge_ip: Option<String>,

    #[serde(default = "default_port")]
    pub bridge_port: u16,

    /// Local port to bind (0 = ephemeral)
    #[serde(default = "default_port")]
    pub local_port: u16,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    /// Silence after which the link is reported down
    #[serde(default = "default_offline_after_ms")]
    pub offline_after_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_BPUP_PORT
}

fn default_probe_interval_ms() -> u64 {
    60_000
}

fn default_receive_timeout_ms() -> u64 {
    3_000
}

fn default_offline_after_ms() -> u64 {
    180_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bond_id: String::new(),
            bridge_ip: None,
            bridge_port: default_port(),
            local_port: default_port(),
            probe_interval_ms: default_probe_interval_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            offline_after_ms: default_offline_after_ms(),
        }
    }
}

impl BridgeConfig {
    pub fn new(bond_id: impl Into<String>) -> Self {
        Self {
            bond_id: bond_id.into(),
            ..Self::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.bridge_ip = Some(ip.into());
        self
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let config: BridgeConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe_interval_ms == 0 {
            return Err(Error::Config("probe_interval_ms must be positive".into()));
        }
        if self.receive_timeout_ms == 0 {
            return Err(Error::Config("receive_timeout_ms must be positive".into()));
        }
        self.host().map(|_| ())
    }

    pub fn host(&self) -> Result<String> {
        match self.bridge_ip.as_deref().map(str::trim) {
            Some(ip) if !ip.is_empty() => Ok(ip.to_string()),
            _ if !self.bond_id.trim().is_empty() => {
                Ok(format!("{}.local", self.bond_id.trim()))
            }
            _ => Err(Error::Config("either bridge_ip or bond_id is required".into())),
        }
    }

    /// Resolves the bridge endpoint to its first IPv4 address. The push
    /// socket is bound on IPv4 only.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let host = self.host()?;
        let mut addrs = tokio::net::lookup_host((host.as_str(), self.bridge_port))
            .await
            .map_err(|e| Error::Resolve(format!("{host}: {e}")))?;
        addrs
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| Error::Resolve(format!("{host}: no IPv4 address")))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_millis(self.offline_after_ms)
    }
}
