use anyhow::Context;

use crate::types::DeviceInfo;

/// Dashboard hub settings.
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub bind_addr: String,
    pub ws_send_buffer: usize,
}

impl HubConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("HUB_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:42831".into());
        let ws_send_buffer = std::env::var("HUB_SEND_BUFFER")
            .unwrap_or_else(|_| "256".into())
            .parse()
            .context("HUB_SEND_BUFFER must be a number")?;

        Ok(Self {
            bind_addr,
            ws_send_buffer,
        })
    }
}

/// Device-side sync settings.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub device: DeviceInfo,
    /// When false a connected coordinator stays idle and installs nothing.
    pub enabled: bool,
    /// Install every network tap as soon as a session becomes active.
    pub network_monitoring: bool,
}

impl SyncConfig {
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            enabled: true,
            network_monitoring: false,
        }
    }

    pub fn with_network_monitoring(mut self, enabled: bool) -> Self {
        self.network_monitoring = enabled;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
