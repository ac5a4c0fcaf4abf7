//! Controller configuration: port counts, reattach tunables, keepalive
//! tunables, and the persistence file path (§6 "Persisted state").

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Clamp bounds for a single port sub-range, per §3 "Port table".
pub const MIN_PORTS_PER_RANGE: u16 = 1;
pub const MAX_PORTS_PER_RANGE: u16 = 254;
pub const MAX_TOTAL_PORTS: u16 = 254;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VhciConfig {
    pub ports: PortSettings,
    pub reattach: ReattachSettings,
    pub keepalive: KeepaliveSettings,
    #[serde(default)]
    pub persistence_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSettings {
    /// `NumberOfUsb20Ports`: ports accepting speeds below SUPER.
    pub number_of_usb20_ports: u16,
    /// `NumberOfUsb30Ports`: ports accepting SUPER and above.
    pub number_of_usb30_ports: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReattachSettings {
    /// `ReattachMaxTries`: 0 = unlimited.
    pub max_tries: u32,
    /// `ReattachInitDelay`, seconds, clamped [1, 86400].
    pub init_delay_secs: u32,
    /// `ReattachMaxDelay`, seconds.
    pub max_delay_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveSettings {
    pub tcp_keepidle_secs: u32,
    pub tcp_keepcnt: u32,
    pub tcp_keepintvl_secs: u32,
}

impl Default for VhciConfig {
    fn default() -> Self {
        Self {
            ports: PortSettings {
                number_of_usb20_ports: 30,
                number_of_usb30_ports: 30,
            },
            reattach: ReattachSettings {
                max_tries: 0,
                init_delay_secs: 15,
                max_delay_secs: 3600,
            },
            keepalive: KeepaliveSettings {
                tcp_keepidle_secs: 30,
                tcp_keepcnt: 4,
                tcp_keepintvl_secs: 5,
            },
            persistence_path: None,
        }
    }
}

impl VhciConfig {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = [Self::default_path(), PathBuf::from("/etc/usbip-vhci/vhci.toml")];
            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: VhciConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!(path = %config_path.display(), "loaded controller configuration");
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }

        fs::write(path, content).with_context(|| format!("failed to write config file: {}", path.display()))?;

        tracing::info!(path = %path.display(), "saved controller configuration");
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbip-vhci").join("vhci.toml")
        } else {
            PathBuf::from(".config/usbip-vhci/vhci.toml")
        }
    }

    pub fn persistence_path(&self) -> PathBuf {
        self.persistence_path.clone().unwrap_or_else(|| {
            if let Some(data_dir) = dirs::data_local_dir() {
                data_dir.join("usbip-vhci").join("imported_devices.toml")
            } else {
                PathBuf::from(".local/share/usbip-vhci/imported_devices.toml")
            }
        })
    }

    /// Total port count, used by the reattach supervisor's capacity cap
    /// (`4 x port_count`, §4.9) and by the controller's port table size.
    pub fn total_ports(&self) -> u16 {
        self.ports.number_of_usb20_ports + self.ports.number_of_usb30_ports
    }

    fn validate(&self) -> Result<()> {
        let p = &self.ports;
        if !(MIN_PORTS_PER_RANGE..=MAX_PORTS_PER_RANGE).contains(&p.number_of_usb20_ports) {
            return Err(anyhow!(
                "number_of_usb20_ports out of range [{MIN_PORTS_PER_RANGE}, {MAX_PORTS_PER_RANGE}]"
            ));
        }
        if !(MIN_PORTS_PER_RANGE..=MAX_PORTS_PER_RANGE).contains(&p.number_of_usb30_ports) {
            return Err(anyhow!(
                "number_of_usb30_ports out of range [{MIN_PORTS_PER_RANGE}, {MAX_PORTS_PER_RANGE}]"
            ));
        }
        if self.total_ports() > MAX_TOTAL_PORTS {
            return Err(anyhow!("total port count {} exceeds {MAX_TOTAL_PORTS}", self.total_ports()));
        }

        let r = &self.reattach;
        if !(1..=86400).contains(&r.init_delay_secs) {
            return Err(anyhow!("reattach.init_delay_secs must be in [1, 86400]"));
        }
        if r.max_delay_secs < r.init_delay_secs {
            return Err(anyhow!("reattach.max_delay_secs must be >= init_delay_secs"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = VhciConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.total_ports(), 60);
    }

    #[test]
    fn serialization_roundtrips() {
        let config = VhciConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: VhciConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.ports.number_of_usb20_ports, parsed.ports.number_of_usb20_ports);
    }

    #[test]
    fn rejects_oversized_total_port_count() {
        let mut config = VhciConfig::default();
        config.ports.number_of_usb20_ports = 200;
        config.ports.number_of_usb30_ports = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_port_range() {
        let mut config = VhciConfig::default();
        config.ports.number_of_usb20_ports = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_max_delay_below_init_delay() {
        let mut config = VhciConfig::default();
        config.reattach.max_delay_secs = 1;
        config.reattach.init_delay_secs = 15;
        assert!(config.validate().is_err());
    }
}
