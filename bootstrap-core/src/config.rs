// Device configuration loaded from the `cfg` flash partition
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;
use thiserror::Error;
use url::Url;

use crate::connection::{Bssid, Credentials};

/// Label of the data partition holding the configuration document.
pub const DEFAULT_CONFIG_LABEL: &str = "cfg";

/// Netmask applied when the document does not name one.
pub const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// The station password field is 64 bytes including the terminator.
const MAX_PSK_LEN: usize = 63;
const MAX_SSID_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config region '{0}' not found")]
    RegionMissing(String),
    #[error("config region '{label}' unreadable: {message}")]
    RegionUnreadable { label: String, message: String },
    #[error("config region is empty or erased")]
    Empty,
    #[error("config document is not valid JSON: {0}")]
    Syntax(#[source] serde_json::Error),
    #[error("config document is missing or has malformed fields: {0}")]
    Schema(#[source] serde_json::Error),
    #[error("config field '{field}' invalid: {reason}")]
    Field { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiSection {
    pub psk: String,
    pub bssid: Bssid,
    #[serde(default)]
    pub ssid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSection {
    pub ip: Ipv4Addr,
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
}

fn default_netmask() -> Ipv4Addr {
    DEFAULT_NETMASK
}

/// Static addressing applied to the station interface instead of DHCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIp {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

/// Required sections of the document. Everything else stays in the raw value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RequiredFields {
    wifi: WifiSection,
    net: NetSection,
    ota: String,
}

/// Parsed, immutable configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    wifi: WifiSection,
    net: NetSection,
    ota_url: String,
    document: Value,
}

impl DeviceConfig {
    /// Parse a configuration document from raw partition bytes.
    ///
    /// Only the first JSON value is read; erased flash (`0xFF`) or NUL padding
    /// after it is ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, ConfigError> {
        let start = raw
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .ok_or(ConfigError::Empty)?;
        if matches!(raw[start], 0x00 | 0xFF) {
            return Err(ConfigError::Empty);
        }

        let document = serde_json::Deserializer::from_slice(&raw[start..])
            .into_iter::<Value>()
            .next()
            .ok_or(ConfigError::Empty)?
            .map_err(ConfigError::Syntax)?;

        Self::from_value(document)
    }

    pub fn from_value(document: Value) -> Result<Self, ConfigError> {
        let required: RequiredFields =
            serde_json::from_value(document.clone()).map_err(ConfigError::Schema)?;

        if required.wifi.psk.len() > MAX_PSK_LEN {
            return Err(ConfigError::Field {
                field: "wifi.psk",
                reason: format!("{} bytes exceeds {}", required.wifi.psk.len(), MAX_PSK_LEN),
            });
        }
        if let Some(ssid) = &required.wifi.ssid {
            if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
                return Err(ConfigError::Field {
                    field: "wifi.ssid",
                    reason: format!("length {} outside 1..={}", ssid.len(), MAX_SSID_LEN),
                });
            }
        }
        if required.net.ip.is_unspecified() {
            return Err(ConfigError::Field {
                field: "net.ip",
                reason: "0.0.0.0 is not a usable address".to_string(),
            });
        }
        validate_url(&required.ota)?;

        Ok(Self {
            wifi: required.wifi,
            net: required.net,
            ota_url: required.ota,
            document,
        })
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            psk: self.wifi.psk.clone(),
            bssid: Some(self.wifi.bssid),
            ssid: self.wifi.ssid.clone(),
        }
    }

    pub fn static_ip(&self) -> StaticIp {
        StaticIp {
            address: self.net.ip,
            netmask: self.net.netmask,
            gateway: self.net.gateway,
        }
    }

    /// Replace the configured address, keeping netmask and gateway.
    pub fn with_ip_override(mut self, address: Ipv4Addr) -> Self {
        self.net.ip = address;
        self
    }

    pub fn update_url(&self) -> &str {
        &self.ota_url
    }

    pub fn wifi(&self) -> &WifiSection {
        &self.wifi
    }

    /// The whole document, including keys the bootstrap does not interpret.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Look up an application section by JSON pointer, e.g. `/telemetry/port`.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.document.pointer(pointer)
    }
}

fn validate_url(raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::Field { field: "ota", reason };

    let url = Url::parse(raw).map_err(|e| invalid(format!("'{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("'{}' is not an http(s) URL", raw)));
    }
    // The parser tolerates missing or extra slashes after the scheme; the
    // HTTP client does not.
    let authority = raw
        .strip_prefix(url.scheme())
        .and_then(|rest| rest.strip_prefix("://"))
        .filter(|rest| !rest.starts_with('/'));
    if authority.is_none() || url.host().is_none() {
        return Err(invalid(format!("'{}' has no host", raw)));
    }
    Ok(())
}

/// Read-only store mounted once at boot from a named flash region.
#[derive(Debug)]
pub struct ConfigStore {
    label: String,
    config: DeviceConfig,
}

impl ConfigStore {
    pub fn mount(label: &str, raw: &[u8]) -> Result<Self, ConfigError> {
        let config = DeviceConfig::parse(raw)?;
        log::info!(
            "Mounted config region '{}' ({} bytes): bssid {}, ip {}, ota {}",
            label,
            raw.len(),
            crate::connection::format_bssid(&config.wifi.bssid),
            config.net.ip,
            config.ota_url
        );
        Ok(Self {
            label: label.to_string(),
            config,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn into_config(self) -> DeviceConfig {
        self.config
    }
}
