//! Configuration
//!
//! `Settings` is the on-disk TOML file shared by the daemon and the CLI.
//! `HubInitConfig` and `HubUpdate` are the validated inputs for creating
//! and editing the hub; `ClusterUpdate` edits cluster metadata.

use crate::ledger::CredentialPolicy;
use crate::pool::AddressPool;
use crate::wireguard::{ReconcilerConfig, StatusMode};
use crate::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// File name of the registry database inside the store directory
pub const DB_FILE_NAME: &str = "hubspoke.db";

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Store directory path
    pub store_path: PathBuf,

    /// Managed tunnel interface
    pub interface: InterfaceSettings,

    /// Credential issuance
    pub credentials: CredentialSettings,

    /// Daemon reconcile loop
    pub reconcile: ReconcileSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: crate::default_store_path(),
            interface: InterfaceSettings::default(),
            credentials: CredentialSettings::default(),
            reconcile: ReconcileSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceSettings {
    /// Interface name, e.g. `wg0`
    pub name: String,

    /// Directory holding `<name>.conf`
    pub config_dir: PathBuf,

    /// Timeout applied to every external command
    pub command_timeout_secs: u64,

    /// How live status is read from `wg`
    pub status_mode: StatusMode,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            name: "wg0".to_string(),
            config_dir: PathBuf::from("/etc/wireguard"),
            command_timeout_secs: 10,
            status_mode: StatusMode::Dump,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    /// Lifetime of a freshly issued credential
    pub ttl_hours: u32,

    /// Keepalive written into rendered spoke configs
    pub persistent_keepalive: u16,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            persistent_keepalive: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub interval_secs: u64,
    pub sweep_expired: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            sweep_expired: true,
        }
    }
}

impl Settings {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: Self = toml::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join(DB_FILE_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        if self.credentials.ttl_hours == 0 {
            return Err(Error::validation("credentials.ttl_hours", "must be at least 1"));
        }
        if self.interface.command_timeout_secs == 0 {
            return Err(Error::validation(
                "interface.command_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.reconcile.interval_secs == 0 {
            return Err(Error::validation("reconcile.interval_secs", "must be at least 1"));
        }
        validate_interface_name(&self.interface.name)
    }

    pub fn credential_policy(&self) -> CredentialPolicy {
        CredentialPolicy {
            ttl: Duration::hours(i64::from(self.credentials.ttl_hours)),
            persistent_keepalive: self.credentials.persistent_keepalive,
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interface: self.interface.name.clone(),
            config_dir: self.interface.config_dir.clone(),
            status_mode: self.interface.status_mode,
        }
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interface.command_timeout_secs)
    }
}

/// Linux interface names: 1-15 characters, no separators
pub fn validate_interface_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(Error::validation(
            "interface.name",
            "must be 1-15 characters of letters, digits or _=+.-",
        ))
    }
}

// ============================================================================
// Hub configuration
// ============================================================================

/// Parameters for bringing up the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubInitConfig {
    pub network_cidr: String,
    pub listen_port: u16,
    pub public_endpoint: String,
    pub private_endpoint: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
}

impl HubInitConfig {
    /// Validate every field and return the parsed address pool
    pub fn validate(&self) -> Result<AddressPool> {
        let pool = AddressPool::parse(&self.network_cidr)?;
        if self.listen_port == 0 {
            return Err(Error::validation("listen_port", "must be between 1 and 65535"));
        }
        validate_endpoint("public_endpoint", &self.public_endpoint)?;
        if let Some(private) = &self.private_endpoint {
            validate_endpoint("private_endpoint", private)?;
        }
        validate_dns(&self.dns)?;
        Ok(pool)
    }
}

/// Mutable, non-structural hub fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubUpdate {
    pub dns: Option<Vec<String>>,
    pub public_endpoint: Option<String>,
    /// `Some(None)` clears the private endpoint
    pub private_endpoint: Option<Option<String>>,
}

impl HubUpdate {
    pub fn is_empty(&self) -> bool {
        self.dns.is_none() && self.public_endpoint.is_none() && self.private_endpoint.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::validation("update", "no fields to update"));
        }
        if let Some(dns) = &self.dns {
            validate_dns(dns)?;
        }
        if let Some(endpoint) = &self.public_endpoint {
            validate_endpoint("public_endpoint", endpoint)?;
        }
        if let Some(Some(endpoint)) = &self.private_endpoint {
            validate_endpoint("private_endpoint", endpoint)?;
        }
        Ok(())
    }
}

/// Cluster metadata edit. `Some("")` clears a field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterUpdate {
    pub datacenter: Option<String>,
    pub description: Option<String>,
}

impl ClusterUpdate {
    pub fn is_empty(&self) -> bool {
        self.datacenter.is_none() && self.description.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::validation("update", "no fields to update"));
        }
        Ok(())
    }
}

/// `host:port` where host is a hostname, IPv4 address or bracketed IPv6
pub fn validate_endpoint(field: &'static str, endpoint: &str) -> Result<()> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| Error::validation(field, "expected host:port"))?;

    match port.parse::<u16>() {
        Ok(p) if p > 0 => {}
        _ => return Err(Error::validation(field, "port must be between 1 and 65535")),
    }

    let host_ok = if let Some(inner) = host.strip_prefix('[') {
        inner
            .strip_suffix(']')
            .map(|v6| v6.parse::<Ipv6Addr>().is_ok())
            .unwrap_or(false)
    } else if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
        host.parse::<Ipv4Addr>().is_ok()
    } else {
        is_hostname(host)
    };

    if host_ok {
        Ok(())
    } else {
        Err(Error::validation(field, format!("invalid host '{}'", host)))
    }
}

fn is_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn validate_dns(dns: &[String]) -> Result<()> {
    for entry in dns {
        if entry.parse::<IpAddr>().is_err() {
            return Err(Error::validation("dns", format!("'{}' is not an IP address", entry)));
        }
    }
    Ok(())
}
