//! Live tunnel interface management
//!
//! - `exec`: external command execution with timeouts
//! - `conf`: structured interface configuration and its text form
//! - `status`: parsers for `wg show` output
//! - `reconciler`: the single writer of the live peer list

pub mod conf;
pub mod exec;
pub mod reconciler;
pub mod status;

pub use conf::{InterfaceSection, WgConfig};
pub use exec::{CommandRunner, SystemCommandRunner};
pub use reconciler::{PeerReconciler, Probe};
pub use status::{InterfaceStatus, PeerStatus};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How live status is read from the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusMode {
    /// `wg show <if> dump`: tab-separated, absolute handshake epochs
    Dump,
    /// `wg show <if>`: human-readable text with relative handshake times
    Show,
}

impl Default for StatusMode {
    fn default() -> Self {
        Self::Dump
    }
}

impl std::fmt::Display for StatusMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusMode::Dump => write!(f, "dump"),
            StatusMode::Show => write!(f, "show"),
        }
    }
}

/// Where and how the reconciler manages its interface
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interface: String,
    pub config_dir: PathBuf,
    pub status_mode: StatusMode,
}

impl ReconcilerConfig {
    /// `<config_dir>/<interface>.conf`, the file `wg-quick` reads at boot
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.interface))
    }

    /// Advisory lock file shared by every process that mutates the interface
    pub fn lock_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf.lock", self.interface))
    }

    /// systemd unit driving the interface
    pub fn service_unit(&self) -> String {
        format!("wg-quick@{}", self.interface)
    }
}
