//! HubSpoke Common Library
//!
//! Provisioning and reconciliation engine for a hub-and-spoke WireGuard
//! network: address allocation, enrollment credentials, and the live
//! interface peer list.

pub mod config;
pub mod db;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod pool;
pub mod service;
pub mod types;
pub mod wireguard;

// Re-export commonly used types
pub use config::{ClusterUpdate, HubInitConfig, HubUpdate, Settings};
pub use db::Database;
pub use error::{Error, ErrorKind, PublicError, Result};
pub use keys::{validate_public_key, WgKeyPair};
pub use ledger::{CredentialLedger, CredentialPolicy};
pub use pool::AddressPool;
pub use service::HubService;
pub use types::*;
pub use wireguard::{PeerReconciler, ReconcilerConfig, StatusMode, SystemCommandRunner};

/// HubSpoke version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".hubspoke")
}

/// Default settings file
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("hubspoke.toml")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join(config::DB_FILE_NAME)
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
