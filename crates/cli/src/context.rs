//! Local store access
//!
//! The CLI drives the engine in-process against the same store and
//! interface config the daemon uses.

use anyhow::{Context as _, Result};
use hubspoke_common::{Database, HubService, PeerReconciler, Settings, SystemCommandRunner};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Command-line overrides applied on top of the settings file
#[derive(Debug, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub store: Option<PathBuf>,
    pub interface: Option<String>,
    pub token_ttl_hours: Option<u32>,
}

pub struct Context {
    pub settings: Settings,
    pub service: HubService,
}

impl Context {
    pub fn open(overrides: Overrides) -> Result<Self> {
        let path = overrides
            .config
            .unwrap_or_else(hubspoke_common::default_config_path);
        let mut settings = Settings::load(&path)
            .with_context(|| format!("Failed to load settings from {:?}", path))?;

        if let Some(store) = overrides.store {
            settings.store_path = store;
        }
        if let Some(interface) = overrides.interface {
            settings.interface.name = interface;
        }
        if let Some(hours) = overrides.token_ttl_hours {
            settings.credentials.ttl_hours = hours;
        }
        settings.validate()?;

        std::fs::create_dir_all(&settings.store_path)
            .with_context(|| format!("Failed to create store {:?}", settings.store_path))?;
        debug!("Using store {:?}", settings.store_path);

        let db = Database::open(settings.db_path())?;
        let runner = Arc::new(SystemCommandRunner::new(settings.command_timeout()));
        let reconciler = PeerReconciler::open(settings.reconciler_config(), runner)?;
        let service = HubService::new(db, settings.credential_policy(), Arc::new(reconciler));

        Ok(Self { settings, service })
    }
}
