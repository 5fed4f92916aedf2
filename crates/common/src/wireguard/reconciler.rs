//! Peer reconciler
//!
//! Owns the hub's tunnel interface. The interface moves one way, from
//! uninitialized to active, on `bring_up`. The config file is the source of
//! truth: every mutation takes an exclusive `flock` on `<if>.conf.lock`,
//! re-reads the file, then mutates, applies and persists before releasing
//! it. The CLI and the daemon each open their own reconciler, and the lock
//! keeps their mutations from interleaving.
//!
//! A change is applied to the running interface with `wg syncconf`, which
//! only touches the difference and leaves other sessions up. The config
//! file is rewritten only after the apply succeeded; if that write fails
//! the previous configuration is applied again.

use super::conf::WgConfig;
use super::exec::CommandRunner;
use super::status::{parse_dump, parse_show, InterfaceStatus};
use super::{ReconcilerConfig, StatusMode};
use crate::config::HubInitConfig;
use crate::keys::WgKeyPair;
use crate::types::{HubInterface, PeerEntry};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Tool availability on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Probe {
    pub installed: bool,
    pub interface_exists: bool,
}

/// Single writer of the live interface configuration
pub struct PeerReconciler {
    config: ReconcilerConfig,
    runner: Arc<dyn CommandRunner>,
    // Orders callers in this process before they queue on the file lock
    local: Mutex<()>,
}

impl PeerReconciler {
    /// Check an existing config file parses; a missing file means uninitialized
    pub fn open(config: ReconcilerConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let path = config.config_path();
        match read_config(&path)? {
            Some(parsed) => info!(
                "Found {} with {} peers at {:?}",
                config.interface,
                parsed.peers.len(),
                path
            ),
            None => debug!("No config at {:?}, interface uninitialized", path),
        }

        Ok(Self {
            config,
            runner,
            local: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub async fn is_active(&self) -> bool {
        self.config.config_path().exists()
    }

    /// Generate keys, write the base config and start the interface
    pub async fn bring_up(&self, init: &HubInitConfig) -> Result<HubInterface> {
        let pool = init.validate()?;
        let _local = self.local.lock().await;
        let _lock = self.lock_interface().await?;

        let path = self.config.config_path();
        if read_config(&path)?.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let keys = WgKeyPair::generate();
        let address = pool.hub_address();
        let config = WgConfig::new(address, init.listen_port, keys.private_key.clone());

        write_config_file(&path, &config.render())?;

        let unit = self.config.service_unit();
        let mut enabled = false;
        for action in ["enable", "start"] {
            if let Err(e) = self.runner.run("systemctl", &[action, &unit], None).await {
                self.roll_back_bring_up(&path, &unit, enabled).await;
                return Err(e);
            }
            enabled = true;
        }

        info!(
            "Interface {} up at {} on port {}",
            self.config.interface, address, init.listen_port
        );

        let now = Utc::now();
        Ok(HubInterface {
            interface_address: address,
            listen_port: init.listen_port,
            private_key: keys.private_key,
            public_key: keys.public_key,
            network_cidr: pool.network(),
            public_endpoint: init.public_endpoint.clone(),
            private_endpoint: init.private_endpoint.clone(),
            dns: init.dns.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Undo a partial bring-up: the file never went live and the unit must
    /// not start at the next boot
    async fn roll_back_bring_up(&self, path: &Path, unit: &str, enabled: bool) {
        if let Err(rm) = std::fs::remove_file(path) {
            warn!("Failed to remove {:?} after failed bring-up: {}", path, rm);
        }
        if enabled {
            if let Err(e) = self.runner.run("systemctl", &["disable", unit], None).await {
                warn!("Failed to disable {} after failed bring-up: {}", unit, e);
            }
        }
    }

    /// Add a peer. Returns `false` without touching the interface when a peer
    /// with the same public key is already configured.
    pub async fn add_peer(&self, entry: &PeerEntry) -> Result<bool> {
        let _local = self.local.lock().await;
        let _lock = self.lock_interface().await?;
        let current = self.load()?;

        if current.contains_key(&entry.public_key) {
            warn!(
                "Peer {} ({}) already configured, skipping add",
                entry.name, entry.public_key
            );
            return Ok(false);
        }

        let next = current.with_peer(entry);
        self.commit(&current, &next).await?;

        info!("Added peer {} ({})", entry.name, entry.public_key);
        Ok(true)
    }

    /// Remove the peer matching both name and public key. Returns `false`
    /// when no such peer is configured.
    pub async fn remove_peer(&self, entry: &PeerEntry) -> Result<bool> {
        let _local = self.local.lock().await;
        let _lock = self.lock_interface().await?;
        let current = self.load()?;

        let Some(index) = current.position(&entry.name, &entry.public_key) else {
            warn!(
                "Peer {} ({}) not configured, nothing to remove",
                entry.name, entry.public_key
            );
            return Ok(false);
        };

        let next = current.without_peer(index);
        self.commit(&current, &next).await?;

        info!("Removed peer {} ({})", entry.name, entry.public_key);
        Ok(true)
    }

    /// Peers in the config file. `HubNotInitialized` before `bring_up`.
    pub async fn peers(&self) -> Result<Vec<PeerEntry>> {
        Ok(self.load()?.peers)
    }

    /// Query the running interface.
    ///
    /// Not serialized against mutations; a status taken during an add or
    /// remove may or may not reflect it.
    pub async fn status(&self) -> Result<InterfaceStatus> {
        self.status_at(Utc::now()).await
    }

    async fn status_at(&self, now: DateTime<Utc>) -> Result<InterfaceStatus> {
        let iface = self.config.interface.as_str();
        match self.config.status_mode {
            StatusMode::Dump => {
                let out = self.runner.run("wg", &["show", iface, "dump"], None).await?;
                parse_dump(iface, &out)
            }
            StatusMode::Show => {
                let out = self.runner.run("wg", &["show", iface], None).await?;
                let mut status = parse_show(&out, now)?;
                if status.interface.is_empty() {
                    status.interface = iface.to_string();
                }
                Ok(status)
            }
        }
    }

    /// Whether `wg` is installed and the interface exists
    pub async fn probe(&self) -> Probe {
        if self.runner.run("which", &["wg"], None).await.is_err() {
            return Probe {
                installed: false,
                interface_exists: false,
            };
        }
        let interface_exists = self
            .runner
            .run("wg", &["show", &self.config.interface], None)
            .await
            .is_ok();
        Probe {
            installed: true,
            interface_exists,
        }
    }

    /// Exclusive lock on the interface, released on drop
    async fn lock_interface(&self) -> Result<Flock<File>> {
        let path = self.config.lock_path();
        tokio::task::spawn_blocking(move || acquire_lock(&path))
            .await
            .map_err(|e| Error::Internal(format!("interface lock task failed: {}", e)))?
    }

    /// Current configuration as persisted on disk
    fn load(&self) -> Result<WgConfig> {
        read_config(&self.config.config_path())?.ok_or(Error::HubNotInitialized)
    }

    /// Apply `next`, then persist it. Restores `prev` on the interface if
    /// persisting fails.
    async fn commit(&self, prev: &WgConfig, next: &WgConfig) -> Result<()> {
        self.sync(next).await?;

        let path = self.config.config_path();
        if let Err(e) = write_config_file(&path, &next.render()) {
            error!("Failed to persist {:?}: {}; restoring previous peers", path, e);
            if let Err(restore) = self.sync(prev).await {
                error!("Failed to restore previous configuration: {}", restore);
            }
            return Err(e);
        }
        Ok(())
    }

    /// `wg syncconf` the stripped form of `config`
    async fn sync(&self, config: &WgConfig) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-sync", self.config.interface))
            .suffix(".conf")
            .tempfile()?;
        file.write_all(config.render_stripped().as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().into_owned();
        self.runner
            .run("wg", &["syncconf", &self.config.interface, &path], None)
            .await?;
        Ok(())
    }
}

fn read_config(path: &Path) -> Result<Option<WgConfig>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(WgConfig::parse(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Block until the exclusive lock on `path` is held
fn acquire_lock(path: &Path) -> Result<Flock<File>> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| Error::Io(std::io::Error::from(errno)))
}

/// Write `contents` to `path` atomically with owner-only permissions
fn write_config_file(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("config path {:?} has no parent", path)))?;
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::exec::testing::FakeRunner;
    use tempfile::TempDir;

    fn init() -> HubInitConfig {
        HubInitConfig {
            network_cidr: "10.0.1.0/24".to_string(),
            listen_port: 51820,
            public_endpoint: "vpn.example.com:51820".to_string(),
            private_endpoint: None,
            dns: vec![],
        }
    }

    fn reconciler(dir: &TempDir, runner: &FakeRunner, mode: StatusMode) -> PeerReconciler {
        let config = ReconcilerConfig {
            interface: "wg0".to_string(),
            config_dir: dir.path().to_path_buf(),
            status_mode: mode,
        };
        PeerReconciler::open(config, Arc::new(runner.clone())).unwrap()
    }

    fn peer(name: &str) -> PeerEntry {
        PeerEntry {
            name: name.to_string(),
            id: format!("{}-id", name),
            public_key: WgKeyPair::generate().public_key,
            allowed_ips: vec!["10.0.1.2/32".parse().unwrap()],
        }
    }

    #[tokio::test]
    async fn test_bring_up_writes_config_and_starts_unit() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let rec = reconciler(&dir, &runner, StatusMode::Dump);

        let hub = rec.bring_up(&init()).await.unwrap();
        assert_eq!(hub.interface_address.to_string(), "10.0.1.1/24");
        assert!(rec.is_active().await);
        assert_eq!(
            runner.lines(),
            vec!["systemctl enable wg-quick@wg0", "systemctl start wg-quick@wg0"]
        );

        let path = dir.path().join("wg0.conf");
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains(&format!("PrivateKey = {}", hub.private_key)));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(matches!(rec.bring_up(&init()).await, Err(Error::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn test_failed_bring_up_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.fail("systemctl start", "unit failed");
        let rec = reconciler(&dir, &runner, StatusMode::Dump);

        let err = rec.bring_up(&init()).await.unwrap_err();
        assert!(matches!(err, Error::ExternalCommand { .. }));
        assert!(!rec.is_active().await);
        assert!(!dir.path().join("wg0.conf").exists());
        assert_eq!(runner.lines().last().unwrap(), "systemctl disable wg-quick@wg0");
    }

    #[tokio::test]
    async fn test_failed_enable_skips_disable() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.fail("systemctl enable", "no such unit");
        let rec = reconciler(&dir, &runner, StatusMode::Dump);

        rec.bring_up(&init()).await.unwrap_err();
        assert_eq!(runner.count("systemctl disable"), 0);
        assert_eq!(runner.count("systemctl start"), 0);
    }

    #[tokio::test]
    async fn test_peer_mutations_require_active_interface() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let rec = reconciler(&dir, &runner, StatusMode::Dump);
        assert!(matches!(rec.add_peer(&peer("a")).await, Err(Error::HubNotInitialized)));
    }

    #[tokio::test]
    async fn test_add_is_idempotent_and_applies_incrementally() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let rec = reconciler(&dir, &runner, StatusMode::Dump);
        rec.bring_up(&init()).await.unwrap();

        let p = peer("alpha");
        assert!(rec.add_peer(&p).await.unwrap());
        assert!(!rec.add_peer(&p).await.unwrap());

        assert_eq!(runner.count("wg syncconf wg0"), 1);
        let applied = runner.synced();
        assert!(applied[0].contains(&format!("PublicKey = {}", p.public_key)));
        assert!(!applied[0].contains("Address ="));

        let file = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert_eq!(file.matches(&p.public_key).count(), 1);
        assert!(file.contains("# Spoke: alpha (alpha-id)"));
    }

    #[tokio::test]
    async fn test_remove_missing_peer_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let rec = reconciler(&dir, &runner, StatusMode::Dump);
        rec.bring_up(&init()).await.unwrap();
        let p = peer("alpha");
        rec.add_peer(&p).await.unwrap();

        let before = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        let mut other = p.clone();
        other.name = "alph".to_string();
        assert!(!rec.remove_peer(&other).await.unwrap());
        let after = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert_eq!(before, after);

        assert!(rec.remove_peer(&p).await.unwrap());
        assert!(rec.peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_previous_config() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let rec = reconciler(&dir, &runner, StatusMode::Dump);
        rec.bring_up(&init()).await.unwrap();
        let before = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();

        runner.hang("wg syncconf");
        let err = rec.add_peer(&peer("alpha")).await.unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(rec.peers().await.unwrap().is_empty());
        let after = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_reconcilers_sharing_a_directory_see_each_other() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let cli = reconciler(&dir, &runner, StatusMode::Dump);
        let daemon = reconciler(&dir, &runner, StatusMode::Dump);
        cli.bring_up(&init()).await.unwrap();
        assert!(matches!(daemon.bring_up(&init()).await, Err(Error::AlreadyInitialized)));

        let x = peer("x");
        let y = peer("y");
        assert!(cli.add_peer(&x).await.unwrap());
        assert!(daemon.add_peer(&y).await.unwrap());
        assert!(!daemon.add_peer(&x).await.unwrap());

        let file = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert!(file.contains(&x.public_key));
        assert!(file.contains(&y.public_key));
        let last = runner.synced().pop().unwrap();
        assert!(last.contains(&x.public_key));
        assert!(last.contains(&y.public_key));

        assert!(cli.remove_peer(&y).await.unwrap());
        assert_eq!(daemon.peers().await.unwrap(), vec![x]);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_across_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wg0.conf.lock");
        let held = acquire_lock(&path).unwrap();

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let contended = Flock::lock(file, FlockArg::LockExclusiveNonblock);
        assert!(contended.is_err());

        drop(held);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        assert!(Flock::lock(file, FlockArg::LockExclusiveNonblock).is_ok());
    }

    #[tokio::test]
    async fn test_open_reloads_persisted_peers() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let p = peer("alpha");
        {
            let rec = reconciler(&dir, &runner, StatusMode::Dump);
            rec.bring_up(&init()).await.unwrap();
            rec.add_peer(&p).await.unwrap();
        }
        let rec = reconciler(&dir, &runner, StatusMode::Dump);
        assert!(rec.is_active().await);
        assert_eq!(rec.peers().await.unwrap(), vec![p]);
    }

    #[tokio::test]
    async fn test_status_modes() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.respond(
            "wg show wg0 dump",
            "PRIV\tHUB=\t51820\toff\nP1=\t(none)\t1.2.3.4:5\t10.0.1.2/32\t1700000000\t10\t20\toff\n",
        );
        let rec = reconciler(&dir, &runner, StatusMode::Dump);
        let status = rec.status().await.unwrap();
        assert_eq!(status.peers[0].rx_bytes, 10);

        let runner = FakeRunner::new();
        runner.respond(
            "wg show wg0",
            "interface: wg0\n  public key: HUB=\n  listening port: 51820\n\npeer: P1=\n  latest handshake: Now\n",
        );
        let rec = reconciler(&dir, &runner, StatusMode::Show);
        let now = Utc::now();
        let status = rec.status_at(now).await.unwrap();
        assert_eq!(status.peers[0].last_handshake, Some(now));
    }

    #[tokio::test]
    async fn test_probe() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        runner.fail("wg show", "No such device");
        let rec = reconciler(&dir, &runner, StatusMode::Dump);
        assert_eq!(
            rec.probe().await,
            Probe {
                installed: true,
                interface_exists: false
            }
        );

        runner.fail("which", "not found");
        assert!(!rec.probe().await.installed);
    }
}
