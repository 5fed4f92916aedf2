//! Reconciliation loop
//!
//! Periodically sweeps expired credentials and converges the live peer list
//! with the registry.

use hubspoke_common::{ConvergeReport, HubService};
use std::time::Duration;
use tracing::{debug, error, info};

/// Outcome of a single pass
#[derive(Debug, Default)]
pub struct PassReport {
    pub swept: usize,
    pub converge: ConvergeReport,
}

/// Drives `HubService::converge` on a fixed interval
pub struct Reconciler {
    service: HubService,
    interval: Duration,
    sweep: bool,
}

impl Reconciler {
    pub fn new(service: HubService, interval: Duration, sweep: bool) -> Self {
        Self {
            service,
            interval,
            sweep,
        }
    }

    /// Run the reconciliation loop
    pub async fn run(&self) {
        info!("Reconciler started, interval {}s", self.interval.as_secs());

        loop {
            if let Err(e) = self.reconcile_once().await {
                error!("Reconciliation error: {}", e);
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// One pass: sweep, then converge
    pub async fn reconcile_once(&self) -> hubspoke_common::Result<PassReport> {
        let mut report = PassReport::default();

        if self.sweep {
            report.swept = self.service.sweep_expired()?;
        }

        report.converge = self.service.converge().await?;
        if !report.converge.changed() {
            debug!("Peers in sync ({})", report.converge.in_sync);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubspoke_common::wireguard::exec::testing::FakeRunner;
    use hubspoke_common::{
        CredentialPolicy, Database, HubInitConfig, PeerEntry, PeerReconciler, ReconcilerConfig,
        StatusMode, WgKeyPair,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn service(dir: &TempDir, runner: &FakeRunner, policy: CredentialPolicy) -> HubService {
        let reconciler = PeerReconciler::open(
            ReconcilerConfig {
                interface: "wg0".to_string(),
                config_dir: dir.path().to_path_buf(),
                status_mode: StatusMode::Dump,
            },
            Arc::new(runner.clone()),
        )
        .unwrap();
        let service = HubService::new(Database::open_memory().unwrap(), policy, Arc::new(reconciler));
        service
            .initialize(HubInitConfig {
                network_cidr: "10.1.0.0/24".to_string(),
                listen_port: 51820,
                public_endpoint: "vpn.example.com:51820".to_string(),
                private_endpoint: None,
                dns: vec![],
            })
            .await
            .unwrap();
        service
    }

    fn expired() -> CredentialPolicy {
        let policy = CredentialPolicy::default();
        CredentialPolicy {
            ttl: -policy.ttl,
            ..policy
        }
    }

    #[tokio::test]
    async fn test_pass_sweeps_and_removes_orphans() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let service = service(&dir, &runner, expired()).await;
        service.issue_credential("stale", None).unwrap();
        service
            .reconciler()
            .add_peer(&PeerEntry {
                name: "ghost".to_string(),
                id: "ghost-id".to_string(),
                public_key: WgKeyPair::generate().public_key,
                allowed_ips: vec!["10.1.0.9/32".parse().unwrap()],
            })
            .await
            .unwrap();

        let reconciler = Reconciler::new(service.clone(), Duration::from_secs(30), true);
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.swept, 1);
        assert_eq!(report.converge.removed, 1);
        assert!(service.list_credentials().unwrap().is_empty());

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.swept, 0);
        assert!(!report.converge.changed());
    }

    #[tokio::test]
    async fn test_sweep_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let service = service(&dir, &runner, expired()).await;
        service.issue_credential("stale", None).unwrap();

        let reconciler = Reconciler::new(service.clone(), Duration::from_secs(30), false);
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.swept, 0);
        assert_eq!(service.list_credentials().unwrap().len(), 1);
    }
}
