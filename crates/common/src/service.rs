//! Hub service
//!
//! Composes the registry, the credential ledger and the peer reconciler.
//! A registry row is only reported as applied once the matching interface
//! mutation has been confirmed.

use crate::config::{ClusterUpdate, HubInitConfig, HubUpdate};
use crate::db::Database;
use crate::ledger::{CredentialLedger, CredentialPolicy};
use crate::types::{
    ApplyState, Cluster, ClusterView, ConvergeReport, Credential, Enrollment, EnrollmentRequest,
    HubInterface, SpokeRegistration, SpokeStatus, SpokeView,
};
use crate::wireguard::{InterfaceStatus, PeerReconciler, Probe};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Provisioning and reconciliation engine
#[derive(Clone)]
pub struct HubService {
    db: Database,
    ledger: CredentialLedger,
    reconciler: Arc<PeerReconciler>,
}

impl HubService {
    pub fn new(db: Database, policy: CredentialPolicy, reconciler: Arc<PeerReconciler>) -> Self {
        Self {
            ledger: CredentialLedger::new(db.clone(), policy),
            db,
            reconciler,
        }
    }

    pub fn ledger(&self) -> &CredentialLedger {
        &self.ledger
    }

    pub fn reconciler(&self) -> &PeerReconciler {
        &self.reconciler
    }

    // ========================================================================
    // Hub
    // ========================================================================

    /// Bring the interface up and record the hub. The row is written only
    /// after the interface is live.
    pub async fn initialize(&self, init: HubInitConfig) -> Result<HubInterface> {
        init.validate()?;
        if self.db.hub()?.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let hub = self.reconciler.bring_up(&init).await?;
        self.db.insert_hub(&hub)?;
        info!("Hub initialized for {}", hub.network_cidr);
        Ok(hub)
    }

    pub fn hub(&self) -> Result<HubInterface> {
        self.db.hub()?.ok_or(Error::HubNotInitialized)
    }

    /// Update DNS and endpoints. Credentials already issued keep the
    /// snapshot they were minted with.
    pub fn update_hub(&self, update: HubUpdate) -> Result<HubInterface> {
        update.validate()?;
        let mut hub = self.hub()?;
        if let Some(dns) = update.dns {
            hub.dns = dns;
        }
        if let Some(endpoint) = update.public_endpoint {
            hub.public_endpoint = endpoint;
        }
        if let Some(endpoint) = update.private_endpoint {
            hub.private_endpoint = endpoint;
        }
        hub.updated_at = Utc::now();
        self.db.update_hub(&hub)?;
        info!("Hub configuration updated");
        Ok(hub)
    }

    /// Live interface status
    pub async fn interface_status(&self) -> Result<InterfaceStatus> {
        self.reconciler.status().await
    }

    pub async fn probe(&self) -> Probe {
        self.reconciler.probe().await
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    pub fn issue_credential(&self, spoke_label: &str, custom_address: Option<&str>) -> Result<Credential> {
        let hub = self.hub()?;
        self.ledger.issue(spoke_label, &hub.snapshot(), custom_address)
    }

    pub fn issue_group_credential(&self, group_name: &str, max_uses: Option<u32>) -> Result<Credential> {
        let hub = self.hub()?;
        self.ledger.issue_group(group_name, &hub.snapshot(), max_uses)
    }

    pub fn validate_credential(&self, secret: &str) -> Result<Credential> {
        self.ledger.validate(secret)
    }

    pub fn consume_credential(&self, secret: &str) -> Result<Credential> {
        self.ledger.consume(secret)
    }

    pub fn credential(&self, id: Uuid) -> Result<Credential> {
        self.ledger.get(id)
    }

    pub fn list_credentials(&self) -> Result<Vec<Credential>> {
        self.ledger.list()
    }

    pub fn revoke_credential(&self, id: Uuid) -> Result<bool> {
        self.ledger.revoke(id)
    }

    pub fn sweep_expired(&self) -> Result<usize> {
        self.ledger.sweep_expired()
    }

    /// Spoke-side tunnel config for a credential
    pub fn spoke_config(&self, id: Uuid, private_key: &str) -> Result<String> {
        Ok(self.ledger.get(id)?.render_spoke_config(private_key))
    }

    // ========================================================================
    // Spokes
    // ========================================================================

    /// Enroll a spoke and add its peer to the interface
    pub async fn register_spoke(&self, request: EnrollmentRequest) -> Result<Enrollment> {
        let mut enrollment = self.ledger.enroll(&request)?;
        let registration = &mut enrollment.registration;

        match self.reconciler.add_peer(&registration.peer_entry()).await {
            Ok(_) => {
                self.db.set_apply_state(registration.id, ApplyState::Applied)?;
                registration.apply_state = ApplyState::Applied;
                Ok(enrollment)
            }
            Err(e) => {
                warn!(
                    "Peer for spoke {} ({}) was not applied: {}",
                    registration.name, registration.id, e
                );
                if let Err(mark) = self.db.set_apply_state(registration.id, ApplyState::Failed) {
                    error!("Failed to mark spoke {} as failed: {}", registration.id, mark);
                }
                Err(e)
            }
        }
    }

    /// Remove the spoke's peer, then its registration
    pub async fn remove_spoke(&self, id: Uuid) -> Result<SpokeRegistration> {
        let registration = self
            .db
            .registration(id)?
            .ok_or_else(|| Error::not_found("spoke", id))?;
        self.reconciler.remove_peer(&registration.peer_entry()).await?;
        self.db.delete_registration(id)?;
        info!("Removed spoke {} ({})", registration.name, id);
        Ok(registration)
    }

    pub async fn list_spokes(&self) -> Result<Vec<SpokeView>> {
        let registrations = self.db.list_registrations()?;
        let status = self.live_status().await;
        let now = Utc::now();
        Ok(registrations
            .into_iter()
            .map(|r| enrich(r, status.as_ref(), now))
            .collect())
    }

    pub async fn spoke(&self, id: Uuid) -> Result<SpokeView> {
        let registration = self
            .db
            .registration(id)?
            .ok_or_else(|| Error::not_found("spoke", id))?;
        let status = self.live_status().await;
        Ok(enrich(registration, status.as_ref(), Utc::now()))
    }

    pub fn list_clusters(&self) -> Result<Vec<ClusterView>> {
        self.db.list_clusters()
    }

    pub fn cluster(&self, id: Uuid) -> Result<ClusterView> {
        self.db
            .cluster(id)?
            .ok_or_else(|| Error::not_found("cluster", id))
    }

    /// Edit datacenter and description; membership is never changed here
    pub fn update_cluster(&self, id: Uuid, update: ClusterUpdate) -> Result<Cluster> {
        update.validate()?;
        let cluster = self
            .db
            .update_cluster(id, &update, Utc::now())?
            .ok_or_else(|| Error::not_found("cluster", id))?;
        info!("Updated cluster {} ({})", cluster.name, id);
        Ok(cluster)
    }

    /// Delete an empty cluster. Spokes must be removed first.
    pub fn delete_cluster(&self, id: Uuid) -> Result<Cluster> {
        let cluster = self
            .db
            .delete_cluster(id)?
            .ok_or_else(|| Error::not_found("cluster", id))?;
        info!("Deleted cluster {} ({})", cluster.name, id);
        Ok(cluster)
    }

    async fn live_status(&self) -> Option<InterfaceStatus> {
        match self.reconciler.status().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Interface status unavailable, reporting spokes as pending: {}", e);
                None
            }
        }
    }

    // ========================================================================
    // Convergence
    // ========================================================================

    /// Bring the live peer list back in line with the registry.
    ///
    /// Registrations without a peer, or not yet marked applied, are added;
    /// configured peers no registration owns are removed. Only `add_peer`
    /// and `remove_peer` touch the interface.
    pub async fn converge(&self) -> Result<ConvergeReport> {
        let mut report = ConvergeReport::default();
        if !self.reconciler.is_active().await {
            return Ok(report);
        }

        // Peers first: every configured peer then has its row in the list below
        let configured = self.reconciler.peers().await?;
        let registrations = self.db.list_registrations()?;

        for registration in &registrations {
            let entry = registration.peer_entry();
            let present = configured.iter().any(|p| p.public_key == entry.public_key);
            if present && registration.apply_state == ApplyState::Applied {
                report.in_sync += 1;
                continue;
            }

            match self.reconciler.add_peer(&entry).await {
                Ok(added) => {
                    if added {
                        report.added += 1;
                    } else {
                        report.in_sync += 1;
                    }
                    if registration.apply_state != ApplyState::Applied {
                        self.db.set_apply_state(registration.id, ApplyState::Applied)?;
                    }
                }
                Err(e) => {
                    warn!("Could not apply peer for spoke {}: {}", registration.id, e);
                    self.db.set_apply_state(registration.id, ApplyState::Failed)?;
                    report.failed += 1;
                }
            }
        }

        let owned: HashSet<&str> = registrations.iter().map(|r| r.public_key.as_str()).collect();
        for peer in configured.iter().filter(|p| !owned.contains(p.public_key.as_str())) {
            match self.reconciler.remove_peer(peer).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Could not remove orphan peer {}: {}", peer.public_key, e);
                    report.failed += 1;
                }
            }
        }

        if report.changed() || report.failed > 0 {
            info!(
                "Converged: {} in sync, {} added, {} removed, {} failed",
                report.in_sync, report.added, report.removed, report.failed
            );
        }
        Ok(report)
    }
}

fn enrich(registration: SpokeRegistration, status: Option<&InterfaceStatus>, now: DateTime<Utc>) -> SpokeView {
    let peer = status.and_then(|s| s.peer(&registration.public_key));
    let last_handshake = peer.and_then(|p| p.last_handshake);
    SpokeView {
        status: SpokeStatus::from_handshake(last_handshake, now),
        endpoint: peer.and_then(|p| p.endpoint.clone()),
        last_handshake,
        rx_bytes: peer.map_or(0, |p| p.rx_bytes),
        tx_bytes: peer.map_or(0, |p| p.tx_bytes),
        registration,
    }
}
