//! Credential ledger
//!
//! Issues, validates and consumes enrollment credentials. Every
//! read-then-write sequence runs inside `Database::immediate`; consumption
//! itself is a conditional UPDATE so that of N racing callers exactly one
//! wins.

use crate::db::{self, Database};
use crate::keys::validate_public_key;
use crate::pool::{is_valid_address, strip_prefix, AddressPool, DEFAULT_RESERVE_FIRST};
use crate::types::{
    ApplyState, Credential, Enrollment, EnrollmentRequest, GroupQuota, HubSnapshot,
    SpokeRegistration,
};
use crate::{Error, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use ipnetwork::Ipv4Network;
use rand::{rngs::OsRng, RngCore};
use rusqlite::Connection;
use std::net::Ipv4Addr;
use tracing::{debug, info};
use uuid::Uuid;

/// Bytes of entropy in a credential secret
pub const SECRET_BYTES: usize = 32;

/// Length of the URL-safe, unpadded text form of a secret
pub const SECRET_TEXT_LEN: usize = 43;

/// Issuance parameters
#[derive(Debug, Clone)]
pub struct CredentialPolicy {
    pub ttl: Duration,
    pub persistent_keepalive: u16,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
            persistent_keepalive: 25,
        }
    }
}

/// Generate an opaque, URL-safe credential secret
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn check_secret_shape(secret: &str) -> Result<()> {
    let ok = secret.len() == SECRET_TEXT_LEN
        && secret
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidSecret)
    }
}

/// Owner of the credential lifecycle
#[derive(Clone)]
pub struct CredentialLedger {
    db: Database,
    policy: CredentialPolicy,
}

impl CredentialLedger {
    pub fn new(db: Database, policy: CredentialPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &CredentialPolicy {
        &self.policy
    }

    /// Mint a single-use credential and reserve its address
    pub fn issue(
        &self,
        spoke_label: &str,
        hub: &HubSnapshot,
        custom_address: Option<&str>,
    ) -> Result<Credential> {
        let spoke_label = spoke_label.trim();
        if spoke_label.is_empty() {
            return Err(Error::validation("spoke_label", "must not be empty"));
        }
        let pool = AddressPool::new(hub.network_cidr)?;
        let custom = custom_address
            .map(|addr| parse_custom_address(&pool, addr))
            .transpose()?;

        let now = Utc::now();
        let credential = self.db.immediate(|tx| {
            let used = db::used_addresses(tx, hub.interface_address.ip())?;
            let address = match custom {
                Some(addr) if used.contains(&addr.ip()) => {
                    return Err(Error::AddressInUse(addr.ip().to_string()))
                }
                Some(addr) => addr,
                None => pool.allocate(&used, DEFAULT_RESERVE_FIRST)?,
            };

            let credential = Credential {
                id: Uuid::new_v4(),
                secret: generate_secret(),
                spoke_id: Uuid::new_v4(),
                spoke_label: spoke_label.to_string(),
                allocated: vec![address],
                hub: hub.clone(),
                created_at: now,
                expires_at: now + self.policy.ttl,
                used_at: None,
                consumed: false,
                group: None,
                persistent_keepalive: self.policy.persistent_keepalive,
            };
            db::insert_credential(tx, &credential)?;
            Ok(credential)
        })?;

        info!(
            "Issued credential {} for {} at {}",
            credential.id, credential.spoke_label, credential.allocated[0]
        );
        Ok(credential)
    }

    /// Mint a group credential usable by up to `max_uses` distinct hosts.
    /// Addresses are allocated per host at enrollment.
    pub fn issue_group(
        &self,
        group_name: &str,
        hub: &HubSnapshot,
        max_uses: Option<u32>,
    ) -> Result<Credential> {
        let group_name = group_name.trim();
        if group_name.is_empty() {
            return Err(Error::validation("group_name", "must not be empty"));
        }
        if max_uses == Some(0) {
            return Err(Error::validation("max_uses", "must be at least 1"));
        }

        let now = Utc::now();
        let credential = Credential {
            id: Uuid::new_v4(),
            secret: generate_secret(),
            spoke_id: Uuid::new_v4(),
            spoke_label: group_name.to_string(),
            allocated: Vec::new(),
            hub: hub.clone(),
            created_at: now,
            expires_at: now + self.policy.ttl,
            used_at: None,
            consumed: false,
            group: Some(GroupQuota {
                group_name: group_name.to_string(),
                max_uses,
                use_count: 0,
            }),
            persistent_keepalive: self.policy.persistent_keepalive,
        };
        self.db.with_conn(|conn| db::insert_credential(conn, &credential))?;

        info!(
            "Issued group credential {} for {} (max uses: {})",
            credential.id,
            group_name,
            max_uses.map_or_else(|| "unlimited".to_string(), |m| m.to_string())
        );
        Ok(credential)
    }

    /// Read-only check that `secret` could be consumed right now
    pub fn validate(&self, secret: &str) -> Result<Credential> {
        check_secret_shape(secret)?;
        let now = Utc::now();
        self.db.with_conn(|conn| {
            let credential = load_unexpired(conn, secret, now)?;
            ensure_usable(&credential)?;
            Ok(credential)
        })
    }

    /// Validate and atomically consume one use of `secret`
    pub fn consume(&self, secret: &str) -> Result<Credential> {
        check_secret_shape(secret)?;
        let now = Utc::now();
        let credential = self.db.with_conn(|conn| {
            let credential = load_unexpired(conn, secret, now)?;
            ensure_usable(&credential)?;
            consume_row(conn, credential, now)
        })?;
        info!("Consumed credential {}", credential.id);
        Ok(credential)
    }

    /// Consume a credential and record the spoke's registration as one unit
    pub fn enroll(&self, request: &EnrollmentRequest) -> Result<Enrollment> {
        check_secret_shape(&request.secret)?;
        validate_public_key(&request.public_key)?;
        let hostname = request
            .hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());
        let machine_id = request
            .machine_id
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty());
        let cluster_name = request
            .cluster_name
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let now = Utc::now();
        let enrollment = self.db.immediate(|tx| {
            let credential = load_unexpired(tx, &request.secret, now)?;

            let (registration_id, name, allocated) = match &credential.group {
                Some(group) => {
                    let hostname = hostname.ok_or_else(|| {
                        Error::validation("hostname", "required for group credentials")
                    })?;
                    // A host re-enrolling is rejected before the quota is looked at
                    if let Some(existing) =
                        db::find_group_duplicate(tx, credential.id, hostname, machine_id)?
                    {
                        return Err(Error::DuplicateEnrollment { existing });
                    }
                    ensure_usable(&credential)?;
                    ensure_key_free(tx, &request.public_key)?;

                    let pool = AddressPool::new(credential.hub.network_cidr)?;
                    let used = db::used_addresses(tx, credential.hub.interface_address.ip())?;
                    let address = pool.allocate(&used, DEFAULT_RESERVE_FIRST)?;
                    (
                        Uuid::new_v4(),
                        format!("{}-{}", group.group_name, hostname),
                        vec![address],
                    )
                }
                None => {
                    ensure_usable(&credential)?;
                    ensure_key_free(tx, &request.public_key)?;
                    (
                        credential.spoke_id,
                        credential.spoke_label.clone(),
                        credential.allocated.clone(),
                    )
                }
            };

            let cluster_id = match cluster_name {
                Some(cluster) => Some(db::get_or_create_cluster(tx, cluster, now)?.id),
                None => None,
            };

            let credential = consume_row(tx, credential, now)?;

            let registration = SpokeRegistration {
                id: registration_id,
                credential_id: credential.id,
                name,
                public_key: request.public_key.trim().to_string(),
                allocated,
                registered_at: now,
                platform: request.platform,
                hostname: hostname.map(str::to_string),
                machine_id: machine_id.map(str::to_string),
                local_ip: request.local_ip.clone(),
                cluster_id,
                apply_state: ApplyState::Provisioning,
                metadata: request.metadata.clone(),
            };
            db::insert_registration(tx, &registration)?;

            Ok(Enrollment {
                registration,
                credential,
            })
        })?;

        info!(
            "Enrolled spoke {} ({}) with credential {}",
            enrollment.registration.name, enrollment.registration.id, enrollment.credential.id
        );
        Ok(enrollment)
    }

    /// Delete a credential that has never been used. Used credentials are
    /// kept for audit and `false` is returned.
    pub fn revoke(&self, id: Uuid) -> Result<bool> {
        let removed = self
            .db
            .with_conn(|conn| db::delete_unused_credential(conn, id))?;
        if removed > 0 {
            info!("Revoked credential {}", id);
        } else {
            debug!("Credential {} not revoked (missing or used)", id);
        }
        Ok(removed > 0)
    }

    /// Delete never-used credentials past expiry
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let removed = self
            .db
            .with_conn(|conn| db::delete_expired_credentials(conn, now))?;
        if removed > 0 {
            info!("Swept {} expired credentials", removed);
        }
        Ok(removed)
    }

    pub fn get(&self, id: Uuid) -> Result<Credential> {
        self.db
            .credential(id)?
            .ok_or_else(|| Error::not_found("credential", id))
    }

    pub fn list(&self) -> Result<Vec<Credential>> {
        self.db.list_credentials()
    }
}

/// Parse an operator-chosen address and place it in the pool's prefix
fn parse_custom_address(pool: &AddressPool, address: &str) -> Result<Ipv4Network> {
    let invalid = || Error::InvalidCustomAddress {
        address: address.to_string(),
        network: pool.network().to_string(),
    };
    if !is_valid_address(address) {
        return Err(invalid());
    }
    let ip: Ipv4Addr = strip_prefix(address).parse().map_err(|_| invalid())?;
    if !pool.contains(ip) || pool.is_reserved(ip) {
        return Err(invalid());
    }
    Ok(Ipv4Network::new(ip, pool.prefix())?)
}

fn load_unexpired(conn: &Connection, secret: &str, now: DateTime<Utc>) -> Result<Credential> {
    let credential = db::credential_by_secret(conn, secret)?.ok_or(Error::CredentialNotFound)?;
    if credential.is_expired(now) {
        return Err(Error::CredentialExpired);
    }
    Ok(credential)
}

fn ensure_usable(credential: &Credential) -> Result<()> {
    match &credential.group {
        Some(quota) if quota.exhausted() => Err(Error::GroupLimitReached {
            limit: quota.max_uses.unwrap_or_default(),
        }),
        Some(_) => Ok(()),
        None if credential.consumed => Err(Error::CredentialAlreadyUsed),
        None => Ok(()),
    }
}

fn ensure_key_free(conn: &Connection, public_key: &str) -> Result<()> {
    if db::public_key_registered(conn, public_key.trim())? {
        return Err(Error::DuplicatePublicKey);
    }
    Ok(())
}

/// Apply the conditional consumption update and reflect it in `credential`
fn consume_row(conn: &Connection, mut credential: Credential, now: DateTime<Utc>) -> Result<Credential> {
    match credential.group.as_mut() {
        Some(quota) => {
            if db::increment_group_use(conn, credential.id, now)? == 0 {
                return Err(Error::GroupLimitReached {
                    limit: quota.max_uses.unwrap_or_default(),
                });
            }
            quota.use_count += 1;
        }
        None => {
            if db::mark_consumed(conn, credential.id, now)? == 0 {
                return Err(Error::CredentialAlreadyUsed);
            }
            credential.consumed = true;
        }
    }
    credential.used_at = Some(now);
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::WgKeyPair;
    use crate::types::Platform;

    fn snapshot(cidr: &str) -> HubSnapshot {
        let pool = AddressPool::parse(cidr).unwrap();
        HubSnapshot {
            interface_address: pool.hub_address(),
            public_endpoint: "vpn.example.com:51820".to_string(),
            private_endpoint: None,
            public_key: WgKeyPair::generate().public_key,
            network_cidr: pool.network(),
            dns: vec!["1.1.1.1".to_string()],
        }
    }

    fn ledger() -> CredentialLedger {
        CredentialLedger::new(Database::open_memory().unwrap(), CredentialPolicy::default())
    }

    fn request(secret: &str, hostname: Option<&str>) -> EnrollmentRequest {
        EnrollmentRequest {
            secret: secret.to_string(),
            public_key: WgKeyPair::generate().public_key,
            platform: Platform::Linux,
            hostname: hostname.map(str::to_string),
            machine_id: None,
            local_ip: None,
            cluster_name: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_TEXT_LEN);
        assert!(check_secret_shape(&secret).is_ok());
        assert!(check_secret_shape("short").is_err());
        assert!(check_secret_shape(&"+".repeat(SECRET_TEXT_LEN)).is_err());
        assert_ne!(generate_secret(), secret);
    }

    #[test]
    fn test_issue_skips_hub_address() {
        let ledger = ledger();
        let hub = snapshot("10.0.1.0/24");
        let a = ledger.issue("alpha", &hub, None).unwrap();
        let b = ledger.issue("beta", &hub, None).unwrap();
        assert_eq!(a.allocated[0].to_string(), "10.0.1.2/24");
        assert_eq!(b.allocated[0].to_string(), "10.0.1.3/24");
        assert!(!a.consumed);
        assert_eq!(a.expires_at - a.created_at, Duration::hours(24));
    }

    #[test]
    fn test_issue_custom_address() {
        let ledger = ledger();
        let hub = snapshot("10.0.1.0/24");
        let c = ledger.issue("alpha", &hub, Some("10.0.1.50")).unwrap();
        assert_eq!(c.allocated[0].to_string(), "10.0.1.50/24");

        let err = ledger.issue("beta", &hub, Some("10.0.1.50/32")).unwrap_err();
        assert!(matches!(err, Error::AddressInUse(_)));

        let err = ledger.issue("beta", &hub, Some("10.0.1.1")).unwrap_err();
        assert!(matches!(err, Error::AddressInUse(_)));

        for bad in ["10.0.2.5", "10.0.1.0", "10.0.1.255", "not-an-ip"] {
            let err = ledger.issue("beta", &hub, Some(bad)).unwrap_err();
            assert!(matches!(err, Error::InvalidCustomAddress { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_validate_then_consume() {
        let ledger = ledger();
        let c = ledger.issue("alpha", &snapshot("10.0.1.0/24"), None).unwrap();

        assert_eq!(ledger.validate(&c.secret).unwrap().id, c.id);
        let consumed = ledger.consume(&c.secret).unwrap();
        assert!(consumed.consumed);
        assert!(consumed.used_at.is_some());

        assert!(matches!(ledger.validate(&c.secret), Err(Error::CredentialAlreadyUsed)));
        assert!(matches!(ledger.consume(&c.secret), Err(Error::CredentialAlreadyUsed)));
        assert!(matches!(
            ledger.validate(&generate_secret()),
            Err(Error::CredentialNotFound)
        ));
        assert!(matches!(ledger.validate("nope"), Err(Error::InvalidSecret)));
    }

    #[test]
    fn test_revoke_keeps_used_credentials() {
        let ledger = ledger();
        let hub = snapshot("10.0.1.0/24");
        let fresh = ledger.issue("alpha", &hub, None).unwrap();
        let used = ledger.issue("beta", &hub, None).unwrap();
        ledger.consume(&used.secret).unwrap();

        assert!(ledger.revoke(fresh.id).unwrap());
        assert!(!ledger.revoke(fresh.id).unwrap());
        assert!(!ledger.revoke(used.id).unwrap());
        assert!(ledger.get(used.id).is_ok());
        assert!(matches!(ledger.get(fresh.id), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_sweep_only_touches_unused_expired() {
        let db = Database::open_memory().unwrap();
        let expired = CredentialLedger::new(
            db.clone(),
            CredentialPolicy {
                ttl: Duration::seconds(-1),
                persistent_keepalive: 25,
            },
        );
        let live = CredentialLedger::new(db, CredentialPolicy::default());
        let hub = snapshot("10.0.1.0/24");

        expired.issue("stale", &hub, None).unwrap();
        live.issue("fresh", &hub, None).unwrap();
        assert_eq!(live.sweep_expired().unwrap(), 1);
        assert_eq!(live.list().unwrap().len(), 1);
    }

    #[test]
    fn test_single_use_enroll() {
        let ledger = ledger();
        let c = ledger.issue("alpha", &snapshot("10.0.1.0/24"), None).unwrap();
        let e = ledger.enroll(&request(&c.secret, None)).unwrap();
        assert_eq!(e.registration.id, c.spoke_id);
        assert_eq!(e.registration.name, "alpha");
        assert_eq!(e.registration.allocated, c.allocated);
        assert_eq!(e.registration.apply_state, ApplyState::Provisioning);
        assert!(e.credential.consumed);

        let err = ledger.enroll(&request(&c.secret, None)).unwrap_err();
        assert!(matches!(err, Error::CredentialAlreadyUsed));
    }

    #[test]
    fn test_enroll_rejects_registered_key() {
        let ledger = ledger();
        let hub = snapshot("10.0.1.0/24");
        let a = ledger.issue("alpha", &hub, None).unwrap();
        let b = ledger.issue("beta", &hub, None).unwrap();

        let first = request(&a.secret, None);
        ledger.enroll(&first).unwrap();

        let mut second = request(&b.secret, None);
        second.public_key = first.public_key.clone();
        assert!(matches!(ledger.enroll(&second), Err(Error::DuplicatePublicKey)));
        // The losing credential is left unconsumed
        assert!(ledger.validate(&b.secret).is_ok());
    }

    #[test]
    fn test_group_enroll_names_and_clusters() {
        let ledger = ledger();
        let g = ledger
            .issue_group("pve", &snapshot("10.0.1.0/24"), Some(5))
            .unwrap();
        assert!(g.allocated.is_empty());

        let mut req = request(&g.secret, Some("node1"));
        req.cluster_name = Some("east".to_string());
        let e = ledger.enroll(&req).unwrap();
        assert_eq!(e.registration.name, "pve-node1");
        assert_eq!(e.registration.allocated[0].to_string(), "10.0.1.2/24");
        assert!(e.registration.cluster_id.is_some());
        assert_eq!(e.credential.group.as_ref().unwrap().use_count, 1);

        let missing_host = request(&g.secret, None);
        assert!(matches!(ledger.enroll(&missing_host), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_issue_group_rejects_zero_limit() {
        let ledger = ledger();
        let err = ledger
            .issue_group("pve", &snapshot("10.0.1.0/24"), Some(0))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
