//! Credential expiry and group enrollment rules, end to end through HubService

use chrono::Duration;
use hubspoke_common::wireguard::exec::testing::FakeRunner;
use hubspoke_common::{
    CredentialPolicy, Database, EnrollmentRequest, Error, HubInitConfig, HubService,
    PeerReconciler, Platform, ReconcilerConfig, StatusMode, WgKeyPair,
};
use std::sync::Arc;
use tempfile::TempDir;

struct Hub {
    _dir: TempDir,
    runner: FakeRunner,
    service: HubService,
}

async fn hub_with(policy: CredentialPolicy) -> Hub {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::new();
    let reconciler = PeerReconciler::open(
        ReconcilerConfig {
            interface: "wg0".to_string(),
            config_dir: dir.path().join("wireguard"),
            status_mode: StatusMode::Dump,
        },
        Arc::new(runner.clone()),
    )
    .unwrap();
    let db = Database::open(dir.path().join("registry.db")).unwrap();
    let service = HubService::new(db, policy, Arc::new(reconciler));
    service
        .initialize(HubInitConfig {
            network_cidr: "10.8.0.0/24".to_string(),
            listen_port: 51820,
            public_endpoint: "hub.example.net:51820".to_string(),
            private_endpoint: Some("192.168.1.10:51820".to_string()),
            dns: vec!["10.8.0.1".to_string()],
        })
        .await
        .unwrap();
    Hub {
        _dir: dir,
        runner,
        service,
    }
}

async fn hub() -> Hub {
    hub_with(CredentialPolicy::default()).await
}

fn host(secret: &str, hostname: &str, machine_id: Option<&str>) -> EnrollmentRequest {
    EnrollmentRequest {
        secret: secret.to_string(),
        public_key: WgKeyPair::generate().public_key,
        platform: Platform::Proxmox,
        hostname: Some(hostname.to_string()),
        machine_id: machine_id.map(str::to_string),
        local_ip: Some("192.168.1.50".to_string()),
        cluster_name: Some("pve-lab".to_string()),
        metadata: serde_json::json!({ "kernel": "6.8" }),
    }
}

#[tokio::test]
async fn expired_credential_is_rejected_by_validate_and_consume() {
    let hub = hub_with(CredentialPolicy {
        ttl: Duration::seconds(-5),
        persistent_keepalive: 25,
    })
    .await;
    let credential = hub.service.issue_credential("late", None).unwrap();
    assert!(!credential.consumed);

    assert!(matches!(
        hub.service.validate_credential(&credential.secret),
        Err(Error::CredentialExpired)
    ));
    assert!(matches!(
        hub.service.consume_credential(&credential.secret),
        Err(Error::CredentialExpired)
    ));
    let err = hub
        .service
        .register_spoke(host(&credential.secret, "late-host", None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOKEN_EXPIRED");

    // Never consumed, so sweeping removes it
    assert_eq!(hub.service.sweep_expired().unwrap(), 1);
}

#[tokio::test]
async fn group_credential_admits_three_hosts_then_stops() {
    let hub = hub().await;
    let group = hub.service.issue_group_credential("pve", Some(3)).unwrap();

    let mut addresses = Vec::new();
    for name in ["node1", "node2", "node3"] {
        let enrollment = hub
            .service
            .register_spoke(host(&group.secret, name, None))
            .await
            .unwrap();
        assert_eq!(enrollment.registration.name, format!("pve-{}", name));
        addresses.push(enrollment.registration.allocated[0].ip().to_string());
    }
    assert_eq!(addresses, vec!["10.8.0.2", "10.8.0.3", "10.8.0.4"]);

    let err = hub
        .service
        .register_spoke(host(&group.secret, "node4", None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::GroupLimitReached { limit: 3 }));

    // A known host is reported as a duplicate, not as over quota
    let err = hub
        .service
        .register_spoke(host(&group.secret, "node2", None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateEnrollment { ref existing } if existing == "pve-node2"));

    assert_eq!(hub.service.reconciler().peers().await.unwrap().len(), 3);
    let clusters = hub.service.list_clusters().unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].cluster.name, "pve-lab");
    assert_eq!(clusters[0].spoke_ids.len(), 3);
}

#[tokio::test]
async fn duplicate_host_is_rejected_while_quota_remains() {
    let hub = hub().await;
    let group = hub.service.issue_group_credential("edge", Some(10)).unwrap();

    hub.service
        .register_spoke(host(&group.secret, "gw-a", Some("machine-a")))
        .await
        .unwrap();

    let same_name = hub
        .service
        .register_spoke(host(&group.secret, "gw-a", Some("machine-b")))
        .await
        .unwrap_err();
    assert_eq!(same_name.code(), "DUPLICATE_GROUP_REGISTRATION");

    let same_machine = hub
        .service
        .register_spoke(host(&group.secret, "gw-renamed", Some("machine-a")))
        .await
        .unwrap_err();
    assert_eq!(same_machine.code(), "DUPLICATE_GROUP_REGISTRATION");

    let credential = hub.service.credential(group.id).unwrap();
    assert_eq!(credential.group.unwrap().use_count, 1);
}

#[tokio::test]
async fn used_group_credential_survives_revoke_and_sweep() {
    let hub = hub().await;
    let group = hub.service.issue_group_credential("edge", None).unwrap();
    hub.service
        .register_spoke(host(&group.secret, "gw-a", None))
        .await
        .unwrap();

    assert!(!hub.service.revoke_credential(group.id).unwrap());
    assert_eq!(hub.service.sweep_expired().unwrap(), 0);
    assert!(hub.service.credential(group.id).is_ok());
}

#[tokio::test]
async fn every_peer_change_goes_through_syncconf() {
    let hub = hub().await;
    let credential = hub.service.issue_credential("solo", None).unwrap();
    let enrollment = hub
        .service
        .register_spoke(host(&credential.secret, "solo-host", None))
        .await
        .unwrap();
    hub.service
        .remove_spoke(enrollment.registration.id)
        .await
        .unwrap();

    assert_eq!(hub.runner.count("wg syncconf wg0"), 2);
    assert_eq!(hub.runner.count("systemctl restart"), 0);
    let applied = hub.runner.synced();
    assert!(applied[0].contains(&enrollment.registration.public_key));
    assert!(!applied[1].contains(&enrollment.registration.public_key));
}
