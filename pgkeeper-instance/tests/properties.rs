//! Behavioural guarantees of the reconciler, checked across input ranges.

mod common;

use common::{configmap_event, encode, pem, secret_event};
use pgkeeper_engine::MemoryFiles;
use pgkeeper_engine::testing::{InstanceCall, MockAdminDatabase, MockInstance};
use pgkeeper_instance::config::CertificateLocations;
use pgkeeper_instance::reconciler::{
    ConfigMaterializer, ConfigOutcome, PrivilegeProvisioner, PromotionCoordinator,
    RestartDecision, SecretMaterializer, SecretOutcome,
};
use pgkeeper_instance::retry::{BackoffPolicy, CasOutcome, compare_and_swap};
use pgkeeper_instance::status::{ClusterStatusStore, MemoryStatusStore};
use pgkeeper_instance::testing::{self, TestHarness};
use pgkeeper_instance::{ChangeType, InstanceError};
use serde_json::json;
use std::path::PathBuf;

#[tokio::test]
async fn test_stale_writer_never_overwrites_concurrent_change() {
    let store = MemoryStatusStore::new(testing::cluster(3, Some("db-1")));
    let stale = store.get().await.unwrap();

    // Another instance updates the record first
    let mut other = store.get().await.unwrap();
    other.set_current_primary("db-1");
    other.status.as_mut().unwrap().pending_restart = Some(true);
    store.update_status(&other).await.unwrap();

    let outcome = compare_and_swap(
        &BackoffPolicy::status_update(),
        stale,
        InstanceError::is_conflict,
        |mut record: pgkeeper_instance::Cluster| {
            record.set_current_primary("db-2");
            let store = &store;
            async move { store.update_status(&record).await }
        },
        || store.get(),
    )
    .await;

    assert!(matches!(outcome, CasOutcome::Applied { attempts: 2, .. }));
    let stored = store.snapshot();
    let status = stored.status.unwrap();
    assert_eq!(status.current_primary.as_deref(), Some("db-2"));
    assert_eq!(status.pending_restart, Some(true));
    assert_eq!(store.conflicts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_promotion_waits_for_receiver_and_replay() {
    let sequences: [(Vec<bool>, Vec<i64>); 4] = [
        (vec![false], vec![0]),
        (vec![true, true, true, false], vec![0]),
        (vec![false], vec![4096, 2048, 16, 0]),
        (vec![true, true, false], vec![900, 400, 100, -8]),
    ];

    for (receiver, lag) in sequences {
        let harness = TestHarness::new(
            MockInstance::replica()
                .with_wal_receiver(receiver.clone())
                .with_apply_lag(lag.clone()),
        );
        let ctx = harness.context();
        let record = harness.store.get().await.unwrap();

        PromotionCoordinator::new(&ctx).run(record).await.unwrap();

        let calls = harness.instance.calls();
        let promote = calls
            .iter()
            .position(|c| *c == InstanceCall::Promote)
            .expect("promoted");
        let before = &calls[..promote];

        let receiver_polls: Vec<bool> = before
            .iter()
            .filter_map(|c| match c {
                InstanceCall::WalReceiverActive(active) => Some(*active),
                _ => None,
            })
            .collect();
        let lag_polls: Vec<i64> = before
            .iter()
            .filter_map(|c| match c {
                InstanceCall::ApplyLag(lag) => Some(*lag),
                _ => None,
            })
            .collect();

        assert_eq!(receiver_polls, receiver);
        assert_eq!(lag_polls, lag);
        assert_eq!(receiver_polls.last(), Some(&false));
        assert!(lag_polls.last().is_some_and(|lag| *lag <= 0));

        // Replay lag is only checked once the receiver has stopped
        let last_receiver = before
            .iter()
            .rposition(|c| matches!(c, InstanceCall::WalReceiverActive(_)))
            .unwrap();
        let first_lag = before
            .iter()
            .position(|c| matches!(c, InstanceCall::ApplyLag(_)))
            .unwrap();
        assert!(last_receiver < first_lag);
    }
}

#[tokio::test]
async fn test_certificate_pairs_are_all_or_nothing() {
    let cert = encode(&pem("CERTIFICATE"));
    let key = encode(&pem("PRIVATE KEY"));
    let cases = [
        (json!({ "tls.crt": cert, "tls.key": key }), true),
        (json!({ "tls.crt": cert, "tls.key": "***" }), false),
        (json!({ "tls.crt": "***", "tls.key": key }), false),
        (json!({ "tls.crt": cert }), false),
        (json!({ "tls.key": key }), false),
    ];

    for name in ["db-server", "db-replication"] {
        for (data, valid) in &cases {
            let harness = TestHarness::new(MockInstance::replica());
            let ctx = harness.context();
            let event = secret_event(ChangeType::Modified, name, data.clone());

            let result = SecretMaterializer::new(&ctx).reconcile(&event).await;

            if *valid {
                assert!(matches!(result, Ok(SecretOutcome::Refreshed(_))));
                assert_eq!(harness.files.len(), 2);
                assert_eq!(harness.instance.reloads(), 1);
            } else {
                assert!(result.is_err(), "{name} {data} should fail");
                assert_eq!(harness.files.len(), 0);
                assert_eq!(harness.instance.reloads(), 0);
            }
        }
    }
}

#[tokio::test]
async fn test_failed_write_never_leaves_half_a_pair() {
    let data = json!({
        "tls.crt": encode(&pem("CERTIFICATE")),
        "tls.key": encode(&pem("PRIVATE KEY")),
    });

    for (name, failing) in [
        ("db-server", "/certs/server.crt"),
        ("db-server", "/certs/server.key"),
        ("db-replication", "/certs/streaming_replica.crt"),
        ("db-replication", "/certs/streaming_replica.key"),
    ] {
        let harness = TestHarness::new(MockInstance::replica())
            .with_files(MemoryFiles::new().failing_on(failing));
        let ctx = harness.context();

        let result = SecretMaterializer::new(&ctx)
            .reconcile(&secret_event(ChangeType::Modified, name, data.clone()))
            .await;

        assert!(result.is_err(), "{name} with {failing} refused");
        assert!(harness.files.is_empty(), "{name}: {:?}", harness.files.paths());
        assert_eq!(harness.instance.reloads(), 0);
    }
}

#[tokio::test]
async fn test_restart_decision_for_every_combination() {
    let table = [
        (false, false, 1, RestartDecision::None),
        (false, false, 3, RestartDecision::None),
        (false, true, 1, RestartDecision::None),
        (false, true, 3, RestartDecision::None),
        (true, false, 1, RestartDecision::RestartNow),
        (true, false, 3, RestartDecision::RestartNow),
        (true, true, 1, RestartDecision::RestartNow),
        (true, true, 3, RestartDecision::Defer),
    ];

    for (pending, primary, instances, expected) in table {
        let instance = if primary {
            MockInstance::primary()
        } else {
            MockInstance::replica()
        };
        let harness = TestHarness::new(instance.with_pending_restart(pending))
            .with_cluster(instances, Some(testing::POD_NAME));
        let ctx = harness.context();

        let outcome = ConfigMaterializer::new(&ctx)
            .reconcile(&configmap_event(
                ChangeType::Modified,
                json!({ "max_connections": "200" }),
            ))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ConfigOutcome::Applied(expected),
            "pending={pending} primary={primary} instances={instances}"
        );
        let restarted = expected == RestartDecision::RestartNow;
        assert_eq!(harness.instance.shutdowns(), usize::from(restarted));
    }
}

#[tokio::test]
async fn test_added_configmaps_and_secrets_are_ignored() {
    let payloads = [
        json!({ "max_connections": "200" }),
        json!({ "tls.crt": "***", "tls.key": "***" }),
        json!({}),
        json!(null),
    ];

    for data in payloads {
        let harness = TestHarness::new(MockInstance::primary().with_pending_restart(true));
        let ctx = harness.context();

        let config = ConfigMaterializer::new(&ctx)
            .reconcile(&configmap_event(ChangeType::Added, data.clone()))
            .await
            .unwrap();
        let secret = SecretMaterializer::new(&ctx)
            .reconcile(&secret_event(ChangeType::Added, "db-server", data))
            .await
            .unwrap();

        assert_eq!(config, ConfigOutcome::Ignored);
        assert_eq!(secret, SecretOutcome::Ignored);
        assert!(harness.files.is_empty());
        assert!(harness.instance.calls().is_empty());
    }
}

#[tokio::test]
async fn test_provisioning_is_idempotent() {
    for version in [9, 10, 11, 13, 16] {
        let harness = TestHarness::new(
            MockInstance::primary()
                .with_major_version(version)
                .with_admin(MockAdminDatabase::new()),
        );
        let ctx = harness.context();
        let provisioner = PrivilegeProvisioner::new(&ctx);

        let first = provisioner.run().await.unwrap();
        let second = provisioner.run().await.unwrap();

        assert!(!first.is_noop(), "version {version}");
        assert!(second.is_noop(), "version {version}");
        assert_eq!(harness.admin().statements(), first.statements);
    }
}

#[tokio::test]
async fn test_certificates_land_in_configured_directory() {
    let harness = TestHarness::new(MockInstance::replica())
        .with_config(|c| c.certificates = CertificateLocations::in_dir("/tls"));
    let ctx = harness.context();

    SecretMaterializer::new(&ctx)
        .reconcile(&secret_event(
            ChangeType::Modified,
            "db-ca",
            json!({ "ca.crt": encode(&pem("CERTIFICATE")) }),
        ))
        .await
        .unwrap();

    assert_eq!(harness.files.paths(), vec![PathBuf::from("/tls/ca.crt")]);
}
