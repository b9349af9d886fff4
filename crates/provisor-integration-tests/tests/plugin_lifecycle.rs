//! End-to-end plugin lifecycle against the real stub provisioner process.
//!
//! Covers checksum gating, caching, single-flight loading, handshake
//! failures, unloading and every protocol operation over stdio.

#![cfg(unix)]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::PluginHarness;
use provisor_plugins::{
    CallContext, ChangePackageRequest, CreateServiceRequest, GetUsageRequest, PluginError,
    PowerAction, PowerControlRequest, Provisioner, SuspendRequest, TerminateRequest, sidecar_path,
};
use tokio_util::sync::CancellationToken;

fn ctx() -> CallContext {
    CallContext::with_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_load_and_reuse_cached_client() {
    let h = PluginHarness::new();
    h.install("vps");

    let first = h.manager.get_client("vps").await.unwrap();
    let second = h.manager.get_client("vps").await.unwrap();

    assert!(first.same_channel(&second));
    assert_eq!(h.manager.spawn_count(), 1);
    assert_eq!(first.ping(&ctx()).await.unwrap().message, "pong");
    assert_eq!(h.manager.loaded_modules().await, vec!["vps".to_owned()]);

    h.manager.shutdown_all().await;
}

#[tokio::test]
async fn test_binary_mutation_is_never_executed() {
    let h = PluginHarness::new();
    let binary = h.install("vps");

    let mut bytes = std::fs::read(&binary).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    std::fs::write(&binary, bytes).unwrap();

    let err = h.manager.get_client("vps").await.unwrap_err();
    assert!(matches!(err, PluginError::Integrity { .. }), "{err}");
    assert_eq!(h.manager.spawn_count(), 0);
    assert!(h.requests(&binary).is_empty());
    assert!(!h.manager.is_loaded("vps").await);
}

#[tokio::test]
async fn test_sidecar_mutation_is_never_executed() {
    let h = PluginHarness::new();
    let binary = h.install("vps");

    let sidecar = sidecar_path(&binary);
    let text = std::fs::read_to_string(&sidecar).unwrap();
    let replacement = if text.starts_with('a') { "b" } else { "a" };
    std::fs::write(&sidecar, format!("{replacement}{}", &text[1..])).unwrap();

    let err = h.manager.get_client("vps").await.unwrap_err();
    assert!(matches!(err, PluginError::Integrity { .. }), "{err}");
    assert_eq!(h.manager.spawn_count(), 0);
}

#[tokio::test]
async fn test_missing_sidecar_is_never_executed() {
    let h = PluginHarness::new();
    h.install_unsigned("vps");

    let err = h.manager.get_client("vps").await.unwrap_err();
    assert!(matches!(err, PluginError::Integrity { .. }), "{err}");
    assert_eq!(h.manager.spawn_count(), 0);
}

#[tokio::test]
async fn test_unknown_module_never_substitutes() {
    let h = PluginHarness::new();
    h.install("vps");
    h.install("vps-backup");

    for module in ["dns", "vp", "vps-", "../vps"] {
        let err = h.manager.get_client(module).await.unwrap_err();
        assert!(matches!(err, PluginError::Resolution { .. }), "{module}: {err}");
    }
    assert_eq!(h.manager.spawn_count(), 0);
}

#[tokio::test]
async fn test_handshake_failures_are_fatal() {
    let h = PluginHarness::with_handshake(
        provisor_plugins::HandshakeConfig::default().with_timeout(Duration::from_millis(500)),
    );
    for name in ["vps-bad-version", "vps-bad-cookie", "vps-silent"] {
        h.install(name);
        let err = h.manager.get_client(name).await.unwrap_err();
        assert!(matches!(err, PluginError::Handshake { .. }), "{name}: {err}");
        assert!(err.is_fatal());
        assert!(!h.manager.is_loaded(name).await);
    }
    assert_eq!(h.manager.spawn_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_calls_spawn_once() {
    let h = PluginHarness::new();
    h.install("vps");

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move { manager.get_client("vps").await })
        })
        .collect();
    let mut clients = Vec::new();
    for call in calls {
        clients.push(call.await.unwrap().unwrap());
    }

    assert_eq!(h.manager.spawn_count(), 1);
    for client in &clients[1..] {
        assert!(client.same_channel(&clients[0]));
    }

    h.manager.shutdown_all().await;
}

#[tokio::test]
async fn test_unload_then_reload() {
    let h = PluginHarness::new();
    h.install("vps");

    let before = h.manager.get_client("vps").await.unwrap();
    assert!(h.manager.unload_plugin("vps").await);
    assert!(!h.manager.unload_plugin("vps").await);

    let err = before.ping(&ctx()).await.unwrap_err();
    assert!(matches!(err, PluginError::ChannelClosed { .. }), "{err}");

    let after = h.manager.get_client("vps").await.unwrap();
    assert!(!after.same_channel(&before));
    assert_eq!(h.manager.spawn_count(), 2);
    after.ping(&ctx()).await.unwrap();

    h.manager.shutdown_all().await;
}

#[tokio::test]
async fn test_missing_sidecar_after_unload() {
    let h = PluginHarness::new();
    let binary = h.install("vps");

    h.manager.get_client("vps").await.unwrap();
    h.manager.unload_plugin("vps").await;
    std::fs::remove_file(sidecar_path(&binary)).unwrap();

    let err = h.manager.get_client("vps").await.unwrap_err();
    assert!(matches!(err, PluginError::Integrity { .. }), "{err}");
    assert_eq!(h.manager.spawn_count(), 1);
}

#[tokio::test]
async fn test_every_operation_over_stdio() {
    let h = PluginHarness::new();
    let binary = h.install("vps");
    let client = h.manager.get_client("vps").await.unwrap();
    let ctx = ctx();

    let created = client
        .create_service(
            &ctx,
            CreateServiceRequest {
                service_id: "42".into(),
                customer_id: "1001".into(),
                package_id: "17".into(),
                options: BTreeMap::from([("os".to_owned(), "debian-12".to_owned())]),
                idempotency_key: "service-42-provision".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(created.external_id, "stub-42");

    client
        .suspend(
            &ctx,
            SuspendRequest {
                service_id: "42".into(),
                reason: "overdue".into(),
            },
        )
        .await
        .unwrap();
    client
        .change_package(
            &ctx,
            ChangePackageRequest {
                service_id: "42".into(),
                current_package_id: "17".into(),
                target_package_id: "18".into(),
                reason: "upgrade".into(),
            },
        )
        .await
        .unwrap();
    let power = client
        .power_control(
            &ctx,
            PowerControlRequest {
                service_id: "42".into(),
                action: PowerAction::Stop,
            },
        )
        .await
        .unwrap();
    assert_eq!(power.message, "stop");
    let usage = client
        .get_usage(
            &ctx,
            GetUsageRequest {
                service_id: "42".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(usage.metrics[0].name, "disk");
    client
        .terminate(
            &ctx,
            TerminateRequest {
                service_id: "42".into(),
                reason: "cancelled".into(),
            },
        )
        .await
        .unwrap();

    let methods: Vec<String> = h
        .requests(&binary)
        .iter()
        .map(|r| r["method"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(
        methods,
        [
            "provisioner.create_service",
            "provisioner.suspend",
            "provisioner.change_package",
            "provisioner.power_control",
            "provisioner.get_usage",
            "provisioner.terminate",
        ]
    );

    h.manager.shutdown_all().await;
}

#[tokio::test]
async fn test_cancelled_call_leaves_plugin_running() {
    let h = PluginHarness::new();
    h.install("vps");
    let client = h.manager.get_client("vps").await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = client
        .ping(&CallContext::new().with_cancel(token))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::Cancelled { .. }), "{err}");

    client.ping(&ctx()).await.unwrap();
    assert!(h.manager.is_loaded("vps").await);
    assert_eq!(h.manager.spawn_count(), 1);

    h.manager.shutdown_all().await;
}

#[tokio::test]
async fn test_probe_and_evict_dead() {
    let h = PluginHarness::new();
    h.install("vps");

    h.manager.probe("vps", &ctx()).await.unwrap();
    assert!(h.manager.is_loaded("vps").await);
    assert!(h.manager.evict_dead().await.is_empty());

    h.manager.shutdown_all().await;
    assert!(h.manager.loaded_modules().await.is_empty());
}
