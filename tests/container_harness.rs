//! Integration tests against a live container engine.
//!
//! Skipped unless `docker info` succeeds; set SKIP_CONTAINER_TESTS=1 to skip
//! explicitly.

#![cfg(feature = "containers")]

use serial_test::serial;
use std::collections::BTreeMap;
use std::time::Duration;
use testrig::compose::{Composer, HarnessDefaults, HarnessSpec, NetworkSpec, ProviderDefaults, generate_id};
use testrig::container::{ContainerOrchestrator, VolumeManager};
use testrig::harness::{
    DockerRuntime, ExecConfig, File, Harness, HarnessRegistry, VolumeClient, VolumeRequest, deadline,
};
use testrig::{HarnessError, env};
use test_tag::tag;
use tokio_util::sync::CancellationToken;

fn should_run_container_tests() -> bool {
    if let Ok(value) = std::env::var("SKIP_CONTAINER_TESTS") {
        if value == "1" || value.eq_ignore_ascii_case("true") {
            return false;
        }
    }

    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_volume_lifecycle() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (docker not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let orchestrator = ContainerOrchestrator::new().await.unwrap();
    let volumes: VolumeManager = orchestrator.volumes();
    let name = format!("{}-volume", generate_id());

    let request = VolumeRequest {
        name: name.clone(),
        target: "/data".to_string(),
        labels: BTreeMap::from([("suite".to_string(), "volumes".to_string())]),
    };
    let mount = volumes.create_volume(&request).await.unwrap();
    assert_eq!(mount.source, name);
    assert_eq!(mount.target, "/data");
    assert_eq!(mount.labels["suite"], "volumes");
    for key in env::default_labels().keys() {
        assert!(mount.labels.contains_key(key), "missing default label {}", key);
    }

    // The engine only sees the caller's labels.
    let inspected = orchestrator
        .client()
        .docker()
        .inspect_volume(&name)
        .await
        .unwrap();
    assert_eq!(inspected.labels.get("suite").map(String::as_str), Some("volumes"));
    for key in env::default_labels().keys() {
        assert!(!inspected.labels.contains_key(key));
    }

    assert!(volumes.volume_exists(&name).await.unwrap());
    volumes.remove_volume(&mount).await.unwrap();
    assert!(!volumes.volume_exists(&name).await.unwrap());

    let err = volumes.remove_volume(&mount).await.unwrap_err();
    assert!(err.is_not_found(), "{}", err);
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_docker_harness_lifecycle() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (docker not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let orchestrator = ContainerOrchestrator::new().await.unwrap();
    let provider = ProviderDefaults {
        envs: BTreeMap::from([("CI".to_string(), "true".to_string())]),
        ..Default::default()
    };
    // The daemon socket bind is dropped so the test needs no socket access
    // inside the container.
    let composer = Composer::new(provider.clone(), std::env::temp_dir()).with_harness_defaults(HarnessDefaults {
        mounts: vec![],
        ..HarnessDefaults::docker(&provider)
    });

    let mut spec = HarnessSpec::new(generate_id());
    spec.image = Some("alpine:3.20".to_string());
    spec.envs.insert("GREETING".to_string(), "hi mom".to_string());

    let mut composed = composer.compose(&spec, &orchestrator.volumes()).await.unwrap();
    let config_volume = composed.config_volume.clone().unwrap();
    composed
        .request
        .files
        .push(File::new("injected\n", "/etc/testrig/hello.txt", 0o644));

    let ctx = CancellationToken::new();
    let registry = HarnessRegistry::new();
    let runtime = DockerRuntime::new(composed, orchestrator.clone());
    registry
        .setup(Harness::new(spec.id.clone(), runtime), &ctx)
        .await
        .unwrap();

    let output = registry
        .exec(&spec.id, &ctx, &ExecConfig::new("echo \"$GREETING $CI\""))
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.text(), "hi mom true\n");

    let output = registry
        .exec(&spec.id, &ctx, &ExecConfig::new("cat hello.txt").with_working_dir("/etc/testrig"))
        .await
        .unwrap();
    assert_eq!(output.text(), "injected\n");

    let output = registry
        .exec(&spec.id, &ctx, &ExecConfig::new("cat \"$DOCKER_CONFIG/config.json\""))
        .await
        .unwrap();
    assert!(output.success(), "{}", output.text());
    assert!(output.text().contains("\"auths\""));

    let output = registry
        .exec(&spec.id, &ctx, &ExecConfig::new("echo oops 1>&2; exit 7"))
        .await
        .unwrap();
    assert_eq!(output.exit_code, Some(7));
    assert_eq!(output.text(), "oops\n");

    // A cancelled exec takes its whole process tree down with it.
    let timeout = deadline(&ctx, Duration::from_millis(500));
    let err = registry
        .exec(&spec.id, &timeout, &ExecConfig::new("sleep 300 & wait"))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Cancelled(_)));
    let output = registry
        .exec(&spec.id, &ctx, &ExecConfig::new("pgrep -x sleep"))
        .await
        .unwrap();
    assert_eq!(output.exit_code, Some(1), "{}", output.text());

    registry.teardown(&spec.id, &ctx).await.unwrap();
    assert!(registry.get(&spec.id).is_none());
    assert!(
        !orchestrator
            .volumes()
            .volume_exists(&config_volume.source)
            .await
            .unwrap()
    );
    let err = orchestrator
        .client()
        .docker()
        .inspect_container(&spec.id, None::<bollard::query_parameters::InspectContainerOptions>)
        .await
        .unwrap_err();
    assert!(HarnessError::from(err).is_not_found());
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_unknown_network_fails_start() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (docker not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let orchestrator = ContainerOrchestrator::new().await.unwrap();
    let provider = ProviderDefaults::default();
    let composer = Composer::new(provider.clone(), std::env::temp_dir()).with_harness_defaults(HarnessDefaults {
        mounts: vec![],
        ..HarnessDefaults::docker(&provider)
    });

    let mut spec = HarnessSpec::new(generate_id());
    spec.image = Some("alpine:3.20".to_string());
    spec.networks.insert(
        "missing".to_string(),
        NetworkSpec {
            name: format!("{}-no-such-network", spec.id),
        },
    );

    let composed = composer.compose(&spec, &orchestrator.volumes()).await.unwrap();
    let config_volume = composed.config_volume.clone().unwrap();
    let ctx = CancellationToken::new();
    let registry = HarnessRegistry::new();
    let err = registry
        .setup(Harness::new(spec.id.clone(), DockerRuntime::new(composed, orchestrator.clone())), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Backend { .. }), "{}", err);
    assert!(registry.get(&spec.id).is_none());

    // The failed start already removed what it created.
    assert!(
        !orchestrator
            .volumes()
            .volume_exists(&config_volume.source)
            .await
            .unwrap()
    );
}
