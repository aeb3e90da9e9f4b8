//! End-to-end tests for the device lifecycle.
//!
//! These tests verify:
//! 1. Create provisions a workload and an endpoint and reports `Creating`
//! 2. A second create for the same user conflicts
//! 3. Get, list and the cached view reflect the running pod
//! 4. Delete removes everything and reports `Terminating`
//! 5. The summary counts node capacity and GPU requests

mod helpers;

use helpers::*;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

#[tokio::test]
async fn test_create_get_list_delete() {
    let hydra = TestHydra::start().await;

    let response = hydra.create_device("alice").await;
    assert_eq!(response.status(), StatusCode::OK);
    let created: Value = response.json().await.unwrap();
    assert_eq!(created["spec"]["deviceType"], "cpu");
    assert_eq!(created["spec"]["deviceStatus"], "Creating");
    assert_eq!(hydra.platform.workload_count(), 1);
    assert_eq!(hydra.platform.endpoint_count(), 1);
    assert!(hydra.workspace.path().join("alice").is_dir());

    hydra.mark_running("alice").await;

    let device: Value = hydra
        .as_user(Method::GET, "/devices/alice", "alice", "alice-pw")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(device["spec"]["deviceIP"], "10.42.0.7");
    assert_eq!(device["spec"]["deviceCpu"], "2");
    assert_eq!(device["spec"]["deviceRam"], "8Gi");
    assert_eq!(device["spec"]["sandboxName"], "jupyter-lab");
    assert!(
        device["spec"]["sandboxURLs"]
            .as_str()
            .unwrap()
            .starts_with("http://localhost:30")
    );

    let list: Value = hydra
        .as_teacher(Method::GET, "/devices")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let items = list["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    let bob = items.iter().find(|d| d["metadata"]["name"] == "bob").unwrap();
    assert!(bob["spec"].get("deviceStatus").is_none());

    let cached = hydra
        .as_teacher(Method::PUT, "/devices/alice")
        .send()
        .await
        .unwrap();
    assert_eq!(cached.status(), StatusCode::OK);
    let cached: Value = cached.json().await.unwrap();
    assert_eq!(cached["spec"]["deviceIP"], "10.42.0.7");

    let deleted = hydra
        .as_user(Method::DELETE, "/devices/alice", "alice", "alice-pw")
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);
    let deleted: Value = deleted.json().await.unwrap();
    assert_eq!(deleted["metadata"]["name"], "alice-device");
    assert_eq!(deleted["spec"]["deviceStatus"], "Terminating");
    assert_eq!(deleted["deletionReport"]["steps"].as_array().unwrap().len(), 2);
    assert_eq!(hydra.platform.workload_count(), 0);
    assert_eq!(hydra.platform.endpoint_count(), 0);

    let cached = hydra
        .as_teacher(Method::PUT, "/devices/alice")
        .send()
        .await
        .unwrap();
    assert_eq!(cached.status(), StatusCode::NOT_FOUND);

    hydra.shutdown().await;
}

#[tokio::test]
async fn test_second_create_conflicts() {
    let hydra = TestHydra::start().await;

    assert_eq!(hydra.create_device("bob").await.status(), StatusCode::OK);
    let second = hydra.create_device("bob").await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"], "conflict");
    assert_eq!(hydra.platform.workload_count(), 1);

    hydra.shutdown().await;
}

#[tokio::test]
async fn test_invalid_requests_create_nothing() {
    let hydra = TestHydra::start().await;

    let cases = [
        json!({"spec": {"sandboxName": "jupyter-lab"}}),
        json!({"spec": {"openHydraUsername": "alice"}}),
        json!({"spec": {"openHydraUsername": "ghost", "sandboxName": "jupyter-lab"}}),
        json!({"spec": {"openHydraUsername": "alice", "sandboxName": "rstudio"}}),
        json!({"spec": {
            "openHydraUsername": "alice",
            "sandboxName": "jupyter-lab",
            "deviceGpu": 1,
            "gpuDriver": "intel.com/gpu"
        }}),
    ];
    for body in cases {
        let response = hydra
            .as_teacher(Method::POST, "/devices")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
    }
    assert_eq!(hydra.platform.workload_count(), 0);
    assert_eq!(hydra.platform.endpoint_count(), 0);

    hydra.shutdown().await;
}

#[tokio::test]
async fn test_gpu_device_and_summary() {
    let hydra = TestHydra::start().await;

    let response = hydra
        .as_teacher(Method::POST, "/devices")
        .json(&json!({
            "spec": {"openHydraUsername": "bob", "sandboxName": "jupyter-lab", "deviceGpu": 1}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created: Value = response.json().await.unwrap();
    assert_eq!(created["spec"]["deviceType"], "gpu");

    hydra.mark_running("bob").await;

    let sum: Value = hydra
        .as_user(Method::GET, "/sumups", "alice", "alice-pw")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sum["spec"]["gpuAllocatable"], "4");
    assert_eq!(sum["spec"]["gpuAllocated"], "1");
    assert_eq!(sum["spec"]["podAllocated"], 1);
    assert_eq!(sum["spec"]["defaultCpuPerDevice"], "2");
    assert_eq!(sum["spec"]["gpuResourceSumUp"]["nvidia.com/gpu"]["allocatable"], 4);

    hydra.shutdown().await;
}

#[tokio::test]
async fn test_compat_mode_delete_reports_every_step() {
    let hydra = TestHydra::start_with(|mut config| {
        config.patch_resource_not_release = true;
        config
    })
    .await;

    assert_eq!(hydra.create_device("alice").await.status(), StatusCode::OK);
    let deleted: Value = hydra
        .as_teacher(Method::DELETE, "/devices/alice")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let targets: Vec<&str> = deleted["deletionReport"]["steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|step| step["target"].as_str().unwrap())
        .collect();
    assert_eq!(targets, ["workload", "replica_sets", "pods", "endpoint"]);
    assert_eq!(hydra.platform.pod_count(), 0);

    hydra.shutdown().await;
}
