//! End-to-end tests for user and settings management.
//!
//! These tests verify:
//! 1. User create, update, merge patch and delete
//! 2. Deleting a user also removes their device
//! 3. Settings expose the catalog and change the runtime GPU default

mod helpers;

use helpers::*;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

#[tokio::test]
async fn test_user_crud() {
    let hydra = TestHydra::start().await;

    let created = hydra
        .as_teacher(Method::POST, "/openhydrausers")
        .json(&json!({
            "metadata": {"name": "carol"},
            "spec": {"password": "carol-pw", "role": 2, "email": "carol@lab"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);

    let duplicate = hydra
        .as_teacher(Method::POST, "/openhydrausers")
        .json(&json!({"metadata": {"name": "carol"}, "spec": {"password": "x", "role": 2}}))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let own: Value = hydra
        .as_user(Method::GET, "/openhydrausers/carol", "carol", "carol-pw")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(own["spec"]["email"], "carol@lab");

    let updated = hydra
        .as_teacher(Method::PUT, "/openhydrausers/carol")
        .json(&json!({
            "metadata": {"name": "ignored"},
            "spec": {"password": "carol-pw", "role": 2, "description": "TA"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(updated.status(), StatusCode::OK);
    let updated: Value = updated.json().await.unwrap();
    assert_eq!(updated["metadata"]["name"], "carol");
    assert_eq!(updated["spec"]["description"], "TA");
    assert!(updated["spec"].get("email").is_none());

    let patched: Value = hydra
        .as_teacher(Method::PATCH, "/openhydrausers/carol")
        .header("content-type", "application/merge-patch+json")
        .body(json!({"spec": {"chineseName": "Carol", "description": null}}).to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(patched["spec"]["chineseName"], "Carol");
    assert!(patched["spec"].get("description").is_none());
    assert_eq!(patched["spec"]["password"], "carol-pw");

    let missing = hydra
        .as_teacher(Method::GET, "/openhydrausers/nobody")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    hydra.shutdown().await;
}

#[tokio::test]
async fn test_user_delete_removes_device() {
    let hydra = TestHydra::start().await;

    assert_eq!(hydra.create_device("bob").await.status(), StatusCode::OK);
    assert_eq!(hydra.platform.workload_count(), 1);

    let deleted = hydra
        .as_teacher(Method::DELETE, "/openhydrausers/bob")
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);
    let deleted: Value = deleted.json().await.unwrap();
    assert_eq!(deleted["metadata"]["name"], "bob");
    assert_eq!(hydra.platform.workload_count(), 0);
    assert_eq!(hydra.platform.endpoint_count(), 0);

    let login = hydra
        .anonymous(Method::POST, "/openhydrausers/login/bob")
        .json(&json!({"spec": {"password": "bob-pw"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::UNAUTHORIZED);

    hydra.shutdown().await;
}

#[tokio::test]
async fn test_settings_drive_default_gpu() {
    let hydra = TestHydra::start_with(|mut config| {
        config.use_default_gpu_when_zero = true;
        config
    })
    .await;

    let setting: Value = hydra
        .as_teacher(Method::GET, "/settings/default")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(setting["metadata"]["name"], "default");
    assert_eq!(setting["spec"]["defaultGpuPerDevice"], 0);
    assert!(setting["spec"]["pluginList"]["sandboxes"]["jupyter-lab"].is_object());

    let response = hydra
        .as_teacher(Method::PUT, "/settings/default")
        .json(&json!({"metadata": {"name": "default"}, "spec": {"defaultGpuPerDevice": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let created: Value = hydra.create_device("alice").await.json().await.unwrap();
    assert_eq!(created["spec"]["deviceType"], "gpu");

    let sum: Value = hydra
        .as_teacher(Method::GET, "/sumups")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sum["spec"]["defaultGpuPerDevice"], 1);
    assert_eq!(sum["spec"]["podAllocatable"], 4);

    hydra.shutdown().await;
}
