//! End-to-end tests for dataset and course records.
//!
//! These tests verify:
//! 1. Records are created from JSON, listed, updated and deleted
//! 2. Deleting a record removes its public directory
//! 3. Only privileged users reach the routes
//! 4. Courses are checked against the sandbox catalog

mod helpers;

use helpers::*;
use hydra_core::HydraConfig;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

fn with_public_dirs(config: HydraConfig) -> HydraConfig {
    let datasets = config.workspace_path.join("public-dataset");
    let courses = config.workspace_path.join("public-course");
    HydraConfig {
        public_dataset_base_path: datasets.to_string_lossy().into_owned(),
        public_course_base_path: courses.to_string_lossy().into_owned(),
        ..config
    }
}

#[tokio::test]
async fn test_dataset_crud() {
    let hydra = TestHydra::start_with(with_public_dirs).await;
    let dir = hydra.workspace.path().join("public-dataset").join("mnist");
    std::fs::create_dir_all(dir.join("train")).unwrap();

    let created = hydra
        .as_teacher(Method::POST, "/datasets")
        .json(&json!({"metadata": {"name": "mnist"}, "spec": {"description": "digits"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let created: Value = created.json().await.unwrap();
    assert!(created["spec"]["lastUpdate"].is_string());

    let duplicate = hydra
        .as_teacher(Method::POST, "/datasets")
        .json(&json!({"metadata": {"name": "mnist"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let updated: Value = hydra
        .as_teacher(Method::PUT, "/datasets/mnist")
        .json(&json!({"metadata": {"name": "mnist"}, "spec": {"description": "handwritten"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["spec"]["description"], "handwritten");

    let list: Value = hydra
        .as_teacher(Method::GET, "/datasets")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["items"].as_array().unwrap().len(), 1);

    let deleted = hydra.as_teacher(Method::DELETE, "/datasets/mnist").send().await.unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);
    assert!(!dir.exists());

    let missing = hydra.as_teacher(Method::GET, "/datasets/mnist").send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    hydra.shutdown().await;
}

#[tokio::test]
async fn test_records_are_privileged() {
    let hydra = TestHydra::start().await;

    for path in ["/datasets", "/courses"] {
        let list = hydra
            .as_user(Method::GET, path, "alice", "alice-pw")
            .send()
            .await
            .unwrap();
        assert_eq!(list.status(), StatusCode::FORBIDDEN, "{path}");

        let create = hydra
            .as_user(Method::POST, path, "alice", "alice-pw")
            .json(&json!({"metadata": {"name": "sneaky"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(create.status(), StatusCode::FORBIDDEN, "{path}");

        let anonymous = hydra.anonymous(Method::GET, path).send().await.unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED, "{path}");
    }

    hydra.shutdown().await;
}

#[tokio::test]
async fn test_course_crud() {
    let hydra = TestHydra::start_with(with_public_dirs).await;
    let dir = hydra.workspace.path().join("public-course").join("intro");
    std::fs::create_dir_all(&dir).unwrap();

    let unknown = hydra
        .as_teacher(Method::POST, "/courses")
        .json(&json!({"metadata": {"name": "intro"}, "spec": {"sandboxName": "vscode"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

    let created = hydra
        .as_teacher(Method::POST, "/courses")
        .json(&json!({
            "metadata": {"name": "intro"},
            "spec": {"createdBy": "teacher", "sandboxName": "jupyter-lab", "level": 1}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);

    let updated: Value = hydra
        .as_teacher(Method::PUT, "/courses/intro")
        .json(&json!({
            "metadata": {"name": "intro"},
            "spec": {"level": 2, "description": "basics"}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["spec"]["level"], 2);
    assert_eq!(updated["spec"]["sandboxName"], "jupyter-lab");
    assert_eq!(updated["spec"]["createdBy"], "teacher");

    let course: Value = hydra
        .as_teacher(Method::GET, "/courses/intro")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(course["spec"]["description"], "basics");

    let deleted = hydra.as_teacher(Method::DELETE, "/courses/intro").send().await.unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);
    assert!(!dir.exists());

    let again = hydra.as_teacher(Method::DELETE, "/courses/intro").send().await.unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    hydra.shutdown().await;
}
