//! HTTP request handlers for the API.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use hydra_core::service::DeletionReport;
use hydra_core::{Caller, Course, Dataset, Device, Setting, SumUp, User};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::ApiResult;
use crate::state::AppState;

/// A list response, `{"items": [...]}`.
#[derive(Debug, Serialize)]
pub struct ItemList<T> {
    /// Items.
    pub items: Vec<T>,
}

/// Response of a device delete.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDeletion {
    /// The device as it is now: terminating.
    #[serde(flatten)]
    pub device: Device,
    /// Outcome of every deletion step.
    pub deletion_report: DeletionReport,
}

/// One discoverable resource.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResource {
    /// Plural path segment.
    pub name: &'static str,
    /// Short name.
    pub singular_name: &'static str,
    /// Always false; every resource is cluster scoped.
    pub namespaced: bool,
    /// Kind.
    pub kind: &'static str,
    /// Supported verbs.
    pub verbs: &'static [&'static str],
}

/// Discovery document for `/apis/{group}/v1`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceList {
    /// Always `APIResourceList`.
    pub kind: &'static str,
    /// `{group}/v1`.
    pub group_version: String,
    /// Served resources.
    pub resources: Vec<ApiResource>,
}

/// Discovery document for one API group.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroup {
    /// Always `APIGroup`.
    pub kind: &'static str,
    /// Group name.
    pub name: String,
    /// Served versions.
    pub versions: Vec<String>,
}

/// Discovery document for `/apis`.
#[derive(Debug, Serialize)]
pub struct ApiGroupList {
    /// Always `APIGroupList`.
    pub kind: &'static str,
    /// Served groups.
    pub groups: Vec<ApiGroup>,
}

const FULL_VERBS: &[&str] = &["get", "list", "watch", "create", "update", "delete", "patch"];

const RECORD_VERBS: &[&str] = &["get", "list", "watch", "create", "update", "delete"];

fn resources() -> Vec<ApiResource> {
    vec![
        ApiResource {
            name: "openhydrausers",
            singular_name: "xuser",
            namespaced: false,
            kind: "OpenHydraUser",
            verbs: FULL_VERBS,
        },
        ApiResource {
            name: "devices",
            singular_name: "dev",
            namespaced: false,
            kind: "Device",
            verbs: FULL_VERBS,
        },
        ApiResource {
            name: "sumups",
            singular_name: "xsu",
            namespaced: false,
            kind: "SumUp",
            verbs: &["get"],
        },
        ApiResource {
            name: "datasets",
            singular_name: "xds",
            namespaced: false,
            kind: "Dataset",
            verbs: RECORD_VERBS,
        },
        ApiResource {
            name: "settings",
            singular_name: "setting",
            namespaced: false,
            kind: "Setting",
            verbs: &["get", "update"],
        },
        ApiResource {
            name: "courses",
            singular_name: "course",
            namespaced: false,
            kind: "Course",
            verbs: RECORD_VERBS,
        },
    ]
}

fn group_of(state: &AppState) -> ApiGroup {
    let group = state.config().group.clone();
    ApiGroup {
        kind: "APIGroup",
        versions: vec![format!("{group}/v1")],
        name: group,
    }
}

/// Handle GET /apis.
pub async fn api_group_list(State(state): State<Arc<AppState>>) -> Json<ApiGroupList> {
    Json(ApiGroupList {
        kind: "APIGroupList",
        groups: vec![group_of(&state)],
    })
}

/// Handle GET /apis/{group}.
pub async fn api_group(State(state): State<Arc<AppState>>) -> Json<ApiGroup> {
    Json(group_of(&state))
}

/// Handle GET /apis/{group}/v1.
pub async fn api_resource_list(State(state): State<Arc<AppState>>) -> Json<ApiResourceList> {
    Json(ApiResourceList {
        kind: "APIResourceList",
        group_version: format!("{}/v1", state.config().group),
        resources: resources(),
    })
}

// ---- devices ----

/// Handle GET /devices.
pub async fn list_devices(State(state): State<Arc<AppState>>) -> ApiResult<Json<ItemList<Device>>> {
    let items = state.service().list_devices().await?;
    Ok(Json(ItemList { items }))
}

/// Handle GET /devices/{username}.
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(username): Path<String>,
) -> ApiResult<Json<Device>> {
    Ok(Json(state.service().get_device(&caller, &username).await?))
}

/// Handle PUT /devices/{username}; answers from the last composed view.
pub async fn get_cached_device(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> ApiResult<Json<Device>> {
    Ok(Json(state.service().cached_device(&username)?))
}

/// Handle POST /devices.
pub async fn create_device(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<Device>, JsonRejection>,
) -> ApiResult<Json<Device>> {
    let Json(request) = payload?;
    Ok(Json(state.service().create_device(&caller, request).await?))
}

/// Handle DELETE /devices/{username}.
pub async fn delete_device(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(username): Path<String>,
) -> ApiResult<Json<DeviceDeletion>> {
    let (device, deletion_report) = state.service().delete_device(&caller, &username).await?;
    Ok(Json(DeviceDeletion {
        device,
        deletion_report,
    }))
}

/// Handle GET /sumups.
pub async fn get_sum_up(State(state): State<Arc<AppState>>) -> ApiResult<Json<SumUp>> {
    Ok(Json(state.service().sum_up().await?))
}

// ---- users ----

/// Handle POST /openhydrausers/login/{name}.
///
/// The credentials come from the body; the path name is used when the body
/// carries none.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Result<Json<User>, JsonRejection>,
) -> ApiResult<Json<User>> {
    let Json(body) = payload?;
    let username = if body.name().is_empty() { name.as_str() } else { body.name() };
    let user = state.service().login(username, &body.spec.password).await?;
    info!(user = %user.name(), "User logged in");
    Ok(Json(user))
}

/// Handle GET /openhydrausers.
pub async fn list_users(State(state): State<Arc<AppState>>) -> ApiResult<Json<ItemList<User>>> {
    let items = state.service().list_users().await?;
    Ok(Json(ItemList { items }))
}

/// Handle POST /openhydrausers.
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<User>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let Json(user) = payload?;
    let created = state.service().create_user(&user).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Handle GET /openhydrausers/{name}.
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.service().get_user(&caller, &name).await?))
}

/// Handle PUT /openhydrausers/{name}.
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Result<Json<User>, JsonRejection>,
) -> ApiResult<Json<User>> {
    let Json(user) = payload?;
    Ok(Json(state.service().update_user(&name, user).await?))
}

/// Handle PATCH /openhydrausers/{name} with a JSON merge patch.
pub async fn patch_user(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<User>> {
    let Json(patch) = payload?;
    Ok(Json(state.service().patch_user(&name, &patch).await?))
}

/// Handle DELETE /openhydrausers/{name}.
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.service().delete_user(&name).await?))
}

// ---- datasets ----

/// Handle GET /datasets.
pub async fn list_datasets(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ItemList<Dataset>>> {
    let items = state.service().list_datasets().await?;
    Ok(Json(ItemList { items }))
}

/// Handle POST /datasets with a JSON record; archive upload is not served.
pub async fn create_dataset(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Dataset>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Dataset>)> {
    let Json(dataset) = payload?;
    let created = state.service().create_dataset(&dataset).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Handle GET /datasets/{name}.
pub async fn get_dataset(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Dataset>> {
    Ok(Json(state.service().get_dataset(&name).await?))
}

/// Handle PUT /datasets/{name}.
pub async fn update_dataset(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Result<Json<Dataset>, JsonRejection>,
) -> ApiResult<Json<Dataset>> {
    let Json(dataset) = payload?;
    Ok(Json(state.service().update_dataset(&name, dataset).await?))
}

/// Handle DELETE /datasets/{name}.
pub async fn delete_dataset(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Dataset>> {
    let removed = state.service().delete_dataset(&name).await?;
    info!(dataset = %name, "Dataset removed via API");
    Ok(Json(removed))
}

// ---- courses ----

/// Handle GET /courses.
pub async fn list_courses(State(state): State<Arc<AppState>>) -> ApiResult<Json<ItemList<Course>>> {
    let items = state.service().list_courses().await?;
    Ok(Json(ItemList { items }))
}

/// Handle POST /courses with a JSON record; archive upload is not served.
pub async fn create_course(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Course>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Course>)> {
    let Json(course) = payload?;
    let created = state.service().create_course(course).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Handle GET /courses/{name}.
pub async fn get_course(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Course>> {
    Ok(Json(state.service().get_course(&name).await?))
}

/// Handle PUT /courses/{name}.
pub async fn update_course(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Result<Json<Course>, JsonRejection>,
) -> ApiResult<Json<Course>> {
    let Json(course) = payload?;
    Ok(Json(state.service().update_course(&name, course).await?))
}

/// Handle DELETE /courses/{name}.
pub async fn delete_course(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Course>> {
    let removed = state.service().delete_course(&name).await?;
    info!(course = %name, "Course removed via API");
    Ok(Json(removed))
}

// ---- settings ----

/// Handle GET /settings/{name}.
pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Setting>> {
    Ok(Json(state.service().get_settings(&name).await?))
}

/// Handle PUT /settings/{name}.
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Setting>, JsonRejection>,
) -> ApiResult<Json<Setting>> {
    let Json(setting) = payload?;
    Ok(Json(state.service().update_settings(&setting)))
}
