//! Route configuration for the API.

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};
use hydra_core::access::api_prefix;
use hydra_core::{AuthorizationTable, HttpMethod};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::authenticate;
use crate::handlers::{
    api_group, api_group_list, api_resource_list, create_course, create_dataset, create_device,
    create_user, delete_course, delete_dataset, delete_device, delete_user, get_cached_device,
    get_course, get_dataset, get_device, get_settings, get_sum_up, get_user, list_courses,
    list_datasets, list_devices, list_users, login, patch_user, update_course, update_dataset,
    update_settings, update_user,
};
use crate::state::AppState;

/// Role mask of routes only privileged users may call.
const PRIVILEGED: u32 = 1;

/// Role mask of routes every authenticated user may call.
const ANY_ROLE: u32 = 3;

/// Role masks of every authenticated route, keyed relative to the API prefix.
#[must_use]
pub fn authorization_table() -> AuthorizationTable {
    AuthorizationTable::builder()
        .route(HttpMethod::Get, "/devices", PRIVILEGED)
        .route(HttpMethod::Get, "/devices/{username}", ANY_ROLE)
        .route(HttpMethod::Post, "/devices", ANY_ROLE)
        .route(HttpMethod::Put, "/devices/{username}", PRIVILEGED)
        .route(HttpMethod::Delete, "/devices/{username}", ANY_ROLE)
        .route(HttpMethod::Get, "/sumups", ANY_ROLE)
        .route(HttpMethod::Get, "/openhydrausers", PRIVILEGED)
        .route(HttpMethod::Post, "/openhydrausers", PRIVILEGED)
        .route(HttpMethod::Get, "/openhydrausers/{name}", ANY_ROLE)
        .route(HttpMethod::Put, "/openhydrausers/{name}", PRIVILEGED)
        .route(HttpMethod::Patch, "/openhydrausers/{name}", PRIVILEGED)
        .route(HttpMethod::Delete, "/openhydrausers/{name}", PRIVILEGED)
        .route(HttpMethod::Get, "/settings/{name}", PRIVILEGED)
        .route(HttpMethod::Put, "/settings/{name}", PRIVILEGED)
        .route(HttpMethod::Get, "/datasets", PRIVILEGED)
        .route(HttpMethod::Post, "/datasets", PRIVILEGED)
        .route(HttpMethod::Get, "/datasets/{name}", PRIVILEGED)
        .route(HttpMethod::Put, "/datasets/{name}", PRIVILEGED)
        .route(HttpMethod::Delete, "/datasets/{name}", PRIVILEGED)
        .route(HttpMethod::Get, "/courses", PRIVILEGED)
        .route(HttpMethod::Post, "/courses", PRIVILEGED)
        .route(HttpMethod::Get, "/courses/{name}", PRIVILEGED)
        .route(HttpMethod::Put, "/courses/{name}", PRIVILEGED)
        .route(HttpMethod::Delete, "/courses/{name}", PRIVILEGED)
        .build()
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config().cors_origins);
    let group = state.config().group.clone();
    let prefix = api_prefix(&group);

    Router::new()
        // Discovery
        .route("/apis", get(api_group_list))
        .route("/apis/", get(api_group_list))
        .route(&format!("/apis/{group}"), get(api_group))
        .route(&format!("/apis/{group}/"), get(api_group))
        .route(&prefix, get(api_resource_list))
        .route(&format!("{prefix}/"), get(api_resource_list))
        // Devices
        .route(&format!("{prefix}/devices"), get(list_devices).post(create_device))
        .route(
            &format!("{prefix}/devices/{{username}}"),
            get(get_device).put(get_cached_device).delete(delete_device),
        )
        // Summary
        .route(&format!("{prefix}/sumups"), get(get_sum_up))
        // Users
        .route(&format!("{prefix}/openhydrausers"), get(list_users).post(create_user))
        .route(
            &format!("{prefix}/openhydrausers/{{name}}"),
            get(get_user).put(update_user).patch(patch_user).delete(delete_user),
        )
        .route(&format!("{prefix}/openhydrausers/login/{{name}}"), post(login))
        // Settings
        .route(&format!("{prefix}/settings/{{name}}"), put(update_settings).get(get_settings))
        // Datasets
        .route(&format!("{prefix}/datasets"), get(list_datasets).post(create_dataset))
        .route(
            &format!("{prefix}/datasets/{{name}}"),
            get(get_dataset).put(update_dataset).delete(delete_dataset),
        )
        // Courses
        .route(&format!("{prefix}/courses"), get(list_courses).post(create_course))
        .route(
            &format!("{prefix}/courses/{{name}}"),
            get(get_course).put(update_course).delete(delete_course),
        )
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), authenticate))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(cors_origins: &[String]) -> CorsLayer {
    if cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = cors_origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    }
}
