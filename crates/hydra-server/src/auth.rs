//! Authentication middleware.
//!
//! Runs the core request filter on every matched route. On success the
//! caller is attached as a request extension and echoed downstream in the
//! `Open-Hydra-User` and `Open-Hydra-Role` headers. Client supplied copies
//! of those headers are always stripped first.

use std::sync::Arc;

use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hydra_core::access::{AUTH_HEADER, ROLE_HEADER, USER_HEADER};
use hydra_core::{Caller, HttpMethod};
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticate and authorize one request.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers_mut();
    headers.remove(USER_HEADER);
    headers.remove(ROLE_HEADER);

    if state.auth_disabled() {
        request.extensions_mut().insert(Caller::Unrestricted);
        return next.run(request).await;
    }

    let method = match request.method().as_str().parse::<HttpMethod>() {
        Ok(method) => method,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let path = request.uri().path().to_string();
    let template = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| path.clone(), |matched| matched.as_str().to_string());
    let auth_header = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    match state
        .access()
        .check(method, &template, &path, auth_header.as_deref())
        .await
    {
        Ok(Some(principal)) => {
            debug!(
                user = %principal.username,
                role = principal.role,
                route = %template,
                "Request authorized"
            );
            if let Ok(value) = HeaderValue::from_str(&principal.username) {
                request.headers_mut().insert(USER_HEADER, value);
            }
            request
                .headers_mut()
                .insert(ROLE_HEADER, HeaderValue::from(principal.role));
            request.extensions_mut().insert(Caller::User(principal));
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(e) => ApiError::from(e).into_response(),
    }
}
