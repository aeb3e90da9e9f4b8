//! Authentication and role-based authorization.
//!
//! Every request outside the bypass list carries
//! `Open-Hydra-Auth: Bearer base64(user:password)`. The credentials are
//! checked against the identity backend and the caller's role is compared
//! with the mask registered for the matched route. The table is assembled
//! once through [`AuthorizationTableBuilder`] and is read-only afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identity::{IdentityBackend, User};

/// Header carrying the credentials.
pub const AUTH_HEADER: &str = "Open-Hydra-Auth";

/// Trusted header carrying the authenticated username.
pub const USER_HEADER: &str = "Open-Hydra-User";

/// Trusted header carrying the authenticated role.
pub const ROLE_HEADER: &str = "Open-Hydra-Role";

/// Only accepted credential scheme.
pub const BEARER_SCHEME: &str = "Bearer";

/// Collection under which the login route lives.
pub const LOGIN_PREFIX: &str = "openhydrausers/login/";

/// Decoded credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Encode as an `Open-Hydra-Auth` header value.
    #[must_use]
    pub fn to_header(&self) -> String {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("{BEARER_SCHEME} {encoded}")
    }
}

/// Parse an `Open-Hydra-Auth` header value.
///
/// # Errors
///
/// Returns [`Error::Unauthenticated`] when the header is absent or malformed.
pub fn parse_credentials(header: Option<&str>) -> Result<Credentials> {
    let header = header
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::Unauthenticated("no auth header found".to_string()))?;

    let parts: Vec<&str> = header.split(' ').collect();
    let [scheme, payload] = parts.as_slice() else {
        return Err(Error::Unauthenticated("format is not recognized".to_string()));
    };
    if *scheme != BEARER_SCHEME {
        return Err(Error::Unauthenticated("only Bearer is supported".to_string()));
    }

    let decoded = STANDARD
        .decode(payload)
        .map_err(|_| Error::Unauthenticated("decode base64 failed".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| Error::Unauthenticated("credentials are not utf-8".to_string()))?;

    let pair: Vec<&str> = decoded.split(':').collect();
    let [username, password] = pair.as_slice() else {
        return Err(Error::Unauthenticated("auth format is not recognized".to_string()));
    };
    Ok(Credentials {
        username: (*username).to_string(),
        password: (*password).to_string(),
    })
}

/// HTTP methods that can be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Upper-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::InvalidRequest(format!("unsupported method {other}"))),
        }
    }
}

/// A route template plus method, e.g. `GET /devices/{username}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteKey {
    /// Method.
    pub method: HttpMethod,
    /// Template relative to the API prefix.
    pub template: String,
}

impl RouteKey {
    /// Build a key.
    pub fn new(method: HttpMethod, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

/// API prefix for a group, e.g. `/apis/open-hydra-server.openhydra.io/v1`.
#[must_use]
pub fn api_prefix(group: &str) -> String {
    format!("/apis/{group}/v1")
}

/// Strip the API prefix from a matched route template.
#[must_use]
pub fn normalize_route(template: &str, group: &str) -> String {
    let prefix = api_prefix(group);
    template.strip_prefix(prefix.as_str()).unwrap_or(template).to_string()
}

/// Whether a request path skips authentication entirely.
///
/// Discovery paths and the login route are public.
#[must_use]
pub fn is_bypass(path: &str, group: &str) -> bool {
    let prefix = api_prefix(group);
    if path
        .strip_prefix(prefix.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|rest| rest.starts_with(LOGIN_PREFIX))
    {
        return true;
    }

    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed == "/apis" || trimmed == format!("/apis/{group}") || trimmed == prefix
}

/// Exact-match-after-AND role check: grant iff `role == mask & role`.
#[must_use]
pub const fn role_grants(role: u32, mask: u32) -> bool {
    role == mask & role
}

/// Immutable `(route, method) -> role mask` table.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationTable {
    entries: BTreeMap<RouteKey, u32>,
}

impl AuthorizationTable {
    /// Start a builder.
    #[must_use]
    pub fn builder() -> AuthorizationTableBuilder {
        AuthorizationTableBuilder::default()
    }

    /// Mask registered for `key`.
    #[must_use]
    pub fn required_mask(&self, key: &RouteKey) -> Option<u32> {
        self.entries.get(key).copied()
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check `role` against the mask of `key`. Unregistered routes are denied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] on deny.
    pub fn authorize(&self, key: &RouteKey, username: &str, role: u32) -> Result<()> {
        let Some(mask) = self.required_mask(key) else {
            warn!(route = %key, "No authorization entry for route, denying");
            return Err(Error::Forbidden(format!("no authorization found for {key}")));
        };
        if role_grants(role, mask) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "user {username} does not have the right to access {key}"
            )))
        }
    }
}

/// Builder for [`AuthorizationTable`].
#[derive(Debug, Default)]
pub struct AuthorizationTableBuilder {
    entries: BTreeMap<RouteKey, u32>,
}

impl AuthorizationTableBuilder {
    /// Register a route. A later registration of the same key replaces the earlier one.
    #[must_use]
    pub fn route(mut self, method: HttpMethod, template: impl Into<String>, mask: u32) -> Self {
        self.entries.insert(RouteKey::new(method, template), mask);
        self
    }

    /// Freeze the table.
    #[must_use]
    pub fn build(self) -> AuthorizationTable {
        AuthorizationTable { entries: self.entries }
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Username.
    pub username: String,
    /// Role bitmask.
    pub role: u32,
}

impl From<&User> for Principal {
    fn from(user: &User) -> Self {
        Self {
            username: user.name().to_string(),
            role: user.spec.role,
        }
    }
}

/// The request filter: bypass, authenticate, authorize.
#[derive(Clone)]
pub struct AccessControl {
    table: Arc<AuthorizationTable>,
    backend: Arc<dyn IdentityBackend>,
    group: String,
}

impl fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessControl")
            .field("routes", &self.table.len())
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl AccessControl {
    /// Create the filter.
    pub fn new(
        table: AuthorizationTable,
        backend: Arc<dyn IdentityBackend>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            table: Arc::new(table),
            backend,
            group: group.into(),
        }
    }

    /// The authorization table.
    #[must_use]
    pub fn table(&self) -> &AuthorizationTable {
        &self.table
    }

    /// Verify credentials with the identity backend.
    ///
    /// # Errors
    ///
    /// Rejected or unknown credentials become [`Error::Unauthenticated`];
    /// other backend failures pass through.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<User> {
        match self
            .backend
            .login_user(&credentials.username, &credentials.password)
            .await
        {
            Ok(user) => Ok(user),
            Err(e) if e.is_not_found() || matches!(e, Error::Unauthenticated(_)) => {
                debug!(user = %credentials.username, error = %e, "Login rejected");
                Err(Error::Unauthenticated("login failed".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Run the filter for one request.
    ///
    /// `route_template` is the matched template (with or without the API
    /// prefix) and `path` the raw request path. Returns `None` for bypassed
    /// paths.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthenticated`] or [`Error::Forbidden`] on failure.
    pub async fn check(
        &self,
        method: HttpMethod,
        route_template: &str,
        path: &str,
        auth_header: Option<&str>,
    ) -> Result<Option<Principal>> {
        if is_bypass(path, &self.group) {
            debug!(path, "Skipping authentication");
            return Ok(None);
        }

        let credentials = parse_credentials(auth_header)?;
        let user = self.authenticate(&credentials).await?;
        let key = RouteKey::new(method, normalize_route(route_template, &self.group));
        self.table.authorize(&key, user.name(), user.spec.role)?;
        Ok(Some(Principal::from(&user)))
    }
}
