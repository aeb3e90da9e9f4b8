//! Keystone v3 backend.
//!
//! Users are Keystone users. An optional `openhydra` attribute on the Keystone
//! record carries the full Open Hydra user; records without it are presented
//! as privileged users named by their Keystone id. Datasets and courses are
//! not stored in Keystone.

use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, warn};

use super::{Course, Dataset, IdentityBackend, IdentityFuture, ROLE_PRIVILEGED, User, UserSpec};
use crate::cluster::ObjectMeta;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const MASKED_PASSWORD: &str = "*********";
const PROTECTED_USERS: [&str; 2] = ["admin", "service"];

/// Keystone connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeystoneConfig {
    /// Base URL, e.g. `http://keystone:5000`.
    pub endpoint: String,
    /// Service account name.
    pub username: String,
    /// Service account password.
    pub password: String,
    /// Domain id; `default` when empty.
    pub domain_id: String,
    /// Project id.
    pub project_id: String,
    /// Response header carrying a freshly issued token.
    pub token_key_in_response: String,
    /// Request header carrying the token.
    pub token_key_in_request: String,
}

impl Default for KeystoneConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:5000".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            domain_id: "default".to_string(),
            project_id: String::new(),
            token_key_in_response: "X-Subject-Token".to_string(),
            token_key_in_request: "X-Auth-Token".to_string(),
        }
    }
}

impl KeystoneConfig {
    fn domain(&self) -> &str {
        if self.domain_id.is_empty() { "default" } else { &self.domain_id }
    }

    fn response_token_header(&self) -> &str {
        if self.token_key_in_response.is_empty() {
            "X-Subject-Token"
        } else {
            &self.token_key_in_response
        }
    }

    fn request_token_header(&self) -> &str {
        if self.token_key_in_request.is_empty() {
            "X-Auth-Token"
        } else {
            &self.token_key_in_request
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint.trim_end_matches('/'))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeystoneOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    ignore_change_password_upon_first_use: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    ignore_password_expiry: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    ignore_lockout_failure_attempts: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeystoneUser {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    email: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    password: String,
    #[serde(default)]
    options: KeystoneOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    openhydra: Option<User>,
}

impl KeystoneUser {
    fn into_user(self) -> User {
        match self.openhydra {
            Some(mut user) => {
                user.metadata.name.clone_from(&self.id);
                user.metadata.uid = self.id;
                user
            }
            None => {
                let mut metadata = ObjectMeta::named(self.id.clone(), "");
                metadata.uid = self.id;
                User {
                    metadata,
                    spec: UserSpec {
                        chinese_name: self.name,
                        description: "keystone user".to_string(),
                        password: MASKED_PASSWORD.to_string(),
                        email: self.email,
                        role: ROLE_PRIVILEGED,
                    },
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: KeystoneUser,
}

#[derive(Debug, Deserialize)]
struct UserCollection {
    #[serde(default)]
    users: Vec<KeystoneUser>,
}

fn http_error(e: &reqwest::Error) -> Error {
    Error::Identity(format!("keystone request failed: {e}"))
}

/// Identity backend delegating users to Keystone.
#[derive(Debug)]
pub struct KeystoneIdentity {
    config: KeystoneConfig,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl KeystoneIdentity {
    /// Create the backend.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: KeystoneConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build keystone client: {e}")))?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
        })
    }

    /// Connection settings.
    #[must_use]
    pub const fn config(&self) -> &KeystoneConfig {
        &self.config
    }

    /// Issue a token for `name`; scoped to the configured domain when asked.
    async fn request_token(&self, name: &str, password: &str, scoped: bool) -> Result<String> {
        let mut auth = json!({
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": name,
                        "password": password,
                        "domain": { "id": self.config.domain() },
                    }
                }
            }
        });
        if scoped {
            auth["scope"] = json!({ "domain": { "id": self.config.domain() } });
        }

        let response = self
            .client
            .post(self.config.url("/v3/auth/tokens"))
            .json(&json!({ "auth": auth }))
            .send()
            .await
            .map_err(|e| http_error(&e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthenticated(format!("keystone rejected credentials of {name}")));
        }
        if !status.is_success() {
            return Err(Error::Identity(format!(
                "keystone token request failed with status {status}"
            )));
        }

        response
            .headers()
            .get(self.config.response_token_header())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Identity("no token in response header".to_string()))
    }

    async fn service_token(&self) -> Result<String> {
        let cached = self.token.lock().clone();
        if let Some(token) = cached {
            return Ok(token);
        }
        self.renew_token().await
    }

    async fn renew_token(&self) -> Result<String> {
        let token = self
            .request_token(&self.config.username, &self.config.password, true)
            .await?;
        *self.token.lock() = Some(token.clone());
        Ok(token)
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .request(method.clone(), self.config.url(path))
            .header(self.config.request_token_header(), token);
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(|e| http_error(&e))
    }

    /// Authorized call with one token renewal on 401.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        name: &str,
    ) -> Result<Vec<u8>> {
        let token = self.service_token().await?;
        let mut response = self.send(&method, path, body.as_ref(), &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path, "Keystone token may have expired, renewing and retrying once");
            let token = self.renew_token().await?;
            response = self.send(&method, path, body.as_ref(), &token).await?;
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::not_found("user", name));
        }
        if !matches!(status, StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT) {
            error!(path, %status, "Keystone request failed");
            return Err(Error::Identity(format!("request to {path} failed with status {status}")));
        }
        let bytes = response.bytes().await.map_err(|e| http_error(&e))?;
        Ok(bytes.to_vec())
    }

    async fn fetch_user(&self, name: &str) -> Result<User> {
        let body = self.call(Method::GET, &format!("/v3/users/{name}"), None, name).await?;
        let envelope: UserEnvelope = serde_json::from_slice(&body)
            .map_err(|e| Error::Identity(format!("malformed keystone user: {e}")))?;
        Ok(envelope.user.into_user())
    }

    async fn insert_user(&self, user: &User) -> Result<()> {
        match self.fetch_user(user.name()).await {
            Ok(_) => return Err(Error::Conflict(format!("user {} already exists", user.name()))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut stored = user.clone();
        stored.spec.chinese_name.clone_from(&stored.metadata.name);
        let record = KeystoneUser {
            name: user.name().to_string(),
            email: user.spec.email.clone(),
            enabled: true,
            password: user.spec.password.clone(),
            options: KeystoneOptions {
                ignore_change_password_upon_first_use: true,
                ignore_password_expiry: true,
                ignore_lockout_failure_attempts: true,
            },
            openhydra: Some(stored),
            ..Default::default()
        };
        let record = serde_json::to_value(&record)
            .map_err(|e| Error::Identity(format!("failed to encode keystone user: {e}")))?;
        self.call(Method::POST, "/v3/users", Some(json!({ "user": record })), user.name())
            .await?;
        Ok(())
    }

    async fn remove_user(&self, name: &str) -> Result<()> {
        if PROTECTED_USERS.contains(&name) {
            return Err(Error::Forbidden(format!("built-in user {name} can not be deleted")));
        }
        self.call(Method::DELETE, &format!("/v3/users/{name}"), None, name).await?;
        Ok(())
    }

    async fn all_users(&self) -> Result<Vec<User>> {
        let body = self.call(Method::GET, "/v3/users", None, "").await?;
        let collection: UserCollection = serde_json::from_slice(&body)
            .map_err(|e| Error::Identity(format!("malformed keystone users: {e}")))?;
        Ok(collection
            .users
            .into_iter()
            .filter(|u| u.enabled)
            .map(KeystoneUser::into_user)
            .collect())
    }

    async fn authenticate(&self, name: &str, password: &str) -> Result<User> {
        let user = self.fetch_user(name).await?;
        // Keystone knows the account by its display name
        self.request_token(&user.spec.chinese_name, password, false).await?;
        Ok(user)
    }
}

fn unsupported<'a, T: Send + 'a>(op: &'static str) -> IdentityFuture<'a, T> {
    Box::pin(async move {
        Err(Error::Unsupported(format!("keystone backend does not store {op}")))
    })
}

impl IdentityBackend for KeystoneIdentity {
    fn init(&self) -> IdentityFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn create_user<'a>(&'a self, user: &'a User) -> IdentityFuture<'a, ()> {
        Box::pin(self.insert_user(user))
    }

    fn get_user<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, User> {
        Box::pin(self.fetch_user(name))
    }

    fn update_user<'a>(&'a self, user: &'a User) -> IdentityFuture<'a, ()> {
        // accounts are managed in keystone itself
        Box::pin(async move {
            warn!(user = %user.name(), "Ignoring user update for keystone backend");
            Ok(())
        })
    }

    fn delete_user<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()> {
        Box::pin(self.remove_user(name))
    }

    fn list_users(&self) -> IdentityFuture<'_, Vec<User>> {
        Box::pin(self.all_users())
    }

    fn login_user<'a>(&'a self, name: &'a str, password: &'a str) -> IdentityFuture<'a, User> {
        Box::pin(self.authenticate(name, password))
    }

    fn create_dataset<'a>(&'a self, _dataset: &'a Dataset) -> IdentityFuture<'a, ()> {
        unsupported("datasets")
    }

    fn get_dataset<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, Dataset> {
        unsupported("datasets")
    }

    fn update_dataset<'a>(&'a self, _dataset: &'a Dataset) -> IdentityFuture<'a, ()> {
        unsupported("datasets")
    }

    fn delete_dataset<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, ()> {
        unsupported("datasets")
    }

    fn list_datasets(&self) -> IdentityFuture<'_, Vec<Dataset>> {
        unsupported("datasets")
    }

    fn create_course<'a>(&'a self, _course: &'a Course) -> IdentityFuture<'a, ()> {
        unsupported("courses")
    }

    fn get_course<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, Course> {
        unsupported("courses")
    }

    fn update_course<'a>(&'a self, _course: &'a Course) -> IdentityFuture<'a, ()> {
        unsupported("courses")
    }

    fn delete_course<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, ()> {
        unsupported("courses")
    }

    fn list_courses(&self) -> IdentityFuture<'_, Vec<Course>> {
        unsupported("courses")
    }
}
