//! Identity and metadata backends.
//!
//! The device path only needs a user's name and role, but the backend also
//! owns dataset and course records. One implementation is chosen at startup
//! from [`BackendConfig`] and never swapped afterwards.

pub mod keystone;
pub mod keyvalue;
pub mod memory;
pub mod relational;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::ObjectMeta;
use crate::error::Result;

pub use keystone::{KeystoneConfig, KeystoneIdentity};
pub use keyvalue::{KeyValueConfig, KeyValueIdentity};
pub use memory::InMemoryIdentity;
pub use relational::{RelationalConfig, RelationalIdentity};

/// Boxed future returned by backend calls.
pub type IdentityFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Role bit of privileged users (teachers).
pub const ROLE_PRIVILEGED: u32 = 1;

/// Role bit of standard users (students).
pub const ROLE_STANDARD: u32 = 2;

/// Mutable attributes of a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UserSpec {
    /// Display name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub chinese_name: String,
    /// Free text.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Credential.
    pub password: String,
    /// Contact address.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
    /// Role bitmask.
    pub role: u32,
}

/// An identity record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Metadata; the name is the username.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Attributes.
    #[serde(default)]
    pub spec: UserSpec,
}

impl User {
    /// Create a user with a role.
    pub fn new(name: impl Into<String>, role: u32) -> Self {
        Self {
            metadata: ObjectMeta::named(name, ""),
            spec: UserSpec {
                role,
                ..Default::default()
            },
        }
    }

    /// Set the password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.spec.password = password.into();
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn with_chinese_name(mut self, name: impl Into<String>) -> Self {
        self.spec.chinese_name = name.into();
        self
    }

    /// Username.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Whether the user holds the privileged role.
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        self.spec.role == ROLE_PRIVILEGED
    }
}

/// Dataset attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DatasetSpec {
    /// Free text.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Last modification.
    pub last_update: Option<DateTime<Utc>>,
}

/// A shared dataset record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dataset {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Attributes.
    #[serde(default)]
    pub spec: DatasetSpec,
}

impl Dataset {
    /// Create a dataset record.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name, ""),
            spec: DatasetSpec {
                description: description.into(),
                last_update: None,
            },
        }
    }
}

/// Course attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CourseSpec {
    /// Author.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    /// Free text.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Last modification.
    pub last_update: Option<DateTime<Utc>>,
    /// Difficulty level.
    pub level: i32,
    /// Sandbox the course is meant for.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sandbox_name: String,
    /// Archive size in bytes.
    pub size: i64,
}

/// A course record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Course {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Attributes.
    #[serde(default)]
    pub spec: CourseSpec,
}

impl Course {
    /// Create a course record.
    pub fn new(name: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name, ""),
            spec: CourseSpec {
                created_by: created_by.into(),
                ..Default::default()
            },
        }
    }
}

/// CRUD contract of an identity and metadata store.
///
/// Lookups of absent records fail with [`crate::Error::NotFound`].
pub trait IdentityBackend: Send + Sync {
    /// Prepare the store (schema bootstrap and similar).
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be prepared.
    fn init(&self) -> IdentityFuture<'_, ()>;

    /// Create a user.
    ///
    /// # Errors
    ///
    /// Returns error if the user exists or the store fails.
    fn create_user<'a>(&'a self, user: &'a User) -> IdentityFuture<'a, ()>;

    /// Fetch a user.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if absent.
    fn get_user<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, User>;

    /// Replace a user's attributes.
    ///
    /// # Errors
    ///
    /// Returns error if the user is absent or the store fails.
    fn update_user<'a>(&'a self, user: &'a User) -> IdentityFuture<'a, ()>;

    /// Delete a user.
    ///
    /// # Errors
    ///
    /// Returns error if the user is absent or protected.
    fn delete_user<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()>;

    /// List every user.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    fn list_users(&self) -> IdentityFuture<'_, Vec<User>>;

    /// Check credentials and return the matching user.
    ///
    /// # Errors
    ///
    /// Returns error if the credentials are rejected.
    fn login_user<'a>(&'a self, name: &'a str, password: &'a str) -> IdentityFuture<'a, User>;

    /// Create a dataset.
    ///
    /// # Errors
    ///
    /// Returns error if the dataset exists or the store fails.
    fn create_dataset<'a>(&'a self, dataset: &'a Dataset) -> IdentityFuture<'a, ()>;

    /// Fetch a dataset.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if absent.
    fn get_dataset<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, Dataset>;

    /// Update a dataset.
    ///
    /// # Errors
    ///
    /// Returns error if the dataset is absent or the store fails.
    fn update_dataset<'a>(&'a self, dataset: &'a Dataset) -> IdentityFuture<'a, ()>;

    /// Delete a dataset.
    ///
    /// # Errors
    ///
    /// Returns error if the dataset is absent or the store fails.
    fn delete_dataset<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()>;

    /// List every dataset.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    fn list_datasets(&self) -> IdentityFuture<'_, Vec<Dataset>>;

    /// Create a course.
    ///
    /// # Errors
    ///
    /// Returns error if the course exists or the store fails.
    fn create_course<'a>(&'a self, course: &'a Course) -> IdentityFuture<'a, ()>;

    /// Fetch a course.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if absent.
    fn get_course<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, Course>;

    /// Update a course.
    ///
    /// # Errors
    ///
    /// Returns error if the course is absent or the store fails.
    fn update_course<'a>(&'a self, course: &'a Course) -> IdentityFuture<'a, ()>;

    /// Delete a course.
    ///
    /// # Errors
    ///
    /// Returns error if the course is absent or the store fails.
    fn delete_course<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()>;

    /// List every course.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    fn list_courses(&self) -> IdentityFuture<'_, Vec<Course>>;
}

/// Which backend to run with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Process-local store.
    #[default]
    Memory,
    /// MySQL.
    Relational(RelationalConfig),
    /// Key-value store.
    KeyValue(KeyValueConfig),
    /// Keystone v3.
    External(KeystoneConfig),
}

impl BackendConfig {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Relational(_) => "relational",
            Self::KeyValue(_) => "key_value",
            Self::External(_) => "external",
        }
    }

    /// Construct the selected backend.
    ///
    /// # Errors
    ///
    /// Returns error if the backend client cannot be built.
    pub fn build(&self) -> Result<Arc<dyn IdentityBackend>> {
        let backend: Arc<dyn IdentityBackend> = match self {
            Self::Memory => Arc::new(InMemoryIdentity::new()),
            Self::Relational(config) => Arc::new(RelationalIdentity::new(config.clone())),
            Self::KeyValue(config) => Arc::new(KeyValueIdentity::new(config.clone())),
            Self::External(config) => Arc::new(KeystoneIdentity::new(config.clone())?),
        };
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_json_shape() {
        let user = User::new("alice", ROLE_STANDARD)
            .with_password("pw")
            .with_chinese_name("Alice");
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["metadata"]["name"], "alice");
        assert_eq!(json["spec"]["chineseName"], "Alice");
        assert_eq!(json["spec"]["role"], 2);
        assert!(json["spec"].get("email").is_none());

        let parsed: User = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, user);
        assert!(!parsed.is_privileged());
    }

    #[test]
    fn test_backend_config_selection() {
        let config: BackendConfig = serde_json::from_str(r#"{"kind": "memory"}"#).unwrap();
        assert_eq!(config, BackendConfig::Memory);
        assert_eq!(config.name(), "memory");

        let raw = r#"{"kind": "relational", "address": "db", "port": 3307}"#;
        let config: BackendConfig = serde_json::from_str(raw).unwrap();
        let BackendConfig::Relational(relational) = &config else {
            panic!("expected relational");
        };
        assert_eq!(relational.address, "db");
        assert_eq!(relational.port, 3307);
        assert_eq!(relational.database_name, "openhydra");
    }

    #[tokio::test]
    async fn test_build_memory_backend() {
        let backend = BackendConfig::Memory.build().unwrap();
        backend.init().await.unwrap();
        assert!(backend.list_users().await.unwrap().is_empty());
    }
}
