//! Key-value store backend.
//!
//! Selectable from configuration so deployments can name it, but no
//! operation is implemented yet; every call fails with
//! [`Error::Unsupported`].

use serde::{Deserialize, Serialize};

use super::{Course, Dataset, IdentityBackend, IdentityFuture, User};
use crate::error::Error;

/// Connection settings of the key-value store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeyValueConfig {
    /// Cluster endpoints.
    pub endpoints: Vec<String>,
    /// CA bundle path.
    pub ca_file: String,
    /// Client certificate path.
    pub cert_file: String,
    /// Client key path.
    pub key_file: String,
}

impl Default for KeyValueConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            ca_file: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
        }
    }
}

/// Key-value store backend.
#[derive(Debug, Clone)]
pub struct KeyValueIdentity {
    config: KeyValueConfig,
}

impl KeyValueIdentity {
    /// Create the backend.
    #[must_use]
    pub const fn new(config: KeyValueConfig) -> Self {
        Self { config }
    }

    /// Connection settings.
    #[must_use]
    pub const fn config(&self) -> &KeyValueConfig {
        &self.config
    }
}

fn unsupported<'a, T: Send + 'a>(op: &'static str) -> IdentityFuture<'a, T> {
    Box::pin(async move {
        Err(Error::Unsupported(format!("key-value backend does not implement {op}")))
    })
}

impl IdentityBackend for KeyValueIdentity {
    fn init(&self) -> IdentityFuture<'_, ()> {
        unsupported("init")
    }

    fn create_user<'a>(&'a self, _user: &'a User) -> IdentityFuture<'a, ()> {
        unsupported("create_user")
    }

    fn get_user<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, User> {
        unsupported("get_user")
    }

    fn update_user<'a>(&'a self, _user: &'a User) -> IdentityFuture<'a, ()> {
        unsupported("update_user")
    }

    fn delete_user<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, ()> {
        unsupported("delete_user")
    }

    fn list_users(&self) -> IdentityFuture<'_, Vec<User>> {
        unsupported("list_users")
    }

    fn login_user<'a>(&'a self, _name: &'a str, _password: &'a str) -> IdentityFuture<'a, User> {
        unsupported("login_user")
    }

    fn create_dataset<'a>(&'a self, _dataset: &'a Dataset) -> IdentityFuture<'a, ()> {
        unsupported("create_dataset")
    }

    fn get_dataset<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, Dataset> {
        unsupported("get_dataset")
    }

    fn update_dataset<'a>(&'a self, _dataset: &'a Dataset) -> IdentityFuture<'a, ()> {
        unsupported("update_dataset")
    }

    fn delete_dataset<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, ()> {
        unsupported("delete_dataset")
    }

    fn list_datasets(&self) -> IdentityFuture<'_, Vec<Dataset>> {
        unsupported("list_datasets")
    }

    fn create_course<'a>(&'a self, _course: &'a Course) -> IdentityFuture<'a, ()> {
        unsupported("create_course")
    }

    fn get_course<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, Course> {
        unsupported("get_course")
    }

    fn update_course<'a>(&'a self, _course: &'a Course) -> IdentityFuture<'a, ()> {
        unsupported("update_course")
    }

    fn delete_course<'a>(&'a self, _name: &'a str) -> IdentityFuture<'a, ()> {
        unsupported("delete_course")
    }

    fn list_courses(&self) -> IdentityFuture<'_, Vec<Course>> {
        unsupported("list_courses")
    }
}
