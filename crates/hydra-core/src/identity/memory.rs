//! Process-local identity store for tests and standalone runs.

use std::collections::BTreeMap;

use chrono::Utc;
use parking_lot::RwLock;

use super::{Course, Dataset, IdentityBackend, IdentityFuture, User};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Records {
    users: BTreeMap<String, User>,
    datasets: BTreeMap<String, Dataset>,
    courses: BTreeMap<String, Course>,
}

/// Identity backend keeping everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryIdentity {
    records: RwLock<Records>,
}

impl InMemoryIdentity {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with users.
    #[must_use]
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let store = Self::new();
        {
            let mut records = store.records.write();
            for user in users {
                records.users.insert(user.metadata.name.clone(), user);
            }
        }
        store
    }
}

fn insert_new<T: Clone>(
    map: &mut BTreeMap<String, T>,
    kind: &str,
    name: &str,
    value: &T,
) -> Result<()> {
    if map.contains_key(name) {
        return Err(Error::Conflict(format!("{kind} {name} already exists")));
    }
    map.insert(name.to_string(), value.clone());
    Ok(())
}

fn replace_existing<T: Clone>(
    map: &mut BTreeMap<String, T>,
    kind: &'static str,
    name: &str,
    value: &T,
) -> Result<()> {
    let slot = map.get_mut(name).ok_or_else(|| Error::not_found(kind, name))?;
    *slot = value.clone();
    Ok(())
}

fn remove_existing<T>(map: &mut BTreeMap<String, T>, kind: &'static str, name: &str) -> Result<()> {
    map.remove(name).map(|_| ()).ok_or_else(|| Error::not_found(kind, name))
}

fn get_existing<T: Clone>(map: &BTreeMap<String, T>, kind: &'static str, name: &str) -> Result<T> {
    map.get(name).cloned().ok_or_else(|| Error::not_found(kind, name))
}

impl IdentityBackend for InMemoryIdentity {
    fn init(&self) -> IdentityFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn create_user<'a>(&'a self, user: &'a User) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            insert_new(&mut self.records.write().users, "user", user.name(), user)
        })
    }

    fn get_user<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, User> {
        Box::pin(async move { get_existing(&self.records.read().users, "user", name) })
    }

    fn update_user<'a>(&'a self, user: &'a User) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            replace_existing(&mut self.records.write().users, "user", user.name(), user)
        })
    }

    fn delete_user<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()> {
        Box::pin(async move { remove_existing(&mut self.records.write().users, "user", name) })
    }

    fn list_users(&self) -> IdentityFuture<'_, Vec<User>> {
        Box::pin(async move { Ok(self.records.read().users.values().cloned().collect()) })
    }

    fn login_user<'a>(&'a self, name: &'a str, password: &'a str) -> IdentityFuture<'a, User> {
        Box::pin(async move {
            let records = self.records.read();
            match records.users.get(name) {
                Some(user) if user.spec.password == password => Ok(user.clone()),
                Some(_) => Err(Error::Unauthenticated("wrong password".to_string())),
                None => Err(Error::not_found("user", name)),
            }
        })
    }

    fn create_dataset<'a>(&'a self, dataset: &'a Dataset) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let mut stored = dataset.clone();
            let now = Utc::now();
            stored.metadata.creation_timestamp = Some(now);
            stored.spec.last_update = Some(now);
            let name = &dataset.metadata.name;
            insert_new(&mut self.records.write().datasets, "dataset", name, &stored)
        })
    }

    fn get_dataset<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, Dataset> {
        Box::pin(async move { get_existing(&self.records.read().datasets, "dataset", name) })
    }

    fn update_dataset<'a>(&'a self, dataset: &'a Dataset) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let mut stored = dataset.clone();
            stored.spec.last_update = Some(Utc::now());
            let name = &dataset.metadata.name;
            replace_existing(&mut self.records.write().datasets, "dataset", name, &stored)
        })
    }

    fn delete_dataset<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            remove_existing(&mut self.records.write().datasets, "dataset", name)
        })
    }

    fn list_datasets(&self) -> IdentityFuture<'_, Vec<Dataset>> {
        Box::pin(async move { Ok(self.records.read().datasets.values().cloned().collect()) })
    }

    fn create_course<'a>(&'a self, course: &'a Course) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let mut stored = course.clone();
            let now = Utc::now();
            stored.metadata.creation_timestamp = Some(now);
            stored.spec.last_update = Some(now);
            insert_new(&mut self.records.write().courses, "course", &course.metadata.name, &stored)
        })
    }

    fn get_course<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, Course> {
        Box::pin(async move { get_existing(&self.records.read().courses, "course", name) })
    }

    fn update_course<'a>(&'a self, course: &'a Course) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let mut stored = course.clone();
            stored.spec.last_update = Some(Utc::now());
            let name = &course.metadata.name;
            replace_existing(&mut self.records.write().courses, "course", name, &stored)
        })
    }

    fn delete_course<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()> {
        Box::pin(async move { remove_existing(&mut self.records.write().courses, "course", name) })
    }

    fn list_courses(&self) -> IdentityFuture<'_, Vec<Course>> {
        Box::pin(async move { Ok(self.records.read().courses.values().cloned().collect()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ROLE_PRIVILEGED, ROLE_STANDARD};

    #[tokio::test]
    async fn test_user_crud() {
        let store = InMemoryIdentity::new();
        let alice = User::new("alice", ROLE_STANDARD).with_password("pw");
        store.create_user(&alice).await.unwrap();
        assert!(matches!(store.create_user(&alice).await, Err(Error::Conflict(_))));
        assert_eq!(store.get_user("alice").await.unwrap(), alice);

        let updated = alice.clone().with_chinese_name("Alice");
        store.update_user(&updated).await.unwrap();
        assert_eq!(store.get_user("alice").await.unwrap().spec.chinese_name, "Alice");

        store.delete_user("alice").await.unwrap();
        assert!(store.get_user("alice").await.unwrap_err().is_not_found());
        assert!(store.delete_user("alice").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_login() {
        let root = User::new("root", ROLE_PRIVILEGED).with_password("secret");
        let store = InMemoryIdentity::with_users([root]);
        assert_eq!(store.login_user("root", "secret").await.unwrap().spec.role, ROLE_PRIVILEGED);
        assert!(matches!(store.login_user("root", "nope").await, Err(Error::Unauthenticated(_))));
        assert!(store.login_user("ghost", "x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_dataset_and_course_timestamps() {
        let store = InMemoryIdentity::new();
        store.create_dataset(&Dataset::new("mnist", "digits")).await.unwrap();
        let dataset = store.get_dataset("mnist").await.unwrap();
        assert!(dataset.metadata.creation_timestamp.is_some());
        assert!(dataset.spec.last_update.is_some());
        assert_eq!(store.list_datasets().await.unwrap().len(), 1);

        store.create_course(&Course::new("intro", "root")).await.unwrap();
        store.delete_course("intro").await.unwrap();
        assert!(store.list_courses().await.unwrap().is_empty());
        let missing = store.update_course(&Course::new("intro", "root")).await;
        assert!(missing.unwrap_err().is_not_found());
    }
}
