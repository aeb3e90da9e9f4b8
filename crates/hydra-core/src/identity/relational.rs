//! MySQL backend.
//!
//! The pool is acquired lazily. Concurrent acquisitions go through a
//! [`SingleFlight`] so a flaky database sees one dial and one ping at a time
//! no matter how many requests are waiting.

use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::{Connection, MySqlConnection, MySqlPool, Row};
use tracing::{debug, error, info};

use super::{
    Course, CourseSpec, Dataset, DatasetSpec, IdentityBackend, IdentityFuture, User, UserSpec,
};
use crate::cluster::ObjectMeta;
use crate::error::{Error, Result};
use crate::singleflight::SingleFlight;

const CREATE_USER_TABLE: &str = concat!(
    "CREATE TABLE IF NOT EXISTS user ( id INT AUTO_INCREMENT PRIMARY KEY, username VARCHAR(255), ",
    "role INT, ch_name NVARCHAR(255), description NVARCHAR(255), email VARCHAR(255), ",
    "password VARCHAR(255), UNIQUE (username) )",
);
const CREATE_DATASET_TABLE: &str = concat!(
    "CREATE TABLE IF NOT EXISTS dataset ( id INT AUTO_INCREMENT PRIMARY KEY, name VARCHAR(255), ",
    "description NVARCHAR(255), last_update DATETIME, create_time DATETIME, UNIQUE (name) )",
);
const CREATE_COURSE_TABLE: &str = concat!(
    "CREATE TABLE IF NOT EXISTS course ( id INT AUTO_INCREMENT PRIMARY KEY, name VARCHAR(255), ",
    "description NVARCHAR(255), created_by NVARCHAR(255), last_update DATETIME, ",
    "create_time DATETIME, file_size BIGINT, level INT, UNIQUE (name) )",
);

const USER_COLUMNS: &str = "username, email, password, ch_name, description, role";
const DATASET_COLUMNS: &str = "name, description, create_time, last_update";
const COURSE_COLUMNS: &str =
    "name, description, created_by, create_time, last_update, file_size, level";

/// MySQL connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelationalConfig {
    /// Server host.
    pub address: String,
    /// Server port.
    pub port: u16,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Database holding the tables.
    pub database_name: String,
    /// Character set used when creating the database.
    pub character: String,
    /// Collation used when creating the database.
    pub collation: String,
    /// Pool size.
    pub max_connections: u32,
    /// How long to wait for a connection, in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            address: "mysql.svc.cluster.local".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: "root".to_string(),
            database_name: "openhydra".to_string(),
            character: "utf8mb3".to_string(),
            collation: "utf8mb3_general_ci".to_string(),
            max_connections: 5,
            connect_timeout_secs: 10,
        }
    }
}

impl RelationalConfig {
    fn server_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.address)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
    }

    fn database_options(&self) -> MySqlConnectOptions {
        self.server_options().database(&self.database_name)
    }
}

/// Identity backend stored in MySQL.
#[derive(Debug)]
pub struct RelationalIdentity {
    config: RelationalConfig,
    pool: RwLock<Option<MySqlPool>>,
    flight: SingleFlight<std::result::Result<MySqlPool, String>>,
}

fn db_error(e: &sqlx::Error) -> Error {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(db.message().to_string())
        }
        other => Error::Identity(other.to_string()),
    }
}

fn text(row: &MySqlRow, column: &str) -> Result<String> {
    row.try_get::<Option<String>, _>(column)
        .map(Option::unwrap_or_default)
        .map_err(|e| db_error(&e))
}

fn timestamp(row: &MySqlRow, column: &str) -> Result<Option<chrono::DateTime<Utc>>> {
    row.try_get::<Option<NaiveDateTime>, _>(column)
        .map(|t| t.map(|t| t.and_utc()))
        .map_err(|e| db_error(&e))
}

fn user_from_row(row: &MySqlRow) -> Result<User> {
    let role: Option<i32> = row.try_get("role").map_err(|e| db_error(&e))?;
    Ok(User {
        metadata: ObjectMeta::named(text(row, "username")?, ""),
        spec: UserSpec {
            chinese_name: text(row, "ch_name")?,
            description: text(row, "description")?,
            password: text(row, "password")?,
            email: text(row, "email")?,
            role: role.and_then(|r| u32::try_from(r).ok()).unwrap_or_default(),
        },
    })
}

fn dataset_from_row(row: &MySqlRow) -> Result<Dataset> {
    let mut metadata = ObjectMeta::named(text(row, "name")?, "");
    metadata.creation_timestamp = timestamp(row, "create_time")?;
    Ok(Dataset {
        metadata,
        spec: DatasetSpec {
            description: text(row, "description")?,
            last_update: timestamp(row, "last_update")?,
        },
    })
}

fn course_from_row(row: &MySqlRow) -> Result<Course> {
    let mut metadata = ObjectMeta::named(text(row, "name")?, "");
    metadata.creation_timestamp = timestamp(row, "create_time")?;
    let size: Option<i64> = row.try_get("file_size").map_err(|e| db_error(&e))?;
    let level: Option<i32> = row.try_get("level").map_err(|e| db_error(&e))?;
    Ok(Course {
        metadata,
        spec: CourseSpec {
            created_by: text(row, "created_by")?,
            description: text(row, "description")?,
            last_update: timestamp(row, "last_update")?,
            level: level.unwrap_or_default(),
            sandbox_name: String::new(),
            size: size.unwrap_or_default(),
        },
    })
}

fn expect_affected(rows: u64, kind: &'static str, name: &str) -> Result<()> {
    if rows == 0 {
        return Err(Error::not_found(kind, name));
    }
    Ok(())
}

impl RelationalIdentity {
    /// Create the backend. No connection is made until first use.
    #[must_use]
    pub fn new(config: RelationalConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            flight: SingleFlight::new(),
        }
    }

    /// Connection settings.
    #[must_use]
    pub const fn config(&self) -> &RelationalConfig {
        &self.config
    }

    /// Get a healthy pool, re-dialing if the cached one fails its ping.
    async fn pool(&self) -> Result<MySqlPool> {
        let cached = self.pool.read().clone();
        let options = self.config.database_options();
        let max_connections = self.config.max_connections;
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);

        let result = self
            .flight
            .run(move || async move {
                if let Some(pool) = cached {
                    match sqlx::query("SELECT 1").execute(&pool).await {
                        Ok(_) => return Ok(pool),
                        Err(e) => error!(error = %e, "Failed to ping database, reconnecting"),
                    }
                }
                debug!("Dialing database");
                MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(timeout)
                    .connect_with(options)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;

        match result {
            Ok(pool) => {
                *self.pool.write() = Some(pool.clone());
                Ok(pool)
            }
            Err(e) => Err(Error::Identity(format!("failed to connect to database: {e}"))),
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        // the database may not exist yet, so connect to the server only
        let mut conn = MySqlConnection::connect_with(&self.config.server_options())
            .await
            .map_err(|e| db_error(&e))?;

        let create_database = format!(
            "CREATE DATABASE IF NOT EXISTS `{}` CHARACTER SET {} COLLATE {}",
            self.config.database_name, self.config.character, self.config.collation
        );
        let use_database = format!("USE `{}`", self.config.database_name);
        for statement in [
            create_database.as_str(),
            use_database.as_str(),
            CREATE_USER_TABLE,
            CREATE_DATASET_TABLE,
            CREATE_COURSE_TABLE,
        ] {
            sqlx::query(statement)
                .execute(&mut conn)
                .await
                .map_err(|e| db_error(&e))?;
        }
        conn.close().await.map_err(|e| db_error(&e))?;
        info!(database = %self.config.database_name, "Database schema ready");
        Ok(())
    }
}

impl IdentityBackend for RelationalIdentity {
    fn init(&self) -> IdentityFuture<'_, ()> {
        Box::pin(self.bootstrap())
    }

    fn create_user<'a>(&'a self, user: &'a User) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            sqlx::query(concat!(
                "INSERT INTO user (username, email, password, ch_name, description, role) ",
                "VALUES (?, ?, ?, ?, ?, ?)",
            ))
            .bind(user.name())
            .bind(&user.spec.email)
            .bind(&user.spec.password)
            .bind(&user.spec.chinese_name)
            .bind(&user.spec.description)
            .bind(user.spec.role)
            .execute(&pool)
            .await
            .map_err(|e| db_error(&e))?;
            Ok(())
        })
    }

    fn get_user<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, User> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM user WHERE username = ?"))
                .bind(name)
                .fetch_optional(&pool)
                .await
                .map_err(|e| db_error(&e))?
                .ok_or_else(|| Error::not_found("user", name))?;
            user_from_row(&row)
        })
    }

    fn update_user<'a>(&'a self, user: &'a User) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            sqlx::query(concat!(
                "UPDATE user SET email = ?, password = ?, ch_name = ?, description = ?, role = ? ",
                "WHERE username = ?",
            ))
            .bind(&user.spec.email)
            .bind(&user.spec.password)
            .bind(&user.spec.chinese_name)
            .bind(&user.spec.description)
            .bind(user.spec.role)
            .bind(user.name())
            .execute(&pool)
            .await
            .map_err(|e| {
                error!(user = %user.name(), error = %e, "Failed to update user");
                db_error(&e)
            })?;
            Ok(())
        })
    }

    fn delete_user<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let result = sqlx::query("DELETE FROM user WHERE username = ?")
                .bind(name)
                .execute(&pool)
                .await
                .map_err(|e| db_error(&e))?;
            expect_affected(result.rows_affected(), "user", name)
        })
    }

    fn list_users(&self) -> IdentityFuture<'_, Vec<User>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let rows = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM user"))
                .fetch_all(&pool)
                .await
                .map_err(|e| db_error(&e))?;
            rows.iter().map(user_from_row).collect()
        })
    }

    fn login_user<'a>(&'a self, name: &'a str, password: &'a str) -> IdentityFuture<'a, User> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let row = sqlx::query(&format!(
                "SELECT {USER_COLUMNS} FROM user WHERE username = ? AND password = ?"
            ))
            .bind(name)
            .bind(password)
            .fetch_optional(&pool)
            .await
            .map_err(|e| db_error(&e))?
            .ok_or_else(|| {
                Error::Unauthenticated(format!("user {name} not found or password mismatch"))
            })?;
            user_from_row(&row)
        })
    }

    fn create_dataset<'a>(&'a self, dataset: &'a Dataset) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let now = Utc::now().naive_utc();
            sqlx::query(concat!(
                "INSERT INTO dataset (name, description, create_time, last_update) ",
                "VALUES (?, ?, ?, ?)",
            ))
            .bind(&dataset.metadata.name)
            .bind(&dataset.spec.description)
            .bind(now)
            .bind(now)
            .execute(&pool)
            .await
            .map_err(|e| db_error(&e))?;
            Ok(())
        })
    }

    fn get_dataset<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, Dataset> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let row = sqlx::query(&format!("SELECT {DATASET_COLUMNS} FROM dataset WHERE name = ?"))
                .bind(name)
                .fetch_optional(&pool)
                .await
                .map_err(|e| db_error(&e))?
                .ok_or_else(|| Error::not_found("dataset", name))?;
            dataset_from_row(&row)
        })
    }

    fn update_dataset<'a>(&'a self, dataset: &'a Dataset) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let statement = "UPDATE dataset SET description = ?, last_update = ? WHERE name = ?";
            let result = sqlx::query(statement)
                .bind(&dataset.spec.description)
                .bind(Utc::now().naive_utc())
                .bind(&dataset.metadata.name)
                .execute(&pool)
                .await
                .map_err(|e| db_error(&e))?;
            expect_affected(result.rows_affected(), "dataset", &dataset.metadata.name)
        })
    }

    fn delete_dataset<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let result = sqlx::query("DELETE FROM dataset WHERE name = ?")
                .bind(name)
                .execute(&pool)
                .await
                .map_err(|e| db_error(&e))?;
            expect_affected(result.rows_affected(), "dataset", name)
        })
    }

    fn list_datasets(&self) -> IdentityFuture<'_, Vec<Dataset>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let rows = sqlx::query(&format!("SELECT {DATASET_COLUMNS} FROM dataset"))
                .fetch_all(&pool)
                .await
                .map_err(|e| db_error(&e))?;
            rows.iter().map(dataset_from_row).collect()
        })
    }

    fn create_course<'a>(&'a self, course: &'a Course) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let now = Utc::now().naive_utc();
            sqlx::query(concat!(
                "INSERT INTO course ",
                "(name, description, created_by, create_time, last_update, file_size, level) ",
                "VALUES (?, ?, ?, ?, ?, ?, ?)",
            ))
            .bind(&course.metadata.name)
            .bind(&course.spec.description)
            .bind(&course.spec.created_by)
            .bind(now)
            .bind(now)
            .bind(course.spec.size)
            .bind(course.spec.level)
            .execute(&pool)
            .await
            .map_err(|e| db_error(&e))?;
            Ok(())
        })
    }

    fn get_course<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, Course> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let row = sqlx::query(&format!("SELECT {COURSE_COLUMNS} FROM course WHERE name = ?"))
                .bind(name)
                .fetch_optional(&pool)
                .await
                .map_err(|e| db_error(&e))?
                .ok_or_else(|| Error::not_found("course", name))?;
            course_from_row(&row)
        })
    }

    fn update_course<'a>(&'a self, course: &'a Course) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let statement =
                "UPDATE course SET description = ?, level = ?, last_update = ? WHERE name = ?";
            let result = sqlx::query(statement)
                .bind(&course.spec.description)
                .bind(course.spec.level)
                .bind(Utc::now().naive_utc())
                .bind(&course.metadata.name)
                .execute(&pool)
                .await
                .map_err(|e| db_error(&e))?;
            expect_affected(result.rows_affected(), "course", &course.metadata.name)
        })
    }

    fn delete_course<'a>(&'a self, name: &'a str) -> IdentityFuture<'a, ()> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let result = sqlx::query("DELETE FROM course WHERE name = ?")
                .bind(name)
                .execute(&pool)
                .await
                .map_err(|e| db_error(&e))?;
            expect_affected(result.rows_affected(), "course", name)
        })
    }

    fn list_courses(&self) -> IdentityFuture<'_, Vec<Course>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let rows = sqlx::query(&format!("SELECT {COURSE_COLUMNS} FROM course"))
                .fetch_all(&pool)
                .await
                .map_err(|e| db_error(&e))?;
            rows.iter().map(course_from_row).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> RelationalConfig {
        RelationalConfig {
            address: "127.0.0.1".to_string(),
            port: 1,
            connect_timeout_secs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = RelationalConfig::default();
        assert_eq!(config.port, 3306);
        assert_eq!(config.database_name, "openhydra");
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_schema_has_unique_names() {
        assert!(CREATE_USER_TABLE.contains("UNIQUE (username)"));
        assert!(CREATE_DATASET_TABLE.contains("UNIQUE (name)"));
        assert!(CREATE_COURSE_TABLE.contains("file_size BIGINT"));
    }

    #[test]
    fn test_expect_affected() {
        assert!(expect_affected(1, "user", "alice").is_ok());
        assert!(expect_affected(0, "user", "alice").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_database_is_identity_error() {
        let backend = RelationalIdentity::new(unreachable_config());
        let err = backend.get_user("alice").await.unwrap_err();
        assert!(matches!(err, Error::Identity(_)), "{err}");
    }

    #[tokio::test]
    async fn test_concurrent_acquisitions_fail_together() {
        let backend = std::sync::Arc::new(RelationalIdentity::new(unreachable_config()));
        let (a, b) = tokio::join!(backend.list_users(), backend.list_datasets());
        assert!(matches!(a, Err(Error::Identity(_))));
        assert!(matches!(b, Err(Error::Identity(_))));
    }
}
