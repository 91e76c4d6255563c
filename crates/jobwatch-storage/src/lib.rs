//! SQLite persistence for users, filter sets, and delivery history.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{FilterKey, FilterSet, UserAccount};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jobwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// User accounts. Deactivation is the only removal path.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn list_active_users(&self) -> StoreResult<Vec<UserAccount>>;
    async fn upsert_user(
        &self,
        chat_id: i64,
        first_name: Option<&str>,
        username: Option<&str>,
    ) -> StoreResult<UserAccount>;
    async fn set_active(&self, user_id: i64, active: bool) -> StoreResult<()>;
}

/// Per-user filter key/value pairs; authoritative, re-read fresh at the
/// start of every per-user check.
#[async_trait]
pub trait FilterStore: Send + Sync {
    async fn filters(&self, user_id: i64) -> StoreResult<FilterSet>;
    async fn save_filter(&self, user_id: i64, key: FilterKey, value: &str) -> StoreResult<()>;
    async fn clear_filters(&self, user_id: i64) -> StoreResult<()>;
}

/// Durable backing for the deduplication ledger, with a bounded retention
/// window so the table does not grow without limit.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn record_delivered(
        &self,
        user_id: i64,
        listing_ids: &[String],
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn delivered_since(
        &self,
        user_id: i64,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>>;
    async fn prune_delivered_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id INTEGER NOT NULL UNIQUE,
        first_name TEXT,
        username TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS user_filters (
        user_id INTEGER NOT NULL,
        filter_key TEXT NOT NULL,
        filter_value TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (user_id, filter_key)
    )",
    "CREATE TABLE IF NOT EXISTS delivered_listings (
        user_id INTEGER NOT NULL,
        listing_id TEXT NOT NULL,
        delivered_at TEXT NOT NULL,
        PRIMARY KEY (user_id, listing_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_delivered_at ON delivered_listings (delivered_at)",
];

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("parsing database url {url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        Ok(Self { pool })
    }

    /// Idempotent schema creation; safe to run at every startup.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("applying schema statement")?;
        }
        debug!("database schema up to date");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// sqlx-backed implementation of all three store traits.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool.clone(),
        }
    }

    async fn user_by_chat_id(&self, chat_id: i64) -> StoreResult<UserAccount> {
        let row = sqlx::query_as::<_, (i64, i64, Option<String>, Option<String>, bool)>(
            "SELECT id, chat_id, first_name, username, active FROM users WHERE chat_id = ?",
        )
        .bind(chat_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(account_from_row(row))
    }
}

fn account_from_row(row: (i64, i64, Option<String>, Option<String>, bool)) -> UserAccount {
    UserAccount {
        id: row.0,
        chat_id: row.1,
        first_name: row.2,
        username: row.3,
        active: row.4,
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn list_active_users(&self) -> StoreResult<Vec<UserAccount>> {
        let rows = sqlx::query_as::<_, (i64, i64, Option<String>, Option<String>, bool)>(
            "SELECT id, chat_id, first_name, username, active FROM users
             WHERE active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(account_from_row).collect())
    }

    async fn upsert_user(
        &self,
        chat_id: i64,
        first_name: Option<&str>,
        username: Option<&str>,
    ) -> StoreResult<UserAccount> {
        sqlx::query(
            "INSERT INTO users (chat_id, first_name, username, active, created_at)
             VALUES (?, ?, ?, 1, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
                 first_name = excluded.first_name,
                 username = excluded.username",
        )
        .bind(chat_id)
        .bind(first_name)
        .bind(username)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.user_by_chat_id(chat_id).await
    }

    async fn set_active(&self, user_id: i64, active: bool) -> StoreResult<()> {
        sqlx::query("UPDATE users SET active = ? WHERE id = ?")
            .bind(active)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FilterStore for SqliteStore {
    async fn filters(&self, user_id: i64) -> StoreResult<FilterSet> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT filter_key, filter_value FROM user_filters WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut set = FilterSet::new();
        for (key, value) in rows {
            match FilterKey::parse(&key) {
                Some(key) => set.set(key, value),
                None => warn!(user_id, key, "skipping unknown stored filter key"),
            }
        }
        Ok(set)
    }

    async fn save_filter(&self, user_id: i64, key: FilterKey, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO user_filters (user_id, filter_key, filter_value, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, filter_key) DO UPDATE SET
                 filter_value = excluded.filter_value,
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(key.as_str())
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_filters(&self, user_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM user_filters WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for SqliteStore {
    async fn record_delivered(
        &self,
        user_id: i64,
        listing_ids: &[String],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for listing_id in listing_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO delivered_listings (user_id, listing_id, delivered_at)
                 VALUES (?, ?, ?)",
            )
            .bind(user_id)
            .bind(listing_id)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delivered_since(
        &self,
        user_id: i64,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT listing_id FROM delivered_listings
             WHERE user_id = ? AND delivered_at >= ?",
        )
        .bind(user_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn prune_delivered_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM delivered_listings WHERE delivered_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// In-process store double for engine and dispatcher tests. Supports
/// injecting a filter-read failure for a chosen user to exercise the
/// per-user error isolation path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: Mutex<Vec<UserAccount>>,
    filters: Mutex<HashMap<i64, FilterSet>>,
    delivered: Mutex<Vec<(i64, String, DateTime<Utc>)>>,
    fail_filters_for: Mutex<Vec<i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: UserAccount) {
        self.users.lock().unwrap().push(user);
    }

    pub fn put_filters(&self, user_id: i64, filters: FilterSet) {
        self.filters.lock().unwrap().insert(user_id, filters);
    }

    pub fn fail_filters_for(&self, user_id: i64) {
        self.fail_filters_for.lock().unwrap().push(user_id);
    }

    pub fn delivered_entries(&self) -> Vec<(i64, String, DateTime<Utc>)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn list_active_users(&self) -> StoreResult<Vec<UserAccount>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.active)
            .cloned()
            .collect())
    }

    async fn upsert_user(
        &self,
        chat_id: i64,
        first_name: Option<&str>,
        username: Option<&str>,
    ) -> StoreResult<UserAccount> {
        let mut users = self.users.lock().unwrap();
        if let Some(existing) = users.iter_mut().find(|u| u.chat_id == chat_id) {
            existing.first_name = first_name.map(str::to_string);
            existing.username = username.map(str::to_string);
            return Ok(existing.clone());
        }
        let user = UserAccount {
            id: users.len() as i64 + 1,
            chat_id,
            first_name: first_name.map(str::to_string),
            username: username.map(str::to_string),
            active: true,
        };
        users.push(user.clone());
        Ok(user)
    }

    async fn set_active(&self, user_id: i64, active: bool) -> StoreResult<()> {
        let mut users = self.users.lock().unwrap();
        if let Some(user) = users.iter_mut().find(|u| u.id == user_id) {
            user.active = active;
        }
        Ok(())
    }
}

#[async_trait]
impl FilterStore for MemoryStore {
    async fn filters(&self, user_id: i64) -> StoreResult<FilterSet> {
        if self.fail_filters_for.lock().unwrap().contains(&user_id) {
            return Err(StoreError::Unavailable(format!(
                "injected filter failure for user {user_id}"
            )));
        }
        Ok(self
            .filters
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_filter(&self, user_id: i64, key: FilterKey, value: &str) -> StoreResult<()> {
        self.filters
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .set(key, value);
        Ok(())
    }

    async fn clear_filters(&self, user_id: i64) -> StoreResult<()> {
        self.filters.lock().unwrap().remove(&user_id);
        Ok(())
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn record_delivered(
        &self,
        user_id: i64,
        listing_ids: &[String],
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut delivered = self.delivered.lock().unwrap();
        for id in listing_ids {
            if !delivered
                .iter()
                .any(|(uid, lid, _)| *uid == user_id && lid == id)
            {
                delivered.push((user_id, id.clone(), at));
            }
        }
        Ok(())
    }

    async fn delivered_since(
        &self,
        user_id: i64,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        Ok(self
            .delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(uid, _, at)| *uid == user_id && *at >= cutoff)
            .map(|(_, id, _)| id.clone())
            .collect())
    }

    async fn prune_delivered_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut delivered = self.delivered.lock().unwrap();
        let before = delivered.len();
        delivered.retain(|(_, _, at)| *at >= cutoff);
        Ok((before - delivered.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    async fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}/jobwatch.db", dir.path().display());
        let database = Database::connect(&url).await.expect("connect");
        database.migrate().await.expect("migrate");
        (dir, SqliteStore::new(&database))
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_chat_id() {
        let (_dir, store) = open_store().await;

        let first = store.upsert_user(100, Some("Анна"), None).await.unwrap();
        let second = store
            .upsert_user(100, Some("Анна"), Some("anna"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.username.as_deref(), Some("anna"));
        assert_eq!(store.list_active_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deactivated_users_drop_out_of_the_active_list() {
        let (_dir, store) = open_store().await;

        let user = store.upsert_user(200, None, None).await.unwrap();
        store.set_active(user.id, false).await.unwrap();

        assert!(store.list_active_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filters_round_trip_with_last_write_wins() {
        let (_dir, store) = open_store().await;
        let user = store.upsert_user(300, None, None).await.unwrap();

        store
            .save_filter(user.id, FilterKey::Profession, "разработчик")
            .await
            .unwrap();
        store
            .save_filter(user.id, FilterKey::Profession, "аналитик")
            .await
            .unwrap();
        store
            .save_filter(user.id, FilterKey::SalaryMin, "120000")
            .await
            .unwrap();

        let filters = store.filters(user.id).await.unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters.get(FilterKey::Profession), Some("аналитик"));

        store.clear_filters(user.id).await.unwrap();
        assert!(store.filters(user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivery_history_respects_cutoffs_and_pruning() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();
        let old = now - Duration::days(10);

        store
            .record_delivered(1, &["a".to_string(), "b".to_string()], old)
            .await
            .unwrap();
        store
            .record_delivered(1, &["c".to_string()], now)
            .await
            .unwrap();
        // Re-recording an already delivered id is a no-op.
        store
            .record_delivered(1, &["c".to_string()], now)
            .await
            .unwrap();

        let recent = store
            .delivered_since(1, now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(recent, vec!["c".to_string()]);

        let pruned = store
            .prune_delivered_before(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(pruned, 2);
    }
}
