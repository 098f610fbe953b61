//! SQLite-backed [`super::KvStore`] implementation.
//!
//! Gives the pipeline a durable store for single-process deployments where
//! state must survive a restart (shield ack tokens, scheduler locks, audit
//! indexes) without standing up a separate Redis instance. Every operation
//! hands the blocking `rusqlite` call to `spawn_blocking` so it never stalls
//! the async runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use glob::Pattern;
use rusqlite::{params, Connection, OptionalExtension};

use super::KvStore;
use crate::error::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_scalars (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE TABLE IF NOT EXISTS kv_zsets (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    score REAL NOT NULL,
    PRIMARY KEY (key, member)
);
CREATE TABLE IF NOT EXISTS kv_sets (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (key, member)
);
";

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn storage_err(err: impl std::fmt::Display) -> Error {
    Error::Internal(format!("sqlite store error: {err}"))
}

/// A SQLite-backed key/value store satisfying the same [`KvStore`] contract
/// as [`super::InMemoryKv`], swappable in without any caller changes.
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    /// Open (or create) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-memory SQLite database, useful for tests that want real SQL
    /// semantics without a file on disk.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poison| poison.into_inner());
            f(&guard)
        })
        .await
        .map_err(storage_err)?
        .map_err(storage_err)
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        let now = now_millis();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_scalars WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = ttl_seconds.map(|s| now_millis() + s as i64 * 1000);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_scalars (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool> {
        let key = key.to_string();
        let value = value.to_string();
        let now = now_millis();
        let expires_at = now + ttl_seconds as i64 * 1000;
        self.with_conn(move |conn| {
            let live: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM kv_scalars WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;
            if live.is_some() {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO kv_scalars (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(true)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| Ok(conn.execute("DELETE FROM kv_scalars WHERE key = ?1", params![key])? > 0))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let key = key.to_string();
        let now = now_millis();
        self.with_conn(move |conn| {
            let current: Option<(String, Option<i64>)> = conn
                .query_row(
                    "SELECT value, expires_at FROM kv_scalars WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (value, expires_at) = match current {
                Some((v, exp)) if exp.map(|e| e > now).unwrap_or(true) => (v.parse::<i64>().unwrap_or(0), exp),
                _ => (0, None),
            };
            let next = value + 1;
            conn.execute(
                "INSERT INTO kv_scalars (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, next.to_string(), expires_at],
            )?;
            Ok(next)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let key = key.to_string();
        let expires_at = now_millis() + ttl_seconds as i64 * 1000;
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE kv_scalars SET expires_at = ?2 WHERE key = ?1",
                params![key, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pat = Pattern::new(pattern).map_err(|e| Error::invalid_input(format!("bad pattern: {e}")))?;
        let now = now_millis();
        let all: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key FROM kv_scalars WHERE expires_at IS NULL OR expires_at > ?1",
                )?;
                let rows = stmt.query_map(params![now], |row| row.get(0))?;
                rows.collect()
            })
            .await?;
        Ok(all.into_iter().filter(|k| pat.matches(k)).collect())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let key = key.to_string();
        let member = member.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_zsets (key, member, score) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
                params![key, member, score],
            )?;
            Ok(())
        })
        .await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let members = self.zset_ascending(key).await?;
        Ok(slice_range(&members, start, stop))
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut members = self.zset_ascending(key).await?;
        members.reverse();
        Ok(slice_range(&members, start, stop))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let key = key.to_string();
        let member = member.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO kv_sets (key, member) VALUES (?1, ?2)",
                params![key, member],
            )?;
            Ok(())
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let key = key.to_string();
        let member = member.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv_sets WHERE key = ?1 AND member = ?2", params![key, member])?;
            Ok(())
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT member FROM kv_sets WHERE key = ?1")?;
            let rows = stmt.query_map(params![key], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT COUNT(*) FROM kv_sets WHERE key = ?1", params![key], |row| row.get(0))
        })
        .await
    }

    async fn cas_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let key = key.to_string();
        let expected = expected.to_string();
        let now = now_millis();
        self.with_conn(move |conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT value FROM kv_scalars WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;
            match current {
                Some(v) if v == expected => {
                    conn.execute("DELETE FROM kv_scalars WHERE key = ?1", params![key])?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }
}

impl SqliteKv {
    async fn zset_ascending(&self, key: &str) -> Result<Vec<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT member FROM kv_zsets WHERE key = ?1 ORDER BY score ASC")?;
            let rows = stmt.query_map(params![key], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }
}

fn slice_range(members: &[String], start: i64, stop: i64) -> Vec<String> {
    let len = members.len() as i64;
    let resolve = |idx: i64| -> i64 {
        if idx < 0 {
            (len + idx).max(0)
        } else {
            idx
        }
    };
    let lo = resolve(start).min(len);
    let hi = resolve(stop).min(len - 1);
    if hi < lo || members.is_empty() {
        return Vec::new();
    }
    members[lo as usize..=hi as usize].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteKv {
        SqliteKv::in_memory().unwrap()
    }

    #[tokio::test]
    async fn set_nx_is_exclusive() {
        let kv = store();
        assert!(kv.set_nx("lock", "a", 60).await.unwrap());
        assert!(!kv.set_nx("lock", "b", 60).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn incr_is_atomic_and_starts_at_zero() {
        let kv = store();
        assert_eq!(kv.incr("c").await.unwrap(), 1);
        assert_eq!(kv.incr("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cas_delete_only_matches_expected_value() {
        let kv = store();
        kv.set("tok", "abc", None).await.unwrap();
        assert!(!kv.cas_delete("tok", "wrong").await.unwrap());
        assert!(kv.cas_delete("tok", "abc").await.unwrap());
        assert!(!kv.exists("tok").await.unwrap());
    }

    #[tokio::test]
    async fn zrange_orders_ascending_by_score() {
        let kv = store();
        kv.zadd("z", 3.0, "c").await.unwrap();
        kv.zadd("z", 1.0, "a").await.unwrap();
        kv.zadd("z", 2.0, "b").await.unwrap();
        assert_eq!(
            kv.zrange("z", 0, -1).await.unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(
            kv.zrevrange("z", 0, -1).await.unwrap(),
            vec!["c".to_string(), "b".to_string(), "a".to_string()]
        );
    }

    #[tokio::test]
    async fn set_operations() {
        let kv = store();
        kv.sadd("purposes", "analytics").await.unwrap();
        kv.sadd("purposes", "marketing").await.unwrap();
        assert_eq!(kv.scard("purposes").await.unwrap(), 2);
        kv.srem("purposes", "marketing").await.unwrap();
        assert_eq!(kv.smembers("purposes").await.unwrap(), vec!["analytics".to_string()]);
    }

    #[tokio::test]
    async fn expired_scalar_reads_as_absent() {
        let kv = store();
        kv.set("short", "v", Some(0)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(kv.get("short").await.unwrap(), None);
    }
}
