//! Abstract key/value store interface.
//!
//! Any backing store satisfying this trait is acceptable; Redis and an
//! in-memory map both satisfy it. This module defines the trait and ships
//! [`InMemoryKv`], a reference implementation used by default and by tests.

mod memory;
mod sqlite;

pub use memory::InMemoryKv;
pub use sqlite::SqliteKv;

use async_trait::async_trait;
use crate::error::Result;

/// Abstract key/value store with the operations the pipeline's components
/// (rate limiter, shield engine, scheduler, retention store) depend on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Return the value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` at `key`, optionally expiring after `ttl_seconds`.
    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()>;

    /// Set `key` to `value` only if absent; returns whether it was acquired.
    async fn set_nx(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool>;

    /// Remove `key`; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether `key` currently exists (and has not expired).
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Atomically increment the integer stored at `key` (default 0) and
    /// return the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set a TTL on an existing key.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()>;

    /// Glob-match keys against `pattern`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Add `member` to the sorted set at `key` with `score`.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;

    /// Return members of the sorted set at `key` within `[start, stop]`
    /// (inclusive rank indices), ascending by score.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Same as [`KvStore::zrange`] but descending by score.
    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Add `member` to the set at `key`.
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// Remove `member` from the set at `key`.
    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    /// All members of the set at `key`.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Cardinality of the set at `key`.
    async fn scard(&self, key: &str) -> Result<u64>;

    /// Conditional delete used by acknowledgment-token consumption: delete
    /// `key` only if its current value equals `expected`. Returns whether
    /// the delete happened.
    async fn cas_delete(&self, key: &str, expected: &str) -> Result<bool>;
}
