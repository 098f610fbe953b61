//! In-memory reference implementation of [`super::KvStore`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use glob::Pattern;

use super::KvStore;
use crate::error::Result;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

#[derive(Default)]
struct Inner {
    scalars: HashMap<String, Entry>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    sets: HashMap<String, HashSet<String>>,
}

/// A process-local key/value store backed by a `Mutex<HashMap>`.
///
/// Suitable for single-process deployments and as the default store used
/// by tests; a distributed deployment swaps this for a Redis-backed
/// implementation of the same [`KvStore`] trait without any caller changes.
pub struct InMemoryKv {
    inner: Mutex<Inner>,
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn normalize_range(len: usize, start: i64, stop: i64) -> (usize, usize) {
    let len_i = len as i64;
    let resolve = |idx: i64| -> i64 {
        if idx < 0 {
            (len_i + idx).max(0)
        } else {
            idx
        }
    };
    let start = resolve(start).min(len_i);
    let stop = resolve(stop).min(len_i - 1);
    if stop < start || len == 0 {
        (0, 0).into()
    } else {
        (start as usize, stop as usize + 1)
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.lock();
        match inner.scalars.get(key) {
            Some(e) if e.is_live() => Ok(Some(e.value.clone())),
            Some(_) => {
                inner.scalars.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        let expires_at = ttl_seconds.map(|s| Instant::now() + Duration::from_secs(s));
        self.lock().scalars.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool> {
        let mut inner = self.lock();
        if let Some(e) = inner.scalars.get(key) {
            if e.is_live() {
                return Ok(false);
            }
        }
        inner.scalars.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().scalars.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.scalars.get(key) {
            Some(e) if e.is_live() => Ok(true),
            Some(_) => {
                inner.scalars.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut inner = self.lock();
        let current = match inner.scalars.get(key) {
            Some(e) if e.is_live() => e.value.parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + 1;
        let expires_at = inner.scalars.get(key).and_then(|e| e.expires_at);
        inner.scalars.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(e) = inner.scalars.get_mut(key) {
            e.expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds));
        }
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pat = Pattern::new(pattern)
            .map_err(|e| crate::error::Error::invalid_input(format!("bad pattern: {e}")))?;
        let inner = self.lock();
        Ok(inner
            .scalars
            .iter()
            .filter(|(_, e)| e.is_live())
            .map(|(k, _)| k.clone())
            .filter(|k| pat.matches(k))
            .collect())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut inner = self.lock();
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        set.push((score, member.to_string()));
        set.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let inner = self.lock();
        let set = inner.zsets.get(key).cloned().unwrap_or_default();
        let (lo, hi) = normalize_range(set.len(), start, stop);
        Ok(set[lo..hi].iter().map(|(_, m)| m.clone()).collect())
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut set = inner.zsets.get(key).cloned().unwrap_or_default();
        set.reverse();
        let (lo, hi) = normalize_range(set.len(), start, stop);
        Ok(set[lo..hi].iter().map(|(_, m)| m.clone()).collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.lock().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        Ok(self.lock().sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn cas_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut inner = self.lock();
        match inner.scalars.get(key) {
            Some(e) if e.is_live() && e.value == expected => {
                inner.scalars.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
