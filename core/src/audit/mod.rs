//! Audit logger: append-only event log with hashing
//! and per-user/per-category sorted-set indexes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Result;
use crate::kv::KvStore;

/// Closed category set for audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    SecurityViolation,
    Safety,
    RateLimit,
    DataAccess,
    Consent,
    Scheduler,
    ProviderFailure,
    InvariantViolation,
    Other,
}

impl std::fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SecurityViolation => "security_violation",
            Self::Safety => "safety",
            Self::RateLimit => "rate_limit",
            Self::DataAccess => "data_access",
            Self::Consent => "consent",
            Self::Scheduler => "scheduler",
            Self::ProviderFailure => "provider_failure",
            Self::InvariantViolation => "invariant_violation",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Severity inferred from category (and optionally overridden by caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl AuditCategory {
    /// Default severity inference per category.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::SecurityViolation | Self::Safety | Self::InvariantViolation => {
                Severity::Critical
            }
            Self::RateLimit | Self::ProviderFailure => Severity::Warning,
            Self::DataAccess | Self::Consent | Self::Scheduler | Self::Other => Severity::Info,
        }
    }
}

/// A single append-only audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub category: AuditCategory,
    pub severity: Severity,
    pub user_id: Option<String>,
    pub message: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub hash: String,
}

impl AuditEvent {
    fn compute_hash(
        category: &AuditCategory,
        user_id: &Option<String>,
        message: &str,
        metadata: &serde_json::Value,
        timestamp: &DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(category.to_string().as_bytes());
        hasher.update(user_id.as_deref().unwrap_or("").as_bytes());
        hasher.update(message.as_bytes());
        hasher.update(metadata.to_string().as_bytes());
        hasher.update(timestamp.to_rfc3339().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Append-only audit logger backed by a [`KvStore`].
///
/// Writers never read: multiple writers only contend on the
/// monotonic index counters the underlying store handles atomically.
pub struct AuditLogger {
    kv: Arc<dyn KvStore>,
    retention_days: u32,
}

impl AuditLogger {
    pub fn new(kv: Arc<dyn KvStore>, retention_days: u32) -> Self {
        Self { kv, retention_days }
    }

    fn event_key(id: &str) -> String {
        format!("audit:event:{id}")
    }

    fn user_index_key(user_id: &str) -> String {
        format!("audit:by_user:{user_id}")
    }

    fn category_index_key(category: AuditCategory) -> String {
        format!("audit:by_category:{category}")
    }

    /// Append a new event. Severity is inferred from `category` unless
    /// `severity_override` is given.
    pub async fn record(
        &self,
        category: AuditCategory,
        user_id: Option<&str>,
        message: impl Into<String>,
        metadata: serde_json::Value,
        severity_override: Option<Severity>,
    ) -> Result<AuditEvent> {
        let id = Uuid::new_v4().to_string();
        let timestamp = Utc::now();
        let message = message.into();
        let user_id = user_id.map(str::to_string);
        let severity = severity_override.unwrap_or_else(|| category.default_severity());

        let hash = AuditEvent::compute_hash(&category, &user_id, &message, &metadata, &timestamp);

        let event = AuditEvent {
            id: id.clone(),
            category,
            severity,
            user_id: user_id.clone(),
            message,
            metadata,
            timestamp,
            hash,
        };

        let ttl = self.retention_days as u64 * 86_400;
        let serialized = serde_json::to_string(&event)?;
        self.kv
            .set(&Self::event_key(&id), &serialized, Some(ttl))
            .await?;

        let score = timestamp.timestamp_millis() as f64;
        if let Some(ref uid) = user_id {
            self.kv.zadd(&Self::user_index_key(uid), score, &id).await?;
        }
        self.kv
            .zadd(&Self::category_index_key(category), score, &id)
            .await?;

        if severity == Severity::Critical {
            tracing::error!(category = %category, user_id = ?event.user_id, "critical audit event");
        } else {
            tracing::debug!(category = %category, "audit event recorded");
        }

        Ok(event)
    }

    /// Read an event back by id.
    pub async fn get(&self, id: &str) -> Result<Option<AuditEvent>> {
        match self.kv.get(&Self::event_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// All event ids for a user, most recent first.
    pub async fn for_user(&self, user_id: &str, limit: i64) -> Result<Vec<String>> {
        self.kv
            .zrevrange(&Self::user_index_key(user_id), 0, limit - 1)
            .await
    }

    /// All event ids for a category, most recent first.
    pub async fn for_category(&self, category: AuditCategory, limit: i64) -> Result<Vec<String>> {
        self.kv
            .zrevrange(&Self::category_index_key(category), 0, limit - 1)
            .await
    }
}
