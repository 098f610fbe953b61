//! Retention and consent store.
//!
//! Consent is modeled as an append-only log of grant/revoke events; the
//! "current" consent state for a purpose is derived by folding the log
//! rather than stored as mutable state, so a consent history can never be
//! silently rewritten. Retention enforcement is a separate, explicit sweep
//! (run from the `retention-enforcement` scheduled job) that archives then
//! deletes keys past their category's window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::KvStore;

/// A data category subject to its own retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    ConversationHistory,
    AuditLog,
    SparkHistory,
    ConsentRecords,
    SessionState,
}

impl DataCategory {
    /// Glob pattern over the `KvStore` keys this category owns.
    fn key_pattern(&self) -> &'static str {
        match self {
            Self::ConversationHistory => "conversation:*",
            Self::AuditLog => "audit:event:*",
            Self::SparkHistory => "spark:history:*",
            Self::ConsentRecords => "consent:log:*",
            Self::SessionState => "pipeline:session_mode:*",
        }
    }
}

/// What happens to a key once it ages past its retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    Delete,
    /// Replace the value with an anonymized placeholder rather than
    /// removing the key outright.
    Anonymize,
}

/// Retention window and disposition for a [`DataCategory`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub category: DataCategory,
    pub retention_days: u32,
    pub action: RetentionAction,
    /// Whether a key is copied to cold storage before it's acted on.
    pub archive_before_delete: bool,
    /// How long an archived copy is kept, independent of the live window.
    pub archive_retention_days: u32,
    pub enabled: bool,
}

/// Default retention policy table.
pub fn default_policies() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy {
            category: DataCategory::ConversationHistory,
            retention_days: 90,
            action: RetentionAction::Delete,
            archive_before_delete: true,
            archive_retention_days: 365,
            enabled: true,
        },
        RetentionPolicy {
            category: DataCategory::AuditLog,
            retention_days: 365,
            action: RetentionAction::Delete,
            archive_before_delete: true,
            archive_retention_days: 365 * 3,
            enabled: true,
        },
        RetentionPolicy {
            category: DataCategory::SparkHistory,
            retention_days: 30,
            action: RetentionAction::Delete,
            archive_before_delete: false,
            archive_retention_days: 0,
            enabled: true,
        },
        // Consent history itself is kept far longer than any other category
        // so a later dispute can still be resolved from the append log.
        RetentionPolicy {
            category: DataCategory::ConsentRecords,
            retention_days: 365 * 7,
            action: RetentionAction::Delete,
            archive_before_delete: true,
            archive_retention_days: 365 * 10,
            enabled: true,
        },
        RetentionPolicy {
            category: DataCategory::SessionState,
            retention_days: 30,
            action: RetentionAction::Delete,
            archive_before_delete: false,
            archive_retention_days: 0,
            enabled: true,
        },
    ]
}

/// A single consent purpose (e.g. "analytics", "marketing", "live_data").
pub type ConsentPurpose = String;

/// Append-only consent event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentAction {
    Grant,
    Revoke,
}

/// How a consent event was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMethod {
    ExplicitUi,
    ApiCall,
    ImpliedByContinuedUse,
}

/// Purposes every user must have granted for the pipeline to use live data
/// or proceed with action recommendations.
pub const REQUIRED_CONSENT_PURPOSES: &[&str] = &["live_data"];

/// Version of the consent policy text a grant/revoke was recorded against.
pub const CURRENT_POLICY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConsentEvent {
    id: String,
    action: ConsentAction,
    method: ConsentMethod,
    policy_version: u32,
    ip_address: Option<String>,
    user_agent: Option<String>,
    timestamp: DateTime<Utc>,
}

/// Request to record a single consent event.
#[derive(Debug, Clone)]
pub struct ConsentRequest<'a> {
    pub purpose: &'a str,
    pub action: ConsentAction,
    pub method: ConsentMethod,
    pub policy_version: u32,
    pub ip_address: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Derived, read-only consent state for a single purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurposeConsent {
    pub purpose: ConsentPurpose,
    pub granted: bool,
    pub last_changed: DateTime<Utc>,
}

/// Derived, read-only snapshot of a user's current consent across every
/// purpose they have a log for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentSnapshot {
    pub purposes: Vec<PurposeConsent>,
    pub has_required_consents: bool,
    pub change_count: u32,
}

/// Outcome of a data-subject export request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportBundle {
    pub user_id: String,
    pub consent_history: HashMap<ConsentPurpose, Vec<(ConsentAction, DateTime<Utc>)>>,
    pub generated_at: DateTime<Utc>,
}

/// Result of sweeping one category for expired keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub category: DataCategory,
    pub keys_archived: u32,
    pub keys_deleted: u32,
}

/// Append-only consent log plus retention-policy-driven cleanup.
pub struct RetentionStore {
    kv: Arc<dyn KvStore>,
    policies: Vec<RetentionPolicy>,
}

impl RetentionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            policies: default_policies(),
        }
    }

    pub fn with_policies(mut self, policies: Vec<RetentionPolicy>) -> Self {
        self.policies = policies;
        self
    }

    pub fn policy_for(&self, category: DataCategory) -> Option<&RetentionPolicy> {
        self.policies.iter().find(|p| p.category == category)
    }

    fn consent_log_key(user_id: &str, purpose: &str) -> String {
        format!("consent:log:{user_id}:{purpose}")
    }

    fn consent_purposes_key(user_id: &str) -> String {
        format!("consent:purposes:{user_id}")
    }

    fn archive_key(category: DataCategory, original_key: &str) -> String {
        format!("archive:{category:?}:{original_key}")
    }

    /// Append a consent event; never overwrites history.
    pub async fn record_consent(&self, user_id: &str, request: ConsentRequest<'_>) -> Result<()> {
        let event = ConsentEvent {
            id: uuid::Uuid::new_v4().to_string(),
            action: request.action,
            method: request.method,
            policy_version: request.policy_version,
            ip_address: request.ip_address.map(str::to_string),
            user_agent: request.user_agent.map(str::to_string),
            timestamp: Utc::now(),
        };
        self.kv
            .zadd(
                &Self::consent_log_key(user_id, request.purpose),
                event.timestamp.timestamp_millis() as f64,
                &serde_json::to_string(&event)?,
            )
            .await?;
        self.kv.sadd(&Self::consent_purposes_key(user_id), request.purpose).await?;
        Ok(())
    }

    /// Fold the append-only log for `purpose` into its current snapshot:
    /// granted iff the most recent event is a `Grant`.
    async fn purpose_consent(&self, user_id: &str, purpose: &str) -> Result<PurposeConsent> {
        let raw_events = self.kv.zrevrange(&Self::consent_log_key(user_id, purpose), 0, 0).await?;
        let latest = raw_events.first().and_then(|raw| serde_json::from_str::<ConsentEvent>(raw).ok());
        Ok(PurposeConsent {
            purpose: purpose.to_string(),
            granted: latest.as_ref().map(|e| e.action == ConsentAction::Grant).unwrap_or(false),
            last_changed: latest.map(|e| e.timestamp).unwrap_or_else(Utc::now),
        })
    }

    /// A single purpose's current consent state, for callers that only
    /// need to gate on one purpose (e.g. the live-data gate).
    pub async fn current_consent(&self, user_id: &str, purpose: &str) -> Result<bool> {
        Ok(self.purpose_consent(user_id, purpose).await?.granted)
    }

    /// The user's full consent snapshot across every purpose they have a
    /// log for: per-purpose state, whether every required purpose is
    /// granted, and the total number of grant/revoke events on record.
    pub async fn consent_snapshot(&self, user_id: &str) -> Result<ConsentSnapshot> {
        let purpose_names = self.kv.smembers(&Self::consent_purposes_key(user_id)).await?;
        let mut purposes = Vec::with_capacity(purpose_names.len());
        let mut change_count = 0u32;
        for purpose in &purpose_names {
            purposes.push(self.purpose_consent(user_id, purpose).await?);
            let history_len = self.kv.zrange(&Self::consent_log_key(user_id, purpose), 0, -1).await?.len();
            change_count += history_len as u32;
        }
        let has_required_consents = REQUIRED_CONSENT_PURPOSES
            .iter()
            .all(|required| purposes.iter().any(|p| p.purpose == *required && p.granted));
        Ok(ConsentSnapshot { purposes, has_required_consents, change_count })
    }

    /// Export every purpose's full consent history for a data-subject
    /// access request.
    pub async fn export(&self, user_id: &str) -> Result<ExportBundle> {
        let purposes = self.kv.smembers(&Self::consent_purposes_key(user_id)).await?;
        let mut consent_history = HashMap::new();
        for purpose in purposes {
            let raw_events = self
                .kv
                .zrange(&Self::consent_log_key(user_id, &purpose), 0, -1)
                .await?;
            let events: Vec<(ConsentAction, DateTime<Utc>)> = raw_events
                .iter()
                .filter_map(|raw| serde_json::from_str::<ConsentEvent>(raw).ok())
                .map(|e| (e.action, e.timestamp))
                .collect();
            consent_history.insert(purpose, events);
        }
        Ok(ExportBundle {
            user_id: user_id.to_string(),
            consent_history,
            generated_at: Utc::now(),
        })
    }

    /// Handle a data-subject deletion request by revoking every known
    /// purpose; the log entries themselves remain (an append-only record of
    /// "this was revoked on this date") for the consent category's own
    /// retention window.
    pub async fn delete_request(&self, user_id: &str) -> Result<()> {
        let purposes = self.kv.smembers(&Self::consent_purposes_key(user_id)).await?;
        for purpose in purposes {
            self.record_consent(
                user_id,
                ConsentRequest {
                    purpose: &purpose,
                    action: ConsentAction::Revoke,
                    method: ConsentMethod::ApiCall,
                    policy_version: CURRENT_POLICY_VERSION,
                    ip_address: None,
                    user_agent: None,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Sweep every key belonging to `category`, archiving (if configured)
    /// and then acting on it per its policy. The store has no notion of a
    /// key's own age beyond its `KvStore` TTL, so this walks every key the
    /// category's glob pattern matches and treats "still present" as "not
    /// yet expired by its own TTL" — expiry itself is enforced by the
    /// store, this just handles the archive-then-delete side effect the
    /// store can't do on its own.
    pub async fn enforce(&self, category: DataCategory) -> Result<CleanupOutcome> {
        let Some(policy) = self.policy_for(category).copied() else {
            return Ok(CleanupOutcome { category, keys_archived: 0, keys_deleted: 0 });
        };
        if !policy.enabled {
            return Ok(CleanupOutcome { category, keys_archived: 0, keys_deleted: 0 });
        }

        let keys = self.kv.keys(category.key_pattern()).await?;
        let mut keys_archived = 0u32;
        let mut keys_deleted = 0u32;

        for key in keys {
            if policy.archive_before_delete {
                if let Some(value) = self.kv.get(&key).await? {
                    let archive_ttl = policy.archive_retention_days as u64 * 86_400;
                    self.kv.set(&Self::archive_key(category, &key), &value, Some(archive_ttl)).await?;
                    keys_archived += 1;
                }
            }

            match policy.action {
                RetentionAction::Delete => {
                    if self.kv.delete(&key).await? {
                        keys_deleted += 1;
                    }
                }
                RetentionAction::Anonymize => {
                    let ttl = policy.retention_days as u64 * 86_400;
                    self.kv.set(&key, "[redacted]", Some(ttl)).await?;
                }
            }
        }

        Ok(CleanupOutcome { category, keys_archived, keys_deleted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    fn store() -> RetentionStore {
        RetentionStore::new(Arc::new(InMemoryKv::new()))
    }

    fn grant(purpose: &str) -> ConsentRequest<'_> {
        ConsentRequest {
            purpose,
            action: ConsentAction::Grant,
            method: ConsentMethod::ExplicitUi,
            policy_version: CURRENT_POLICY_VERSION,
            ip_address: Some("127.0.0.1"),
            user_agent: Some("test-agent"),
        }
    }

    fn revoke(purpose: &str) -> ConsentRequest<'_> {
        ConsentRequest { action: ConsentAction::Revoke, ..grant(purpose) }
    }

    #[tokio::test]
    async fn consent_reflects_most_recent_event() {
        let store = store();
        store.record_consent("u1", grant("analytics")).await.unwrap();
        assert!(store.current_consent("u1", "analytics").await.unwrap());

        store.record_consent("u1", revoke("analytics")).await.unwrap();
        assert!(!store.current_consent("u1", "analytics").await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_reports_required_consents_and_change_count() {
        let store = store();
        store.record_consent("u1", grant("live_data")).await.unwrap();
        store.record_consent("u1", grant("marketing")).await.unwrap();
        store.record_consent("u1", revoke("marketing")).await.unwrap();

        let snapshot = store.consent_snapshot("u1").await.unwrap();
        assert!(snapshot.has_required_consents);
        assert_eq!(snapshot.change_count, 3);
        assert_eq!(snapshot.purposes.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_without_required_purpose_is_not_satisfied() {
        let store = store();
        store.record_consent("u1", grant("marketing")).await.unwrap();
        let snapshot = store.consent_snapshot("u1").await.unwrap();
        assert!(!snapshot.has_required_consents);
    }

    #[tokio::test]
    async fn export_includes_full_history_not_just_latest() {
        let store = store();
        store.record_consent("u1", grant("marketing")).await.unwrap();
        store.record_consent("u1", revoke("marketing")).await.unwrap();
        store.record_consent("u1", grant("marketing")).await.unwrap();

        let bundle = store.export("u1").await.unwrap();
        assert_eq!(bundle.consent_history["marketing"].len(), 3);
    }

    #[tokio::test]
    async fn delete_request_revokes_all_known_purposes() {
        let store = store();
        store.record_consent("u1", grant("analytics")).await.unwrap();
        store.record_consent("u1", grant("marketing")).await.unwrap();

        store.delete_request("u1").await.unwrap();

        assert!(!store.current_consent("u1", "analytics").await.unwrap());
        assert!(!store.current_consent("u1", "marketing").await.unwrap());
    }

    #[test]
    fn retention_policies_cover_every_category() {
        let store = store();
        for category in [
            DataCategory::ConversationHistory,
            DataCategory::AuditLog,
            DataCategory::SparkHistory,
            DataCategory::ConsentRecords,
            DataCategory::SessionState,
        ] {
            assert!(store.policy_for(category).is_some());
        }
    }

    #[tokio::test]
    async fn enforce_archives_then_deletes_expired_keys() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        kv.set("spark:history:u1", "some history", None).await.unwrap();
        let store = RetentionStore::new(kv.clone());

        let outcome = store.enforce(DataCategory::SparkHistory).await.unwrap();
        assert_eq!(outcome.keys_deleted, 1);
        assert_eq!(outcome.keys_archived, 0);
        assert!(!kv.exists("spark:history:u1").await.unwrap());
    }

    #[tokio::test]
    async fn enforce_archives_before_deleting_when_configured() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        kv.set("audit:event:e1", "some event", None).await.unwrap();
        let store = RetentionStore::new(kv.clone());

        let outcome = store.enforce(DataCategory::AuditLog).await.unwrap();
        assert_eq!(outcome.keys_archived, 1);
        assert_eq!(outcome.keys_deleted, 1);
        assert!(kv.exists("archive:AuditLog:audit:event:e1").await.unwrap());
    }

    #[tokio::test]
    async fn enforce_is_a_noop_for_disabled_policy() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        kv.set("pipeline:session_mode:u1", "{}", None).await.unwrap();
        let mut policies = default_policies();
        for policy in policies.iter_mut() {
            if policy.category == DataCategory::SessionState {
                policy.enabled = false;
            }
        }
        let store = RetentionStore::new(kv.clone()).with_policies(policies);

        let outcome = store.enforce(DataCategory::SessionState).await.unwrap();
        assert_eq!(outcome.keys_deleted, 0);
        assert!(kv.exists("pipeline:session_mode:u1").await.unwrap());
    }
}
