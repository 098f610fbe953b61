//! Shield engine: crisis detection state machine.
//!
//! Tracks a per-user crisis/warn session across turns (clear → warned →
//! ack_bypass, clear → crisis → ack_bypass), renders the immutable safety
//! block through [`SafetyRenderer`] when crisis is detected, and gates a
//! single bypass of the veto behind a one-time acknowledgment token consumed
//! via the store's conditional delete.
//!
//! An open crisis (or warn) session blocks every subsequent message for that
//! user regardless of that message's own signal — checked before anything
//! else. The signal itself is supplied by the intent gate, which runs ahead
//! of the shield in the canonical stage order; the shield never inspects raw
//! message text. The session closes only when its acknowledgment token is
//! supplied and consumed, or when it expires.
//!
//! Fails closed: if the backing store errors while checking or consuming an
//! acknowledgment token, the shield treats the token as not consumed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditLogger};
use crate::error::Result;
use crate::intent::SafetySignal;
use crate::kv::KvStore;
use crate::safety::SafetyRenderer;

/// Lifecycle state of a user's crisis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShieldState {
    /// No crisis signal active.
    Clear,
    /// A soft signal was detected; the user has been warned and the
    /// pipeline halts pending acknowledgment.
    Warned,
    /// A hard crisis signal was detected; generation is vetoed pending
    /// acknowledgment.
    Crisis,
    /// The user has acknowledged the open session and is allowed one
    /// bypass of the veto.
    AckBypass,
}

/// Default acknowledgment-token lifetime: tokens expire rather than living
/// forever.
pub const DEFAULT_ACK_TOKEN_TTL: Duration = Duration::from_secs(600);

/// Default lifetime of an open crisis session. A session is meant to persist
/// until closed out-of-band; this bounds how long it can lock a user out if
/// that out-of-band resolution never arrives.
pub const DEFAULT_CRISIS_SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

/// Default lifetime of an open warn session. Shorter than a crisis session:
/// a warn is a single soft-veto turn, not an ongoing safety concern.
pub const DEFAULT_WARN_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Outcome of a shield check against a single incoming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldDecision {
    pub state: ShieldState,
    /// Present when the decision is to veto generation: either the
    /// structurally verified crisis block, or a short warn message.
    pub response_text: Option<String>,
    /// A fresh (or still-open) acknowledgment token the caller must have the
    /// user accept out-of-band before the veto can be bypassed.
    pub ack_token: Option<String>,
}

const WARN_MESSAGE: &str =
    "I want to check in: it sounds like things feel heavy right now. I'm still here, but let's slow down before continuing.";

/// How long crisis/warn audit events are retained.
const SHIELD_AUDIT_RETENTION_DAYS: u32 = 365;

/// Crisis/warn detection and acknowledgment-gated bypass engine.
pub struct ShieldEngine {
    kv: Arc<dyn KvStore>,
    renderer: SafetyRenderer,
    audit: AuditLogger,
    ack_token_ttl: Duration,
    crisis_session_ttl: Duration,
    warn_session_ttl: Duration,
}

impl ShieldEngine {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            audit: AuditLogger::new(kv.clone(), SHIELD_AUDIT_RETENTION_DAYS),
            kv,
            renderer: SafetyRenderer::new(),
            ack_token_ttl: DEFAULT_ACK_TOKEN_TTL,
            crisis_session_ttl: DEFAULT_CRISIS_SESSION_TTL,
            warn_session_ttl: DEFAULT_WARN_SESSION_TTL,
        }
    }

    pub fn with_ack_token_ttl(mut self, ttl: Duration) -> Self {
        self.ack_token_ttl = ttl;
        self
    }

    pub fn with_crisis_session_ttl(mut self, ttl: Duration) -> Self {
        self.crisis_session_ttl = ttl;
        self
    }

    pub fn with_warn_session_ttl(mut self, ttl: Duration) -> Self {
        self.warn_session_ttl = ttl;
        self
    }

    fn crisis_session_key(user_id: &str) -> String {
        format!("shield:crisis_session:{user_id}")
    }

    fn warn_session_key(user_id: &str) -> String {
        format!("shield:warn_session:{user_id}")
    }

    fn crisis_ack_token_key(user_id: &str) -> String {
        format!("shield:ack_token:crisis:{user_id}")
    }

    fn warn_ack_token_key(user_id: &str) -> String {
        format!("shield:ack_token:warn:{user_id}")
    }

    /// Evaluate the intent gate's `safety_signal` for `user_id`. An open
    /// crisis or warn session for this user is checked first and blocks
    /// regardless of the new message's own signal; only once neither is open
    /// does a fresh signal get a chance to open one.
    pub async fn check(
        &self,
        user_id: &str,
        safety_signal: SafetySignal,
        supplied_ack_token: Option<&str>,
    ) -> Result<ShieldDecision> {
        if self.kv.exists(&Self::crisis_session_key(user_id)).await? {
            if let Some(token) = supplied_ack_token {
                if self.try_close_session(user_id, &Self::crisis_session_key(user_id), &Self::crisis_ack_token_key(user_id), token).await? {
                    return Ok(Self::ack_bypass());
                }
            }
            let token = self
                .ensure_ack_token(&Self::crisis_ack_token_key(user_id))
                .await?;
            self.record_audit(user_id, "crisis session active", token.as_str()).await;
            return Ok(ShieldDecision {
                state: ShieldState::Crisis,
                response_text: Some(self.renderer.render_crisis_response(
                    "I want to make sure you have support right now.",
                )),
                ack_token: Some(token),
            });
        }

        if self.kv.exists(&Self::warn_session_key(user_id)).await? {
            if let Some(token) = supplied_ack_token {
                if self.try_close_session(user_id, &Self::warn_session_key(user_id), &Self::warn_ack_token_key(user_id), token).await? {
                    return Ok(Self::ack_bypass());
                }
            }
            let token = self.ensure_ack_token(&Self::warn_ack_token_key(user_id)).await?;
            return Ok(ShieldDecision {
                state: ShieldState::Warned,
                response_text: Some(WARN_MESSAGE.to_string()),
                ack_token: Some(token),
            });
        }

        match safety_signal {
            SafetySignal::Crisis => {
                self.kv
                    .set(&Self::crisis_session_key(user_id), "open", Some(self.crisis_session_ttl.as_secs()))
                    .await?;
                let token = self
                    .ensure_ack_token(&Self::crisis_ack_token_key(user_id))
                    .await?;
                self.record_audit(user_id, "crisis session opened", token.as_str()).await;
                Ok(ShieldDecision {
                    state: ShieldState::Crisis,
                    response_text: Some(self.renderer.render_crisis_response(
                        "I want to make sure you have support right now.",
                    )),
                    ack_token: Some(token),
                })
            }
            SafetySignal::Warn => {
                self.kv
                    .set(&Self::warn_session_key(user_id), "open", Some(self.warn_session_ttl.as_secs()))
                    .await?;
                let token = self.ensure_ack_token(&Self::warn_ack_token_key(user_id)).await?;
                Ok(ShieldDecision {
                    state: ShieldState::Warned,
                    response_text: Some(WARN_MESSAGE.to_string()),
                    ack_token: Some(token),
                })
            }
            SafetySignal::None => Ok(ShieldDecision {
                state: ShieldState::Clear,
                response_text: None,
                ack_token: None,
            }),
        }
    }

    /// Record a crisis audit event, tolerating store failures: the session
    /// state machine above has already run regardless of whether this
    /// succeeds.
    async fn record_audit(&self, user_id: &str, message: &str, ack_token: &str) {
        let result = self
            .audit
            .record(
                AuditCategory::Safety,
                Some(user_id),
                message,
                serde_json::json!({"ack_token_issued": !ack_token.is_empty()}),
                None,
            )
            .await;
        if let Err(err) = result {
            tracing::warn!(%user_id, error = %err, "failed to record crisis audit event");
        }
    }

    fn ack_bypass() -> ShieldDecision {
        ShieldDecision {
            state: ShieldState::AckBypass,
            response_text: None,
            ack_token: None,
        }
    }

    /// Return the currently valid token for `token_key`, minting and storing
    /// a fresh one if none is active.
    async fn ensure_ack_token(&self, token_key: &str) -> Result<String> {
        if let Some(existing) = self.kv.get(token_key).await? {
            return Ok(existing);
        }
        let token = Uuid::new_v4().to_string();
        self.kv.set(token_key, &token, Some(self.ack_token_ttl.as_secs())).await?;
        Ok(token)
    }

    /// Consume `supplied` against `token_key` via conditional delete and, on
    /// success, close the session at `session_key`. Fails closed on store
    /// error (treats the token as unconsumed, session left open).
    async fn try_close_session(
        &self,
        user_id: &str,
        session_key: &str,
        token_key: &str,
        supplied: &str,
    ) -> Result<bool> {
        match self.kv.cas_delete(token_key, supplied).await {
            Ok(true) => {
                self.kv.delete(session_key).await.ok();
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => {
                tracing::warn!(%user_id, error = %err, "ack token consume failed closed");
                Ok(false)
            }
        }
    }
}
