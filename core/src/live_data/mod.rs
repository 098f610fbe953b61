//! Live-data orchestrator and evidence injection.
//!
//! Runs the full need→risk→fetch→evidence pipeline for a single turn:
//! classify the message's data need, assert the force-high risk invariant,
//! fan out provider fetches in parallel with a per-call timeout, combine
//! per-category failures into an overall fallback decision, and build an
//! [`EvidencePack`] the generation gate can ground its answer in.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::data_need::{
    DataNeedClassification, DataNeedClassifier, FallbackMode, LiveCategory, TruthMode,
    MIN_ACTIONABLE_CONFIDENCE,
};
use crate::freshness::{FreshnessChecker, RequiredAction};
use crate::providers::{ProviderData, ProviderQuery, ProviderRegistry, ProviderResult};
use crate::risk::{RiskAssessment, RiskAssessor};

/// How constrained generation must be given the available evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseConstraints {
    /// No live-data constraints apply.
    Unconstrained,
    /// May answer but must hedge / qualify claims.
    Qualified,
    /// Data came back but is stale enough to require quoting it verbatim
    /// rather than restating it in generation's own words.
    QuoteEvidenceOnly,
    /// Must not state specific numeric figures.
    NoNumericClaims,
    /// The need classification was too ambiguous to act on; generation must
    /// ask for clarification rather than guess.
    Insufficient,
    /// Must refuse to answer the live-data portion of the query.
    Refuse,
}

/// Ranks constraints from least to most restrictive so a caller combining
/// several per-category results can take the strictest one.
fn restrictiveness(c: ResponseConstraints) -> u8 {
    match c {
        ResponseConstraints::Unconstrained => 0,
        ResponseConstraints::Qualified => 1,
        ResponseConstraints::QuoteEvidenceOnly => 2,
        ResponseConstraints::NoNumericClaims => 3,
        ResponseConstraints::Insufficient => 4,
        ResponseConstraints::Refuse => 5,
    }
}

fn most_restrictive_constraint(a: ResponseConstraints, b: ResponseConstraints) -> ResponseConstraints {
    if restrictiveness(a) >= restrictiveness(b) {
        a
    } else {
        b
    }
}

/// Grounding evidence handed to the generation gate: the resolved per-category
/// data (or explicit absence), plus instructions to fold into the system
/// prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePack {
    pub results: HashMap<String, ProviderResult>,
    /// Numeric tokens it is safe for generation to repeat verbatim (drawn
    /// only from successfully fetched data: the numeric-token allow-list).
    pub allowed_numeric_tokens: Vec<String>,
    pub system_prompt_additions: Vec<String>,
    pub constraints: ResponseConstraints,
}

/// Final result of running the live-data gate for a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensGateResult {
    pub classification: DataNeedClassification,
    pub risk: RiskAssessment,
    pub evidence: EvidencePack,
}

/// Per-call provider timeout.
const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestrates the live-data gate end to end.
pub struct LiveDataOrchestrator {
    classifier: DataNeedClassifier,
    risk_assessor: RiskAssessor,
    freshness_checker: FreshnessChecker,
    registry: ProviderRegistry,
    provider_timeout: Duration,
}

impl LiveDataOrchestrator {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            classifier: DataNeedClassifier::new(),
            risk_assessor: RiskAssessor::new(),
            freshness_checker: FreshnessChecker::new(),
            registry,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    /// Run the full live-data gate for `message`.
    pub async fn orchestrate(&self, message: &str) -> LensGateResult {
        let classification = self.classifier.classify(message);
        let risk = self.risk_assessor.assess(&classification);

        if classification.live_categories.is_empty() {
            return LensGateResult {
                classification,
                risk,
                evidence: EvidencePack {
                    results: HashMap::new(),
                    allowed_numeric_tokens: Vec::new(),
                    system_prompt_additions: Vec::new(),
                    constraints: ResponseConstraints::Unconstrained,
                },
            };
        }

        if classification.entities.is_empty() && classification.confidence < MIN_ACTIONABLE_CONFIDENCE {
            return LensGateResult {
                classification,
                risk,
                evidence: EvidencePack {
                    results: HashMap::new(),
                    allowed_numeric_tokens: Vec::new(),
                    system_prompt_additions: vec![
                        "The request names a live-data category but no specific subject; ask the user which one before answering.".to_string(),
                    ],
                    constraints: ResponseConstraints::Insufficient,
                },
            };
        }

        let mut fetches = Vec::new();

        // Fan out one fetch per matched category, in parallel.
        let entity = classification
            .entities
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        for category in classification.live_categories.iter().copied() {
            let registry_ref = &self.registry;
            let timeout = self.provider_timeout;
            let query = ProviderQuery::new(entity.clone());
            fetches.push(async move {
                (category, registry_ref.fetch_with_timeout(category, query, timeout).await)
            });
        }

        let results: Vec<(LiveCategory, ProviderResult)> = futures::future::join_all(fetches).await;

        let mut by_category = HashMap::new();
        let mut allowed_tokens = Vec::new();
        let mut any_failed = false;
        let mut all_failed = true;

        for (category, result) in &results {
            match result {
                ProviderResult::Ok { .. } => {
                    all_failed = false;
                    allowed_tokens.extend(numeric_tokens(result));
                }
                ProviderResult::Err { .. } => {
                    any_failed = true;
                }
            }
            by_category.insert(category.to_string(), result.clone());
        }

        let constraints = self.determine_constraints(
            message,
            &classification,
            all_failed,
            any_failed,
            &results,
        );

        let system_prompt_additions = self.build_prompt_additions(&classification, &by_category, constraints);

        LensGateResult {
            classification,
            risk,
            evidence: EvidencePack {
                results: by_category,
                allowed_numeric_tokens: allowed_tokens,
                system_prompt_additions,
                constraints,
            },
        }
    }

    /// Combine per-category outcomes into an overall constraint, honoring
    /// the classification's fallback mode and the freshness checker's
    /// immediate-domain-blocks-numerics rule.
    fn determine_constraints(
        &self,
        message: &str,
        classification: &DataNeedClassification,
        all_failed: bool,
        any_failed: bool,
        results: &[(LiveCategory, ProviderResult)],
    ) -> ResponseConstraints {
        // The time domain forbids a qualitative fallback outright: a wrong
        // time is never a safe approximation, so any failure in this
        // category refuses regardless of what else succeeded.
        let any_time_failure = results
            .iter()
            .any(|(category, result)| *category == LiveCategory::Time && matches!(result, ProviderResult::Err { .. }));
        if any_time_failure {
            return ResponseConstraints::Refuse;
        }

        if !all_failed && !any_failed {
            return self.constraints_for_freshness(message, results);
        }

        if all_failed {
            return match classification.fallback_mode {
                FallbackMode::Refuse => ResponseConstraints::Refuse,
                FallbackMode::ProceedDegraded => ResponseConstraints::NoNumericClaims,
                FallbackMode::QualitativeOnly => ResponseConstraints::Qualified,
            };
        }

        // Partial failure: if any failed category maps to an "immediate"
        // freshness domain, numeric claims must be blocked even though some
        // other category's data did come back.
        let any_immediate_failure = results.iter().any(|(_, result)| {
            matches!(result, ProviderResult::Err { .. })
                && self.freshness_checker.check(message, None).required_action
                    == RequiredAction::BlockNumerics
        });

        if any_immediate_failure {
            ResponseConstraints::NoNumericClaims
        } else {
            ResponseConstraints::Qualified
        }
    }

    /// All fetches succeeded: check how stale the returned data is and map
    /// that onto a constraint, taking the most restrictive result across
    /// every successful category.
    fn constraints_for_freshness(
        &self,
        message: &str,
        results: &[(LiveCategory, ProviderResult)],
    ) -> ResponseConstraints {
        let mut constraints = ResponseConstraints::Unconstrained;
        for (_, result) in results {
            if let ProviderResult::Ok { fetched_at, .. } = result {
                let age_ms = (Utc::now() - *fetched_at).num_milliseconds().max(0);
                let required_action = self.freshness_checker.check(message, Some(age_ms)).required_action;
                let this_constraint = match required_action {
                    RequiredAction::Verify => ResponseConstraints::NoNumericClaims,
                    RequiredAction::Warn => ResponseConstraints::QuoteEvidenceOnly,
                    RequiredAction::None | RequiredAction::BlockNumerics => ResponseConstraints::Unconstrained,
                };
                constraints = most_restrictive_constraint(constraints, this_constraint);
            }
        }
        constraints
    }

    fn build_prompt_additions(
        &self,
        classification: &DataNeedClassification,
        by_category: &HashMap<String, ProviderResult>,
        constraints: ResponseConstraints,
    ) -> Vec<String> {
        let mut additions = Vec::new();

        if classification.truth_mode == TruthMode::Local {
            return additions;
        }

        for (category, result) in by_category {
            match result {
                ProviderResult::Ok { data, fetched_at, .. } => {
                    additions.push(format!(
                        "Verified {category} data as of {}: {}",
                        fetched_at.to_rfc3339(),
                        describe(data)
                    ));
                }
                ProviderResult::Err { message, .. } => {
                    additions.push(format!(
                        "Live {category} data is currently unavailable ({message}); do not state specific figures."
                    ));
                }
            }
        }

        match constraints {
            ResponseConstraints::Refuse => additions
                .push("You must decline to answer the live-data portion of this request.".to_string()),
            ResponseConstraints::NoNumericClaims => additions
                .push("Do not include any specific numeric figures in your response.".to_string()),
            ResponseConstraints::QuoteEvidenceOnly => additions.push(
                "The data above is stale; only quote it verbatim and attribute it, do not restate it as current."
                    .to_string(),
            ),
            ResponseConstraints::Insufficient => additions
                .push("Ask the user to clarify the subject before answering.".to_string()),
            ResponseConstraints::Qualified => additions
                .push("Clearly qualify any claims drawn from the above as approximate or possibly outdated.".to_string()),
            ResponseConstraints::Unconstrained => {}
        }

        additions
    }
}

fn numeric_tokens(result: &ProviderResult) -> Vec<String> {
    match result {
        ProviderResult::Ok { data, .. } => match data {
            ProviderData::Stock { price, change_percent, .. } => {
                vec![format!("{price:.2}"), format!("{change_percent:.2}%")]
            }
            ProviderData::Crypto { price_usd, change_percent_24h, .. } => {
                vec![format!("{price_usd:.2}"), format!("{change_percent_24h:.2}%")]
            }
            ProviderData::Weather { temperature_f, .. } => vec![format!("{temperature_f:.0}")],
            ProviderData::Fx { rate, .. } => vec![format!("{rate:.4}")],
            ProviderData::Time { iso8601, .. } => vec![iso8601.clone()],
            ProviderData::News { .. } => Vec::new(),
        },
        ProviderResult::Err { .. } => Vec::new(),
    }
}

fn describe(data: &ProviderData) -> String {
    match data {
        ProviderData::Stock { symbol, price, change_percent, currency, .. } => {
            format!("{symbol} at {price:.2} {currency} ({change_percent:+.2}%)")
        }
        ProviderData::Weather { location, temperature_f, condition } => {
            format!("{location}: {temperature_f:.0}F, {condition}")
        }
        ProviderData::Crypto { symbol, price_usd, change_percent_24h } => {
            format!("{symbol} at ${price_usd:.2} ({change_percent_24h:+.2}% 24h)")
        }
        ProviderData::Fx { base, quote, rate } => format!("1 {base} = {rate:.4} {quote}"),
        ProviderData::Time { location, iso8601, .. } => format!("{location}: {iso8601}"),
        ProviderData::News { headline, summary, source } => format!("{headline} ({source}): {summary}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> LiveDataOrchestrator {
        LiveDataOrchestrator::new(ProviderRegistry::with_synthetic_defaults())
    }

    #[tokio::test]
    async fn local_query_is_unconstrained_with_no_evidence() {
        let orchestrator = orchestrator();
        let result = orchestrator.orchestrate("what is the capital of France").await;
        assert_eq!(result.evidence.constraints, ResponseConstraints::Unconstrained);
        assert!(result.evidence.results.is_empty());
    }

    #[tokio::test]
    async fn stock_query_force_highs_and_returns_numeric_tokens() {
        let orchestrator = orchestrator();
        let result = orchestrator.orchestrate("What's AAPL trading at?").await;
        assert!(result.risk.force_high);
        assert_eq!(result.evidence.constraints, ResponseConstraints::Unconstrained);
        assert!(!result.evidence.allowed_numeric_tokens.is_empty());
    }

    #[tokio::test]
    async fn all_providers_missing_refuses_for_refuse_fallback() {
        let orchestrator = LiveDataOrchestrator::new(ProviderRegistry::new());
        let result = orchestrator.orchestrate("What's AAPL trading at?").await;
        assert_eq!(result.evidence.constraints, ResponseConstraints::Refuse);
    }

    #[tokio::test]
    async fn weather_failure_degrades_to_no_numeric_claims() {
        let orchestrator = LiveDataOrchestrator::new(ProviderRegistry::new());
        let result = orchestrator.orchestrate("what's the weather like today").await;
        assert_eq!(result.evidence.constraints, ResponseConstraints::NoNumericClaims);
    }

    #[tokio::test]
    async fn time_provider_failure_refuses_rather_than_degrading() {
        let orchestrator = LiveDataOrchestrator::new(ProviderRegistry::new());
        let result = orchestrator.orchestrate("what time is it in Tokyo").await;
        assert_eq!(result.evidence.constraints, ResponseConstraints::Refuse);
    }

    #[tokio::test]
    async fn mixed_success_and_time_failure_still_refuses() {
        // A partial failure would ordinarily only degrade to qualified/no
        // numeric claims, but a failed time fetch overrides that even when
        // another category in the same turn succeeded.
        let mut registry = ProviderRegistry::new();
        registry.register(crate::data_need::LiveCategory::Stock, std::sync::Arc::new(crate::providers::synthetic::SyntheticStockProvider));
        let orchestrator = LiveDataOrchestrator::new(registry);
        let result = orchestrator
            .orchestrate("what's AAPL trading at and what time is it in Tokyo")
            .await;
        assert_eq!(result.evidence.constraints, ResponseConstraints::Refuse);
    }

    #[test]
    fn most_restrictive_constraint_picks_the_stricter_side() {
        assert_eq!(
            most_restrictive_constraint(ResponseConstraints::Unconstrained, ResponseConstraints::Qualified),
            ResponseConstraints::Qualified
        );
        assert_eq!(
            most_restrictive_constraint(ResponseConstraints::Refuse, ResponseConstraints::Unconstrained),
            ResponseConstraints::Refuse
        );
    }
}
