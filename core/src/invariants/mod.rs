//! Invariant checker: the last gate before rendering,
//! asserting the pipeline's safety and consistency invariants held for this
//! turn. A critical violation stops the turn (`PipelineResult::Stopped`); a
//! non-critical one is logged and the turn degrades but still renders.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::freshness::RequiredAction;
use crate::live_data::ResponseConstraints;
use crate::safety::SafetyRenderer;
use crate::spark::Stance;

/// Closed set of invariants this checker asserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invariant {
    CrisisBlockStructure,
    SoftVetoRequiresAck,
    SparkOnlyUnderSword,
    DegradedVerificationImpliesLowConfidence,
    RegenerationCapRespected,
    ActionRecommendationsFromExplicitSourcesOnly,
    ImmediateDomainBlocksNumericsOnFetchFailure,
    HighConfidenceRequiresVerified,
    NumericClaimsMatchAllowList,
}

impl Invariant {
    /// Whether a violation of this invariant must stop the turn outright.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::CrisisBlockStructure
                | Self::SoftVetoRequiresAck
                | Self::ActionRecommendationsFromExplicitSourcesOnly
                | Self::ImmediateDomainBlocksNumericsOnFetchFailure
                | Self::NumericClaimsMatchAllowList
        )
    }
}

/// Literal financial-numeric shapes a response might quote: dollar figures,
/// percentages, and comma-grouped figures.
static NUMERIC_CLAIM_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\$\d+\.\d{2}").unwrap(),
        Regex::new(r"\d+\.\d{2}%").unwrap(),
        Regex::new(r"\d{1,3}(,\d{3})+\.\d{2}").unwrap(),
    ]
});

/// Strip everything but digits and the decimal point, so `"$187.43"` and
/// `"187.43"` compare equal to an allow-listed `"187.43"` token.
fn numeric_core(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect()
}

/// Scan `response_text` for a literal numeric claim not present (after
/// stripping formatting) in `allowed`. Returns the first unauthorized claim
/// found, if any.
fn unauthorized_numeric_claim(response_text: &str, allowed: &[String]) -> Option<String> {
    let allowed_cores: Vec<String> = allowed.iter().map(|t| numeric_core(t)).collect();
    for pattern in NUMERIC_CLAIM_PATTERNS.iter() {
        for found in pattern.find_iter(response_text) {
            let claim = found.as_str();
            let core = numeric_core(claim);
            if !allowed_cores.iter().any(|a| a == &core) {
                return Some(claim.to_string());
            }
        }
    }
    None
}

/// A single detected violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: Invariant,
    pub detail: String,
    pub critical: bool,
}

/// Snapshot of the turn state the invariant checker asserts over. Built by
/// the gate executor from the flattened pipeline state just before
/// rendering.
#[derive(Debug, Clone)]
pub struct InvariantCheckInput<'a> {
    pub is_crisis: bool,
    pub crisis_response_text: Option<&'a str>,
    pub soft_veto_active: bool,
    pub ack_bypass_granted: bool,
    pub spark_present: bool,
    pub stance: Stance,
    pub verification_degraded: bool,
    pub confidence_is_high: bool,
    pub regeneration_count: u8,
    pub action_recommendations_present: bool,
    pub action_recommendations_have_explicit_source: bool,
    pub live_data_constraints: Option<ResponseConstraints>,
    pub immediate_domain_fetch_failed: bool,
    pub allowed_numeric_tokens: &'a [String],
    pub response_text: &'a str,
}

/// Regeneration attempts beyond this cap is itself a violation.
pub const MAX_REGENERATIONS: u8 = 2;

/// Checks all pipeline invariants for a turn.
#[derive(Default)]
pub struct InvariantChecker;

impl InvariantChecker {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, input: &InvariantCheckInput<'_>) -> Vec<Violation> {
        let mut violations = Vec::new();

        if input.is_crisis {
            let structurally_sound = input
                .crisis_response_text
                .map(SafetyRenderer::verify_structure)
                .unwrap_or(false);
            if !structurally_sound {
                violations.push(self.violation(
                    Invariant::CrisisBlockStructure,
                    "crisis response did not contain a structurally valid resource block",
                ));
            }
        }

        if input.soft_veto_active && !input.ack_bypass_granted && !input.response_text.is_empty() {
            violations.push(self.violation(
                Invariant::SoftVetoRequiresAck,
                "generation proceeded under an active soft veto without an acknowledgment bypass",
            ));
        }

        if input.spark_present && input.stance != Stance::Sword {
            violations.push(self.violation(
                Invariant::SparkOnlyUnderSword,
                "a spark was present outside the sword stance",
            ));
        }

        if input.verification_degraded && input.confidence_is_high {
            violations.push(self.violation(
                Invariant::DegradedVerificationImpliesLowConfidence,
                "verification was degraded but confidence was reported high",
            ));
        }

        if input.regeneration_count > MAX_REGENERATIONS {
            violations.push(self.violation(
                Invariant::RegenerationCapRespected,
                format!(
                    "regeneration count {} exceeded cap of {}",
                    input.regeneration_count, MAX_REGENERATIONS
                ),
            ));
        }

        if input.action_recommendations_present && !input.action_recommendations_have_explicit_source
        {
            violations.push(self.violation(
                Invariant::ActionRecommendationsFromExplicitSourcesOnly,
                "action recommendations were present without an explicit source",
            ));
        }

        if input.immediate_domain_fetch_failed
            && input.live_data_constraints != Some(ResponseConstraints::NoNumericClaims)
            && input.live_data_constraints != Some(ResponseConstraints::Refuse)
        {
            violations.push(self.violation(
                Invariant::ImmediateDomainBlocksNumericsOnFetchFailure,
                "an immediate domain's fetch failed but numeric claims were not blocked",
            ));
        }

        if input.confidence_is_high && input.verification_degraded {
            violations.push(self.violation(
                Invariant::HighConfidenceRequiresVerified,
                "high confidence reported without completed verification",
            ));
        }

        if matches!(
            input.live_data_constraints,
            Some(ResponseConstraints::NoNumericClaims) | Some(ResponseConstraints::QuoteEvidenceOnly)
        ) {
            if let Some(claim) = unauthorized_numeric_claim(input.response_text, input.allowed_numeric_tokens) {
                violations.push(self.violation(
                    Invariant::NumericClaimsMatchAllowList,
                    format!("response contained numeric claim '{claim}' not present in the allow-list"),
                ));
            }
        }

        violations
    }

    fn violation(&self, invariant: Invariant, detail: impl Into<String>) -> Violation {
        Violation {
            invariant,
            detail: detail.into(),
            critical: invariant.is_critical(),
        }
    }
}

/// Maps a freshness check's required action onto whether numeric claims
/// must be blocked, used by callers building [`InvariantCheckInput`].
pub fn requires_numeric_block(action: RequiredAction) -> bool {
    action == RequiredAction::BlockNumerics
}
