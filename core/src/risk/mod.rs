//! Risk assessor: computes the force-high invariant
//! from truth mode, plus a stake level and overall risk score.

use serde::{Deserialize, Serialize};

use crate::data_need::{DataNeedClassification, TruthMode};

/// Stakes level for the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakesLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Risk assessment for a classified message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// `true` when `truth_mode ∈ {live_feed, mixed}`: the force-high invariant.
    pub force_high: bool,
    pub stakes_level: StakesLevel,
    pub risk_score: f64,
}

/// Computes risk from a [`DataNeedClassification`].
#[derive(Default)]
pub struct RiskAssessor;

impl RiskAssessor {
    pub fn new() -> Self {
        Self
    }

    /// Assess risk. Upholds the force-high invariant:
    /// `truth_mode ∈ {live_feed, mixed} ⇒ force_high = true`.
    pub fn assess(&self, classification: &DataNeedClassification) -> RiskAssessment {
        let force_high = matches!(
            classification.truth_mode,
            TruthMode::LiveFeed | TruthMode::Mixed
        );

        let mut risk_score: f64 = 0.0;
        if force_high {
            risk_score += 0.5;
        }
        if classification.requires_numeric_precision {
            risk_score += 0.2;
        }
        if classification.freshness_critical {
            risk_score += 0.2;
        }
        if classification.live_categories.len() > 1 {
            risk_score += 0.1;
        }
        let risk_score = risk_score.clamp(0.0, 1.0);

        let stakes_level = if force_high && classification.requires_numeric_precision {
            StakesLevel::High
        } else if force_high {
            StakesLevel::Medium
        } else {
            StakesLevel::Low
        };

        RiskAssessment {
            force_high,
            stakes_level,
            risk_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_need::DataNeedClassifier;

    #[test]
    fn force_high_invariant_holds_for_live_feed_and_mixed() {
        let classifier = DataNeedClassifier::new();
        let assessor = RiskAssessor::new();

        for message in [
            "What's AAPL trading at?",
            "what's the latest on the merger",
        ] {
            let classification = classifier.classify(message);
            assert!(matches!(
                classification.truth_mode,
                crate::data_need::TruthMode::LiveFeed | crate::data_need::TruthMode::Mixed
            ));
            let assessment = assessor.assess(&classification);
            assert!(
                assessment.force_high,
                "force_high invariant violated for: {message}"
            );
        }
    }

    #[test]
    fn local_query_does_not_force_high() {
        let classifier = DataNeedClassifier::new();
        let assessor = RiskAssessor::new();
        let classification = classifier.classify("what is the capital of France");
        let assessment = assessor.assess(&classification);
        assert!(!assessment.force_high);
        assert_eq!(assessment.stakes_level, StakesLevel::Low);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn force_high_invariant_is_universal(msg in "[a-zA-Z ]{0,60}") {
            let classifier = DataNeedClassifier::new();
            let assessor = RiskAssessor::new();
            let classification = classifier.classify(&msg);
            let assessment = assessor.assess(&classification);
            let should_force = matches!(
                classification.truth_mode,
                crate::data_need::TruthMode::LiveFeed | crate::data_need::TruthMode::Mixed
            );
            prop_assert_eq!(assessment.force_high, should_force);
        }
    }
}
