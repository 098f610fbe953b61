//! Spark gate: decides whether an unsolicited conversational
//! "spark" (a proactive prompt/suggestion) may be appended to a response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::risk::StakesLevel;

/// Conversational stance a turn is operating under. A spark is only ever
/// appended under `Sword`; the other three stances each name a different
/// reason generation is operating more cautiously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    /// Ordinary, unconstrained conversation.
    Sword,
    /// A force-high turn whose stakes are low enough to answer with
    /// qualification rather than outright caution (weather, news).
    Lens,
    /// A force-high turn whose stakes are high (numeric precision demanded
    /// of live data: stock, crypto, fx).
    Shield,
    /// Operating under an acknowledgment bypass or an open crisis/warn
    /// session.
    Control,
}

/// Per-user spark history the gate needs to decide eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkHistory {
    pub sparks_today: u32,
    pub last_spark_at: Option<DateTime<Utc>>,
    /// Exponentially-weighted ignore rate over recent sparks, in `[0, 1]`.
    pub recent_ignore_ema: f64,
}

impl Default for SparkHistory {
    fn default() -> Self {
        Self {
            sparks_today: 0,
            last_spark_at: None,
            recent_ignore_ema: 0.0,
        }
    }
}

/// Verification state of the current turn's claims, as produced upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Complete,
    Partial,
    NotStarted,
}

/// Inputs the spark gate evaluates.
#[derive(Debug, Clone)]
pub struct SparkInput {
    pub stance: Stance,
    pub shield_intervened: bool,
    pub is_crisis_or_control: bool,
    pub stakes_level: StakesLevel,
    pub history: SparkHistory,
    pub verification: VerificationState,
}

/// Closed enumeration of reasons a spark was withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SparkWithheldReason {
    WrongStance,
    ShieldIntervened,
    CrisisOrControlSession,
    StakesTooHigh,
    DailyCapReached,
    TooSoonSinceLast,
    RecentlyIgnored,
    VerificationIncomplete,
}

/// Decision returned by the spark gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SparkDecision {
    Eligible,
    Withheld(SparkWithheldReason),
}

const MAX_SPARKS_PER_DAY: u32 = 5;
const MIN_MINUTES_BETWEEN_SPARKS: i64 = 30;
const MAX_IGNORE_EMA: f64 = 0.7;

/// Evaluates spark eligibility for a turn.
#[derive(Default)]
pub struct SparkGate;

impl SparkGate {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate eligibility. Checks run in a fixed order so the first
    /// failing condition is reported as the withholding reason.
    pub fn evaluate(&self, input: &SparkInput) -> SparkDecision {
        if input.stance != Stance::Sword {
            return SparkDecision::Withheld(SparkWithheldReason::WrongStance);
        }
        if input.shield_intervened {
            return SparkDecision::Withheld(SparkWithheldReason::ShieldIntervened);
        }
        if input.is_crisis_or_control {
            return SparkDecision::Withheld(SparkWithheldReason::CrisisOrControlSession);
        }
        if matches!(input.stakes_level, StakesLevel::High | StakesLevel::Critical) {
            return SparkDecision::Withheld(SparkWithheldReason::StakesTooHigh);
        }
        if input.history.sparks_today >= MAX_SPARKS_PER_DAY {
            return SparkDecision::Withheld(SparkWithheldReason::DailyCapReached);
        }
        if let Some(last) = input.history.last_spark_at {
            let minutes_since = (Utc::now() - last).num_minutes();
            if minutes_since < MIN_MINUTES_BETWEEN_SPARKS {
                return SparkDecision::Withheld(SparkWithheldReason::TooSoonSinceLast);
            }
        }
        if input.history.recent_ignore_ema > MAX_IGNORE_EMA {
            return SparkDecision::Withheld(SparkWithheldReason::RecentlyIgnored);
        }
        if input.verification != VerificationState::Complete {
            return SparkDecision::Withheld(SparkWithheldReason::VerificationIncomplete);
        }

        SparkDecision::Eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> SparkInput {
        SparkInput {
            stance: Stance::Sword,
            shield_intervened: false,
            is_crisis_or_control: false,
            stakes_level: StakesLevel::Low,
            history: SparkHistory::default(),
            verification: VerificationState::Complete,
        }
    }

    #[test]
    fn eligible_when_all_conditions_met() {
        let gate = SparkGate::new();
        assert_eq!(gate.evaluate(&base_input()), SparkDecision::Eligible);
    }

    #[test]
    fn withheld_for_shield_stance() {
        let gate = SparkGate::new();
        let mut input = base_input();
        input.stance = Stance::Shield;
        assert_eq!(
            gate.evaluate(&input),
            SparkDecision::Withheld(SparkWithheldReason::WrongStance)
        );
    }

    #[test]
    fn withheld_for_lens_stance() {
        let gate = SparkGate::new();
        let mut input = base_input();
        input.stance = Stance::Lens;
        assert_eq!(
            gate.evaluate(&input),
            SparkDecision::Withheld(SparkWithheldReason::WrongStance)
        );
    }

    #[test]
    fn withheld_for_control_stance() {
        let gate = SparkGate::new();
        let mut input = base_input();
        input.stance = Stance::Control;
        assert_eq!(
            gate.evaluate(&input),
            SparkDecision::Withheld(SparkWithheldReason::WrongStance)
        );
    }

    #[test]
    fn withheld_for_high_stakes() {
        let gate = SparkGate::new();
        let mut input = base_input();
        input.stakes_level = StakesLevel::High;
        assert_eq!(
            gate.evaluate(&input),
            SparkDecision::Withheld(SparkWithheldReason::StakesTooHigh)
        );
    }

    #[test]
    fn withheld_past_daily_cap() {
        let gate = SparkGate::new();
        let mut input = base_input();
        input.history.sparks_today = MAX_SPARKS_PER_DAY;
        assert_eq!(
            gate.evaluate(&input),
            SparkDecision::Withheld(SparkWithheldReason::DailyCapReached)
        );
    }

    #[test]
    fn withheld_when_recently_ignored() {
        let gate = SparkGate::new();
        let mut input = base_input();
        input.history.recent_ignore_ema = 0.9;
        assert_eq!(
            gate.evaluate(&input),
            SparkDecision::Withheld(SparkWithheldReason::RecentlyIgnored)
        );
    }

    #[test]
    fn withheld_when_verification_incomplete() {
        let gate = SparkGate::new();
        let mut input = base_input();
        input.verification = VerificationState::Partial;
        assert_eq!(
            gate.evaluate(&input),
            SparkDecision::Withheld(SparkWithheldReason::VerificationIncomplete)
        );
    }
}
