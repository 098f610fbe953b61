//! Mode detector / redirect gate.
//!
//! Decides, for a given turn, whether conversation should be redirected into
//! a different mode (practice runner, goal designer) ahead of generation.
//! Priority-ordered and pure: identical inputs always yield identical
//! decisions.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Session mode in effect before this turn is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    None,
    PracticeDrill,
    Explore,
}

/// Inputs the mode detector needs; callers assemble this from session state.
#[derive(Debug, Clone)]
pub struct RedirectInput<'a> {
    pub message: &'a str,
    pub active_session_mode: SessionMode,
}

/// A redirect decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectDecision {
    /// No redirect: proceed with normal generation.
    None,
    /// Continue an active practice-drill session in the runner.
    ContinueRunner,
    /// Continue an active explore session in the designer.
    ContinueDesigner,
    /// A goal statement was detected; route to the designer and bypass the
    /// explore stage.
    DesignerBypassExplore,
    /// Goal-creation keywords were detected; route to the designer.
    Designer,
}

/// A concrete goal statement names a skill, a purpose, a deadline, or a
/// target credential ("learn X to do Y", "in N weeks", "pass the X exam") —
/// specific enough to bypass the explore stage and go straight to the
/// designer.
static GOAL_STATEMENT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\blearn\b.*\bto\b").unwrap(),
        Regex::new(r"\bin\s+\d+\s+weeks?\b").unwrap(),
        Regex::new(r"\bpass\s+the\b.*\bexam\b").unwrap(),
    ]
});

/// A bare expression of wanting to learn something, with no stated purpose
/// or timeframe, still routes to the designer but without bypassing explore.
const GOAL_CREATION_PATTERNS: &[&str] = &["i want to learn", "teach me"];

/// Priority-ordered, deterministic mode/redirect decision logic.
#[derive(Default)]
pub struct ModeDetector;

impl ModeDetector {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate the redirect decision for this turn. Priority order: active
    /// practice-drill session wins first, then active explore session, then
    /// an explicit goal statement (which also bypasses the explore stage),
    /// then goal-creation keywords, else no redirect.
    pub fn evaluate(&self, input: &RedirectInput<'_>) -> RedirectDecision {
        if input.active_session_mode == SessionMode::PracticeDrill {
            return RedirectDecision::ContinueRunner;
        }
        if input.active_session_mode == SessionMode::Explore {
            return RedirectDecision::ContinueDesigner;
        }

        let lower = input.message.to_lowercase();

        if GOAL_STATEMENT_PATTERNS.iter().any(|p| p.is_match(&lower)) {
            return RedirectDecision::DesignerBypassExplore;
        }

        if GOAL_CREATION_PATTERNS.iter().any(|p| lower.contains(p)) {
            return RedirectDecision::Designer;
        }

        RedirectDecision::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_practice_drill_always_wins() {
        let detector = ModeDetector::new();
        let input = RedirectInput {
            message: "my goal is to learn Rust",
            active_session_mode: SessionMode::PracticeDrill,
        };
        assert_eq!(detector.evaluate(&input), RedirectDecision::ContinueRunner);
    }

    #[test]
    fn goal_statement_with_purpose_bypasses_explore() {
        let detector = ModeDetector::new();
        let input = RedirectInput {
            message: "I want to learn Rust to build a web server",
            active_session_mode: SessionMode::None,
        };
        assert_eq!(
            detector.evaluate(&input),
            RedirectDecision::DesignerBypassExplore
        );
    }

    #[test]
    fn goal_statement_with_deadline_bypasses_explore() {
        let detector = ModeDetector::new();
        let input = RedirectInput {
            message: "I need to be ready in 6 weeks",
            active_session_mode: SessionMode::None,
        };
        assert_eq!(
            detector.evaluate(&input),
            RedirectDecision::DesignerBypassExplore
        );
    }

    #[test]
    fn goal_statement_with_exam_bypasses_explore() {
        let detector = ModeDetector::new();
        let input = RedirectInput {
            message: "I want to pass the AWS certification exam",
            active_session_mode: SessionMode::None,
        };
        assert_eq!(
            detector.evaluate(&input),
            RedirectDecision::DesignerBypassExplore
        );
    }

    #[test]
    fn bare_goal_creation_keywords_route_to_designer_without_bypass() {
        let detector = ModeDetector::new();
        let input = RedirectInput {
            message: "teach me Python",
            active_session_mode: SessionMode::None,
        };
        assert_eq!(detector.evaluate(&input), RedirectDecision::Designer);
    }

    #[test]
    fn ordinary_message_has_no_redirect() {
        let detector = ModeDetector::new();
        let input = RedirectInput {
            message: "what's the weather like",
            active_session_mode: SessionMode::None,
        };
        assert_eq!(detector.evaluate(&input), RedirectDecision::None);
    }

    #[test]
    fn decisions_are_stable_for_identical_input() {
        let detector = ModeDetector::new();
        let input = RedirectInput {
            message: "teach me Python",
            active_session_mode: SessionMode::None,
        };
        let first = detector.evaluate(&input);
        let second = detector.evaluate(&input);
        assert_eq!(first, second);
    }
}
