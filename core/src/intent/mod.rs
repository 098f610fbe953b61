//! Intent classifier: the first gate in the canonical stage
//! order. Reads the raw message once and produces the safety signal and
//! urgency every downstream stage consumes, so no later stage re-derives its
//! own view of the same text.

use serde::{Deserialize, Serialize};

/// Safety signal detected in a message, ranked by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetySignal {
    None,
    Warn,
    Crisis,
}

/// How urgently the turn reads, independent of its safety signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    Elevated,
}

/// Output of classifying a single message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentClassification {
    pub safety_signal: SafetySignal,
    pub urgency: Urgency,
    pub summary: String,
}

struct SignalRule {
    severity: SafetySignal,
    patterns: &'static [&'static str],
}

fn signal_rules() -> &'static [SignalRule] {
    const RULES: &[SignalRule] = &[
        SignalRule {
            severity: SafetySignal::Crisis,
            patterns: &[
                "kill myself",
                "end my life",
                "suicide",
                "want to die",
                "hurt myself",
            ],
        },
        SignalRule {
            severity: SafetySignal::Warn,
            patterns: &["hopeless", "can't go on", "no point anymore", "give up on life"],
        },
    ];
    RULES
}

const URGENT_PATTERNS: &[&str] = &["right now", "emergency", "urgent", "asap", "immediately"];

const SUMMARY_MAX_CHARS: usize = 80;

/// Classifies a message's safety signal and urgency ahead of every other
/// gate. Pure and stateless: identical input always yields the same output.
#[derive(Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, message: &str) -> IntentClassification {
        let lower = message.to_lowercase();

        let safety_signal = signal_rules()
            .iter()
            .find(|rule| rule.patterns.iter().any(|p| lower.contains(p)))
            .map(|rule| rule.severity)
            .unwrap_or(SafetySignal::None);

        let urgency = if URGENT_PATTERNS.iter().any(|p| lower.contains(p)) {
            Urgency::Elevated
        } else {
            Urgency::Normal
        };

        IntentClassification {
            safety_signal,
            urgency,
            summary: summarize(message),
        }
    }
}

fn summarize(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= SUMMARY_MAX_CHARS {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(SUMMARY_MAX_CHARS).collect();
    format!("{truncated}...")
}
