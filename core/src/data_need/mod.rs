//! Data-need classifier: classifies a message
//! into a truth mode, live categories, entities, and fallback behavior.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How dependent the answer is on live/external data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruthMode {
    Local,
    LiveFeed,
    Mixed,
}

/// Behavior when all live fetches for a query fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    Refuse,
    ProceedDegraded,
    QualitativeOnly,
}

/// A category of live data a message may need (maps 1:1 to a provider in
/// the registry, C8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveCategory {
    Stock,
    Weather,
    Crypto,
    Fx,
    Time,
    News,
}

impl std::fmt::Display for LiveCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stock => "stock",
            Self::Weather => "weather",
            Self::Crypto => "crypto",
            Self::Fx => "fx",
            Self::Time => "time",
            Self::News => "news",
        };
        write!(f, "{s}")
    }
}

/// Output of the data-need classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNeedClassification {
    pub truth_mode: TruthMode,
    pub live_categories: HashSet<LiveCategory>,
    pub entities: Vec<String>,
    pub fallback_mode: FallbackMode,
    pub freshness_critical: bool,
    pub max_data_age_ms: Option<i64>,
    pub requires_numeric_precision: bool,
    pub allows_action_recommendations: bool,
    /// Classifier confidence in `[0, 1]`: low when a live category matched
    /// but no entity was found to query it against.
    pub confidence: f64,
}

/// Below this, a live-data classification is too ambiguous to act on; the
/// live-data gate responds with `ResponseConstraints::Insufficient` rather
/// than attempting a fetch against a guessed entity.
pub const MIN_ACTIONABLE_CONFIDENCE: f64 = 0.5;

struct CategoryRule {
    category: LiveCategory,
    patterns: &'static [&'static str],
    fallback: FallbackMode,
    freshness_critical: bool,
}

fn category_rules() -> &'static [CategoryRule] {
    const RULES: &[CategoryRule] = &[
        CategoryRule {
            category: LiveCategory::Time,
            patterns: &["what time is it", "current time", "time in"],
            fallback: FallbackMode::Refuse,
            freshness_critical: true,
        },
        CategoryRule {
            category: LiveCategory::Stock,
            patterns: &["stock", "trading at", "share price", "ticker"],
            fallback: FallbackMode::Refuse,
            freshness_critical: true,
        },
        CategoryRule {
            category: LiveCategory::Crypto,
            patterns: &["bitcoin", "btc", "eth", "ethereum", "crypto price"],
            fallback: FallbackMode::Refuse,
            freshness_critical: true,
        },
        CategoryRule {
            category: LiveCategory::Weather,
            patterns: &["weather", "temperature", "forecast"],
            fallback: FallbackMode::ProceedDegraded,
            freshness_critical: true,
        },
        CategoryRule {
            category: LiveCategory::Fx,
            patterns: &["exchange rate", "convert usd", "convert eur", "currency conversion"],
            fallback: FallbackMode::QualitativeOnly,
            freshness_critical: false,
        },
        CategoryRule {
            category: LiveCategory::News,
            patterns: &["news", "what happened with", "latest on"],
            fallback: FallbackMode::QualitativeOnly,
            freshness_critical: false,
        },
    ];
    RULES
}

/// Classifies a message's data-need profile.
#[derive(Default)]
pub struct DataNeedClassifier;

impl DataNeedClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, message: &str) -> DataNeedClassification {
        let lower = message.to_lowercase();

        let mut categories = HashSet::new();
        let mut fallback = FallbackMode::QualitativeOnly;
        let mut freshness_critical = false;

        for rule in category_rules() {
            if rule.patterns.iter().any(|p| lower.contains(p)) {
                categories.insert(rule.category);
                // Most restrictive fallback wins when multiple categories match.
                fallback = most_restrictive(fallback, rule.fallback);
                freshness_critical |= rule.freshness_critical;
            }
        }

        let truth_mode = if categories.is_empty() {
            TruthMode::Local
        } else if categories.len() == 1 && (categories.contains(&LiveCategory::News)) {
            TruthMode::Mixed
        } else {
            TruthMode::LiveFeed
        };

        let entities = extract_entities(&lower);

        let confidence = if !categories.is_empty() && entities.is_empty() {
            0.3
        } else {
            1.0
        };

        DataNeedClassification {
            truth_mode,
            requires_numeric_precision: categories.iter().any(|c| {
                matches!(
                    c,
                    LiveCategory::Stock | LiveCategory::Crypto | LiveCategory::Fx
                )
            }),
            allows_action_recommendations: matches!(truth_mode, TruthMode::Local),
            max_data_age_ms: None,
            live_categories: categories,
            fallback_mode: fallback,
            freshness_critical,
            entities,
            confidence,
        }
    }
}

fn most_restrictive(a: FallbackMode, b: FallbackMode) -> FallbackMode {
    fn rank(m: FallbackMode) -> u8 {
        match m {
            FallbackMode::Refuse => 2,
            FallbackMode::ProceedDegraded => 1,
            FallbackMode::QualitativeOnly => 0,
        }
    }
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

/// Minimal ticker/entity extraction: uppercase tokens of 2-5 letters.
fn extract_entities(lower_message: &str) -> Vec<String> {
    lower_message
        .split_whitespace()
        .filter(|w| w.len() >= 3 && w.chars().all(|c| c.is_ascii_alphabetic()))
        .take(3)
        .map(|s| s.to_string())
        .collect()
}
