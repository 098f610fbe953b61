//! Freshness checker: classifies a message into a data
//! domain and decides what the live-data orchestrator and invariant checker
//! must enforce about numeric claims for that domain.

use serde::{Deserialize, Serialize};

/// Action required once a domain's freshness window has been evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAction {
    None,
    Warn,
    Verify,
    BlockNumerics,
}

/// A domain's freshness window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FreshnessWindow {
    /// Maximum age before data is considered stale. `None` means the
    /// domain never goes stale (historical facts, math, physics).
    pub max_age_ms: Option<i64>,
    /// `true` means any unverified answer in this domain is unsafe and
    /// numeric claims are forbidden without fresh data (the "immediate
    /// domain" concept from the glossary).
    pub immediate: bool,
}

impl FreshnessWindow {
    const fn new(max_age_ms: Option<i64>, immediate: bool) -> Self {
        Self { max_age_ms, immediate }
    }
}

/// Result of classifying a message's data domain and freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessResult {
    pub domain: String,
    pub is_stale: bool,
    pub stale_by_ms: Option<i64>,
    pub required_action: RequiredAction,
    pub window: FreshnessWindowSnapshot,
}

/// Serializable snapshot of a [`FreshnessWindow`] (avoids exposing the
/// `'static` lifetime of the domain table to callers).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreshnessWindowSnapshot {
    pub max_age_ms: Option<i64>,
    pub immediate: bool,
}

impl From<FreshnessWindow> for FreshnessWindowSnapshot {
    fn from(w: FreshnessWindow) -> Self {
        Self {
            max_age_ms: w.max_age_ms,
            immediate: w.immediate,
        }
    }
}

struct DomainRule {
    domain: &'static str,
    priority: u8,
    patterns: &'static [&'static str],
    window: FreshnessWindow,
}

const DAY_MS: i64 = 86_400_000;

/// Ordered `(domain, patternSet, priority)` table plus freshness windows
///. Higher `priority` wins when multiple domains match.
fn domain_rules() -> &'static [DomainRule] {
    const RULES: &[DomainRule] = &[
        DomainRule {
            domain: "crypto_prices",
            priority: 90,
            patterns: &["bitcoin", "btc", "eth", "ethereum", "crypto", "token price"],
            window: FreshnessWindow::new(Some(5 * 60_000), true),
        },
        DomainRule {
            domain: "stock_prices",
            priority: 90,
            patterns: &["stock", "share price", "trading at", "ticker", "nasdaq", "nyse"],
            window: FreshnessWindow::new(Some(15 * 60_000), true),
        },
        DomainRule {
            domain: "weather",
            priority: 85,
            patterns: &["weather", "temperature", "forecast", "rain", "snow"],
            window: FreshnessWindow::new(Some(60 * 60_000), true),
        },
        DomainRule {
            domain: "breaking_news",
            priority: 95,
            patterns: &["breaking news", "just happened", "breaking:"],
            window: FreshnessWindow::new(Some(4 * 60 * 60_000), true),
        },
        DomainRule {
            domain: "news",
            priority: 60,
            patterns: &["news", "latest on", "what happened with"],
            window: FreshnessWindow::new(Some(24 * 60 * 60_000), false),
        },
        DomainRule {
            domain: "sports_scores",
            priority: 80,
            patterns: &["score", "game result", "who won", "match result"],
            window: FreshnessWindow::new(Some(2 * 60 * 60_000), false),
        },
        DomainRule {
            domain: "exchange_rates",
            priority: 75,
            patterns: &["exchange rate", "currency conversion", "usd to", "eur to"],
            window: FreshnessWindow::new(Some(DAY_MS), false),
        },
        DomainRule {
            domain: "product_prices",
            priority: 70,
            patterns: &["price of", "how much does", "cost of"],
            window: FreshnessWindow::new(Some(7 * DAY_MS), false),
        },
        DomainRule {
            domain: "company_info",
            priority: 50,
            patterns: &["ceo of", "founded", "headquartered", "company profile"],
            window: FreshnessWindow::new(Some(30 * DAY_MS), false),
        },
        DomainRule {
            domain: "laws_regulations",
            priority: 55,
            patterns: &["law", "regulation", "statute", "legal requirement"],
            window: FreshnessWindow::new(Some(90 * DAY_MS), false),
        },
        DomainRule {
            domain: "medical_guidelines",
            priority: 55,
            patterns: &["medical guideline", "dosage", "treatment protocol"],
            window: FreshnessWindow::new(Some(180 * DAY_MS), false),
        },
        DomainRule {
            domain: "historical_facts",
            priority: 10,
            patterns: &["history of", "historical", "math", "physics", "theorem"],
            window: FreshnessWindow::new(None, false),
        },
    ];
    RULES
}

/// Scans messages for domain keywords and applies per-domain freshness
/// windows and staleness policy.
#[derive(Default)]
pub struct FreshnessChecker;

impl FreshnessChecker {
    pub fn new() -> Self {
        Self
    }

    /// Classify `message` into the highest-priority matching domain
    /// (default `general`, which never goes stale).
    pub fn classify_domain(&self, message: &str) -> &'static str {
        let lower = message.to_lowercase();
        let mut best: Option<&DomainRule> = None;
        for rule in domain_rules() {
            if rule.patterns.iter().any(|p| lower.contains(p)) {
                match best {
                    Some(b) if b.priority >= rule.priority => {}
                    _ => best = Some(rule),
                }
            }
        }
        best.map(|r| r.domain).unwrap_or("general")
    }

    fn window_for(&self, domain: &str) -> FreshnessWindow {
        domain_rules()
            .iter()
            .find(|r| r.domain == domain)
            .map(|r| r.window)
            .unwrap_or(FreshnessWindow::new(None, false))
    }

    /// Evaluate freshness for `message` given the age of the data backing
    /// a potential answer. `data_age_ms = None` means the age is unknown
    /// (e.g. no live fetch was attempted).
    pub fn check(&self, message: &str, data_age_ms: Option<i64>) -> FreshnessResult {
        let domain = self.classify_domain(message);
        let window = self.window_for(domain);

        let (is_stale, stale_by_ms, required_action) = match (window.max_age_ms, data_age_ms) {
            (_, None) if window.immediate => (true, None, RequiredAction::BlockNumerics),
            (None, _) => (false, None, RequiredAction::None),
            (Some(max_age), None) => (false, None, self.action_for_unknown_age(max_age)),
            (Some(max_age), Some(age)) => {
                let stale = age > max_age;
                let stale_by = if stale { Some(age - max_age) } else { None };
                let action = if !stale {
                    RequiredAction::None
                } else if age > max_age * 2 {
                    RequiredAction::Verify
                } else {
                    RequiredAction::Warn
                };
                (stale, stale_by, action)
            }
        };

        FreshnessResult {
            domain: domain.to_string(),
            is_stale,
            stale_by_ms,
            required_action,
            window: window.into(),
        }
    }

    fn action_for_unknown_age(&self, _max_age: i64) -> RequiredAction {
        RequiredAction::Warn
    }
}
