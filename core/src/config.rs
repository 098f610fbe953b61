//! Pipeline configuration: a single [`PipelineConfig`]
//! tree, loadable from a file/environment overlay via the `config` crate,
//! with safe defaults for every field so the pipeline runs out of the box.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limit::TierConfig;

/// Regeneration cap for the generation↔personality-validate loop.
pub const DEFAULT_MAX_REGENERATIONS: u8 = 2;

/// Default acknowledgment-token lifetime in seconds.
pub const DEFAULT_ACK_TOKEN_TTL_SECS: u64 = 600;

/// Default crisis-session lifetime in seconds.
pub const DEFAULT_CRISIS_SESSION_TTL_SECS: u64 = 24 * 3600;

/// Default warn-session lifetime in seconds.
pub const DEFAULT_WARN_SESSION_TTL_SECS: u64 = 3600;

/// Default per-provider fetch timeout in milliseconds.
pub const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 5000;

/// Default overall pipeline timeout in milliseconds.
pub const DEFAULT_PIPELINE_TIMEOUT_MS: u64 = 30_000;

/// Rate-limiter configuration: one [`TierConfig`] per named tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub anonymous: RawTierConfig,
    pub standard: RawTierConfig,
    pub premium: RawTierConfig,
}

/// Plain-data mirror of [`TierConfig`] (serde-friendly, no derived methods).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RawTierConfig {
    pub window_ms: u64,
    pub max_tokens: f64,
    pub refill_rate_per_sec: f64,
}

impl From<TierConfig> for RawTierConfig {
    fn from(t: TierConfig) -> Self {
        Self {
            window_ms: t.window_ms,
            max_tokens: t.max_tokens,
            refill_rate_per_sec: t.refill_rate_per_sec,
        }
    }
}

impl From<RawTierConfig> for TierConfig {
    fn from(t: RawTierConfig) -> Self {
        Self {
            window_ms: t.window_ms,
            max_tokens: t.max_tokens,
            refill_rate_per_sec: t.refill_rate_per_sec,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            anonymous: TierConfig::anonymous().into(),
            standard: TierConfig::standard().into(),
            premium: TierConfig::premium().into(),
        }
    }
}

/// Gate-executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineGateConfig {
    pub max_regenerations: u8,
    pub pipeline_timeout_ms: u64,
    pub provider_timeout_ms: u64,
}

impl Default for PipelineGateConfig {
    fn default() -> Self {
        Self {
            max_regenerations: DEFAULT_MAX_REGENERATIONS,
            pipeline_timeout_ms: DEFAULT_PIPELINE_TIMEOUT_MS,
            provider_timeout_ms: DEFAULT_PROVIDER_TIMEOUT_MS,
        }
    }
}

/// Shield-engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldConfig {
    pub ack_token_ttl_secs: u64,
    pub crisis_session_ttl_secs: u64,
    pub warn_session_ttl_secs: u64,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            ack_token_ttl_secs: DEFAULT_ACK_TOKEN_TTL_SECS,
            crisis_session_ttl_secs: DEFAULT_CRISIS_SESSION_TTL_SECS,
            warn_session_ttl_secs: DEFAULT_WARN_SESSION_TTL_SECS,
        }
    }
}

/// Audit-log retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { retention_days: 365 }
    }
}

/// Root configuration tree for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub gate: PipelineGateConfig,
    pub shield: ShieldConfig,
    pub audit: AuditConfig,
    pub rate_limit: RateLimitConfig,
}

impl PipelineConfig {
    /// Build the overlay: defaults, then an optional `config.toml`/`.yaml`
    /// file, then `WARDLINE_`-prefixed environment variables, highest
    /// priority last.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(config_err)?);

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("WARDLINE")
                .separator("__")
                .try_parsing(true),
        );

        builder.build().map_err(config_err)?.try_deserialize().map_err(config_err)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.gate.provider_timeout_ms)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_millis(self.gate.pipeline_timeout_ms)
    }

    pub fn ack_token_ttl(&self) -> Duration {
        Duration::from_secs(self.shield.ack_token_ttl_secs)
    }

    pub fn crisis_session_ttl(&self) -> Duration {
        Duration::from_secs(self.shield.crisis_session_ttl_secs)
    }

    pub fn warn_session_ttl(&self) -> Duration {
        Duration::from_secs(self.shield.warn_session_ttl_secs)
    }
}

fn config_err(err: impl std::fmt::Display) -> Error {
    Error::configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_loads_without_a_file() {
        let config = PipelineConfig::load(None).unwrap();
        assert_eq!(config.gate.max_regenerations, DEFAULT_MAX_REGENERATIONS);
        assert_eq!(config.shield.ack_token_ttl_secs, DEFAULT_ACK_TOKEN_TTL_SECS);
    }

    #[test]
    fn anonymous_tier_is_stricter_than_standard_by_default() {
        let config = PipelineConfig::load(None).unwrap();
        assert!(config.rate_limit.anonymous.max_tokens < config.rate_limit.standard.max_tokens);
    }
}
