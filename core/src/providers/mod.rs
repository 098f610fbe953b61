//! Provider registry and data providers.
//!
//! Real providers call out to external market-data/weather/news APIs; this
//! module defines the interface and ships small synthetic providers
//! sufficient to exercise the live-data orchestrator end-to-end in tests
//! (SPEC_FULL §F) without depending on network access.

pub mod synthetic;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data_need::LiveCategory;

/// A query a provider is asked to satisfy.
#[derive(Debug, Clone)]
pub struct ProviderQuery {
    pub entity: String,
    pub bypass_cache: bool,
}

impl ProviderQuery {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            bypass_cache: false,
        }
    }
}

/// The differently-shaped payload each provider category returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderData {
    Stock {
        symbol: String,
        price: f64,
        change: f64,
        change_percent: f64,
        currency: String,
    },
    Weather {
        location: String,
        temperature_f: f64,
        condition: String,
    },
    Crypto {
        symbol: String,
        price_usd: f64,
        change_percent_24h: f64,
    },
    Fx {
        base: String,
        quote: String,
        rate: f64,
    },
    Time {
        location: String,
        iso8601: String,
        utc_offset: String,
    },
    News {
        headline: String,
        summary: String,
        source: String,
    },
}

/// Retryable error codes a provider can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorCode {
    Timeout,
    Unavailable,
    RateLimited,
    NotFound,
    Upstream,
}

impl ProviderErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable | Self::RateLimited)
    }
}

/// Tagged result of a single provider fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderResult {
    Ok {
        data: ProviderData,
        provider: String,
        fetched_at: DateTime<Utc>,
    },
    Err {
        code: ProviderErrorCode,
        message: String,
        retryable: bool,
    },
}

impl ProviderResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn timeout() -> Self {
        Self::Err {
            code: ProviderErrorCode::Timeout,
            message: "provider call timed out".to_string(),
            retryable: true,
        }
    }
}

/// A data-provider capability.
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, query: ProviderQuery) -> ProviderResult;
}

/// Catalog mapping `LiveCategory` to its provider; at most one provider per
/// category at a time.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<LiveCategory, Arc<dyn DataProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, category: LiveCategory, provider: Arc<dyn DataProvider>) {
        self.providers.insert(category, provider);
    }

    pub fn get(&self, category: LiveCategory) -> Option<Arc<dyn DataProvider>> {
        self.providers.get(&category).cloned()
    }

    /// Fetch `query` from `category`'s provider with a per-call timeout.
    /// A timeout produces a synthetic `Err{code=timeout}` result.
    pub async fn fetch_with_timeout(
        &self,
        category: LiveCategory,
        query: ProviderQuery,
        timeout: Duration,
    ) -> ProviderResult {
        let Some(provider) = self.get(category) else {
            return ProviderResult::Err {
                code: ProviderErrorCode::NotFound,
                message: format!("no provider registered for category {category}"),
                retryable: false,
            };
        };

        match tokio::time::timeout(timeout, provider.fetch(query)).await {
            Ok(result) => result,
            Err(_) => ProviderResult::timeout(),
        }
    }

    /// Build a registry pre-populated with the synthetic providers.
    pub fn with_synthetic_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(LiveCategory::Stock, Arc::new(synthetic::SyntheticStockProvider));
        registry.register(LiveCategory::Weather, Arc::new(synthetic::SyntheticWeatherProvider));
        registry.register(LiveCategory::Crypto, Arc::new(synthetic::SyntheticCryptoProvider));
        registry.register(LiveCategory::Fx, Arc::new(synthetic::SyntheticFxProvider));
        registry.register(LiveCategory::Time, Arc::new(synthetic::SyntheticTimeProvider));
        registry.register(LiveCategory::News, Arc::new(synthetic::SyntheticNewsProvider));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_category_returns_not_found() {
        let registry = ProviderRegistry::new();
        let result = registry
            .fetch_with_timeout(
                LiveCategory::Stock,
                ProviderQuery::new("AAPL"),
                Duration::from_secs(1),
            )
            .await;
        match result {
            ProviderResult::Err { code, .. } => assert_eq!(code, ProviderErrorCode::NotFound),
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        struct SlowProvider;
        #[async_trait]
        impl DataProvider for SlowProvider {
            fn name(&self) -> &str {
                "slow"
            }
            async fn fetch(&self, _query: ProviderQuery) -> ProviderResult {
                tokio::time::sleep(Duration::from_millis(200)).await;
                ProviderResult::Err {
                    code: ProviderErrorCode::Upstream,
                    message: "should not get here".to_string(),
                    retryable: false,
                }
            }
        }

        let mut registry = ProviderRegistry::new();
        registry.register(LiveCategory::Weather, Arc::new(SlowProvider));

        let result = registry
            .fetch_with_timeout(
                LiveCategory::Weather,
                ProviderQuery::new("NYC"),
                Duration::from_millis(10),
            )
            .await;

        match result {
            ProviderResult::Err { code, retryable, .. } => {
                assert_eq!(code, ProviderErrorCode::Timeout);
                assert!(retryable);
            }
            _ => panic!("expected timeout"),
        }
    }
}
