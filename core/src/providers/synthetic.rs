//! Synthetic data providers used when no real market-data/weather/news API
//! key is configured (tests, local development). Each returns a small
//! deterministic-shaped payload derived from the requested entity so the
//! orchestrator can be exercised without network access.

use async_trait::async_trait;
use chrono::Utc;

use super::{DataProvider, ProviderData, ProviderErrorCode, ProviderQuery, ProviderResult};

fn entity_seed(entity: &str) -> u64 {
    entity.bytes().fold(7u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
}

pub struct SyntheticStockProvider;

#[async_trait]
impl DataProvider for SyntheticStockProvider {
    fn name(&self) -> &str {
        "synthetic-stock"
    }

    async fn fetch(&self, query: ProviderQuery) -> ProviderResult {
        if query.entity.is_empty() {
            return ProviderResult::Err {
                code: ProviderErrorCode::NotFound,
                message: "no symbol given".to_string(),
                retryable: false,
            };
        }
        let seed = entity_seed(&query.entity);
        let price = 50.0 + (seed % 5000) as f64 / 100.0;
        let change = ((seed % 400) as f64 - 200.0) / 100.0;
        ProviderResult::Ok {
            data: ProviderData::Stock {
                symbol: query.entity.to_uppercase(),
                price,
                change,
                change_percent: change / price * 100.0,
                currency: "USD".to_string(),
            },
            provider: self.name().to_string(),
            fetched_at: Utc::now(),
        }
    }
}

pub struct SyntheticWeatherProvider;

#[async_trait]
impl DataProvider for SyntheticWeatherProvider {
    fn name(&self) -> &str {
        "synthetic-weather"
    }

    async fn fetch(&self, query: ProviderQuery) -> ProviderResult {
        let seed = entity_seed(&query.entity);
        let temperature_f = 20.0 + (seed % 800) as f64 / 10.0;
        let condition = match seed % 4 {
            0 => "clear",
            1 => "cloudy",
            2 => "rain",
            _ => "windy",
        };
        ProviderResult::Ok {
            data: ProviderData::Weather {
                location: query.entity,
                temperature_f,
                condition: condition.to_string(),
            },
            provider: self.name().to_string(),
            fetched_at: Utc::now(),
        }
    }
}

pub struct SyntheticCryptoProvider;

#[async_trait]
impl DataProvider for SyntheticCryptoProvider {
    fn name(&self) -> &str {
        "synthetic-crypto"
    }

    async fn fetch(&self, query: ProviderQuery) -> ProviderResult {
        let seed = entity_seed(&query.entity);
        let price_usd = 100.0 + (seed % 90_000) as f64 / 10.0;
        ProviderResult::Ok {
            data: ProviderData::Crypto {
                symbol: query.entity.to_uppercase(),
                price_usd,
                change_percent_24h: ((seed % 2000) as f64 - 1000.0) / 100.0,
            },
            provider: self.name().to_string(),
            fetched_at: Utc::now(),
        }
    }
}

pub struct SyntheticFxProvider;

#[async_trait]
impl DataProvider for SyntheticFxProvider {
    fn name(&self) -> &str {
        "synthetic-fx"
    }

    async fn fetch(&self, query: ProviderQuery) -> ProviderResult {
        let seed = entity_seed(&query.entity);
        let rate = 0.5 + (seed % 200) as f64 / 100.0;
        let mut parts = query.entity.split('_');
        let base = parts.next().unwrap_or("USD").to_uppercase();
        let quote = parts.next().unwrap_or("EUR").to_uppercase();
        ProviderResult::Ok {
            data: ProviderData::Fx { base, quote, rate },
            provider: self.name().to_string(),
            fetched_at: Utc::now(),
        }
    }
}

pub struct SyntheticTimeProvider;

#[async_trait]
impl DataProvider for SyntheticTimeProvider {
    fn name(&self) -> &str {
        "synthetic-time"
    }

    async fn fetch(&self, query: ProviderQuery) -> ProviderResult {
        let now = Utc::now();
        ProviderResult::Ok {
            data: ProviderData::Time {
                location: query.entity,
                iso8601: now.to_rfc3339(),
                utc_offset: "+00:00".to_string(),
            },
            provider: self.name().to_string(),
            fetched_at: now,
        }
    }
}

pub struct SyntheticNewsProvider;

#[async_trait]
impl DataProvider for SyntheticNewsProvider {
    fn name(&self) -> &str {
        "synthetic-news"
    }

    async fn fetch(&self, query: ProviderQuery) -> ProviderResult {
        ProviderResult::Ok {
            data: ProviderData::News {
                headline: format!("Update on {}", query.entity),
                summary: format!("Synthetic summary for {}", query.entity),
                source: "synthetic-wire".to_string(),
            },
            provider: self.name().to_string(),
            fetched_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stock_provider_rejects_empty_entity() {
        let provider = SyntheticStockProvider;
        let result = provider.fetch(ProviderQuery::new("")).await;
        assert!(!result.is_ok());
    }

    #[tokio::test]
    async fn stock_provider_is_deterministic_for_same_entity() {
        let provider = SyntheticStockProvider;
        let a = provider.fetch(ProviderQuery::new("AAPL")).await;
        let b = provider.fetch(ProviderQuery::new("AAPL")).await;
        match (a, b) {
            (
                ProviderResult::Ok { data: ProviderData::Stock { price: p1, .. }, .. },
                ProviderResult::Ok { data: ProviderData::Stock { price: p2, .. }, .. },
            ) => assert_eq!(p1, p2),
            _ => panic!("expected ok stock results"),
        }
    }
}
