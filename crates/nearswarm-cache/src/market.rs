use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nearswarm_models::MarketConfig;
use serde::{Deserialize, Serialize};

use crate::error::MarketDataError;
use crate::memory::TtlCache;
use crate::rate_limit::RateLimiter;

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Map a ticker symbol to its CoinGecko id. Unknown symbols pass through lowercased.
pub fn coin_id(symbol: &str) -> String {
    let symbol = symbol.trim().to_lowercase();
    let id = match symbol.as_str() {
        "btc" => "bitcoin",
        "eth" => "ethereum",
        "near" => "near",
        "usdc" => "usd-coin",
        "usdt" => "tether",
        "ref" => "ref-finance",
        "aurora" => "aurora-near",
        other => return other.to_string(),
    };
    id.to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Upward,
    Downward,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Volatility {
    Low,
    Medium,
    High,
}

impl Volatility {
    /// Bucket the average daily move across the 24h, 7d, 14d and 30d windows.
    pub fn from_changes(change_24h: f64, change_7d: f64, change_14d: f64, change_30d: f64) -> Self {
        let daily = [
            change_24h.abs(),
            (change_7d / 7.0).abs(),
            (change_14d / 14.0).abs(),
            (change_30d / 30.0).abs(),
        ];
        let average = daily.iter().sum::<f64>() / daily.len() as f64;
        if average < 2.0 {
            Volatility::Low
        } else if average < 5.0 {
            Volatility::Medium
        } else {
            Volatility::High
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenQuote {
    pub coin_id: String,
    pub price: f64,
    pub volume_24h: f64,
    pub change_24h: f64,
    pub trend: Trend,
    pub volatility: Volatility,
    pub fetched_at: DateTime<Utc>,
}

/// Snapshot attached to proposals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketContext {
    pub token: String,
    pub price: f64,
    pub volume_24h: f64,
    pub change_24h: f64,
    pub trend: Trend,
    pub volatility: Volatility,
    pub timestamp: DateTime<Utc>,
}

impl From<TokenQuote> for MarketContext {
    fn from(quote: TokenQuote) -> Self {
        Self {
            token: quote.coin_id,
            price: quote.price,
            volume_24h: quote.volume_24h,
            change_24h: quote.change_24h,
            trend: quote.trend,
            volatility: quote.volatility,
            timestamp: quote.fetched_at,
        }
    }
}

#[derive(Deserialize)]
struct CoinResponse {
    market_data: Option<RawMarketData>,
}

#[derive(Deserialize)]
struct RawMarketData {
    current_price: Option<UsdAmount>,
    #[serde(default)]
    total_volume: Option<UsdAmount>,
    #[serde(default)]
    price_change_percentage_24h: Option<f64>,
    #[serde(default)]
    price_change_percentage_7d: Option<f64>,
    #[serde(default)]
    price_change_percentage_14d: Option<f64>,
    #[serde(default)]
    price_change_percentage_30d: Option<f64>,
}

#[derive(Deserialize)]
struct UsdAmount {
    usd: Option<f64>,
}

/// Decode a `/coins/{id}` body into a quote.
pub fn parse_coin_response(coin_id: &str, body: &str) -> Result<TokenQuote, MarketDataError> {
    let missing = || MarketDataError::MissingData(coin_id.to_string());
    let response: CoinResponse =
        serde_json::from_str(body).map_err(|source| MarketDataError::Decode {
            coin: coin_id.to_string(),
            source,
        })?;
    let data = response.market_data.ok_or_else(missing)?;
    let price = data
        .current_price
        .and_then(|p| p.usd)
        .ok_or_else(missing)?;

    let change_24h = data.price_change_percentage_24h.unwrap_or(0.0);
    Ok(TokenQuote {
        coin_id: coin_id.to_string(),
        price,
        volume_24h: data.total_volume.and_then(|v| v.usd).unwrap_or(0.0),
        change_24h,
        trend: if change_24h > 0.0 {
            Trend::Upward
        } else {
            Trend::Downward
        },
        volatility: Volatility::from_changes(
            change_24h,
            data.price_change_percentage_7d.unwrap_or(0.0),
            data.price_change_percentage_14d.unwrap_or(0.0),
            data.price_change_percentage_30d.unwrap_or(0.0),
        ),
        fetched_at: Utc::now(),
    })
}

/// CoinGecko client with a TTL cache in front and a shared rate limiter.
pub struct MarketDataClient {
    http: reqwest::Client,
    base_url: String,
    cache: TtlCache<TokenQuote>,
    limiter: Arc<RateLimiter>,
    ttl: Duration,
    backoff: Duration,
}

impl MarketDataClient {
    pub fn new(config: &MarketConfig) -> Result<Self, MarketDataError> {
        let limiter = Arc::new(RateLimiter::new(
            config.calls_per_window,
            Duration::from_secs(config.window_seconds),
        ));
        Self::with_limiter(config, limiter)
    }

    pub fn with_limiter(
        config: &MarketConfig,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, MarketDataError> {
        let ttl = Duration::from_secs(config.ttl_seconds);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("nearswarm/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            cache: TtlCache::new(config.max_capacity, ttl),
            limiter,
            ttl,
            backoff: BACKOFF_BASE,
        })
    }

    /// First wait after a 429; later waits grow by half each time.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Current quote for `symbol`, served from cache while younger than the TTL.
    pub async fn token_quote(&self, symbol: &str) -> Result<TokenQuote, MarketDataError> {
        let id = coin_id(symbol);
        let key = format!("price_{id}");
        self.cache
            .get_or_set(&key, || self.fetch_quote(&id), self.ttl)
            .await
    }

    pub async fn market_context(&self, symbol: &str) -> Result<MarketContext, MarketDataError> {
        self.token_quote(symbol).await.map(MarketContext::from)
    }

    async fn fetch_quote(&self, id: &str) -> Result<TokenQuote, MarketDataError> {
        let url = format!("{}/coins/{id}", self.base_url);
        let mut backoff = self.backoff;

        for attempt in 1..=MAX_RETRIES {
            self.limiter.acquire().await;
            tracing::debug!(coin = id, attempt, "fetching market data");

            let response = self
                .http
                .get(&url)
                .header("Accept", "application/json")
                .send()
                .await?;
            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RETRIES {
                    tracing::warn!(coin = id, attempt, "market data rate limited, giving up");
                    break;
                }
                tracing::warn!(coin = id, attempt, wait_ms = backoff.as_millis() as u64, "market data rate limited");
                tokio::time::sleep(backoff).await;
                backoff = backoff.mul_f64(1.5);
                continue;
            }

            let body = response.text().await?;
            if !status.is_success() {
                return Err(MarketDataError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            return parse_coin_response(id, &body);
        }

        Err(MarketDataError::RateLimited(MAX_RETRIES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEAR_BODY: &str = r#"{
        "id": "near",
        "market_data": {
            "current_price": {"usd": 5.12, "eur": 4.7},
            "total_volume": {"usd": 312000000.0},
            "price_change_percentage_24h": 3.4,
            "price_change_percentage_7d": -7.0,
            "price_change_percentage_14d": 14.0,
            "price_change_percentage_30d": 30.0
        }
    }"#;

    #[test]
    fn symbols_map_to_coin_ids() {
        assert_eq!(coin_id("NEAR"), "near");
        assert_eq!(coin_id("usdc"), "usd-coin");
        assert_eq!(coin_id("aurora"), "aurora-near");
        assert_eq!(coin_id("Solana"), "solana");
    }

    #[test]
    fn parse_full_response() {
        let quote = parse_coin_response("near", NEAR_BODY).unwrap();
        assert_eq!(quote.price, 5.12);
        assert_eq!(quote.volume_24h, 312000000.0);
        assert_eq!(quote.trend, Trend::Upward);
        // (3.4 + 1 + 1 + 1) / 4 = 1.6
        assert_eq!(quote.volatility, Volatility::Low);
    }

    #[test]
    fn negative_or_flat_change_is_downward() {
        let body = r#"{"market_data": {"current_price": {"usd": 1.0}}}"#;
        let quote = parse_coin_response("tether", body).unwrap();
        assert_eq!(quote.trend, Trend::Downward);
        assert_eq!(quote.change_24h, 0.0);
        assert_eq!(quote.volatility, Volatility::Low);
    }

    #[test]
    fn missing_market_data_is_an_error() {
        let err = parse_coin_response("nothing", r#"{"id": "nothing"}"#).unwrap_err();
        assert!(matches!(err, MarketDataError::MissingData(id) if id == "nothing"));

        let err = parse_coin_response("near", r#"{"market_data": {"current_price": {}}}"#)
            .unwrap_err();
        assert!(matches!(err, MarketDataError::MissingData(_)));
    }

    #[test]
    fn undecodable_body_keeps_the_serde_error() {
        let err = parse_coin_response("near", "<html>maintenance</html>").unwrap_err();
        assert!(matches!(err, MarketDataError::Decode { ref coin, .. } if coin == "near"));

        let err = parse_coin_response("near", r#"{"market_data": {"current_price": {"usd": "five"}}}"#)
            .unwrap_err();
        assert!(matches!(err, MarketDataError::Decode { .. }));
    }

    #[test]
    fn volatility_buckets() {
        assert_eq!(Volatility::from_changes(1.0, 7.0, 14.0, 30.0), Volatility::Low);
        assert_eq!(Volatility::from_changes(8.0, 14.0, 28.0, 60.0), Volatility::Medium);
        assert_eq!(Volatility::from_changes(-20.0, 70.0, 0.0, 0.0), Volatility::High);
    }

    #[test]
    fn context_from_quote() {
        let quote = parse_coin_response("near", NEAR_BODY).unwrap();
        let context = MarketContext::from(quote.clone());
        assert_eq!(context.token, "near");
        assert_eq!(context.price, quote.price);
        let json = serde_json::to_value(&context).unwrap();
        assert_eq!(json["trend"], "upward");
        assert_eq!(json["volatility"], "low");
    }
}
