use crate::models::Candle;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

const COINGECKO_API_BASE: &str = "https://api.coingecko.com/api/v3";
const RATE_LIMIT_RPM: u32 = 30; // Demo API: 30 requests per minute
const MAX_RETRIES: u32 = 3;

type CoinGeckoRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// CoinGecko API client with rate limiting
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<CoinGeckoRateLimiter>,
    backoff_unit: Duration,
}

/// Response from /market_chart endpoint
#[derive(Debug, Deserialize)]
pub struct MarketChartData {
    pub prices: Vec<[f64; 2]>,        // [timestamp_ms, price]
    pub total_volumes: Vec<[f64; 2]>, // [timestamp_ms, volume_24h]
}

impl CoinGeckoClient {
    /// `api_key` is the optional demo key
    pub fn new(api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: COINGECKO_API_BASE.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            backoff_unit: Duration::from_secs(1),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Scale of the exponential retry backoff (2^attempt units)
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    fn url(&self, path_and_query: &str) -> String {
        match &self.api_key {
            Some(key) => format!("{}{}&x_cg_demo_api_key={}", self.base_url, path_and_query, key),
            None => format!("{}{}", self.base_url, path_and_query),
        }
    }

    /// Make a rate-limited API request with retry logic
    async fn make_request(&self, url: &str) -> Result<reqwest::Response> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;
            let backoff = self.backoff_unit * 2u32.pow(attempt);

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(
                            "CoinGecko returned {}, backing off for {:?} (attempt {}/{})",
                            status,
                            backoff,
                            attempt,
                            MAX_RETRIES
                        );
                        if attempt < MAX_RETRIES {
                            tokio::time::sleep(backoff).await;
                        }
                        continue;
                    }

                    // Other errors (4xx) - don't retry
                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    anyhow::bail!("CoinGecko API error ({}): {}", status, error_text);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    tracing::warn!(
                        "Network error: {}, retrying in {:?} (attempt {}/{})",
                        e,
                        backoff,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => anyhow::bail!("Network error after {} retries: {}", MAX_RETRIES, e),
            }
        }

        anyhow::bail!("Failed after {} retries", MAX_RETRIES)
    }

    /// Fetch market chart data (price and volume time series)
    pub async fn get_market_chart(&self, coin_id: &str, days: u32) -> Result<MarketChartData> {
        let url = self.url(&format!(
            "/coins/{}/market_chart?vs_currency=usd&days={}",
            coin_id, days
        ));

        tracing::debug!("Fetching market chart for {} ({}d)", coin_id, days);

        let data: MarketChartData = self
            .make_request(&url)
            .await?
            .json()
            .await
            .context("Failed to parse market chart")?;

        tracing::debug!("Fetched {} price points for {}", data.prices.len(), coin_id);
        Ok(data)
    }

    /// Daily OHLCV candles (UTC days, oldest first) built from the market chart
    pub async fn get_daily_candles(&self, coin_id: &str, days: u32) -> Result<Vec<Candle>> {
        let chart = self.get_market_chart(coin_id, days).await?;
        let candles = aggregate_daily(coin_id, &chart);
        if candles.is_empty() {
            anyhow::bail!("CoinGecko returned no price data for {}", coin_id);
        }
        Ok(candles)
    }

    /// Latest USD spot price
    pub async fn get_current_price(&self, coin_id: &str) -> Result<f64> {
        let url = self.url(&format!("/simple/price?ids={}&vs_currencies=usd", coin_id));

        let prices: HashMap<String, HashMap<String, f64>> = self
            .make_request(&url)
            .await?
            .json()
            .await
            .context("Failed to parse simple price")?;

        prices
            .get(coin_id)
            .and_then(|p| p.get("usd"))
            .copied()
            .with_context(|| format!("No USD price for {} in response", coin_id))
    }
}

/// Bucket the point series into UTC days
fn aggregate_daily(coin_id: &str, chart: &MarketChartData) -> Vec<Candle> {
    struct Day {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    }

    let day_of = |ts_ms: f64| -> Option<NaiveDate> {
        DateTime::<Utc>::from_timestamp_millis(ts_ms as i64).map(|t| t.date_naive())
    };

    let mut days: BTreeMap<NaiveDate, Day> = BTreeMap::new();
    for [ts, price] in &chart.prices {
        let Some(date) = day_of(*ts) else { continue };
        days.entry(date)
            .and_modify(|d| {
                d.high = d.high.max(*price);
                d.low = d.low.min(*price);
                d.close = *price;
            })
            .or_insert(Day {
                open: *price,
                high: *price,
                low: *price,
                close: *price,
                volume: 0.0,
            });
    }

    // total_volumes is a rolling 24h figure; the last sample of the day is used
    for [ts, volume] in &chart.total_volumes {
        if let Some(day) = day_of(*ts).and_then(|date| days.get_mut(&date)) {
            day.volume = *volume;
        }
    }

    days.into_iter()
        .filter_map(|(date, d)| {
            let timestamp = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
            Some(Candle {
                token: coin_id.to_string(),
                timestamp,
                open: d.open,
                high: d.high,
                low: d.low,
                close: d.close,
                volume: d.volume,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: f64 = 86_400_000.0;
    // 2024-01-01T00:00:00Z
    const T0: f64 = 1_704_067_200_000.0;

    fn test_client(server: &mockito::Server) -> CoinGeckoClient {
        CoinGeckoClient::new(None)
            .unwrap()
            .with_base_url(server.url())
            .with_backoff_unit(Duration::from_millis(1))
    }

    #[test]
    fn test_aggregate_daily_candles() {
        let chart = MarketChartData {
            prices: vec![
                [T0 + 1_000.0, 100.0],
                [T0 + 3_600_000.0, 110.0],
                [T0 + 7_200_000.0, 95.0],
                [T0 + DAY_MS + 1_000.0, 96.0],
                [T0 + DAY_MS + 5_000.0, 99.0],
            ],
            total_volumes: vec![
                [T0 + 1_000.0, 1.0],
                [T0 + 7_200_000.0, 2.0],
                [T0 + DAY_MS + 5_000.0, 3.0],
            ],
        };

        let candles = aggregate_daily("bitcoin", &chart);

        assert_eq!(candles.len(), 2);
        let first = &candles[0];
        assert_eq!(first.timestamp.format("%Y-%m-%d").to_string(), "2024-01-01");
        assert_eq!((first.open, first.high, first.low, first.close), (100.0, 110.0, 95.0, 95.0));
        assert_eq!(first.volume, 2.0);
        assert_eq!(candles[1].close, 99.0);
        assert_eq!(candles[1].volume, 3.0);
    }

    #[tokio::test]
    async fn test_get_current_price() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/simple/price")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("ids".into(), "bitcoin".into()),
                mockito::Matcher::UrlEncoded("vs_currencies".into(), "usd".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"bitcoin":{"usd":64250.5}}"#)
            .create_async()
            .await;

        let price = test_client(&server).get_current_price("bitcoin").await.unwrap();
        assert_eq!(price, 64250.5);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/simple/price")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .expect(MAX_RETRIES as usize)
            .create_async()
            .await;

        let result = test_client(&server).get_current_price("bitcoin").await;

        assert!(result.is_err());
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/coins/bitcoin/market_chart")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .with_body("not found")
            .expect(1)
            .create_async()
            .await;

        let result = test_client(&server).get_daily_candles("bitcoin", 30).await;

        assert!(result.unwrap_err().to_string().contains("404"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_daily_candles_from_chart() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "prices": [[T0, 42000.0], [T0 + DAY_MS, 43000.0], [T0 + 2.0 * DAY_MS, 41000.0]],
            "total_volumes": [[T0, 1.0e10], [T0 + DAY_MS, 1.2e10], [T0 + 2.0 * DAY_MS, 0.9e10]]
        });
        let _mock = server
            .mock("GET", "/coins/bitcoin/market_chart")
            .match_query(mockito::Matcher::UrlEncoded("days".into(), "3".into()))
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let candles = test_client(&server).get_daily_candles("bitcoin", 3).await.unwrap();

        assert_eq!(candles.len(), 3);
        assert_eq!(candles[2].close, 41000.0);
        assert!(candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_get_daily_candles_live() {
        let api_key = std::env::var("COINGECKO_API_KEY").ok();
        let client = CoinGeckoClient::new(api_key).unwrap();

        let candles = client.get_daily_candles("bitcoin", 30).await.unwrap();

        assert!(candles.len() >= 28, "Expected ~30 daily candles, got {}", candles.len());
        assert!(candles.iter().all(|c| c.close > 0.0));
    }
}
