use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use retry_utils::{retry_with_backoff, RetryKind, RetryPolicy};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use trade_core::{QuoteError, QuoteSource};

#[derive(Error, Debug)]
pub enum PriceClientError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Rate limit exceeded")]
    RateLimit,
    #[error("Price API server error: HTTP {0}")]
    ServerError(u16),
    #[error("Invalid price response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, PriceClientError>;

#[derive(Debug, Clone)]
pub struct CoinGeckoConfig {
    /// API base URL, the free tier needs no key
    pub api_url: String,
    pub api_key: Option<String>,
    pub request_timeout_seconds: u64,
    /// Pause between calls, free tier allows roughly two per second
    pub request_delay_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: None,
            request_timeout_seconds: 30,
            request_delay_ms: 500,
            retry: RetryPolicy::default(),
        }
    }
}

/// Shape of `/coins/{id}/history`, everything beyond the USD price ignored
#[derive(Debug, Deserialize)]
struct HistoryResponse {
    market_data: Option<MarketData>,
}

#[derive(Debug, Deserialize)]
struct MarketData {
    current_price: Option<CurrencyPrices>,
}

#[derive(Debug, Deserialize)]
struct CurrencyPrices {
    usd: Option<f64>,
}

/// Symbols the tracker can price without external id discovery
///
/// Wrapped assets map to their underlying market: WETH trades at the ETH
/// price, WBTC and BTC both at the wrapped-bitcoin market.
fn builtin_symbol_ids() -> HashMap<String, String> {
    [
        ("ETH", "ethereum"),
        ("WETH", "ethereum"),
        ("WBTC", "wrapped-bitcoin"),
        ("BTC", "wrapped-bitcoin"),
        ("COMP", "compound-governance-token"),
        ("AAVE", "aave"),
        ("UNI", "uniswap"),
        ("LINK", "chainlink"),
        ("CRV", "curve-dao-token"),
        ("SUSHI", "sushi"),
        ("MKR", "maker"),
        ("SNX", "synthetix-network-token"),
        ("YFI", "yearn-finance"),
    ]
    .into_iter()
    .map(|(symbol, id)| (symbol.to_string(), id.to_string()))
    .collect()
}

/// CoinGecko historical price client
///
/// Lookups are paced by `request_delay_ms` and retried per the configured
/// policy, with rate-limit responses backed off harder than transport
/// errors. Symbols without a known CoinGecko id resolve to `None` without
/// touching the network.
pub struct CoinGeckoClient {
    config: CoinGeckoConfig,
    http_client: Client,
    symbol_ids: HashMap<String, String>,
    last_request: Mutex<Option<Instant>>,
}

impl CoinGeckoClient {
    pub fn new(config: CoinGeckoConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            http_client,
            symbol_ids: builtin_symbol_ids(),
            last_request: Mutex::new(None),
        })
    }

    /// Adds or overrides a symbol-to-id mapping
    pub fn add_symbol_mapping(&mut self, symbol: &str, coingecko_id: &str) {
        self.symbol_ids
            .insert(symbol.to_uppercase(), coingecko_id.to_string());
    }

    pub fn knows_symbol(&self, symbol: &str) -> bool {
        self.symbol_ids.contains_key(&symbol.to_uppercase())
    }

    /// USD price of `symbol` on `date`, `None` when CoinGecko cannot answer
    pub async fn historical_price(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<Decimal>> {
        let Some(id) = self.symbol_ids.get(&symbol.to_uppercase()) else {
            debug!("No CoinGecko id for {}, skipping lookup", symbol);
            return Ok(None);
        };
        let id = id.as_str();

        retry_with_backoff(
            move || self.fetch_history(id, date),
            &self.config.retry,
            classify_error,
        )
        .await
    }

    async fn fetch_history(&self, id: &str, date: NaiveDate) -> Result<Option<Decimal>> {
        self.pace().await;

        let url = format!(
            "{}/coins/{}/history",
            self.config.api_url.trim_end_matches('/'),
            id
        );
        let date_param = history_date_param(date);
        let mut request = self
            .http_client
            .get(&url)
            .query(&[("date", date_param.as_str())]);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-cg-demo-api-key", key);
        }

        debug!("Fetching {} price history for {}", id, date_param);
        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                let body: HistoryResponse = response.json().await?;
                let usd = body
                    .market_data
                    .and_then(|m| m.current_price)
                    .and_then(|p| p.usd);
                match usd {
                    Some(value) => Decimal::from_f64(value).map(Some).ok_or_else(|| {
                        PriceClientError::InvalidResponse(format!(
                            "unrepresentable USD price {} for {}",
                            value, id
                        ))
                    }),
                    None => {
                        debug!("No USD quote in history payload for {} on {}", id, date_param);
                        Ok(None)
                    }
                }
            }
            StatusCode::NOT_FOUND => {
                debug!("CoinGecko has no market {} (404)", id);
                Ok(None)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("⚠️ CoinGecko rate limited on {} for {}", id, date_param);
                Err(PriceClientError::RateLimit)
            }
            status if status.is_server_error() => {
                Err(PriceClientError::ServerError(status.as_u16()))
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(PriceClientError::InvalidResponse(format!(
                    "HTTP {}: {}",
                    status, text
                )))
            }
        }
    }

    /// Spaces requests out so consecutive calls respect the configured delay
    async fn pace(&self) {
        let delay = Duration::from_millis(self.config.request_delay_ms);
        if delay.is_zero() {
            return;
        }

        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// CoinGecko wants dates as DD-MM-YYYY
fn history_date_param(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

fn classify_error(error: &PriceClientError) -> RetryKind {
    match error {
        PriceClientError::RateLimit => RetryKind::RateLimit,
        PriceClientError::Http(_) | PriceClientError::ServerError(_) => RetryKind::Transient,
        PriceClientError::InvalidResponse(_) => RetryKind::Fatal,
    }
}

#[async_trait]
impl QuoteSource for CoinGeckoClient {
    async fn quote(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> std::result::Result<Option<Decimal>, QuoteError> {
        self.historical_price(symbol, date)
            .await
            .map_err(QuoteError::from)
    }
}

impl From<PriceClientError> for QuoteError {
    fn from(error: PriceClientError) -> Self {
        match error {
            PriceClientError::RateLimit => QuoteError::RateLimited,
            PriceClientError::Http(e) => QuoteError::Unreachable(e.to_string()),
            PriceClientError::ServerError(status) => {
                QuoteError::Unreachable(format!("HTTP {}", status))
            }
            PriceClientError::InvalidResponse(reason) => QuoteError::InvalidResponse(reason),
        }
    }
}
