use crate::model::PriceSource;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum QuoteError {
    #[error("Price source rate limited")]
    RateLimited,

    #[error("Price source unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid price response: {0}")]
    InvalidResponse(String),
}

/// Historical USD price source with day granularity
///
/// `Ok(None)` means the source does not cover the symbol or date; that
/// answer is final and must not be retried. `Err` means the source could not
/// be reached even after the implementation's own bounded retries.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<Decimal>, QuoteError>;
}

#[async_trait]
impl<T: QuoteSource + ?Sized> QuoteSource for Arc<T> {
    async fn quote(
        &self,
        symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<Decimal>, QuoteError> {
        (**self).quote(symbol, date).await
    }
}

/// In-memory `(symbol, day)` price cache
///
/// Entries only ever record successful lookups. Misses and transport
/// failures are never written, so absence always means "not yet answered"
/// and the next run asks again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceCache {
    entries: HashMap<String, Decimal>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: HashMap<String, Decimal>) -> Self {
        Self { entries }
    }

    /// Cache key, uppercased symbol joined with the ISO day
    pub fn key(symbol: &str, date: NaiveDate) -> String {
        format!("{}_{}", symbol.to_uppercase(), date.format("%Y-%m-%d"))
    }

    pub fn get(&self, symbol: &str, date: NaiveDate) -> Option<Decimal> {
        self.entries.get(&Self::key(symbol, date)).copied()
    }

    pub fn insert(&mut self, symbol: &str, date: NaiveDate, price: Decimal) {
        self.entries.insert(Self::key(symbol, date), price);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &HashMap<String, Decimal> {
        &self.entries
    }
}

/// Symbols treated as worth exactly $1.00 when no market quote exists
#[derive(Debug, Clone)]
pub struct StablecoinRegistry {
    pegged: HashSet<String>,
    protocol_wrapped: HashSet<String>,
}

impl Default for StablecoinRegistry {
    fn default() -> Self {
        let pegged = [
            "USDC", "USDT", "DAI", "BUSD", "USDP", "TUSD", "USDD", "FRAX",
            "LUSD", "USD3", "NUSD", "AUSD", "USN",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        let protocol_wrapped = [
            "aEthUSDC", "aUSDC", "reUSDC", "fUSDC", "csUSDC", "hyperUSDC",
            "syrupUSDC", "aEthUSDT", "syrupUSDT", "stcUSD", "siUSD", "cUSD",
            "reUSDe", "iUSD",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        Self {
            pegged,
            protocol_wrapped,
        }
    }
}

impl StablecoinRegistry {
    pub fn is_stablecoin(&self, symbol: &str) -> bool {
        self.pegged.contains(&symbol.to_uppercase())
    }

    /// Protocol receipt tokens are matched case-sensitively; their prefixes
    /// carry meaning (aUSDC vs AUSDC)
    pub fn is_protocol_stablecoin(&self, symbol: &str) -> bool {
        self.protocol_wrapped.contains(symbol)
    }

    /// Strips well-known protocol prefixes to recover the deposited asset
    ///
    /// Handles Pendle principal tokens ("PT-sUSDe-29MAY2025"), Aave receipt
    /// tokens ("aEthUSDC", "aUSDC") and f-prefixed vault shares ("fUSDC").
    pub fn underlying_asset(symbol: &str) -> Option<&str> {
        if let Some(rest) = symbol.strip_prefix("PT-") {
            return rest.split('-').next().filter(|s| !s.is_empty());
        }
        if let Some(rest) = symbol.strip_prefix("aEth") {
            return Some(rest).filter(|s| !s.is_empty());
        }
        if let Some(rest) = symbol.strip_prefix('a') {
            return Some(rest).filter(|s| !s.is_empty());
        }
        if let Some(rest) = symbol.strip_prefix('f') {
            return Some(rest).filter(|s| !s.is_empty());
        }
        None
    }

    /// Whether the symbol can be assumed to sit on the $1.00 peg, directly
    /// or through the asset it wraps
    pub fn is_pegged(&self, symbol: &str) -> bool {
        if self.is_stablecoin(symbol) || self.is_protocol_stablecoin(symbol) {
            return true;
        }
        match Self::underlying_asset(symbol) {
            Some(underlying) => {
                self.is_stablecoin(underlying) || self.is_protocol_stablecoin(underlying)
            }
            None => false,
        }
    }
}

/// Resolved prices for one trade plus the strategy that produced them
#[derive(Debug, Clone, PartialEq)]
pub struct Valuation {
    pub price_in_usd: Option<Decimal>,
    pub price_out_usd: Option<Decimal>,
    pub source: PriceSource,
}

/// Prices trades by walking a fixed strategy chain
///
/// Order: external quotes for both legs, then ratio derivation off a single
/// quoted leg, then the stablecoin peg, then give up. The cache is consulted
/// before the external source and updated on every successful quote.
pub struct ValuationEngine {
    quotes: Arc<dyn QuoteSource>,
    stables: StablecoinRegistry,
}

impl ValuationEngine {
    pub fn new(quotes: Arc<dyn QuoteSource>) -> Self {
        Self {
            quotes,
            stables: StablecoinRegistry::default(),
        }
    }

    pub fn with_stables(quotes: Arc<dyn QuoteSource>, stables: StablecoinRegistry) -> Self {
        Self { quotes, stables }
    }

    pub async fn resolve(
        &self,
        cache: &mut PriceCache,
        symbol_in: &str,
        amount_in: Decimal,
        symbol_out: &str,
        amount_out: Decimal,
        date: NaiveDate,
    ) -> Valuation {
        let price_in = self.external_quote(cache, symbol_in, date).await;
        let price_out = self.external_quote(cache, symbol_out, date).await;

        if let (Some(pi), Some(po)) = (price_in, price_out) {
            return Valuation {
                price_in_usd: Some(pi),
                price_out_usd: Some(po),
                source: PriceSource::ExternalQuote,
            };
        }

        let can_derive = amount_in > Decimal::ZERO && amount_out > Decimal::ZERO;

        // One quoted leg prices the other through the exchange ratio
        if can_derive {
            if let Some(pi) = price_in {
                let derived = pi * amount_in / amount_out;
                return Valuation {
                    price_in_usd: Some(pi),
                    price_out_usd: Some(derived),
                    source: self.ratio_source(symbol_in),
                };
            }
            if let Some(po) = price_out {
                let derived = po * amount_out / amount_in;
                return Valuation {
                    price_in_usd: Some(derived),
                    price_out_usd: Some(po),
                    source: self.ratio_source(symbol_out),
                };
            }
        }

        // Stablecoin peg for whatever is still unpriced
        let peg_in = self.stables.is_pegged(symbol_in);
        let peg_out = self.stables.is_pegged(symbol_out);
        let price_in = price_in.or(peg_in.then_some(Decimal::ONE));
        let price_out = price_out.or(peg_out.then_some(Decimal::ONE));

        match (price_in, price_out) {
            (Some(pi), Some(po)) => Valuation {
                price_in_usd: Some(pi),
                price_out_usd: Some(po),
                source: PriceSource::Stablecoin,
            },
            (Some(pi), None) if can_derive => Valuation {
                price_in_usd: Some(pi),
                price_out_usd: Some(pi * amount_in / amount_out),
                source: PriceSource::StablecoinRatio,
            },
            (None, Some(po)) if can_derive => Valuation {
                price_in_usd: Some(po * amount_out / amount_in),
                price_out_usd: Some(po),
                source: PriceSource::StablecoinRatio,
            },
            (pi, po) => {
                debug!(
                    "No price strategy succeeded for {} -> {} on {}",
                    symbol_in, symbol_out, date
                );
                Valuation {
                    price_in_usd: pi,
                    price_out_usd: po,
                    source: PriceSource::Unavailable,
                }
            }
        }
    }

    /// Prices a trade in place, using the trade's own day for the lookup
    pub async fn price_trade(
        &self,
        cache: &mut PriceCache,
        trade: &mut crate::model::ValuedTrade,
    ) {
        let Some(date) = trade.trade_date() else {
            warn!(
                "⚠️ Trade {} has an out-of-range timestamp, leaving it unpriced",
                trade.tx_hash
            );
            trade.price_source = PriceSource::Unavailable;
            return;
        };

        let valuation = self
            .resolve(
                cache,
                &trade.token_in,
                trade.amount_in,
                &trade.token_out,
                trade.amount_out,
                date,
            )
            .await;

        trade.source_price_usd = valuation.price_in_usd;
        trade.target_price_usd = valuation.price_out_usd;
        trade.price_source = valuation.source;
    }

    fn ratio_source(&self, anchor_symbol: &str) -> PriceSource {
        if self.stables.is_pegged(anchor_symbol) {
            PriceSource::StablecoinRatio
        } else {
            PriceSource::QuoteRatio
        }
    }

    async fn external_quote(
        &self,
        cache: &mut PriceCache,
        symbol: &str,
        date: NaiveDate,
    ) -> Option<Decimal> {
        if let Some(price) = cache.get(symbol, date) {
            return Some(price);
        }

        match self.quotes.quote(symbol, date).await {
            Ok(Some(price)) => {
                cache.insert(symbol, date, price);
                debug!("Quoted {} @ {} = ${}", symbol, date, price);
                Some(price)
            }
            Ok(None) => {
                debug!("No quote for {} @ {}", symbol, date);
                None
            }
            Err(e) => {
                warn!("⚠️ Quote lookup failed for {} @ {}: {}", symbol, date, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PriceSource, ValuedTrade};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct ScriptedQuotes {
        prices: HashMap<String, Decimal>,
        errors: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedQuotes {
        fn new(prices: &[(&str, Decimal)]) -> Self {
            Self {
                prices: prices
                    .iter()
                    .map(|(s, p)| (s.to_string(), *p))
                    .collect(),
                errors: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, symbol: &str) -> Self {
            self.errors.insert(symbol.to_string());
            self
        }

        fn calls_for(&self, symbol: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.as_str() == symbol)
                .count()
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedQuotes {
        async fn quote(
            &self,
            symbol: &str,
            _date: NaiveDate,
        ) -> Result<Option<Decimal>, QuoteError> {
            self.calls.lock().unwrap().push(symbol.to_string());
            if self.errors.contains(symbol) {
                return Err(QuoteError::Unreachable("connection refused".to_string()));
            }
            Ok(self.prices.get(symbol).copied())
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[tokio::test]
    async fn both_legs_quoted_directly() {
        let quotes = Arc::new(ScriptedQuotes::new(&[
            ("WETH", dec!(2000)),
            ("WBTC", dec!(60000)),
        ]));
        let engine = ValuationEngine::new(quotes);
        let mut cache = PriceCache::new();

        let v = engine
            .resolve(&mut cache, "WETH", dec!(3), "WBTC", dec!(0.1), day())
            .await;

        assert_eq!(v.source, PriceSource::ExternalQuote);
        assert_eq!(v.price_in_usd, Some(dec!(2000)));
        assert_eq!(v.price_out_usd, Some(dec!(60000)));
        assert_eq!(cache.get("WETH", day()), Some(dec!(2000)));
        assert_eq!(cache.get("WBTC", day()), Some(dec!(60000)));
    }

    #[tokio::test]
    async fn stablecoin_leg_anchors_the_ratio() {
        // 1000 USDC for 0.5 WETH with only the USDC quote available
        let quotes = Arc::new(ScriptedQuotes::new(&[("USDC", dec!(1.00))]));
        let engine = ValuationEngine::new(quotes);
        let mut cache = PriceCache::new();

        let v = engine
            .resolve(&mut cache, "USDC", dec!(1000), "WETH", dec!(0.5), day())
            .await;

        assert_eq!(v.source, PriceSource::StablecoinRatio);
        assert_eq!(v.price_in_usd, Some(dec!(1.00)));
        assert_eq!(v.price_out_usd, Some(dec!(2000)));
    }

    #[tokio::test]
    async fn non_stable_anchor_is_a_plain_ratio() {
        let quotes = Arc::new(ScriptedQuotes::new(&[("WETH", dec!(2000))]));
        let engine = ValuationEngine::new(quotes);
        let mut cache = PriceCache::new();

        let v = engine
            .resolve(&mut cache, "WETH", dec!(1), "PEPE", dec!(10000), day())
            .await;

        assert_eq!(v.source, PriceSource::QuoteRatio);
        assert_eq!(v.price_in_usd, Some(dec!(2000)));
        assert_eq!(v.price_out_usd, Some(dec!(0.2)));
    }

    #[tokio::test]
    async fn two_stables_fall_back_to_the_peg() {
        let quotes = Arc::new(ScriptedQuotes::new(&[]));
        let engine = ValuationEngine::new(quotes);
        let mut cache = PriceCache::new();

        let v = engine
            .resolve(&mut cache, "USDC", dec!(500), "DAI", dec!(499), day())
            .await;

        assert_eq!(v.source, PriceSource::Stablecoin);
        assert_eq!(v.price_in_usd, Some(Decimal::ONE));
        assert_eq!(v.price_out_usd, Some(Decimal::ONE));
    }

    #[tokio::test]
    async fn wrapped_stable_pegs_through_its_underlying() {
        let quotes = Arc::new(ScriptedQuotes::new(&[]));
        let engine = ValuationEngine::new(quotes);
        let mut cache = PriceCache::new();

        let v = engine
            .resolve(
                &mut cache,
                "PT-sUSDe-29MAY2025",
                dec!(1000),
                "WETH",
                dec!(0.5),
                day(),
            )
            .await;

        // sUSDe is not pegged, so this one stays unresolved
        assert_eq!(v.source, PriceSource::Unavailable);

        let v = engine
            .resolve(&mut cache, "aEthUSDC", dec!(1000), "WETH", dec!(0.5), day())
            .await;

        assert_eq!(v.source, PriceSource::StablecoinRatio);
        assert_eq!(v.price_out_usd, Some(dec!(2000)));
    }

    #[tokio::test]
    async fn cached_keys_are_not_asked_again() {
        let quotes = Arc::new(ScriptedQuotes::new(&[("USDC", dec!(1.00))]));
        let engine = ValuationEngine::new(quotes.clone());
        let mut cache = PriceCache::new();

        let first = engine
            .resolve(&mut cache, "USDC", dec!(1000), "WETH", dec!(0.5), day())
            .await;
        let second = engine
            .resolve(&mut cache, "USDC", dec!(1000), "WETH", dec!(0.5), day())
            .await;

        assert_eq!(first, second);
        // USDC was answered once and cached; the WETH miss is asked again
        assert_eq!(quotes.calls_for("USDC"), 1);
        assert_eq!(quotes.calls_for("WETH"), 2);
        assert!(cache.get("WETH", day()).is_none());
    }

    #[tokio::test]
    async fn source_failure_is_a_miss_and_never_cached() {
        let quotes = Arc::new(
            ScriptedQuotes::new(&[("USDC", dec!(1.00))]).failing_on("WETH"),
        );
        let engine = ValuationEngine::new(quotes);
        let mut cache = PriceCache::new();

        let v = engine
            .resolve(&mut cache, "USDC", dec!(1000), "WETH", dec!(0.5), day())
            .await;

        assert_eq!(v.source, PriceSource::StablecoinRatio);
        assert!(cache.get("WETH", day()).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_pair_is_left_unpriced() {
        let quotes = Arc::new(ScriptedQuotes::new(&[]));
        let engine = ValuationEngine::new(quotes);
        let mut cache = PriceCache::new();

        let v = engine
            .resolve(&mut cache, "MYSTERY", dec!(5), "ENIGMA", dec!(9), day())
            .await;

        assert_eq!(v.source, PriceSource::Unavailable);
        assert_eq!(v.price_in_usd, None);
        assert_eq!(v.price_out_usd, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn price_trade_fills_the_record_in_place() {
        let quotes = Arc::new(ScriptedQuotes::new(&[("USDC", dec!(1.00))]));
        let engine = ValuationEngine::new(quotes);
        let mut cache = PriceCache::new();

        let mut trade = ValuedTrade {
            tx_hash: "0xswap".to_string(),
            block_number: 19_000_000,
            timestamp: 1_700_000_000,
            token_in: "USDC".to_string(),
            token_out: "WETH".to_string(),
            amount_in: dec!(1000),
            amount_out: dec!(0.5),
            source_price_usd: None,
            target_price_usd: None,
            price_source: PriceSource::Unavailable,
        };

        engine.price_trade(&mut cache, &mut trade).await;

        assert_eq!(trade.price_source, PriceSource::StablecoinRatio);
        assert_eq!(trade.source_price_usd, Some(dec!(1.00)));
        assert_eq!(trade.target_price_usd, Some(dec!(2000)));
    }

    #[test]
    fn underlying_extraction_handles_known_prefixes() {
        assert_eq!(
            StablecoinRegistry::underlying_asset("PT-sUSDe-29MAY2025"),
            Some("sUSDe")
        );
        assert_eq!(StablecoinRegistry::underlying_asset("aEthWETH"), Some("WETH"));
        assert_eq!(StablecoinRegistry::underlying_asset("aUSDC"), Some("USDC"));
        assert_eq!(StablecoinRegistry::underlying_asset("fUSDT"), Some("USDT"));
        assert_eq!(StablecoinRegistry::underlying_asset("WETH"), None);
    }

    #[test]
    fn peg_membership_rules() {
        let stables = StablecoinRegistry::default();
        assert!(stables.is_pegged("usdc"));
        assert!(stables.is_pegged("aEthUSDT"));
        assert!(stables.is_pegged("PT-iUSD-26JUN2025"));
        assert!(!stables.is_pegged("AUSDC"));
        assert!(!stables.is_pegged("WETH"));
    }
}
