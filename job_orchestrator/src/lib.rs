use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chain_adapters::{
    create_adapter, AdapterError, AdapterSettings, ChainAdapter, ChainKind, TokenRegistry,
    TokenSeed,
};
use chrono::{DateTime, Utc};
use config_manager::{
    ChainSettings, ClassifierConfig, ConfigurationError, PriceSourceConfig, RetrySettings,
    SystemConfig,
};
use persistence_layer::{summarize, PersistenceError, PriceCacheStore, TaxStore, TaxSummary, TradeStore};
use price_client::{CoinGeckoClient, CoinGeckoConfig, PriceClientError};
use retry_utils::RetryPolicy;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use trade_core::{
    aggregate_transfers, is_dust_trade, ClassifierThresholds, PriceCache, QuoteSource,
    RecordedTrade, TaxCalculator, TaxRecord, ValuationEngine, ValuedTrade,
};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),

    #[error("Chain adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Price client error: {0}")]
    PriceClient(#[from] PriceClientError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Converts the configured classifier cutoffs into exact decimals
pub fn classifier_thresholds(config: &ClassifierConfig) -> Result<ClassifierThresholds> {
    let decimal = |name: &str, value: f64| -> Result<Decimal> {
        Decimal::from_f64(value).ok_or_else(|| {
            ConfigurationError::InvalidValue(format!(
                "classifier.{} value {} is not representable",
                name, value
            ))
            .into()
        })
    };

    Ok(ClassifierThresholds {
        dust_usd: decimal("dust_usd", config.dust_usd)?,
        native_min_units: decimal("native_min_units", config.native_min_units)?,
        native_fee_max_units: decimal("native_fee_max_units", config.native_fee_max_units)?,
        unknown_units_min: decimal("unknown_units_min", config.unknown_units_min)?,
    })
}

fn retry_policy(settings: &RetrySettings) -> RetryPolicy {
    RetryPolicy {
        max_attempts: settings.max_attempts,
        base_delay_ms: settings.base_delay_ms,
        backoff_multiplier: settings.backoff_multiplier,
    }
}

/// Adapter settings for one configured chain
pub fn adapter_settings(
    chain: &ChainSettings,
    thresholds: &ClassifierThresholds,
) -> Result<AdapterSettings> {
    Ok(AdapterSettings {
        chain_name: chain.name.clone(),
        kind: ChainKind::from_str(&chain.kind)?,
        api_url: chain.api_url.clone(),
        api_key: (!chain.api_key.is_empty()).then(|| chain.api_key.clone()),
        chain_id: chain.chain_id,
        native_decimals: chain.native_decimals,
        page_size: chain.page_size as u64,
        request_delay_ms: chain.request_delay_ms,
        thresholds: thresholds.clone(),
        ..AdapterSettings::default()
    })
}

pub fn coingecko_config(price: &PriceSourceConfig) -> CoinGeckoConfig {
    CoinGeckoConfig {
        api_url: price.api_url.clone(),
        api_key: price.api_key.clone(),
        request_timeout_seconds: price.request_timeout_seconds,
        request_delay_ms: price.request_delay_ms,
        retry: retry_policy(&price.retry),
    }
}

/// Outcome of one chain-and-address pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub chain: String,
    pub address: String,
    pub status: PassStatus,
    pub trades: usize,
    pub error: Option<String>,
}

/// What one batch run did, logged at the end and returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passes: Vec<PassReport>,
    pub trade_count: usize,
    pub priced_count: usize,
    pub unpriced_count: usize,
    /// Trade counts keyed by pricing strategy
    pub price_sources: BTreeMap<String, usize>,
    pub tax: TaxSummary,
}

impl RunSummary {
    pub fn failed_passes(&self) -> usize {
        self.passes
            .iter()
            .filter(|p| p.status == PassStatus::Failed)
            .count()
    }
}

/// Replays all trades chronologically through one FIFO ledger per address
///
/// The sort is total: timestamp, then block, then transaction id, so reruns
/// over the same history produce identical records. Inventory never crosses
/// addresses; each address gets its own calculator and id sequence.
pub fn compute_tax_records(recorded: &mut [RecordedTrade]) -> Vec<TaxRecord> {
    recorded.sort_by(|a, b| {
        a.trade
            .timestamp
            .cmp(&b.trade.timestamp)
            .then_with(|| a.trade.block_number.cmp(&b.trade.block_number))
            .then_with(|| a.trade.tx_hash.cmp(&b.trade.tx_hash))
    });

    let mut calculators: HashMap<String, TaxCalculator> = HashMap::new();
    let mut records = Vec::new();
    for item in recorded.iter() {
        let calculator = calculators.entry(item.address.clone()).or_default();
        if let Some(record) = calculator.process_trade(item) {
            records.push(record);
        }
    }
    records
}

/// Drives the whole pipeline: every enabled chain, every configured address
///
/// Passes run sequentially so the price cache warms up front to back and the
/// FIFO ledger sees trades in one deterministic order. A failing pass is
/// recorded and the batch moves on; only configuration problems abort a run.
pub struct BatchRunner {
    config: SystemConfig,
    thresholds: ClassifierThresholds,
    valuation: ValuationEngine,
    cache_store: PriceCacheStore,
}

impl BatchRunner {
    pub fn new(config: SystemConfig) -> Result<Self> {
        let quotes = Arc::new(CoinGeckoClient::new(coingecko_config(&config.price_source))?);
        Self::with_quote_source(config, quotes)
    }

    /// Same runner with a caller-supplied price source
    pub fn with_quote_source(config: SystemConfig, quotes: Arc<dyn QuoteSource>) -> Result<Self> {
        let thresholds = classifier_thresholds(&config.classifier)?;
        let cache_store = PriceCacheStore::new(
            PathBuf::from(&config.system.output_dir).join(&config.price_source.cache_file),
        );
        Ok(Self {
            config,
            thresholds,
            valuation: ValuationEngine::new(quotes),
            cache_store,
        })
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Starting batch run {}", run_id);

        let mut cache = self.cache_store.load()?;
        let mut passes: Vec<PassReport> = Vec::new();
        let mut recorded: Vec<RecordedTrade> = Vec::new();
        let mut chain_trades: Vec<(String, Vec<ValuedTrade>)> = Vec::new();

        for chain in &self.config.chains {
            if !chain.enabled {
                info!("Chain {} is disabled, skipping", chain.name);
                continue;
            }

            let settings = adapter_settings(chain, &self.thresholds)?;
            let kind = settings.kind;
            let adapter = create_adapter(settings)?;
            let mut registry = TokenRegistry::new(
                &chain.name,
                adapter.rules(),
                &chain.native_symbol,
                kind.default_decimals(),
            );
            registry.seed(&config_seeds(&self.config, &chain.name));

            let mut trades_for_chain: Vec<ValuedTrade> = Vec::new();
            for address in &chain.addresses {
                let outcome = self
                    .run_pass(adapter.as_ref(), &mut registry, &mut cache, chain, address)
                    .await;

                match outcome {
                    Ok(trades) => {
                        passes.push(PassReport {
                            chain: chain.name.clone(),
                            address: address.clone(),
                            status: PassStatus::Completed,
                            trades: trades.len(),
                            error: None,
                        });
                        recorded.extend(trades.iter().cloned().map(|trade| RecordedTrade {
                            trade,
                            platform: chain.name.clone(),
                            address: address.clone(),
                        }));
                        trades_for_chain.extend(trades);
                    }
                    Err(e) => {
                        error!("❌ Pass failed for {} on {}: {}", address, chain.name, e);
                        passes.push(PassReport {
                            chain: chain.name.clone(),
                            address: address.clone(),
                            status: PassStatus::Failed,
                            trades: 0,
                            error: Some(e.to_string()),
                        });
                    }
                }

                // New quotes survive even if a later pass dies mid-flight
                if let Err(e) = self.cache_store.save(&cache) {
                    warn!("⚠️ Could not save price cache: {}", e);
                }
                sleep(Duration::from_millis(chain.request_delay_ms)).await;
            }
            chain_trades.push((chain.name.clone(), trades_for_chain));
        }

        let records = compute_tax_records(&mut recorded);
        let tax = self.export(&chain_trades, &records)?;

        let mut price_sources: BTreeMap<String, usize> = BTreeMap::new();
        for item in &recorded {
            *price_sources
                .entry(item.trade.price_source.as_str().to_string())
                .or_default() += 1;
        }
        let priced_count = recorded.iter().filter(|r| r.trade.is_priced()).count();

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            passes,
            trade_count: recorded.len(),
            priced_count,
            unpriced_count: recorded.len() - priced_count,
            price_sources,
            tax,
        };
        self.log_summary(&summary);
        Ok(summary)
    }

    /// One chain and address through the full trade pipeline
    async fn run_pass(
        &self,
        adapter: &dyn ChainAdapter,
        registry: &mut TokenRegistry,
        cache: &mut PriceCache,
        chain: &ChainSettings,
        address: &str,
    ) -> Result<Vec<ValuedTrade>> {
        info!("Processing {} address {}", chain.name, address);

        let activity = adapter.fetch_transactions(address).await?;
        if activity.is_empty() {
            info!("No activity for {} on {}", address, chain.name);
            return Ok(Vec::new());
        }
        registry.observe(&activity.token_metadata);

        let aggregated =
            aggregate_transfers(address, &activity.transfers, &activity.call_input_txs);

        let mut trades = Vec::new();
        for tx in &aggregated {
            let Some(swap) = adapter.classify_swap(tx) else {
                continue;
            };
            let mut trade = registry.prepare_trade(&swap);
            self.valuation.price_trade(cache, &mut trade).await;
            if is_dust_trade(&trade, &chain.native_symbol, &self.thresholds) {
                debug!("Dust trade {} dropped", trade.tx_hash);
                continue;
            }
            trades.push(trade);
        }

        info!(
            "✅ {}: {} trades from {} transactions for {}",
            chain.name,
            trades.len(),
            aggregated.len(),
            address
        );
        Ok(trades)
    }

    fn export(
        &self,
        chain_trades: &[(String, Vec<ValuedTrade>)],
        records: &[TaxRecord],
    ) -> Result<TaxSummary> {
        let output_dir = PathBuf::from(&self.config.system.output_dir);

        for (chain_name, trades) in chain_trades {
            if trades.is_empty() {
                info!("No trades for {}, skipping export", chain_name);
                continue;
            }
            let file = format!("{}{}", chain_name, self.config.report.trades_file_suffix);
            TradeStore::new(output_dir.join(file)).save(trades)?;
        }

        if records.is_empty() {
            info!("No tax records produced, skipping report export");
            return Ok(summarize(records));
        }
        let tax_store = TaxStore::new(output_dir.join(&self.config.report.tax_report_file));
        Ok(tax_store.save(records)?)
    }

    fn log_summary(&self, summary: &RunSummary) {
        info!(
            "✅ Run {} finished: {} trades ({} priced, {} unpriced), {} tax records, {}/{} passes ok",
            summary.run_id,
            summary.trade_count,
            summary.priced_count,
            summary.unpriced_count,
            summary.tax.record_count,
            summary.passes.len() - summary.failed_passes(),
            summary.passes.len(),
        );
        for (source, count) in &summary.price_sources {
            info!("  {} trades priced via {}", count, source);
        }
        for pass in summary
            .passes
            .iter()
            .filter(|p| p.status == PassStatus::Failed)
        {
            warn!(
                "⚠️ {} {} failed: {}",
                pass.chain,
                pass.address,
                pass.error.as_deref().unwrap_or("unknown")
            );
        }
    }
}

fn config_seeds(config: &SystemConfig, chain_name: &str) -> Vec<TokenSeed> {
    config
        .tokens_for_chain(chain_name)
        .into_iter()
        .map(|entry| TokenSeed {
            identifier: entry.identifier.clone(),
            symbol: entry.symbol.clone(),
            decimals: entry.decimals,
        })
        .collect()
}
