use chrono::NaiveDateTime;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use trade_core::{PriceCache, PriceSource, TaxRecord, ValuedTrade};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Malformed row in {file}: {reason}")]
    MalformedRow { file: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Durable price cache, a flat JSON object of `SYMBOL_YYYY-MM-DD` to price
///
/// Prices are stored as JSON numbers for interoperability and converted to
/// `Decimal` on load. The whole file is rewritten on save; entries for keys
/// that failed conversion are dropped with a warning rather than aborting
/// the run.
#[derive(Debug, Clone)]
pub struct PriceCacheStore {
    path: PathBuf,
}

impl PriceCacheStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<PriceCache> {
        if !self.path.exists() {
            info!("No price cache at {}, starting empty", self.path.display());
            return Ok(PriceCache::new());
        }

        let raw = fs::read_to_string(&self.path)?;
        let numeric: HashMap<String, f64> = serde_json::from_str(&raw)?;

        let mut entries = HashMap::with_capacity(numeric.len());
        for (key, value) in numeric {
            match Decimal::from_f64(value) {
                Some(price) => {
                    entries.insert(key, price);
                }
                None => warn!("⚠️ Dropping unrepresentable cached price {}={}", key, value),
            }
        }

        info!(
            "Loaded {} cached prices from {}",
            entries.len(),
            self.path.display()
        );
        Ok(PriceCache::from_entries(entries))
    }

    pub fn save(&self, cache: &PriceCache) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut numeric: HashMap<&String, f64> = HashMap::with_capacity(cache.len());
        for (key, price) in cache.entries() {
            match price.to_f64() {
                Some(value) => {
                    numeric.insert(key, value);
                }
                None => warn!("⚠️ Dropping unwritable cached price {}={}", key, price),
            }
        }

        let body = serde_json::to_string_pretty(&numeric)?;
        fs::write(&self.path, body)?;
        debug!(
            "Saved {} cached prices to {}",
            numeric.len(),
            self.path.display()
        );
        Ok(())
    }
}

const TRADE_HEADER: [&str; 10] = [
    "tx_hash",
    "block_number",
    "timestamp",
    "token_in",
    "token_out",
    "amount_in",
    "amount_out",
    "source_price_usd",
    "target_price_usd",
    "price_source",
];

/// Per-chain trade file, one tab-separated row per normalized trade
#[derive(Debug, Clone)]
pub struct TradeStore {
    path: PathBuf,
}

impl TradeStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, trades: &[ValuedTrade]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&self.path)?;

        writer.write_record(TRADE_HEADER)?;
        for trade in trades {
            writer.write_record(&[
                trade.tx_hash.clone(),
                trade.block_number.to_string(),
                trade.timestamp.to_string(),
                trade.token_in.clone(),
                trade.token_out.clone(),
                trade.amount_in.to_string(),
                trade.amount_out.to_string(),
                trade
                    .source_price_usd
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                trade
                    .target_price_usd
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                trade.price_source.to_string(),
            ])?;
        }
        writer.flush()?;

        info!("Saved {} trades to {}", trades.len(), self.path.display());
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<ValuedTrade>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(&self.path)?;

        let mut trades = Vec::new();
        for record in reader.records() {
            let record = record?;
            trades.push(self.parse_row(&record)?);
        }

        debug!("Loaded {} trades from {}", trades.len(), self.path.display());
        Ok(trades)
    }

    fn parse_row(&self, record: &csv::StringRecord) -> Result<ValuedTrade> {
        let field = |idx: usize| -> Result<&str> {
            record.get(idx).ok_or_else(|| PersistenceError::MalformedRow {
                file: self.path.display().to_string(),
                reason: format!("missing column {}", TRADE_HEADER[idx]),
            })
        };
        let malformed = |reason: String| PersistenceError::MalformedRow {
            file: self.path.display().to_string(),
            reason,
        };

        let parse_decimal = |idx: usize| -> Result<Decimal> {
            let raw = field(idx)?;
            raw.parse::<Decimal>()
                .map_err(|e| malformed(format!("bad {} '{}': {}", TRADE_HEADER[idx], raw, e)))
        };
        let parse_optional = |idx: usize| -> Result<Option<Decimal>> {
            let raw = field(idx)?;
            if raw.is_empty() {
                return Ok(None);
            }
            raw.parse::<Decimal>()
                .map(Some)
                .map_err(|e| malformed(format!("bad {} '{}': {}", TRADE_HEADER[idx], raw, e)))
        };

        let price_source = match field(9)? {
            "external_quote" => PriceSource::ExternalQuote,
            "quote_ratio" => PriceSource::QuoteRatio,
            "stablecoin_ratio" => PriceSource::StablecoinRatio,
            "stablecoin" => PriceSource::Stablecoin,
            "unavailable" => PriceSource::Unavailable,
            other => return Err(malformed(format!("unknown price_source '{}'", other))),
        };

        Ok(ValuedTrade {
            tx_hash: field(0)?.to_string(),
            block_number: field(1)?
                .parse()
                .map_err(|e| malformed(format!("bad block_number: {}", e)))?,
            timestamp: field(2)?
                .parse()
                .map_err(|e| malformed(format!("bad timestamp: {}", e)))?,
            token_in: field(3)?.to_string(),
            token_out: field(4)?.to_string(),
            amount_in: parse_decimal(5)?,
            amount_out: parse_decimal(6)?,
            source_price_usd: parse_optional(7)?,
            target_price_usd: parse_optional(8)?,
            price_source,
        })
    }
}

const TAX_HEADER: [&str; 10] = [
    "trade_id",
    "date_time",
    "token_sold",
    "amount_sold",
    "sale_proceeds_usd",
    "cost_basis_usd",
    "profit_usd",
    "buy_tx_ids",
    "platform",
    "address",
];

/// Totals printed alongside the tax report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxSummary {
    pub record_count: usize,
    pub total_proceeds_usd: Decimal,
    pub total_cost_basis_usd: Decimal,
    pub total_profit_usd: Decimal,
}

pub fn summarize(records: &[TaxRecord]) -> TaxSummary {
    TaxSummary {
        record_count: records.len(),
        total_proceeds_usd: records.iter().map(|r| r.sale_proceeds_usd).sum(),
        total_cost_basis_usd: records.iter().map(|r| r.cost_basis_usd).sum(),
        total_profit_usd: records.iter().map(|r| r.profit_usd).sum(),
    }
}

/// Tax report file, tab-separated and sorted most recent sale first
#[derive(Debug, Clone)]
pub struct TaxStore {
    path: PathBuf,
}

impl TaxStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, records: &[TaxRecord]) -> Result<TaxSummary> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut ordered: Vec<&TaxRecord> = records.iter().collect();
        ordered.sort_by(|a, b| b.date_time.cmp(&a.date_time));

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(&self.path)?;

        writer.write_record(TAX_HEADER)?;
        for record in ordered {
            let ids = record
                .matched_acquisition_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");

            writer.write_record(&[
                record.trade_id.to_string(),
                record.date_time.format("%Y/%m/%d %H:%M:%S").to_string(),
                record.token_sold.clone(),
                format!("{:.8}", record.amount_sold),
                format!("{:.2}", record.sale_proceeds_usd),
                format!("{:.2}", record.cost_basis_usd),
                format!("{:.2}", record.profit_usd),
                ids,
                record.platform.clone(),
                record.address.clone(),
            ])?;
        }
        writer.flush()?;

        let summary = summarize(records);
        info!(
            "✅ Exported {} tax records to {}",
            summary.record_count,
            self.path.display()
        );
        Ok(summary)
    }

    /// Reads sale timestamps back, newest first, for report verification
    pub fn load_sale_dates(&self) -> Result<Vec<NaiveDateTime>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(&self.path)?;

        let mut dates = Vec::new();
        for record in reader.records() {
            let record = record?;
            let raw = record.get(1).ok_or_else(|| PersistenceError::MalformedRow {
                file: self.path.display().to_string(),
                reason: "missing date_time column".to_string(),
            })?;
            let parsed = NaiveDateTime::parse_from_str(raw, "%Y/%m/%d %H:%M:%S").map_err(|e| {
                PersistenceError::MalformedRow {
                    file: self.path.display().to_string(),
                    reason: format!("bad date_time '{}': {}", raw, e),
                }
            })?;
            dates.push(parsed);
        }
        Ok(dates)
    }
}
