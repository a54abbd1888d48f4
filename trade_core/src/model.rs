use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Display symbol assigned to tokens whose metadata could not be resolved
pub const UNKNOWN_SYMBOL: &str = "UNKNOWN";

#[derive(Error, Debug)]
pub enum TradeError {
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Invalid trade: {0}")]
    InvalidTrade(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TradeError>;

/// Parses a raw integer amount expressed in a token's smallest unit
pub fn parse_units(value: &str) -> Result<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|e| TradeError::MalformedRecord(format!("bad amount '{}': {}", value, e)))
}

/// Parses a unix timestamp carried as a decimal string
pub fn parse_timestamp(value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|e| TradeError::MalformedRecord(format!("bad timestamp '{}': {}", value, e)))
}

/// Single asset movement observed on chain, in the chain's own terms
///
/// `token` is either the token's contract/mint/coin-type identifier or the
/// chain's native-asset sentinel. `amount` is the raw integer amount in the
/// token's smallest unit; scaling to human units happens later, once token
/// metadata is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransfer {
    /// Transaction identifier the movement belongs to
    pub tx_id: String,
    /// Sending address, lowercased where the chain is case-insensitive
    pub from: Option<String>,
    /// Receiving address
    pub to: Option<String>,
    /// Token identifier or native-asset sentinel
    pub token: String,
    /// Raw amount in smallest units, always non-negative
    pub amount: Decimal,
    /// Block height or slot the transaction landed in
    pub block_ref: u64,
    /// Unix timestamp of the enclosing block
    pub timestamp: i64,
}

impl RawTransfer {
    pub fn involves(&self, address: &str) -> bool {
        self.from.as_deref() == Some(address) || self.to.as_deref() == Some(address)
    }
}

/// All movements of one transaction folded into per-token totals
///
/// `sent` and `received` are keyed by token identifier and hold summed raw
/// amounts from the tracked address's perspective. A self transfer shows up
/// on both sides under the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedTransaction {
    pub tx_id: String,
    pub sent: BTreeMap<String, Decimal>,
    pub received: BTreeMap<String, Decimal>,
    pub block_ref: u64,
    pub timestamp: i64,
    /// True when the transaction carried non-trivial call input data
    pub raw_input_present: bool,
}

/// Two-sided swap candidate picked out of an aggregated transaction
///
/// Amounts are still raw smallest units and always come from observed
/// movements, never synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSwap {
    pub tx_id: String,
    pub block_ref: u64,
    pub timestamp: i64,
    /// Identifier of the asset leaving the tracked address
    pub token_in: String,
    /// Identifier of the asset arriving at the tracked address
    pub token_out: String,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
}

impl CandidateSwap {
    /// A usable swap has two distinct assets and positive amounts on both legs
    pub fn is_valid(&self) -> bool {
        self.token_in != self.token_out
            && self.amount_in > Decimal::ZERO
            && self.amount_out > Decimal::ZERO
    }
}

/// How a trade's USD prices were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// Both legs priced directly from the external source
    ExternalQuote,
    /// One leg quoted, the other derived from the exchange ratio
    QuoteRatio,
    /// Ratio derivation anchored by a recognized stablecoin leg
    StablecoinRatio,
    /// Priced purely by the $1.00 stablecoin assumption
    Stablecoin,
    /// No strategy produced a price
    Unavailable,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::ExternalQuote => "external_quote",
            PriceSource::QuoteRatio => "quote_ratio",
            PriceSource::StablecoinRatio => "stablecoin_ratio",
            PriceSource::Stablecoin => "stablecoin",
            PriceSource::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical normalized trade record
///
/// Token fields hold display symbols, amounts are human units scaled by each
/// token's decimals. Price fields stay `None` when valuation could not
/// resolve them; such trades are still persisted but carry no tax effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuedTrade {
    pub tx_hash: String,
    pub block_number: u64,
    pub timestamp: i64,
    pub token_in: String,
    pub token_out: String,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub source_price_usd: Option<Decimal>,
    pub target_price_usd: Option<Decimal>,
    pub price_source: PriceSource,
}

impl ValuedTrade {
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.timestamp, 0)
    }

    pub fn trade_date(&self) -> Option<NaiveDate> {
        self.datetime().map(|dt| dt.date_naive())
    }

    /// USD value of the trade, taken from whichever leg has a price
    pub fn usd_value(&self) -> Option<Decimal> {
        self.source_price_usd
            .map(|p| p * self.amount_in)
            .or_else(|| self.target_price_usd.map(|p| p * self.amount_out))
    }

    pub fn is_priced(&self) -> bool {
        self.source_price_usd.is_some()
    }
}

/// A valued trade tagged with the chain and address it was executed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedTrade {
    pub trade: ValuedTrade,
    /// Chain label, e.g. "ethereum" or "solana"
    pub platform: String,
    /// Tracked address the trade belongs to
    pub address: String,
}

/// Lifecycle of an acquisition lot inside the FIFO inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LotState {
    Open,
    PartiallyConsumed,
    Closed,
}

/// One acquisition sitting in FIFO inventory, consumed oldest-first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    /// Identifier of the acquisition event that created the lot
    pub acquisition_id: u64,
    pub asset_symbol: String,
    pub original_amount: Decimal,
    pub remaining_amount: Decimal,
    /// Cost basis covering the remaining amount
    pub remaining_cost_basis_usd: Decimal,
    pub acquired_at: DateTime<Utc>,
}

impl Lot {
    pub fn state(&self) -> LotState {
        if self.remaining_amount <= Decimal::ZERO {
            LotState::Closed
        } else if self.remaining_amount < self.original_amount {
            LotState::PartiallyConsumed
        } else {
            LotState::Open
        }
    }

    pub fn cost_per_unit(&self) -> Decimal {
        if self.remaining_amount > Decimal::ZERO {
            self.remaining_cost_basis_usd / self.remaining_amount
        } else {
            Decimal::ZERO
        }
    }
}

/// Realized gain or loss from one disposal, ready for the tax report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRecord {
    /// Identifier of the disposal event
    pub trade_id: u64,
    pub date_time: DateTime<Utc>,
    pub token_sold: String,
    pub amount_sold: Decimal,
    pub sale_proceeds_usd: Decimal,
    pub cost_basis_usd: Decimal,
    pub profit_usd: Decimal,
    /// Acquisition lots the disposal drew from, oldest first
    pub matched_acquisition_ids: Vec<u64>,
    pub platform: String,
    pub address: String,
}
