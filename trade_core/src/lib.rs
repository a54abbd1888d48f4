pub mod aggregate;
pub mod classify;
pub mod fifo;
pub mod model;
pub mod valuation;

// Re-export the pipeline surface so downstream crates import one path
pub use aggregate::aggregate_transfers;
pub use classify::{classify_swap, is_dust_trade, ChainRules, ClassifierThresholds};
pub use fifo::{DisposalMatch, FifoLedger, TaxCalculator};
pub use model::{
    parse_timestamp, parse_units, AggregatedTransaction, CandidateSwap, Lot, LotState,
    PriceSource, RawTransfer, RecordedTrade, Result, TaxRecord, TradeError, ValuedTrade,
    UNKNOWN_SYMBOL,
};
pub use valuation::{
    PriceCache, QuoteError, QuoteSource, StablecoinRegistry, Valuation, ValuationEngine,
};
