use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use tracing::debug;
use trade_core::{CandidateSwap, ChainRules, PriceSource, ValuedTrade, UNKNOWN_SYMBOL};

use crate::TokenMetadata;

/// Operator-curated token facts from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSeed {
    pub identifier: String,
    pub symbol: String,
    pub decimals: u32,
}

#[derive(Debug, Clone)]
struct TokenMeta {
    symbol: String,
    decimals: u32,
}

/// Per-chain lookup from token identifier to display symbol and decimals
///
/// Three layers feed it: the chain's native asset at construction, seeds
/// from configuration, and metadata observed on fetched transfer rows.
/// Observed metadata wins over seeds, the native entry wins over both, and
/// the first observation of an identifier sticks.
#[derive(Debug, Clone)]
pub struct TokenRegistry {
    chain_name: String,
    native_identifier: String,
    default_decimals: u32,
    entries: HashMap<String, TokenMeta>,
    observed: HashSet<String>,
}

impl TokenRegistry {
    pub fn new(
        chain_name: impl Into<String>,
        rules: &ChainRules,
        native_symbol: impl Into<String>,
        default_decimals: u32,
    ) -> Self {
        let native_identifier = rules.native_token.clone();
        let mut entries = HashMap::new();
        entries.insert(
            native_identifier.clone(),
            TokenMeta {
                symbol: native_symbol.into(),
                decimals: rules.native_decimals,
            },
        );
        Self {
            chain_name: chain_name.into(),
            native_identifier,
            default_decimals,
            entries,
            observed: HashSet::new(),
        }
    }

    /// Loads configured token entries; the native asset cannot be reseeded
    pub fn seed(&mut self, seeds: &[TokenSeed]) {
        for seed in seeds {
            if seed.identifier == self.native_identifier {
                continue;
            }
            self.entries.insert(
                seed.identifier.clone(),
                TokenMeta {
                    symbol: seed.symbol.clone(),
                    decimals: seed.decimals,
                },
            );
        }
    }

    /// Records metadata carried on fetched transfer rows
    ///
    /// The first observation of an identifier wins; later rows for the same
    /// token are ignored.
    pub fn observe(&mut self, metadata: &[TokenMetadata]) {
        for meta in metadata {
            if meta.identifier == self.native_identifier || meta.symbol.is_empty() {
                continue;
            }
            if !self.observed.insert(meta.identifier.clone()) {
                continue;
            }
            debug!(
                "Observed token {} = {} ({} decimals) on {}",
                meta.identifier, meta.symbol, meta.decimals, self.chain_name
            );
            self.entries.insert(
                meta.identifier.clone(),
                TokenMeta {
                    symbol: meta.symbol.clone(),
                    decimals: meta.decimals,
                },
            );
        }
    }

    /// Symbol and decimals for `identifier`, falling back to the coin-type
    /// tag for Move-style identifiers and to the unresolved placeholder
    /// otherwise
    pub fn resolve(&self, identifier: &str) -> (String, u32) {
        if let Some(meta) = self.entries.get(identifier) {
            return (meta.symbol.clone(), meta.decimals);
        }
        if let Some(symbol) = coin_type_symbol(identifier) {
            return (symbol, self.default_decimals);
        }
        (UNKNOWN_SYMBOL.to_string(), self.default_decimals)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Turns a classified swap into the canonical trade record, swapping
    /// identifiers for symbols and scaling raw amounts to human units
    pub fn prepare_trade(&self, swap: &CandidateSwap) -> ValuedTrade {
        let (token_in, decimals_in) = self.resolve(&swap.token_in);
        let (token_out, decimals_out) = self.resolve(&swap.token_out);
        ValuedTrade {
            tx_hash: swap.tx_id.clone(),
            block_number: swap.block_ref,
            timestamp: swap.timestamp,
            token_in,
            token_out,
            amount_in: scale_amount(swap.amount_in, decimals_in),
            amount_out: scale_amount(swap.amount_out, decimals_out),
            source_price_usd: None,
            target_price_usd: None,
            price_source: PriceSource::Unavailable,
        }
    }
}

/// Display symbol embedded in a Move coin type
///
/// `0x2::sui::SUI` resolves to `SUI`; a generic wrapper like
/// `0xa::coin::COIN<0xb::usdc::USDC>` resolves to the inner `USDC`.
pub fn coin_type_symbol(coin_type: &str) -> Option<String> {
    let parts: Vec<&str> = coin_type.split("::").collect();
    if parts.len() < 3 {
        return None;
    }
    let name = parts[parts.len() - 1].trim_end_matches('>');
    if name.is_empty() {
        return None;
    }
    Some(name.to_uppercase())
}

// Decimal supports at most 28 fractional digits
fn scale_amount(raw: Decimal, decimals: u32) -> Decimal {
    if decimals == 0 {
        return raw;
    }
    raw * Decimal::new(1, decimals.min(28))
}
