pub mod evm;
pub mod registry;
mod rpc;
pub mod solana;
pub mod sui;

pub use evm::EvmAdapter;
pub use registry::{TokenRegistry, TokenSeed};
pub use solana::SolanaAdapter;
pub use sui::SuiAdapter;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use retry_utils::{RetryKind, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trade_core::{AggregatedTransaction, CandidateSwap, ChainRules, ClassifierThresholds, RawTransfer};

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Indexer error: {message}")]
    Indexer { message: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Invalid wallet address: {address}")]
    InvalidAddress { address: String },

    #[error("Unsupported chain kind: {kind}")]
    UnsupportedChain { kind: String },
}

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Chain families the pipeline can ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Evm,
    Solana,
    Sui,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Evm => "evm",
            ChainKind::Solana => "solana",
            ChainKind::Sui => "sui",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "evm" => Ok(ChainKind::Evm),
            "solana" => Ok(ChainKind::Solana),
            "sui" => Ok(ChainKind::Sui),
            other => Err(AdapterError::UnsupportedChain {
                kind: other.to_string(),
            }),
        }
    }

    /// Decimals assumed for tokens the registry has never seen on this family
    pub fn default_decimals(&self) -> u32 {
        match self {
            ChainKind::Evm => 18,
            ChainKind::Solana | ChainKind::Sui => 9,
        }
    }
}

/// Everything an adapter needs to talk to one chain's data source
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub chain_name: String,
    pub kind: ChainKind,
    pub api_url: String,
    pub api_key: Option<String>,
    /// Explorer network id, only meaningful for multi-chain EVM endpoints
    pub chain_id: Option<u64>,
    pub native_decimals: u32,
    pub page_size: u64,
    pub request_delay_ms: u64,
    pub timeout_seconds: u64,
    pub retry: RetryPolicy,
    pub thresholds: ClassifierThresholds,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            chain_name: "ethereum".to_string(),
            kind: ChainKind::Evm,
            api_url: "https://api.etherscan.io/v2/api".to_string(),
            api_key: None,
            chain_id: Some(1),
            native_decimals: 18,
            page_size: 10_000,
            request_delay_ms: 250,
            timeout_seconds: 30,
            retry: RetryPolicy::default(),
            thresholds: ClassifierThresholds::default(),
        }
    }
}

/// Token facts carried alongside transfer rows by explorers that embed them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMetadata {
    pub identifier: String,
    pub symbol: String,
    pub decimals: u32,
}

/// One wallet's complete on-chain history, flattened for aggregation
#[derive(Debug, Clone, Default)]
pub struct FetchedActivity {
    pub transfers: Vec<RawTransfer>,
    /// Transactions that carried call input or matched a router or swap
    /// signature, per the chain's own notion of those signals
    pub call_input_txs: HashSet<String>,
    pub token_metadata: Vec<TokenMetadata>,
}

impl FetchedActivity {
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// One blockchain's ingestion surface
///
/// Implementations own the wire format of their data source and hand the
/// rest of the pipeline plain transfers plus the per-transaction facts the
/// classifier needs.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Configured chain name, e.g. "ethereum" or "solana"
    fn chain_name(&self) -> &str;

    /// Classification rules for this chain
    fn rules(&self) -> &ChainRules;

    /// Whether `address` is well formed for this chain
    fn validate_address(&self, address: &str) -> bool;

    /// Pull the full transfer history for one wallet
    async fn fetch_transactions(&self, address: &str) -> Result<FetchedActivity>;

    /// Decide whether an aggregated transaction is a swap on this chain
    fn classify_swap(&self, tx: &AggregatedTransaction) -> Option<CandidateSwap>;
}

/// Builds the adapter matching the configured chain kind
pub fn create_adapter(settings: AdapterSettings) -> Result<Arc<dyn ChainAdapter>> {
    let adapter: Arc<dyn ChainAdapter> = match settings.kind {
        ChainKind::Evm => Arc::new(EvmAdapter::new(settings)?),
        ChainKind::Solana => Arc::new(SolanaAdapter::new(settings)?),
        ChainKind::Sui => Arc::new(SuiAdapter::new(settings)?),
    };
    Ok(adapter)
}

pub(crate) fn classify_retry(error: &AdapterError) -> RetryKind {
    match error {
        AdapterError::RateLimit => RetryKind::RateLimit,
        AdapterError::Http(_) => RetryKind::Transient,
        _ => RetryKind::Fatal,
    }
}
