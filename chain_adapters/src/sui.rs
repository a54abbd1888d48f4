use async_trait::async_trait;
use retry_utils::retry_with_backoff;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};
use trade_core::{AggregatedTransaction, CandidateSwap, ChainRules, RawTransfer};

use crate::rpc::JsonRpcClient;
use crate::{
    classify_retry, AdapterError, AdapterSettings, ChainAdapter, FetchedActivity, Result,
};

/// Canonical SUI coin type, stored lowercase like every other coin type
pub const NATIVE_COIN_TYPE: &str = "0x2::sui::sui";

const SUI_DECIMALS: u32 = 9;
const QUERY_PAGE_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionPage {
    #[serde(default)]
    data: Vec<TransactionBlock>,
    next_cursor: Option<String>,
    #[serde(default)]
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionBlock {
    digest: String,
    // Fullnodes return these as decimal strings, older releases as numbers
    timestamp_ms: Option<serde_json::Value>,
    checkpoint: Option<serde_json::Value>,
    #[serde(default)]
    balance_changes: Vec<BalanceChange>,
    effects: Option<TransactionEffects>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceChange {
    // Either {"AddressOwner": "0x.."} or a bare string for legacy owners
    #[serde(default)]
    owner: serde_json::Value,
    #[serde(default)]
    coin_type: String,
    #[serde(default)]
    amount: String,
}

#[derive(Debug, Deserialize)]
struct TransactionEffects {
    status: Option<EffectsStatus>,
}

#[derive(Debug, Deserialize)]
struct EffectsStatus {
    status: Option<String>,
}

impl TransactionBlock {
    fn timestamp_secs(&self) -> i64 {
        self.timestamp_ms
            .as_ref()
            .and_then(json_number)
            .map(|ms| ms / 1000)
            .unwrap_or(0)
    }

    fn checkpoint_number(&self) -> u64 {
        self.checkpoint
            .as_ref()
            .and_then(json_number)
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0)
    }

    fn succeeded(&self) -> bool {
        match self.effects.as_ref().and_then(|e| e.status.as_ref()) {
            Some(status) => status.status.as_deref() == Some("success"),
            None => true,
        }
    }
}

/// Wallet history source for Sui fullnode JSON-RPC
///
/// Sui reports per-transaction balance changes directly, so transfers come
/// straight from `balanceChanges` entries owned by the tracked address. Gas
/// is already folded into the SUI change, which keeps the native leg of a
/// swap intact without summing object mutations.
pub struct SuiAdapter {
    settings: AdapterSettings,
    rules: ChainRules,
    rpc: JsonRpcClient,
}

impl SuiAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let rpc = JsonRpcClient::new(&settings)?;
        Ok(Self {
            settings,
            rules: ChainRules::account_model(NATIVE_COIN_TYPE, SUI_DECIMALS),
            rpc,
        })
    }

    async fn fetch_page(&self, address: &str, cursor: Option<&str>) -> Result<TransactionPage> {
        let query = serde_json::json!({
            "filter": { "FromAddress": address },
            "options": { "showBalanceChanges": true, "showEffects": true }
        });
        let params = serde_json::json!([query, cursor, QUERY_PAGE_LIMIT, false]);

        let page: Option<TransactionPage> = retry_with_backoff(
            || self.rpc.call("suix_queryTransactionBlocks", params.clone()),
            &self.settings.retry,
            classify_retry,
        )
        .await?;
        page.ok_or_else(|| AdapterError::Indexer {
            message: "suix_queryTransactionBlocks returned no result".to_string(),
        })
    }

    fn extract_transfers(&self, tracked: &str, tx: &TransactionBlock) -> Vec<RawTransfer> {
        let mut transfers = Vec::new();
        if !tx.succeeded() {
            debug!("Transaction {} failed on chain, balance changes kept", tx.digest);
        }
        let timestamp = tx.timestamp_secs();
        let block_ref = tx.checkpoint_number();

        for change in &tx.balance_changes {
            let owner = owner_address(&change.owner).to_lowercase();
            if owner != tracked || change.coin_type.is_empty() {
                continue;
            }
            let amount = match trade_core::parse_units(&change.amount) {
                Ok(value) => value,
                Err(e) => {
                    warn!("⚠️ Skipping balance change in {}: {}", tx.digest, e);
                    continue;
                }
            };
            if amount.is_zero() {
                continue;
            }
            transfers.push(RawTransfer {
                tx_id: tx.digest.clone(),
                from: (amount < Decimal::ZERO).then(|| owner.clone()),
                to: (amount > Decimal::ZERO).then(|| owner.clone()),
                token: change.coin_type.trim().to_lowercase(),
                amount: amount.abs(),
                block_ref,
                timestamp,
            });
        }

        transfers
    }
}

#[async_trait]
impl ChainAdapter for SuiAdapter {
    fn chain_name(&self) -> &str {
        &self.settings.chain_name
    }

    fn rules(&self) -> &ChainRules {
        &self.rules
    }

    /// 0x prefix followed by 64 hex characters
    fn validate_address(&self, address: &str) -> bool {
        address.starts_with("0x")
            && address.len() == 66
            && address[2..].chars().all(|c| c.is_ascii_hexdigit())
    }

    async fn fetch_transactions(&self, address: &str) -> Result<FetchedActivity> {
        if !self.validate_address(address) {
            return Err(AdapterError::InvalidAddress {
                address: address.to_string(),
            });
        }
        let tracked = address.to_lowercase();

        let mut activity = FetchedActivity::default();
        let mut cursor: Option<String> = None;
        let mut transactions = 0usize;
        loop {
            let page = self.fetch_page(&tracked, cursor.as_deref()).await?;
            transactions += page.data.len();
            for tx in &page.data {
                activity
                    .transfers
                    .extend(self.extract_transfers(&tracked, tx));
            }
            if !page.has_next_page || page.data.is_empty() {
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(
            "✅ {}: {} transfers from {} transactions for {}",
            self.settings.chain_name,
            activity.transfers.len(),
            transactions,
            address
        );
        Ok(activity)
    }

    fn classify_swap(&self, tx: &AggregatedTransaction) -> Option<CandidateSwap> {
        trade_core::classify_swap(tx, &self.rules, &self.settings.thresholds)
    }
}

fn owner_address(owner: &serde_json::Value) -> String {
    match owner {
        serde_json::Value::Object(map) => map
            .get("AddressOwner")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn json_number(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
