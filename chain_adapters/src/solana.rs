use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use retry_utils::retry_with_backoff;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};
use trade_core::{AggregatedTransaction, CandidateSwap, ChainRules, RawTransfer};

use crate::rpc::JsonRpcClient;
use crate::{
    classify_retry, AdapterError, AdapterSettings, ChainAdapter, FetchedActivity, Result,
};

/// Wrapped SOL mint, used as the native-asset identifier
pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";

const SOL_DECIMALS: u32 = 9;
const SIGNATURE_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
struct SignatureEntry {
    signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionEnvelope {
    slot: u64,
    block_time: Option<i64>,
    meta: Option<TransactionMeta>,
    transaction: Option<TransactionBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMeta {
    err: Option<serde_json::Value>,
    #[serde(default)]
    pre_token_balances: Vec<TokenBalanceEntry>,
    #[serde(default)]
    post_token_balances: Vec<TokenBalanceEntry>,
    #[serde(default)]
    pre_balances: Vec<u64>,
    #[serde(default)]
    post_balances: Vec<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBalanceEntry {
    owner: Option<String>,
    #[serde(default)]
    mint: String,
    ui_token_amount: UiTokenAmount,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UiTokenAmount {
    ui_amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    message: TransactionMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMessage {
    #[serde(default)]
    account_keys: Vec<AccountKey>,
}

#[derive(Debug, Deserialize)]
struct AccountKey {
    pubkey: String,
}

/// Wallet history source for Solana JSON-RPC nodes
///
/// Transfers are reconstructed from pre/post balance snapshots rather than
/// instruction parsing: every (owner, mint) balance difference becomes one
/// transfer, and lamport differences per account key become transfers under
/// the wrapped SOL mint. All amounts are expressed in 10^-9 units so SPL
/// and native legs stay comparable.
pub struct SolanaAdapter {
    settings: AdapterSettings,
    rules: ChainRules,
    rpc: JsonRpcClient,
}

impl SolanaAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let rpc = JsonRpcClient::new(&settings)?;
        Ok(Self {
            settings,
            rules: ChainRules::account_model(NATIVE_MINT, SOL_DECIMALS),
            rpc,
        })
    }

    async fn fetch_signatures(&self, address: &str) -> Result<Vec<String>> {
        let mut signatures = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = serde_json::json!([address, { "limit": SIGNATURE_PAGE_LIMIT }]);
            if let Some(before) = &cursor {
                params[1]["before"] = serde_json::Value::String(before.clone());
            }

            let entries: Vec<SignatureEntry> = retry_with_backoff(
                || self.rpc.call("getSignaturesForAddress", params.clone()),
                &self.settings.retry,
                classify_retry,
            )
            .await?
            .unwrap_or_default();

            let batch_len = entries.len();
            signatures.extend(entries.into_iter().map(|entry| entry.signature));
            if batch_len < SIGNATURE_PAGE_LIMIT {
                break;
            }
            cursor = signatures.last().cloned();
        }

        Ok(signatures)
    }

    async fn fetch_transaction(&self, signature: &str) -> Result<Option<TransactionEnvelope>> {
        let params = serde_json::json!([
            signature,
            { "encoding": "jsonParsed", "maxSupportedTransactionVersion": 0 }
        ]);
        retry_with_backoff(
            || self.rpc.call("getTransaction", params.clone()),
            &self.settings.retry,
            classify_retry,
        )
        .await
    }

    fn extract_transfers(&self, signature: &str, tx: &TransactionEnvelope) -> Vec<RawTransfer> {
        let mut transfers = Vec::new();
        let Some(meta) = &tx.meta else {
            return transfers;
        };
        if meta.err.is_some() {
            debug!("Transaction {} failed on chain, keeping fee traffic only", signature);
        }
        let timestamp = tx.block_time.unwrap_or(0);

        let pre = token_balance_map(&meta.pre_token_balances);
        let post = token_balance_map(&meta.post_token_balances);
        let holders: BTreeSet<&(String, String)> = pre.keys().chain(post.keys()).collect();

        for key in holders {
            let before = pre.get(key).copied().unwrap_or_default();
            let after = post.get(key).copied().unwrap_or_default();
            let diff = after - before;
            if diff.is_zero() {
                continue;
            }
            let (owner, mint) = key;
            transfers.push(RawTransfer {
                tx_id: signature.to_string(),
                from: (diff < Decimal::ZERO).then(|| owner.clone()),
                to: (diff > Decimal::ZERO).then(|| owner.clone()),
                token: mint.clone(),
                amount: diff.abs(),
                block_ref: tx.slot,
                timestamp,
            });
        }

        if let Some(body) = &tx.transaction {
            for (index, key) in body.message.account_keys.iter().enumerate() {
                let (Some(before), Some(after)) =
                    (meta.pre_balances.get(index), meta.post_balances.get(index))
                else {
                    continue;
                };
                let diff = *after as i64 - *before as i64;
                if diff == 0 {
                    continue;
                }
                transfers.push(RawTransfer {
                    tx_id: signature.to_string(),
                    from: (diff < 0).then(|| key.pubkey.clone()),
                    to: (diff > 0).then(|| key.pubkey.clone()),
                    token: NATIVE_MINT.to_string(),
                    amount: Decimal::from(diff.abs()),
                    block_ref: tx.slot,
                    timestamp,
                });
            }
        }

        transfers
    }
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    fn chain_name(&self) -> &str {
        &self.settings.chain_name
    }

    fn rules(&self) -> &ChainRules {
        &self.rules
    }

    /// Base58 text between 32 and 44 characters; the alphabet has no
    /// `0`, `O`, `I` or `l`
    fn validate_address(&self, address: &str) -> bool {
        (32..=44).contains(&address.len())
            && address
                .chars()
                .all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'))
    }

    async fn fetch_transactions(&self, address: &str) -> Result<FetchedActivity> {
        if !self.validate_address(address) {
            return Err(AdapterError::InvalidAddress {
                address: address.to_string(),
            });
        }

        let signatures = self.fetch_signatures(address).await?;
        info!(
            "Found {} signatures for {} on {}",
            signatures.len(),
            address,
            self.settings.chain_name
        );

        let mut activity = FetchedActivity::default();
        let mut failures = 0usize;
        for signature in &signatures {
            match self.fetch_transaction(signature).await {
                Ok(Some(tx)) => {
                    activity
                        .transfers
                        .extend(self.extract_transfers(signature, &tx));
                }
                Ok(None) => debug!("Transaction {} not found", signature),
                Err(e) => {
                    warn!("⚠️ Skipping signature {}: {}", signature, e);
                    failures += 1;
                }
            }
        }

        info!(
            "✅ {}: {} transfers from {} transactions ({} failed) for {}",
            self.settings.chain_name,
            activity.transfers.len(),
            signatures.len(),
            failures,
            address
        );
        Ok(activity)
    }

    fn classify_swap(&self, tx: &AggregatedTransaction) -> Option<CandidateSwap> {
        trade_core::classify_swap(tx, &self.rules, &self.settings.thresholds)
    }
}

fn token_balance_map(balances: &[TokenBalanceEntry]) -> HashMap<(String, String), Decimal> {
    let mut map = HashMap::new();
    for balance in balances {
        let Some(owner) = &balance.owner else {
            continue;
        };
        if balance.mint.is_empty() {
            continue;
        }
        map.insert(
            (owner.clone(), balance.mint.clone()),
            lamport_scale(balance.ui_token_amount.ui_amount),
        );
    }
    map
}

// Human token amounts are rescaled to 10^-9 units so every leg of a
// transaction, native SOL included, shares one scale
fn lamport_scale(ui_amount: Option<f64>) -> Decimal {
    let amount = ui_amount.and_then(Decimal::from_f64).unwrap_or_default();
    (amount * Decimal::from(1_000_000_000_u64)).trunc()
}
