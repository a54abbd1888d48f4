use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use retry_utils::retry_with_backoff;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use trade_core::model::{parse_timestamp, parse_units, TradeError};
use trade_core::{AggregatedTransaction, CandidateSwap, ChainRules, RawTransfer};

use crate::{
    classify_retry, AdapterError, AdapterSettings, ChainAdapter, FetchedActivity, Result,
    TokenMetadata,
};

/// Zero address, the explorer's stand-in for the chain's native asset
pub const NATIVE_TOKEN: &str = "0x0000000000000000000000000000000000000000";

/// Routers of the major DEX protocols, lowercased
const DEX_ROUTERS: &[(&str, &str)] = &[
    ("0x7a250d5630b4cf539739df2c5dacb4c659f2488d", "Uniswap V2"),
    ("0x68b3465833fb72a70ecdf485e0e4c7bd8665fc45", "Uniswap V3 Router"),
    ("0xd9e1ce17f2641f24ae83637ab66a2cca9c378b9f", "SushiSwap"),
    ("0x99c9fc46f92e8a1c0dec1b1747d010903e884be1", "Curve Router"),
    ("0x1111111254fb6c44bac0bed2854e76f90643097d", "1inch V4"),
    ("0x1111111254eeb25477b68fb85ed929f73a960582", "1inch V5"),
    ("0xba12222222228d8ba445958a75a0704d566bf2c8", "Balancer V2"),
    ("0xdef1c0ded9bec7f1a1670819833240f027b25eff", "0x Protocol"),
    ("0x6131b5fae19ea4f9d964eac0408e4408b66337b5", "KyberSwap"),
    ("0xa356867fdcea8e71aeaf87805808803806231fdc", "DODO"),
    ("0xdef171fe48cf0115b1d80b88dc8eab59176fee57", "Paraswap"),
    ("0x9008d19f58aabd9ed0d60971565aa8510560ab41", "CowSwap"),
    ("0x2f9bc877dfb3c0da6d8238173d855b566e030af4", "Bancor"),
    ("0x10ed43c718714eb63d5aa57b78b54704e256024e", "PancakeSwap"),
    ("0x03f7724180aa6b939894b5ca4314783b0b36b329", "ShibaSwap"),
    ("0x5130f6ce257b8f9bf7fac0a0e519b25c120cb0b6", "Clipper"),
    ("0xe592427a0aece92de3edee1f18e0157c05861564", "Hashflow"),
    ("0x6352a56caadc4f1e25cd6c75970fa768a3304e64", "OpenOcean"),
];

/// First four bytes of the common swap entry points across routers
const SWAP_FUNCTION_SIGNATURES: &[&str] = &[
    // Uniswap V2 family
    "0x38ed1739",
    "0x8803dbee",
    "0x5c11d795",
    "0x791ac947",
    "0x02751cec",
    "0x4a25d94a",
    "0x7ff36ab5",
    "0x18cbafe5",
    "0x022c0d9f",
    // Uniswap V3 routers
    "0x414bf389",
    "0xdb3e2198",
    "0xf28c0498",
    "0x128acb08",
    "0x5ae401dc",
    "0x04e45aaf",
    "0xc04b8d59",
    // 1inch
    "0x12aa3caf",
    "0x2e95b6c8",
    "0x2521b930",
    "0xe449022e",
    "0x0502b1c5",
    // Curve
    "0x3df02124",
    "0xa6417ed6",
    // 0x / Hashflow
    "0x415565b0",
    // Balancer V2
    "0x52bbbe29",
    // Aggregator catch-alls
    "0x7c025200",
    "0x3593564c",
    "0x90411a32",
];

/// Etherscan-style explorer envelope; `result` is an array of rows on
/// success and a bare string when the API wants to complain
#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: Option<String>,
    message: Option<String>,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct NormalTxRow {
    hash: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    input: String,
    #[serde(rename = "isError", default)]
    is_error: String,
    #[serde(rename = "blockNumber", default)]
    block_number: String,
    #[serde(rename = "timeStamp", default)]
    time_stamp: String,
}

#[derive(Debug, Deserialize)]
struct TokenTxRow {
    hash: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(rename = "contractAddress", default)]
    contract_address: String,
    #[serde(default)]
    value: String,
    #[serde(rename = "tokenSymbol", default)]
    token_symbol: String,
    #[serde(rename = "tokenDecimal", default)]
    token_decimal: String,
    #[serde(rename = "blockNumber", default)]
    block_number: String,
    #[serde(rename = "timeStamp", default)]
    time_stamp: String,
}

#[derive(Debug, Deserialize)]
struct InternalTxRow {
    hash: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    value: String,
    #[serde(rename = "isError", default)]
    is_error: String,
    #[serde(rename = "blockNumber", default)]
    block_number: String,
    #[serde(rename = "timeStamp", default)]
    time_stamp: String,
}

/// Wallet history source for etherscan-compatible explorers
///
/// Fetches normal, token and internal transaction lists and flattens them
/// into one stream of transfers. Native value movements become transfers
/// under the zero-address sentinel; ERC-20 rows keep their contract address
/// and contribute observed token metadata.
pub struct EvmAdapter {
    settings: AdapterSettings,
    rules: ChainRules,
    http_client: Client,
    routers: HashMap<String, String>,
    swap_signatures: HashSet<String>,
    last_request: Mutex<Option<Instant>>,
}

impl EvmAdapter {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;
        let mut rules = ChainRules::evm(NATIVE_TOKEN);
        rules.native_decimals = settings.native_decimals;
        Ok(Self {
            settings,
            rules,
            http_client,
            routers: DEX_ROUTERS
                .iter()
                .map(|(address, name)| (address.to_string(), name.to_string()))
                .collect(),
            swap_signatures: SWAP_FUNCTION_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            last_request: Mutex::new(None),
        })
    }

    /// Registers an extra router so its swaps get labeled in logs
    pub fn add_router(&mut self, address: &str, name: &str) {
        self.routers
            .insert(address.to_lowercase(), name.to_string());
    }

    /// Registers an extra swap function selector
    pub fn add_swap_signature(&mut self, selector: &str) {
        self.swap_signatures.insert(selector.to_lowercase());
    }

    pub fn router_label(&self, address: &str) -> Option<&str> {
        self.routers
            .get(&address.to_lowercase())
            .map(|name| name.as_str())
    }

    pub fn is_swap_call(&self, input: &str) -> bool {
        input
            .get(..10)
            .map_or(false, |selector| self.swap_signatures.contains(&selector.to_lowercase()))
    }

    async fn fetch_action_rows(
        &self,
        action: &str,
        address: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let mut rows = Vec::new();
        let mut page: u64 = 1;

        loop {
            let batch = retry_with_backoff(
                || self.fetch_page(action, address, page),
                &self.settings.retry,
                classify_retry,
            )
            .await?;

            let batch_len = batch.len() as u64;
            if batch_len == 0 {
                break;
            }
            rows.extend(batch);
            if batch_len < self.settings.page_size {
                break;
            }
            page += 1;
        }

        debug!(
            "Fetched {} {} rows for {} on {}",
            rows.len(),
            action,
            address,
            self.settings.chain_name
        );
        Ok(rows)
    }

    async fn fetch_page(
        &self,
        action: &str,
        address: &str,
        page: u64,
    ) -> Result<Vec<serde_json::Value>> {
        self.pace().await;

        let mut query: Vec<(&str, String)> = vec![
            ("module", "account".to_string()),
            ("action", action.to_string()),
            ("address", address.to_string()),
            ("startblock", "0".to_string()),
            ("endblock", "99999999".to_string()),
            ("page", page.to_string()),
            ("offset", self.settings.page_size.to_string()),
            ("sort", "asc".to_string()),
        ];
        if let Some(key) = &self.settings.api_key {
            query.push(("apikey", key.clone()));
        }
        // chainid is only understood by the multi-chain v2 endpoint
        if self.settings.api_url.contains("/v2/api") {
            if let Some(chain_id) = self.settings.chain_id {
                query.push(("chainid", chain_id.to_string()));
            }
        }

        let response = self
            .http_client
            .get(&self.settings.api_url)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::RateLimit);
        }
        if !status.is_success() {
            return Err(AdapterError::Indexer {
                message: format!("HTTP {} from {}", status, self.settings.api_url),
            });
        }

        let body: ExplorerResponse = response.json().await?;
        self.interpret_response(action, body)
    }

    /// Untangles the explorer's mixed success/error envelope
    ///
    /// Rows win whenever they are present, whatever the status field says.
    /// Throttle complaints become retryable errors, known "nothing found"
    /// messages become empty pages, and everything else is logged and
    /// treated as empty, mirroring how the explorer actually behaves.
    fn interpret_response(
        &self,
        action: &str,
        body: ExplorerResponse,
    ) -> Result<Vec<serde_json::Value>> {
        let message = body.message.unwrap_or_default();

        let detail = match body.result {
            serde_json::Value::Array(rows) => {
                if !rows.is_empty() {
                    return Ok(rows);
                }
                String::new()
            }
            serde_json::Value::String(text) => text,
            _ => String::new(),
        };

        let probe = format!("{} {}", message, detail).to_lowercase();
        if probe.contains("rate limit") {
            return Err(AdapterError::RateLimit);
        }
        if probe.contains("invalid api key") {
            return Err(AdapterError::Indexer {
                message: format!("{} {}", message, detail).trim().to_string(),
            });
        }
        if probe.contains("no transactions found") || probe.contains("no records found") {
            return Ok(Vec::new());
        }
        if body.status.as_deref() == Some("0") && !probe.trim().is_empty() {
            warn!(
                "⚠️ Explorer returned no {} rows on {}: {} {}",
                action, self.settings.chain_name, message, detail
            );
        }
        Ok(Vec::new())
    }

    fn flatten_normal(&self, rows: &[serde_json::Value], activity: &mut FetchedActivity) {
        for row in rows {
            let parsed: NormalTxRow = match serde_json::from_value(row.clone()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("⚠️ Skipping malformed normal tx row: {}", e);
                    continue;
                }
            };
            if parsed.is_error == "1" {
                continue;
            }
            let hash = parsed.hash.to_lowercase();

            let router = self.router_label(&parsed.to);
            let swap_selector = self.is_swap_call(&parsed.input);
            if has_call_input(&parsed.input) || router.is_some() || swap_selector {
                activity.call_input_txs.insert(hash.clone());
            }
            if swap_selector {
                let selector = parsed.input.get(..10).unwrap_or_default();
                debug!("Swap selector {} in {}", selector, hash);
            }
            if let Some(label) = router {
                debug!("Router {} called in {}", label, hash);
            }

            match self.native_transfer(&hash, &parsed.from, &parsed.to, &parsed.value, &parsed.block_number, &parsed.time_stamp) {
                Ok(Some(transfer)) => activity.transfers.push(transfer),
                Ok(None) => {}
                Err(e) => warn!("⚠️ Skipping normal tx {}: {}", hash, e),
            }
        }
    }

    fn flatten_internal(&self, rows: &[serde_json::Value], activity: &mut FetchedActivity) {
        for row in rows {
            let parsed: InternalTxRow = match serde_json::from_value(row.clone()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("⚠️ Skipping malformed internal tx row: {}", e);
                    continue;
                }
            };
            if parsed.is_error == "1" {
                continue;
            }
            let hash = parsed.hash.to_lowercase();
            match self.native_transfer(&hash, &parsed.from, &parsed.to, &parsed.value, &parsed.block_number, &parsed.time_stamp) {
                Ok(Some(transfer)) => activity.transfers.push(transfer),
                Ok(None) => {}
                Err(e) => warn!("⚠️ Skipping internal tx {}: {}", hash, e),
            }
        }
    }

    fn flatten_token(&self, rows: &[serde_json::Value], activity: &mut FetchedActivity) {
        let mut seen_tokens = HashSet::new();

        for row in rows {
            let parsed: TokenTxRow = match serde_json::from_value(row.clone()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("⚠️ Skipping malformed token tx row: {}", e);
                    continue;
                }
            };
            let hash = parsed.hash.to_lowercase();
            let contract = parsed.contract_address.to_lowercase();
            if contract.is_empty() {
                warn!("⚠️ Skipping token tx {} without contract address", hash);
                continue;
            }

            let transfer = parse_units(&parsed.value)
                .and_then(|amount| {
                    Ok(RawTransfer {
                        tx_id: hash.clone(),
                        from: opt_address(&parsed.from),
                        to: opt_address(&parsed.to),
                        token: contract.clone(),
                        amount,
                        block_ref: parse_block(&parsed.block_number)?,
                        timestamp: parse_timestamp(&parsed.time_stamp)?,
                    })
                });
            match transfer {
                Ok(transfer) => activity.transfers.push(transfer),
                Err(e) => {
                    warn!("⚠️ Skipping token tx {}: {}", hash, e);
                    continue;
                }
            }

            // Etherscan embeds token facts on every transfer row; the first
            // sighting of a contract is kept
            if !parsed.token_symbol.is_empty() && seen_tokens.insert(contract.clone()) {
                activity.token_metadata.push(TokenMetadata {
                    identifier: contract,
                    symbol: parsed.token_symbol,
                    decimals: parsed.token_decimal.parse().unwrap_or(18),
                });
            }
        }
    }

    fn native_transfer(
        &self,
        hash: &str,
        from: &str,
        to: &str,
        value: &str,
        block_number: &str,
        time_stamp: &str,
    ) -> std::result::Result<Option<RawTransfer>, TradeError> {
        let amount = parse_units(value)?;
        if amount <= rust_decimal::Decimal::ZERO {
            return Ok(None);
        }
        Ok(Some(RawTransfer {
            tx_id: hash.to_string(),
            from: opt_address(from),
            to: opt_address(to),
            token: NATIVE_TOKEN.to_string(),
            amount,
            block_ref: parse_block(block_number)?,
            timestamp: parse_timestamp(time_stamp)?,
        }))
    }

    /// Spaces requests out so consecutive calls respect the configured delay
    async fn pace(&self) {
        let delay = Duration::from_millis(self.settings.request_delay_ms);
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

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain_name(&self) -> &str {
        &self.settings.chain_name
    }

    fn rules(&self) -> &ChainRules {
        &self.rules
    }

    fn validate_address(&self, address: &str) -> bool {
        address.starts_with("0x")
            && address.len() == 42
            && address[2..].chars().all(|c| c.is_ascii_hexdigit())
    }

    async fn fetch_transactions(&self, address: &str) -> Result<FetchedActivity> {
        if !self.validate_address(address) {
            return Err(AdapterError::InvalidAddress {
                address: address.to_string(),
            });
        }
        let address = address.to_lowercase();

        let normal = self.fetch_action_rows("txlist", &address).await?;
        let token = self.fetch_action_rows("tokentx", &address).await?;
        let internal = self.fetch_action_rows("txlistinternal", &address).await?;

        let mut activity = FetchedActivity::default();
        self.flatten_normal(&normal, &mut activity);
        self.flatten_token(&token, &mut activity);
        self.flatten_internal(&internal, &mut activity);

        info!(
            "✅ {}: {} transfers, {} call-input txs, {} observed tokens for {}",
            self.settings.chain_name,
            activity.transfers.len(),
            activity.call_input_txs.len(),
            activity.token_metadata.len(),
            address
        );
        Ok(activity)
    }

    fn classify_swap(&self, tx: &AggregatedTransaction) -> Option<CandidateSwap> {
        // The chain rules gate native legs on call input; token-only
        // movements classify without it, as with relayer-signed swaps
        trade_core::classify_swap(tx, &self.rules, &self.settings.thresholds)
    }
}

fn has_call_input(input: &str) -> bool {
    !input.is_empty() && input != "0x"
}

fn opt_address(address: &str) -> Option<String> {
    if address.is_empty() {
        None
    } else {
        Some(address.to_lowercase())
    }
}

fn parse_block(value: &str) -> std::result::Result<u64, TradeError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| TradeError::MalformedRecord(format!("bad block number '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use trade_core::aggregate_transfers;

    const WALLET: &str = "0x1111111111111111111111111111111111111111";
    const POOL: &str = "0x2222222222222222222222222222222222222222";
    const USDC: &str = "0x3333333333333333333333333333333333333333";

    fn adapter() -> EvmAdapter {
        EvmAdapter::new(AdapterSettings::default()).unwrap()
    }

    #[test]
    fn validates_wallet_addresses() {
        let adapter = adapter();
        assert!(adapter.validate_address(WALLET));
        assert!(adapter.validate_address("0x742D35CC6131B2F6E7F4C3B5E8A8C8D8F0B4C4E3"));
        assert!(!adapter.validate_address("742d35cc6131b2f6e7f4c3b5e8a8c8d8f0b4c4e3"));
        assert!(!adapter.validate_address("0x742d35cc6131b2f6e7f4c3b5e8a8c8d8f0b4c4"));
        assert!(!adapter.validate_address("0x742d35cc6131b2f6e7f4c3b5e8a8c8d8f0b4c4g3"));
    }

    #[test]
    fn normal_rows_become_native_transfers_and_call_input() {
        let adapter = adapter();
        let rows = vec![json!({
            "hash": "0xAAA1",
            "from": WALLET,
            "to": POOL,
            "value": "1000000000000000000",
            "input": "0x38ed17390000000000000000",
            "isError": "0",
            "blockNumber": "100",
            "timeStamp": "1700000000"
        })];

        let mut activity = FetchedActivity::default();
        adapter.flatten_normal(&rows, &mut activity);

        assert!(activity.call_input_txs.contains("0xaaa1"));
        assert_eq!(activity.transfers.len(), 1);
        let transfer = &activity.transfers[0];
        assert_eq!(transfer.token, NATIVE_TOKEN);
        assert_eq!(transfer.amount, dec!(1000000000000000000));
        assert_eq!(transfer.from.as_deref(), Some(WALLET));
    }

    #[test]
    fn failed_and_malformed_rows_are_dropped() {
        let adapter = adapter();
        let rows = vec![
            json!({
                "hash": "0xbad1",
                "from": WALLET,
                "to": POOL,
                "value": "5",
                "input": "0x",
                "isError": "1",
                "blockNumber": "100",
                "timeStamp": "1700000000"
            }),
            json!({
                "hash": "0xbad2",
                "from": WALLET,
                "to": POOL,
                "value": "not a number",
                "input": "0x",
                "isError": "0",
                "blockNumber": "100",
                "timeStamp": "1700000000"
            }),
            json!({
                "hash": "0xok",
                "from": POOL,
                "to": WALLET,
                "value": "7",
                "input": "0x",
                "isError": "0",
                "blockNumber": "101",
                "timeStamp": "1700000100"
            }),
        ];

        let mut activity = FetchedActivity::default();
        adapter.flatten_normal(&rows, &mut activity);

        assert_eq!(activity.transfers.len(), 1);
        assert_eq!(activity.transfers[0].tx_id, "0xok");
        assert!(activity.call_input_txs.is_empty());
    }

    #[test]
    fn token_rows_carry_metadata_once_per_contract() {
        let adapter = adapter();
        let rows = vec![
            json!({
                "hash": "0xaaa1",
                "from": WALLET,
                "to": POOL,
                "contractAddress": USDC,
                "value": "2500000000",
                "tokenSymbol": "USDC",
                "tokenDecimal": "6",
                "blockNumber": "100",
                "timeStamp": "1700000000"
            }),
            json!({
                "hash": "0xaaa2",
                "from": POOL,
                "to": WALLET,
                "contractAddress": USDC,
                "value": "100",
                "tokenSymbol": "FAKE",
                "tokenDecimal": "18",
                "blockNumber": "101",
                "timeStamp": "1700000100"
            }),
        ];

        let mut activity = FetchedActivity::default();
        adapter.flatten_token(&rows, &mut activity);

        assert_eq!(activity.transfers.len(), 2);
        assert_eq!(activity.token_metadata.len(), 1);
        assert_eq!(activity.token_metadata[0].symbol, "USDC");
        assert_eq!(activity.token_metadata[0].decimals, 6);
    }

    #[test]
    fn flattened_swap_classifies_end_to_end() {
        let adapter = adapter();
        let normal = vec![json!({
            "hash": "0xswap",
            "from": WALLET,
            "to": POOL,
            "value": "1000000000000000000",
            "input": "0x7ff36ab50000000000000000",
            "isError": "0",
            "blockNumber": "100",
            "timeStamp": "1700000000"
        })];
        let token = vec![json!({
            "hash": "0xswap",
            "from": POOL,
            "to": WALLET,
            "contractAddress": USDC,
            "value": "2500000000",
            "tokenSymbol": "USDC",
            "tokenDecimal": "6",
            "blockNumber": "100",
            "timeStamp": "1700000000"
        })];

        let mut activity = FetchedActivity::default();
        adapter.flatten_normal(&normal, &mut activity);
        adapter.flatten_token(&token, &mut activity);

        let aggregated = aggregate_transfers(WALLET, &activity.transfers, &activity.call_input_txs);
        assert_eq!(aggregated.len(), 1);

        let swap = adapter.classify_swap(&aggregated[0]).unwrap();
        assert_eq!(swap.token_in, NATIVE_TOKEN);
        assert_eq!(swap.token_out, USDC);
        assert_eq!(swap.amount_in, dec!(1000000000000000000));
        assert_eq!(swap.amount_out, dec!(2500000000));
    }

    #[test]
    fn relayer_token_swaps_classify_without_call_input() {
        let adapter = adapter();
        let transfers = vec![
            RawTransfer {
                tx_id: "0xswap".to_string(),
                from: Some(WALLET.to_string()),
                to: Some(POOL.to_string()),
                token: USDC.to_string(),
                amount: dec!(2500000000),
                block_ref: 100,
                timestamp: 1_700_000_000,
            },
            RawTransfer {
                tx_id: "0xswap".to_string(),
                from: Some(POOL.to_string()),
                to: Some(WALLET.to_string()),
                token: "0x4444444444444444444444444444444444444444".to_string(),
                amount: dec!(900),
                block_ref: 100,
                timestamp: 1_700_000_000,
            },
        ];

        let aggregated = aggregate_transfers(WALLET, &transfers, &HashSet::new());
        let swap = adapter.classify_swap(&aggregated[0]).unwrap();
        assert_eq!(swap.token_in, USDC);
        assert_eq!(swap.token_out, "0x4444444444444444444444444444444444444444");
        assert_eq!(swap.amount_in, dec!(2500000000));
        assert_eq!(swap.amount_out, dec!(900));
    }

    #[test]
    fn native_legs_still_require_call_input() {
        let adapter = adapter();
        let transfers = vec![
            RawTransfer {
                tx_id: "0xswap".to_string(),
                from: Some(WALLET.to_string()),
                to: Some(POOL.to_string()),
                token: NATIVE_TOKEN.to_string(),
                amount: dec!(1000000000000000000),
                block_ref: 100,
                timestamp: 1_700_000_000,
            },
            RawTransfer {
                tx_id: "0xswap".to_string(),
                from: Some(POOL.to_string()),
                to: Some(WALLET.to_string()),
                token: USDC.to_string(),
                amount: dec!(2500000000),
                block_ref: 100,
                timestamp: 1_700_000_000,
            },
        ];

        let silent = aggregate_transfers(WALLET, &transfers, &HashSet::new());
        assert!(adapter.classify_swap(&silent[0]).is_none());

        let called = HashSet::from(["0xswap".to_string()]);
        let aggregated = aggregate_transfers(WALLET, &transfers, &called);
        assert!(adapter.classify_swap(&aggregated[0]).is_some());
    }

    #[test]
    fn router_and_selector_hints_mark_call_input() {
        let adapter = adapter();
        let rows = vec![
            json!({
                "hash": "0xdep1",
                "from": WALLET,
                "to": POOL,
                "value": "0",
                "input": "0xd0e30db0",
                "isError": "0",
                "blockNumber": "100",
                "timeStamp": "1700000000"
            }),
            json!({
                "hash": "0xrt01",
                "from": WALLET,
                "to": "0x7a250d5630b4cf539739df2c5dacb4c659f2488d",
                "value": "0",
                "input": "0x",
                "isError": "0",
                "blockNumber": "101",
                "timeStamp": "1700000100"
            }),
        ];

        let mut activity = FetchedActivity::default();
        adapter.flatten_normal(&rows, &mut activity);

        assert!(activity.call_input_txs.contains("0xdep1"));
        assert!(activity.call_input_txs.contains("0xrt01"));
    }

    #[test]
    fn rate_limit_and_error_envelopes_are_interpreted() {
        let adapter = adapter();

        let throttled = ExplorerResponse {
            status: Some("0".to_string()),
            message: Some("NOTOK".to_string()),
            result: serde_json::Value::String("Max rate limit reached".to_string()),
        };
        assert!(matches!(
            adapter.interpret_response("txlist", throttled),
            Err(AdapterError::RateLimit)
        ));

        let empty = ExplorerResponse {
            status: Some("0".to_string()),
            message: Some("No transactions found".to_string()),
            result: json!([]),
        };
        assert!(adapter
            .interpret_response("txlist", empty)
            .unwrap()
            .is_empty());

        let bad_key = ExplorerResponse {
            status: Some("0".to_string()),
            message: Some("NOTOK".to_string()),
            result: serde_json::Value::String("Invalid API Key".to_string()),
        };
        assert!(matches!(
            adapter.interpret_response("txlist", bad_key),
            Err(AdapterError::Indexer { .. })
        ));

        let rows = ExplorerResponse {
            status: Some("1".to_string()),
            message: Some("OK".to_string()),
            result: json!([{"hash": "0xaaa"}]),
        };
        assert_eq!(adapter.interpret_response("txlist", rows).unwrap().len(), 1);
    }

    #[test]
    fn router_and_selector_tables_are_extensible() {
        let mut adapter = adapter();
        assert_eq!(
            adapter.router_label("0x7A250d5630B4cF539739dF2C5dAcb4c659F2488D"),
            Some("Uniswap V2")
        );
        assert!(adapter.is_swap_call("0x38ed17390000"));
        assert!(!adapter.is_swap_call("0xdeadbeef0000"));

        adapter.add_router("0xABCDEF0000000000000000000000000000000000", "TestDex");
        adapter.add_swap_signature("0xAABBCCDD");
        assert_eq!(
            adapter.router_label("0xabcdef0000000000000000000000000000000000"),
            Some("TestDex")
        );
        assert!(adapter.is_swap_call("0xaabbccdd99"));
    }
}
