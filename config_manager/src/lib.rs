use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Configuration loading error: {0}")]
    ConfigLoad(#[from] ConfigError),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, ConfigurationError>;

/// Top-level configuration for the tax tracking system
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemConfig {
    #[serde(default)]
    pub system: SystemSettings,

    /// Chains to scan, one entry per network
    #[serde(default)]
    pub chains: Vec<ChainSettings>,

    #[serde(default)]
    pub price_source: PriceSourceConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Known token metadata, keyed by chain name and on-chain identifier
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,

    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Directory all reports and caches are written under
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Default log filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            log_level: default_log_level(),
        }
    }
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One chain to fetch activity from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSettings {
    /// Chain label used in file names and report rows, e.g. "ethereum"
    pub name: String,

    /// Adapter family: "evm", "solana" or "sui"
    pub kind: String,

    /// Disabled chains stay in the file but are skipped by batch runs
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Indexer API base URL
    pub api_url: String,

    /// API key for the indexer
    #[serde(default)]
    pub api_key: String,

    /// Wallet addresses to track on this chain
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Display symbol of the chain's native asset
    pub native_symbol: String,

    /// Decimals of the native asset's raw unit
    #[serde(default = "default_native_decimals")]
    pub native_decimals: u32,

    /// Numeric chain id, required by multichain EVM endpoints
    #[serde(default)]
    pub chain_id: Option<u64>,

    /// Records per page when fetching transaction history
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Pause between indexer calls
    #[serde(default = "default_chain_delay_ms")]
    pub request_delay_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_native_decimals() -> u32 {
    18
}

fn default_page_size() -> u32 {
    10_000
}

fn default_chain_delay_ms() -> u64 {
    200
}

impl ChainSettings {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::InvalidValue(
                "Chain name must not be empty".to_string(),
            ));
        }
        if !matches!(self.kind.as_str(), "evm" | "solana" | "sui") {
            return Err(ConfigurationError::InvalidValue(format!(
                "Unknown chain kind '{}' for {} (expected evm, solana or sui)",
                self.kind, self.name
            )));
        }
        if self.api_url.trim().is_empty() {
            return Err(ConfigurationError::InvalidValue(format!(
                "Chain {} has no api_url",
                self.name
            )));
        }
        if self.enabled && self.addresses.is_empty() {
            return Err(ConfigurationError::InvalidValue(format!(
                "Chain {} has no addresses to track",
                self.name
            )));
        }
        if self.native_decimals > 28 {
            return Err(ConfigurationError::InvalidValue(format!(
                "Chain {} native_decimals must be 28 or less",
                self.name
            )));
        }
        if self.page_size == 0 {
            return Err(ConfigurationError::InvalidValue(format!(
                "Chain {} page_size must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// Historical price source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSourceConfig {
    #[serde(default = "default_price_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_price_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Pause between price lookups, keeps free-tier rate limits happy
    #[serde(default = "default_price_delay_ms")]
    pub request_delay_ms: u64,

    /// Price cache file name inside the output directory
    #[serde(default = "default_cache_file")]
    pub cache_file: String,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for PriceSourceConfig {
    fn default() -> Self {
        Self {
            api_url: default_price_api_url(),
            api_key: None,
            request_timeout_seconds: default_price_timeout_seconds(),
            request_delay_ms: default_price_delay_ms(),
            cache_file: default_cache_file(),
            retry: RetrySettings::default(),
        }
    }
}

fn default_price_api_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_price_timeout_seconds() -> u64 {
    30
}

fn default_price_delay_ms() -> u64 {
    500
}

fn default_cache_file() -> String {
    "price_cache.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_retry_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    4.0
}

/// Noise cutoffs for the swap classifier, all overridable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_dust_usd")]
    pub dust_usd: f64,

    #[serde(default = "default_native_min_units")]
    pub native_min_units: f64,

    #[serde(default = "default_native_fee_max_units")]
    pub native_fee_max_units: f64,

    #[serde(default = "default_unknown_units_min")]
    pub unknown_units_min: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            dust_usd: default_dust_usd(),
            native_min_units: default_native_min_units(),
            native_fee_max_units: default_native_fee_max_units(),
            unknown_units_min: default_unknown_units_min(),
        }
    }
}

fn default_dust_usd() -> f64 {
    10.0
}

fn default_native_min_units() -> f64 {
    0.1
}

fn default_native_fee_max_units() -> f64 {
    0.01
}

fn default_unknown_units_min() -> f64 {
    10.0
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("dust_usd", self.dust_usd),
            ("native_min_units", self.native_min_units),
            ("native_fee_max_units", self.native_fee_max_units),
            ("unknown_units_min", self.unknown_units_min),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigurationError::InvalidValue(format!(
                    "classifier.{} must be a non-negative number",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Token metadata entry, resolves an on-chain identifier to symbol/decimals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub chain: String,
    pub identifier: String,
    pub symbol: String,
    pub decimals: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Tax report file name inside the output directory
    #[serde(default = "default_tax_report_file")]
    pub tax_report_file: String,

    /// Per-chain trade files are named "<chain><suffix>"
    #[serde(default = "default_trades_file_suffix")]
    pub trades_file_suffix: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            tax_report_file: default_tax_report_file(),
            trades_file_suffix: default_trades_file_suffix(),
        }
    }
}

fn default_tax_report_file() -> String {
    "fifo_tax_report.csv".to_string()
}

fn default_trades_file_suffix() -> String {
    "_trades.csv".to_string()
}

impl SystemConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config_builder = Config::builder()
            // Start with defaults
            .add_source(Config::try_from(&SystemConfig::default())?);

        // Add config file if it exists
        if config_path.as_ref().exists() {
            info!(
                "Loading configuration from: {}",
                config_path.as_ref().display()
            );
            config_builder = config_builder.add_source(File::from(config_path.as_ref()));
        } else {
            debug!("Config file not found, using defaults and environment variables");
        }

        // Add environment variables with prefix
        config_builder = config_builder.add_source(
            Environment::with_prefix("TAX")
                .try_parsing(true)
                .separator("__")
                .list_separator(","),
        );

        let config = config_builder.build()?;
        let mut system_config: SystemConfig = config.try_deserialize()?;

        // Hex addresses compare case-insensitively, so normalize them once
        // here instead of at every comparison site. Base58 addresses are
        // case-sensitive and must be left alone.
        for chain in &mut system_config.chains {
            if matches!(chain.kind.as_str(), "evm" | "sui") {
                for address in &mut chain.addresses {
                    *address = address.to_lowercase();
                }
            }
        }
        for token in &mut system_config.tokens {
            if token.identifier.starts_with("0x") {
                token.identifier = token.identifier.to_lowercase();
            }
        }

        system_config.validate()?;
        Ok(system_config)
    }

    pub fn validate(&self) -> Result<()> {
        for chain in &self.chains {
            chain.validate()?;
        }
        self.classifier.validate()?;

        if self.price_source.api_url.trim().is_empty() {
            return Err(ConfigurationError::InvalidValue(
                "price_source.api_url must not be empty".to_string(),
            ));
        }
        if self.price_source.retry.max_attempts == 0 {
            return Err(ConfigurationError::InvalidValue(
                "price_source.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.price_source.request_timeout_seconds == 0 {
            return Err(ConfigurationError::InvalidValue(
                "price_source.request_timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.system.output_dir.trim().is_empty() {
            return Err(ConfigurationError::InvalidValue(
                "system.output_dir must not be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.name.clone()) {
                return Err(ConfigurationError::InvalidValue(format!(
                    "Duplicate chain entry '{}'",
                    chain.name
                )));
            }
        }

        Ok(())
    }

    /// Token entries for one chain
    pub fn tokens_for_chain(&self, chain_name: &str) -> Vec<&TokenEntry> {
        self.tokens
            .iter()
            .filter(|t| t.chain == chain_name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn chain(kind: &str) -> ChainSettings {
        ChainSettings {
            name: "ethereum".to_string(),
            kind: kind.to_string(),
            enabled: true,
            api_url: "https://api.etherscan.io/v2/api".to_string(),
            api_key: "key".to_string(),
            addresses: vec!["0xAbC0000000000000000000000000000000000001".to_string()],
            native_symbol: "ETH".to_string(),
            native_decimals: 18,
            chain_id: Some(1),
            page_size: 10_000,
            request_delay_ms: 200,
        }
    }

    #[test]
    fn defaults_are_sensible() {
        let config = SystemConfig::default();
        assert_eq!(config.system.output_dir, "output");
        assert_eq!(config.price_source.request_delay_ms, 500);
        assert_eq!(config.price_source.request_timeout_seconds, 30);
        assert_eq!(config.price_source.retry.max_attempts, 3);
        assert_eq!(config.classifier.dust_usd, 10.0);
        assert_eq!(config.report.tax_report_file, "fifo_tax_report.csv");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_price_timeout_is_rejected() {
        let mut config = SystemConfig::default();
        config.price_source.request_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_chain_kind_is_rejected() {
        let mut config = SystemConfig::default();
        config.chains.push(chain("cosmos"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn chain_without_addresses_is_rejected() {
        let mut config = SystemConfig::default();
        let mut c = chain("evm");
        c.addresses.clear();
        config.chains.push(c);
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_chain_may_omit_addresses() {
        let mut config = SystemConfig::default();
        let mut c = chain("evm");
        c.enabled = false;
        c.addresses.clear();
        config.chains.push(c);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_chain_names_are_rejected() {
        let mut config = SystemConfig::default();
        config.chains.push(chain("evm"));
        config.chains.push(chain("evm"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retry_attempts_are_rejected() {
        let mut config = SystemConfig::default();
        config.price_source.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_load_normalizes_evm_addresses() {
        let path = std::env::temp_dir().join(format!(
            "tax_tracker_config_test_{}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[system]
output_dir = "out"

[[chains]]
name = "ethereum"
kind = "evm"
api_url = "https://api.etherscan.io/v2/api"
api_key = "k"
addresses = ["0xABCDEF0000000000000000000000000000000001"]
native_symbol = "ETH"
chain_id = 1

[[tokens]]
chain = "ethereum"
identifier = "0xA0B86991C6218B36C1D19D4A2E9EB0CE3606EB48"
symbol = "USDC"
decimals = 6
"#
        )
        .unwrap();

        let config = SystemConfig::load_from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.system.output_dir, "out");
        assert_eq!(
            config.chains[0].addresses[0],
            "0xabcdef0000000000000000000000000000000001"
        );
        assert_eq!(
            config.tokens[0].identifier,
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
        );
        assert_eq!(config.chains[0].page_size, 10_000);
        assert_eq!(config.tokens_for_chain("ethereum").len(), 1);
        assert!(config.tokens_for_chain("solana").is_empty());
    }
}
