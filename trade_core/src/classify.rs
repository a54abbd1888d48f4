use crate::model::{AggregatedTransaction, CandidateSwap, ValuedTrade, UNKNOWN_SYMBOL};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use tracing::debug;

/// Cutoffs used to keep gas refunds, airdrop spam and rounding noise out of
/// the trade stream. All values are overridable through configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierThresholds {
    /// Priced trades in unresolved tokens below this USD value are noise
    pub dust_usd: Decimal,
    /// Minimum native-asset amount (human units) for a sold leg
    pub native_min_units: Decimal,
    /// Native-asset receipts below this are treated as fee refunds
    pub native_fee_max_units: Decimal,
    /// Unpriced unresolved-token trades need this many units on a leg
    pub unknown_units_min: Decimal,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            dust_usd: dec!(10),
            native_min_units: dec!(0.1),
            native_fee_max_units: dec!(0.01),
            unknown_units_min: dec!(10),
        }
    }
}

/// Chain-specific context the classifier needs, supplied by the adapter
#[derive(Debug, Clone, PartialEq)]
pub struct ChainRules {
    /// Identifier the fetcher uses for native-asset movements
    pub native_token: String,
    /// Decimals of the native asset's raw unit
    pub native_decimals: u32,
    /// Accept a native leg only when the transaction carried call input.
    /// Bare value sends never pair with a token movement, so this holds on
    /// EVM chains; account-model chains carry no usable input flag.
    pub native_leg_requires_call_input: bool,
}

impl ChainRules {
    pub fn evm(native_token: impl Into<String>) -> Self {
        Self {
            native_token: native_token.into(),
            native_decimals: 18,
            native_leg_requires_call_input: true,
        }
    }

    pub fn account_model(native_token: impl Into<String>, native_decimals: u32) -> Self {
        Self {
            native_token: native_token.into(),
            native_decimals,
            native_leg_requires_call_input: false,
        }
    }

    fn to_native_units(&self, raw: Decimal) -> Decimal {
        raw * Decimal::new(1, self.native_decimals)
    }
}

/// Decides whether an aggregated transaction is a swap
///
/// Ordered rules, first rejection wins:
/// 1. both sides must hold at least one asset
/// 2. the dominant leg per side (largest raw amount, last identifier wins a
///    tie) must be positive
/// 3. a native leg is only trusted when the chain rules allow it for the
///    transaction's input shape
/// 4. native legs under the unit cutoffs are fee traffic, not trades
/// 5. identical assets on both sides is a self transfer
pub fn classify_swap(
    tx: &AggregatedTransaction,
    rules: &ChainRules,
    thresholds: &ClassifierThresholds,
) -> Option<CandidateSwap> {
    if tx.sent.is_empty() || tx.received.is_empty() {
        return None;
    }

    let (token_in, amount_in) = dominant_leg(&tx.sent)?;
    let (token_out, amount_out) = dominant_leg(&tx.received)?;
    if amount_in <= Decimal::ZERO || amount_out <= Decimal::ZERO {
        return None;
    }

    let native_in = token_in == rules.native_token;
    let native_out = token_out == rules.native_token;

    if (native_in || native_out)
        && rules.native_leg_requires_call_input
        && !tx.raw_input_present
    {
        debug!("Skipping {}: native leg without call input", tx.tx_id);
        return None;
    }

    if native_in && rules.to_native_units(amount_in) < thresholds.native_min_units {
        debug!("Skipping {}: native sale below dust cutoff", tx.tx_id);
        return None;
    }
    if native_out && rules.to_native_units(amount_out) < thresholds.native_fee_max_units {
        debug!("Skipping {}: native receipt looks like a fee refund", tx.tx_id);
        return None;
    }

    if token_in == token_out {
        return None;
    }

    Some(CandidateSwap {
        tx_id: tx.tx_id.clone(),
        block_ref: tx.block_ref,
        timestamp: tx.timestamp,
        token_in,
        token_out,
        amount_in,
        amount_out,
    })
}

fn dominant_leg(side: &BTreeMap<String, Decimal>) -> Option<(String, Decimal)> {
    side.iter()
        .max_by(|a, b| a.1.cmp(b.1))
        .map(|(token, amount)| (token.clone(), *amount))
}

/// Post-valuation noise filter for trades touching an unresolved token
///
/// Runs once USD values exist. Trades between two resolved tokens always
/// pass. For the rest: a known USD value under the dust cutoff fails, a
/// native leg under the unit cutoff fails, and with no USD value at all the
/// trade fails when both legs are tiny.
pub fn is_dust_trade(
    trade: &ValuedTrade,
    native_symbol: &str,
    thresholds: &ClassifierThresholds,
) -> bool {
    let has_unknown =
        trade.token_in == UNKNOWN_SYMBOL || trade.token_out == UNKNOWN_SYMBOL;
    if !has_unknown {
        return false;
    }

    if let Some(usd) = trade.usd_value() {
        if usd > Decimal::ZERO && usd < thresholds.dust_usd {
            return true;
        }
        return false;
    }

    if trade.token_in == native_symbol {
        trade.amount_in < thresholds.native_min_units
    } else if trade.token_out == native_symbol {
        trade.amount_out < thresholds.native_min_units
    } else {
        trade.amount_in < thresholds.unknown_units_min
            && trade.amount_out < thresholds.unknown_units_min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PriceSource;

    const NATIVE: &str = "native:eth";

    fn tx(
        sent: Vec<(&str, Decimal)>,
        received: Vec<(&str, Decimal)>,
        raw_input_present: bool,
    ) -> AggregatedTransaction {
        AggregatedTransaction {
            tx_id: "0xswap".to_string(),
            sent: sent
                .into_iter()
                .map(|(t, a)| (t.to_string(), a))
                .collect(),
            received: received
                .into_iter()
                .map(|(t, a)| (t.to_string(), a))
                .collect(),
            block_ref: 1,
            timestamp: 1_700_000_000,
            raw_input_present,
        }
    }

    fn rules() -> ChainRules {
        ChainRules::evm(NATIVE)
    }

    #[test]
    fn one_sided_transactions_are_not_swaps() {
        let thresholds = ClassifierThresholds::default();
        let deposit = tx(vec![], vec![("0xusdc", dec!(1000))], false);
        let withdrawal = tx(vec![("0xusdc", dec!(1000))], vec![], true);

        assert!(classify_swap(&deposit, &rules(), &thresholds).is_none());
        assert!(classify_swap(&withdrawal, &rules(), &thresholds).is_none());
    }

    #[test]
    fn dominant_legs_become_the_swap() {
        let thresholds = ClassifierThresholds::default();
        let aggregated = tx(
            vec![("0xusdc", dec!(1000)), ("0xdust", dec!(3))],
            vec![("0xweth", dec!(500))],
            true,
        );

        let swap = classify_swap(&aggregated, &rules(), &thresholds).unwrap();
        assert_eq!(swap.token_in, "0xusdc");
        assert_eq!(swap.token_out, "0xweth");
        assert_eq!(swap.amount_in, dec!(1000));
        assert_eq!(swap.amount_out, dec!(500));
    }

    #[test]
    fn native_leg_needs_call_input_on_evm() {
        let thresholds = ClassifierThresholds::default();
        // 0.5 native in raw 18-decimal units
        let raw_native = dec!(500000000000000000);
        let no_input = tx(
            vec![(NATIVE, raw_native)],
            vec![("0xweth", dec!(100))],
            false,
        );
        let with_input = tx(
            vec![(NATIVE, raw_native)],
            vec![("0xweth", dec!(100))],
            true,
        );

        assert!(classify_swap(&no_input, &rules(), &thresholds).is_none());
        assert!(classify_swap(&with_input, &rules(), &thresholds).is_some());

        let account_rules = ChainRules::account_model("native:sol", 9);
        let sol_tx = tx(
            vec![("native:sol", dec!(2000000000))],
            vec![("mint:bonk", dec!(5))],
            false,
        );
        assert!(classify_swap(&sol_tx, &account_rules, &thresholds).is_some());
    }

    #[test]
    fn tiny_native_legs_are_fee_traffic() {
        let thresholds = ClassifierThresholds::default();
        // 0.05 native sold is under the 0.1 cutoff
        let small_sale = tx(
            vec![(NATIVE, dec!(50000000000000000))],
            vec![("0xweth", dec!(100))],
            true,
        );
        // 0.005 native received is under the 0.01 fee cutoff
        let refund = tx(
            vec![("0xusdc", dec!(1000))],
            vec![(NATIVE, dec!(5000000000000000))],
            true,
        );
        // 0.02 native received clears it
        let real_exit = tx(
            vec![("0xusdc", dec!(1000))],
            vec![(NATIVE, dec!(20000000000000000))],
            true,
        );

        assert!(classify_swap(&small_sale, &rules(), &thresholds).is_none());
        assert!(classify_swap(&refund, &rules(), &thresholds).is_none());
        assert!(classify_swap(&real_exit, &rules(), &thresholds).is_some());
    }

    #[test]
    fn self_transfers_are_rejected() {
        let thresholds = ClassifierThresholds::default();
        let shuffle = tx(
            vec![("0xusdc", dec!(100))],
            vec![("0xusdc", dec!(100))],
            true,
        );
        assert!(classify_swap(&shuffle, &rules(), &thresholds).is_none());
    }

    fn unknown_trade(
        token_in: &str,
        amount_in: Decimal,
        token_out: &str,
        amount_out: Decimal,
        source_price: Option<Decimal>,
    ) -> ValuedTrade {
        ValuedTrade {
            tx_hash: "0x1".to_string(),
            block_number: 1,
            timestamp: 1_700_000_000,
            token_in: token_in.to_string(),
            token_out: token_out.to_string(),
            amount_in,
            amount_out,
            source_price_usd: source_price,
            target_price_usd: None,
            price_source: if source_price.is_some() {
                PriceSource::ExternalQuote
            } else {
                PriceSource::Unavailable
            },
        }
    }

    #[test]
    fn dust_filter_only_touches_unresolved_tokens() {
        let thresholds = ClassifierThresholds::default();
        let resolved = unknown_trade("USDC", dec!(2), "WETH", dec!(0.001), Some(dec!(1)));
        assert!(!is_dust_trade(&resolved, "ETH", &thresholds));
    }

    #[test]
    fn priced_unknown_dust_is_dropped() {
        let thresholds = ClassifierThresholds::default();
        let dust = unknown_trade("ETH", dec!(0.002), UNKNOWN_SYMBOL, dec!(9999), Some(dec!(2000)));
        assert!(is_dust_trade(&dust, "ETH", &thresholds));

        let sized = unknown_trade("ETH", dec!(0.2), UNKNOWN_SYMBOL, dec!(9999), Some(dec!(2000)));
        assert!(!is_dust_trade(&sized, "ETH", &thresholds));
    }

    #[test]
    fn unpriced_unknown_falls_back_to_unit_checks() {
        let thresholds = ClassifierThresholds::default();
        let tiny_native = unknown_trade("ETH", dec!(0.05), UNKNOWN_SYMBOL, dec!(50), None);
        assert!(is_dust_trade(&tiny_native, "ETH", &thresholds));

        let both_tiny = unknown_trade(UNKNOWN_SYMBOL, dec!(2), "PEPE", dec!(4), None);
        assert!(is_dust_trade(&both_tiny, "ETH", &thresholds));

        let one_sized = unknown_trade(UNKNOWN_SYMBOL, dec!(2), "PEPE", dec!(400), None);
        assert!(!is_dust_trade(&one_sized, "ETH", &thresholds));
    }
}
