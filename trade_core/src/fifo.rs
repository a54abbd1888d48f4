use crate::model::{Lot, RecordedTrade, TaxRecord};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Outcome of matching one disposal against FIFO inventory
#[derive(Debug, Clone, PartialEq)]
pub struct DisposalMatch {
    pub cost_basis_usd: Decimal,
    /// Acquisition ids of the lots drawn from, oldest first
    pub matched_acquisition_ids: Vec<u64>,
    /// Portion that had no lot coverage and was priced at the fallback rate
    pub uncovered_amount: Decimal,
}

/// Per-asset acquisition queues, consumed oldest-first
#[derive(Debug, Default)]
pub struct FifoLedger {
    inventory: HashMap<String, VecDeque<Lot>>,
}

impl FifoLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_lot(
        &mut self,
        asset: &str,
        amount: Decimal,
        cost_basis_usd: Decimal,
        acquisition_id: u64,
        acquired_at: DateTime<Utc>,
    ) {
        self.inventory
            .entry(asset.to_string())
            .or_default()
            .push_back(Lot {
                acquisition_id,
                asset_symbol: asset.to_string(),
                original_amount: amount,
                remaining_amount: amount,
                remaining_cost_basis_usd: cost_basis_usd,
                acquired_at,
            });
    }

    /// Consumes inventory for a disposal, oldest lots first
    ///
    /// A disposal larger than the held inventory does not fail: the
    /// uncovered remainder is priced at `fallback_unit_price`, which makes
    /// the uncovered portion a zero-gain sale when the fallback is the sale
    /// price itself.
    pub fn match_disposal(
        &mut self,
        asset: &str,
        amount: Decimal,
        fallback_unit_price: Decimal,
    ) -> DisposalMatch {
        let mut remaining = amount;
        let mut cost_basis_usd = Decimal::ZERO;
        let mut matched_acquisition_ids = Vec::new();

        if let Some(queue) = self.inventory.get_mut(asset) {
            while remaining > Decimal::ZERO {
                let Some(lot) = queue.front_mut() else {
                    break;
                };

                if lot.remaining_amount <= remaining {
                    remaining -= lot.remaining_amount;
                    cost_basis_usd += lot.remaining_cost_basis_usd;
                    matched_acquisition_ids.push(lot.acquisition_id);
                    queue.pop_front();
                } else {
                    let consumed_cost = lot.cost_per_unit() * remaining;
                    lot.remaining_amount -= remaining;
                    lot.remaining_cost_basis_usd -= consumed_cost;
                    cost_basis_usd += consumed_cost;
                    matched_acquisition_ids.push(lot.acquisition_id);
                    remaining = Decimal::ZERO;
                }
            }
        }

        if remaining > Decimal::ZERO {
            warn!(
                "⚠️ Disposal of {} {} exceeds inventory by {}, pricing the rest at {}",
                amount, asset, remaining, fallback_unit_price
            );
            cost_basis_usd += remaining * fallback_unit_price;
        }

        DisposalMatch {
            cost_basis_usd,
            matched_acquisition_ids,
            uncovered_amount: remaining,
        }
    }

    pub fn open_lots(&self, asset: &str) -> Vec<&Lot> {
        self.inventory
            .get(asset)
            .map(|queue| queue.iter().collect())
            .unwrap_or_default()
    }

    pub fn total_remaining(&self, asset: &str) -> Decimal {
        self.inventory
            .get(asset)
            .map(|queue| queue.iter().map(|lot| lot.remaining_amount).sum())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn total_cost_basis(&self, asset: &str) -> Decimal {
        self.inventory
            .get(asset)
            .map(|queue| queue.iter().map(|lot| lot.remaining_cost_basis_usd).sum())
            .unwrap_or(Decimal::ZERO)
    }
}

/// Turns a chronological trade stream into realized gain/loss records
///
/// Every trade consumes two sequential event ids, one for the disposal and
/// one for the acquisition it funds, whether or not the trade ends up
/// producing a tax record. That keeps ids stable when unpriced trades are
/// interleaved with priced ones.
pub struct TaxCalculator {
    ledger: FifoLedger,
    next_event_id: u64,
}

impl Default for TaxCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaxCalculator {
    pub fn new() -> Self {
        Self {
            ledger: FifoLedger::new(),
            next_event_id: 1,
        }
    }

    pub fn ledger(&self) -> &FifoLedger {
        &self.ledger
    }

    /// Processes trades already sorted by timestamp
    pub fn process_all(&mut self, trades: &[RecordedTrade]) -> Vec<TaxRecord> {
        trades
            .iter()
            .filter_map(|recorded| self.process_trade(recorded))
            .collect()
    }

    /// One trade: dispose of the source leg, acquire the target leg
    ///
    /// The acquisition's cost basis is the disposal's USD proceeds, so value
    /// flows through conversions unchanged. Trades without a source-side
    /// price consume their ids but produce nothing.
    pub fn process_trade(&mut self, recorded: &RecordedTrade) -> Option<TaxRecord> {
        let trade = &recorded.trade;
        let disposal_id = self.next_event_id;
        let acquisition_id = self.next_event_id + 1;
        self.next_event_id += 2;

        let Some(source_price) = trade.source_price_usd else {
            debug!("Trade {} is unpriced, no tax impact recorded", trade.tx_hash);
            return None;
        };
        let Some(date_time) = trade.datetime() else {
            warn!(
                "⚠️ Trade {} has an out-of-range timestamp, no tax impact recorded",
                trade.tx_hash
            );
            return None;
        };
        if trade.amount_in <= Decimal::ZERO {
            warn!("⚠️ Trade {} disposes of nothing, skipped", trade.tx_hash);
            return None;
        }

        let proceeds = source_price * trade.amount_in;
        let sale_price_per_token = if proceeds > Decimal::ZERO {
            proceeds / trade.amount_in
        } else {
            Decimal::ZERO
        };

        let matched = self.ledger.match_disposal(
            &trade.token_in,
            trade.amount_in,
            sale_price_per_token,
        );
        let profit = proceeds - matched.cost_basis_usd;

        if trade.amount_out > Decimal::ZERO {
            self.ledger.add_lot(
                &trade.token_out,
                trade.amount_out,
                proceeds,
                acquisition_id,
                date_time,
            );
        }

        Some(TaxRecord {
            trade_id: disposal_id,
            date_time,
            token_sold: trade.token_in.clone(),
            amount_sold: round_amount(trade.amount_in),
            sale_proceeds_usd: round_usd(proceeds),
            cost_basis_usd: round_usd(matched.cost_basis_usd),
            profit_usd: round_usd(profit),
            matched_acquisition_ids: matched.matched_acquisition_ids,
            platform: recorded.platform.clone(),
            address: recorded.address.clone(),
        })
    }
}

/// Token amounts truncate to 8 decimal places, never rounding value up
fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(8, RoundingStrategy::ToZero)
}

/// USD figures truncate to cents
fn round_usd(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}
