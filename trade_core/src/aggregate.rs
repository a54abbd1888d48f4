use crate::model::{AggregatedTransaction, RawTransfer};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Folds per-transfer records into one aggregate per transaction
///
/// Every transfer involving the tracked address lands in the aggregate for
/// its transaction: amounts sum per token identifier, a movement with the
/// tracked address on both ends is counted on both sides. Transfers that do
/// not involve the tracked address are dropped. The result is ordered
/// chronologically, ties broken by block and transaction id so reruns
/// produce identical output.
pub fn aggregate_transfers(
    tracked_address: &str,
    transfers: &[RawTransfer],
    call_input_txs: &HashSet<String>,
) -> Vec<AggregatedTransaction> {
    let mut grouped: HashMap<String, AggregatedTransaction> = HashMap::new();

    for transfer in transfers {
        let sent = transfer.from.as_deref() == Some(tracked_address);
        let received = transfer.to.as_deref() == Some(tracked_address);
        if !sent && !received {
            continue;
        }

        let entry = grouped
            .entry(transfer.tx_id.clone())
            .or_insert_with(|| AggregatedTransaction {
                tx_id: transfer.tx_id.clone(),
                sent: BTreeMap::new(),
                received: BTreeMap::new(),
                block_ref: transfer.block_ref,
                timestamp: transfer.timestamp,
                raw_input_present: call_input_txs.contains(&transfer.tx_id),
            });

        if sent {
            *entry
                .sent
                .entry(transfer.token.clone())
                .or_default() += transfer.amount;
        }
        if received {
            *entry
                .received
                .entry(transfer.token.clone())
                .or_default() += transfer.amount;
        }
    }

    let mut aggregated: Vec<AggregatedTransaction> = grouped.into_values().collect();
    aggregated.sort_by(|a, b| {
        (a.timestamp, a.block_ref, &a.tx_id).cmp(&(b.timestamp, b.block_ref, &b.tx_id))
    });

    debug!(
        "Aggregated {} transfers into {} transactions for {}",
        transfers.len(),
        aggregated.len(),
        tracked_address
    );

    aggregated
}
