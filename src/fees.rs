//! Virtual-size estimation and greedy input selection.

use crate::backend::Utxo;
use crate::error::{ChatError, Result};
use bitcoin::Amount;

/// Smallest value any non-data output may carry.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

const TX_OVERHEAD: u64 = 10;
const INPUT_BASE: u64 = 41;
const INPUT_WITNESS: u64 = 108;
const DATA_OUTPUT_BASE: u64 = 11;
const VALUE_OUTPUT: u64 = 31;
const SEGWIT_MARKER: u64 = 2;

/// Estimated virtual size of a P2WPKH spend carrying a `payload_len`-byte OP_RETURN.
pub fn estimate_vbytes(inputs: usize, payload_len: usize, has_recipient: bool, has_change: bool) -> u64 {
    let n = inputs as u64;
    let mut base = TX_OVERHEAD + INPUT_BASE * n;
    let witness = INPUT_WITNESS * n;
    base += DATA_OUTPUT_BASE + payload_len as u64;
    if has_recipient {
        base += VALUE_OUTPUT;
    }
    if has_change {
        base += VALUE_OUTPUT;
    }
    let total = base + witness + SEGWIT_MARKER;
    (base * 3 + total).div_ceil(4) + 2
}

pub fn fee_for(vbytes: u64, fee_rate: u64) -> Amount {
    Amount::from_sat(vbytes.saturating_mul(fee_rate))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    pub input_total: Amount,
    /// Effective fee: everything not paid to the recipient or returned as change.
    pub fee: Amount,
    pub change: Option<Amount>,
    pub vbytes: u64,
}

/// Saturating sum of coin values reported by a backend.
pub fn total_of(utxos: &[Utxo]) -> Amount {
    utxos
        .iter()
        .fold(Amount::ZERO, |acc, u| acc.checked_add(u.amount).unwrap_or(Amount::MAX))
}

/// Pick inputs in the order given until they cover `payment` plus fee.
///
/// Change below [`DUST_LIMIT`] is dropped and added to the fee.
pub fn select(candidates: &[Utxo], payment: Amount, payload_len: usize, fee_rate: u64) -> Result<Selection> {
    let fee_rate = fee_rate.max(1);
    let mut chosen: Vec<Utxo> = Vec::new();
    let mut total = Amount::ZERO;

    for utxo in candidates {
        chosen.push(utxo.clone());
        total = total.checked_add(utxo.amount).unwrap_or(Amount::MAX);

        let vbytes_change = estimate_vbytes(chosen.len(), payload_len, true, true);
        let fee_change = fee_for(vbytes_change, fee_rate);
        if let Some(change) = payment
            .checked_add(fee_change)
            .and_then(|needed| total.checked_sub(needed))
        {
            if change > DUST_LIMIT {
                return Ok(Selection {
                    input_total: total,
                    fee: fee_change,
                    change: Some(change),
                    vbytes: vbytes_change,
                    inputs: chosen,
                });
            }
        }

        let vbytes_plain = estimate_vbytes(chosen.len(), payload_len, true, false);
        let fee_plain = fee_for(vbytes_plain, fee_rate);
        let covered = payment.checked_add(fee_plain).is_some_and(|needed| total >= needed);
        if covered {
            return Ok(Selection {
                input_total: total,
                fee: total - payment,
                change: None,
                vbytes: vbytes_plain,
                inputs: chosen,
            });
        }
    }

    let n = candidates.len().max(1);
    let vbytes = estimate_vbytes(n, payload_len, true, true);
    let fee = fee_for(vbytes, fee_rate);
    Err(ChatError::InsufficientFunds {
        required: payment.checked_add(fee).unwrap_or(Amount::MAX),
        available: total,
        fee,
        fee_rate,
        vbytes,
    })
}
