//! Coin selection for the transaction builder
//!
//! Largest-first accumulation: outputs are taken in decreasing value order,
//! ties broken by outpoint, until they cover the payment plus the fee of the
//! transaction built so far. The outcome depends only on the set of candidate
//! outputs, never on the order they were ingested in.

use std::cmp::Reverse;

use crate::error::{WalletError, WalletResult};
use crate::wallet::fee::{DUST_THRESHOLD, FeeRate, estimate_tx_size};
use crate::wallet::ledger::TrackedOutput;

/// Result of UTXO selection
#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// Selected outputs, in selection order
    pub selected: Vec<TrackedOutput>,
    /// Total value of selected outputs
    pub total_value: u64,
    /// Sum of payment amounts (excluding fees)
    pub target_amount: u64,
    /// Change amount, zero when no change output is created
    pub change_amount: u64,
    /// Estimated size of the signed transaction, including the change output if any
    pub estimated_size: usize,
    /// Fee paid, including any surplus forfeited as dust
    pub fee: u64,
}

impl SelectionResult {
    pub fn has_change(&self) -> bool {
        self.change_amount > 0
    }
}

/// Coin selector for choosing UTXOs
pub struct CoinSelector {
    dust_threshold: u64,
}

impl Default for CoinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinSelector {
    pub fn new() -> Self {
        Self {
            dust_threshold: DUST_THRESHOLD,
        }
    }

    /// Set dust threshold
    pub fn with_dust_threshold(mut self, threshold: u64) -> Self {
        self.dust_threshold = threshold;
        self
    }

    /// Selects outputs paying `target_amount` to `num_outputs` recipients.
    ///
    /// Candidates must already be filtered for spendability.
    pub fn select_coins<'a, I>(
        &self,
        candidates: I,
        target_amount: u64,
        num_outputs: usize,
        fee_rate: FeeRate,
    ) -> WalletResult<SelectionResult>
    where
        I: IntoIterator<Item = &'a TrackedOutput>,
    {
        let mut available: Vec<&'a TrackedOutput> = candidates.into_iter().collect();
        available.sort_by_key(|output| (Reverse(output.value), output.outpoint));

        let mut selected = Vec::new();
        let mut total_value = 0u64;
        let mut required =
            add_fee(target_amount, fee_rate.calculate_fee(estimate_tx_size(0, num_outputs)))?;

        for output in available {
            total_value = total_value.checked_add(output.value).ok_or_else(|| {
                WalletError::InvalidAmount("selected outputs overflow u64".to_string())
            })?;
            selected.push(output.clone());

            // Size and fee are refined with every input added
            let estimated_size = estimate_tx_size(selected.len(), num_outputs);
            let fee = fee_rate.calculate_fee(estimated_size);
            required = add_fee(target_amount, fee)?;

            if total_value < required {
                continue;
            }

            let surplus = total_value - required;
            let change_fee = fee_rate.change_output_fee();
            let change_amount = surplus.saturating_sub(change_fee);

            return Ok(if change_amount >= self.dust_threshold {
                SelectionResult {
                    estimated_size: estimate_tx_size(selected.len(), num_outputs + 1),
                    selected,
                    total_value,
                    target_amount,
                    change_amount,
                    fee: fee + change_fee,
                }
            } else {
                // Change would be dust: forfeit the surplus to the fee
                SelectionResult {
                    selected,
                    total_value,
                    target_amount,
                    change_amount: 0,
                    estimated_size,
                    fee: total_value - target_amount,
                }
            });
        }

        Err(WalletError::InsufficientFunds {
            available: total_value,
            required,
        })
    }
}

fn add_fee(target_amount: u64, fee: u64) -> WalletResult<u64> {
    target_amount.checked_add(fee).ok_or_else(|| {
        WalletError::InvalidAmount(format!("payment {target_amount} plus fee {fee} overflows u64"))
    })
}
