//! Fee rates and transaction size estimation.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Signed P2PKH input: outpoint, script length, DER signature, compressed key, sequence.
pub const P2PKH_INPUT_SIZE: usize = 148;

/// P2PKH output: value, script length, 25-byte script.
pub const P2PKH_OUTPUT_SIZE: usize = 34;

/// Outputs below this value are uneconomical to spend and are not created as change.
pub const DUST_THRESHOLD: u64 = 546;

/// Fee rate in duffs per kilobyte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FeeRate {
    sat_per_kb: u64,
}

impl Default for FeeRate {
    fn default() -> Self {
        Self::normal()
    }
}

impl FeeRate {
    pub fn new(sat_per_kb: u64) -> Self {
        Self {
            sat_per_kb,
        }
    }

    /// Create from duffs per byte
    pub fn from_sat_per_byte(sat_per_byte: u64) -> Self {
        Self {
            sat_per_kb: sat_per_byte.saturating_mul(1000),
        }
    }

    pub fn as_sat_per_kb(&self) -> u64 {
        self.sat_per_kb
    }

    /// Calculate fee for a given transaction size in bytes
    ///
    /// Saturates instead of overflowing; an absurd fee surfaces later as insufficient funds.
    pub fn calculate_fee(&self, size_bytes: usize) -> u64 {
        // Round up to ensure we pay at least the minimum fee
        self.sat_per_kb.saturating_mul(size_bytes as u64).div_ceil(1000)
    }

    /// Relay minimum of a regtest node (1 duff/byte)
    pub fn normal() -> Self {
        Self {
            sat_per_kb: 1000,
        }
    }

    /// Marginal fee of adding one P2PKH change output.
    pub fn change_output_fee(&self) -> u64 {
        self.calculate_fee(P2PKH_OUTPUT_SIZE)
    }
}

/// Estimated serialized size of a signed transaction with P2PKH inputs and outputs.
pub fn estimate_tx_size(num_inputs: usize, num_outputs: usize) -> usize {
    // version (2) + type (2) + locktime (4) + input/output counts
    2 + 2
        + 4
        + varint_size(num_inputs)
        + varint_size(num_outputs)
        + num_inputs * P2PKH_INPUT_SIZE
        + num_outputs * P2PKH_OUTPUT_SIZE
}

/// Length of the compact-size prefix encoding `n`.
fn varint_size(n: usize) -> usize {
    match n {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x10000..=0xFFFFFFFF => 5,
        _ => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_rate_calculation() {
        let rate = FeeRate::new(1000); // 1 duff/byte

        assert_eq!(rate.calculate_fee(250), 250);
        assert_eq!(rate.calculate_fee(1000), 1000);

        // Rounds up
        let rate = FeeRate::new(500);
        assert_eq!(rate.calculate_fee(251), 126);
        assert_eq!(rate.calculate_fee(1), 1);
    }

    #[test]
    fn test_fee_saturates_instead_of_overflowing() {
        let rate = FeeRate::new(u64::MAX);
        assert_eq!(rate.calculate_fee(226), u64::MAX.div_ceil(1000));
        assert_eq!(FeeRate::from_sat_per_byte(u64::MAX).as_sat_per_kb(), u64::MAX);
    }

    #[test]
    fn test_fee_rate_from_sat_per_byte() {
        let rate = FeeRate::from_sat_per_byte(5);
        assert_eq!(rate.as_sat_per_kb(), 5000);
        assert_eq!(rate.calculate_fee(1000), 5000);
        assert_eq!(rate.change_output_fee(), 170);
    }

    #[test]
    fn test_tx_size_estimation() {
        assert_eq!(estimate_tx_size(1, 1), 10 + 148 + 34);
        assert_eq!(estimate_tx_size(2, 2), 10 + 2 * 148 + 2 * 34);
        // Counts above 252 need a three byte varint.
        assert_eq!(estimate_tx_size(253, 0), 2 + 2 + 4 + 3 + 1 + 253 * 148);
    }
}
