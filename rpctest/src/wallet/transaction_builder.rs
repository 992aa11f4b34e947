//! Transaction building against the wallet's ledger.
//!
//! A build selects coins, allocates a change address, signs every input and
//! reserves the spent outputs as one step. The caller holds exclusive access
//! to the [`KeyRing`] and [`Ledger`] for the whole call, so two builds can
//! never select the same output. Any failure leaves both untouched.

use dashcore::{Address, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid, Witness};

use crate::error::{WalletError, WalletResult};
use crate::wallet::coin_selection::CoinSelector;
use crate::wallet::fee::FeeRate;
use crate::wallet::keyring::KeyRing;
use crate::wallet::ledger::{Ledger, TrackedOutput};
use crate::wallet::signer::sign_input;

/// A signed transaction whose inputs are reserved in the ledger.
#[derive(Debug, Clone)]
pub struct CreatedTransaction {
    pub transaction: Transaction,
    pub txid: Txid,
    /// Outputs consumed by the transaction, in input order.
    pub spent: Vec<TrackedOutput>,
    pub fee: u64,
    /// Index of the change output, if one was created.
    pub change_index: Option<usize>,
}

impl CreatedTransaction {
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.spent.iter().map(|output| output.outpoint).collect()
    }

    pub fn change_output(&self) -> Option<&TxOut> {
        self.change_index.and_then(|index| self.transaction.output.get(index))
    }
}

/// Transaction builder for wallet payments
pub struct TransactionBuilder {
    outputs: Vec<TxOut>,
    fee_rate: FeeRate,
    min_confirmations: u32,
    lock_time: u32,
    version: u16,
    selector: CoinSelector,
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            outputs: Vec::new(),
            fee_rate: FeeRate::default(),
            min_confirmations: 1,
            lock_time: 0,
            version: 2,
            selector: CoinSelector::new(),
        }
    }

    /// Add an output to a specific address
    pub fn add_output(mut self, address: &Address, amount: u64) -> WalletResult<Self> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount("Output amount cannot be zero".into()));
        }
        self.outputs.push(TxOut {
            value: amount,
            script_pubkey: address.script_pubkey(),
        });
        Ok(self)
    }

    pub fn set_fee_rate(mut self, fee_rate: FeeRate) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Confirmations an output needs to be selected. `0` allows unconfirmed outputs.
    pub fn set_min_confirmations(mut self, confirmations: u32) -> Self {
        self.min_confirmations = confirmations;
        self
    }

    pub fn set_lock_time(mut self, lock_time: u32) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn set_version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn set_coin_selector(mut self, selector: CoinSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Get the total value of all outputs added so far
    pub fn total_output_value(&self) -> WalletResult<u64> {
        self.outputs.iter().try_fold(0u64, |total, out| {
            total
                .checked_add(out.value)
                .ok_or_else(|| WalletError::InvalidAmount("Output total overflows".into()))
        })
    }

    /// Funds, signs and reserves the transaction.
    pub fn build(
        self,
        keyring: &mut KeyRing,
        ledger: &mut Ledger,
    ) -> WalletResult<CreatedTransaction> {
        if self.outputs.is_empty() {
            return Err(WalletError::NoOutputs);
        }
        let target = self.total_output_value()?;

        let selection = self.selector.select_coins(
            ledger.spendable_outputs(self.min_confirmations),
            target,
            self.outputs.len(),
            self.fee_rate,
        )?;

        // Only peek: the index is consumed once nothing else can fail.
        let change_address = if selection.has_change() {
            Some(keyring.peek_next_address()?)
        } else {
            None
        };

        let mut outputs = self.outputs;
        let change_index = change_address.as_ref().map(|address| {
            outputs.push(TxOut {
                value: selection.change_amount,
                script_pubkey: address.script_pubkey(),
            });
            outputs.len() - 1
        });

        let mut tx = Transaction {
            version: self.version,
            lock_time: self.lock_time,
            input: selection
                .selected
                .iter()
                .map(|output| TxIn {
                    previous_output: output.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: 0xffffffff,
                    witness: Witness::default(),
                })
                .collect(),
            output: outputs,
            special_transaction_payload: None,
        };

        let mut script_sigs = Vec::with_capacity(tx.input.len());
        for (index, output) in selection.selected.iter().enumerate() {
            let key = keyring
                .private_key_for(&output.address)
                .map_err(|e| WalletError::Signing(format!("no key for input {index}: {e}")))?;
            let script_sig = sign_input(
                keyring.secp(),
                &tx,
                index,
                &output.address.script_pubkey(),
                &key.secret_key,
            )
            .map_err(|e| WalletError::Signing(format!("input {index}: {e}")))?;
            script_sigs.push(script_sig);
        }
        for (input, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }

        let txid = tx.txid();
        let outpoints: Vec<OutPoint> = selection.selected.iter().map(|o| o.outpoint).collect();
        ledger.mark_spent(&outpoints, txid)?;

        if let Some(expected) = change_address {
            match keyring.new_address() {
                Ok(address) if address == expected => ledger.watch(address),
                Ok(address) => {
                    ledger.release(&txid);
                    return Err(WalletError::KeyDerivation {
                        index: keyring.next_index() - 1,
                        reason: format!("change address {address} differs from {expected}"),
                    });
                }
                Err(err) => {
                    ledger.release(&txid);
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            "built transaction {} spending {} inputs, fee {}, change {}",
            txid,
            outpoints.len(),
            selection.fee,
            selection.change_amount
        );

        Ok(CreatedTransaction {
            transaction: tx,
            txid,
            spent: selection.selected,
            fee: selection.fee,
            change_index,
        })
    }
}
