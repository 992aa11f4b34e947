//! UTXO ledger fed by chain notifications.
//!
//! The ledger tracks every output paying a watched address together with its
//! spend status. It is driven entirely by [`ChainNotification`]s, and every
//! notification may be delivered more than once: ingestion is keyed by
//! outpoint and block height so a replay leaves the state unchanged.

use std::collections::{BTreeMap, HashMap};

use dashcore::{Address, BlockHash, OutPoint, ScriptBuf, Transaction, Txid};

use crate::chain_params::ChainParams;
use crate::error::{WalletError, WalletResult};
use crate::rpc::ChainNotification;

/// An output owned by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedOutput {
    pub outpoint: OutPoint,
    /// Value in duffs.
    pub value: u64,
    pub address: Address,
    /// Height of the confirming block, `None` while unconfirmed.
    pub height: Option<u32>,
    pub is_coinbase: bool,
    /// Transaction consuming this output, confirmed or pending.
    pub spent_by: Option<Txid>,
    /// Whether the output was first observed in the mempool.
    pub seen_unconfirmed: bool,
}

impl TrackedOutput {
    pub fn is_spent(&self) -> bool {
        self.spent_by.is_some()
    }

    /// Number of confirmations given the current tip. Unconfirmed outputs have zero.
    pub fn confirmations(&self, tip_height: u32) -> u32 {
        match self.height {
            Some(height) if tip_height >= height => tip_height - height + 1,
            _ => 0,
        }
    }

    /// Coinbase outputs may be spent once the tip is `maturity` blocks past their block.
    pub fn is_mature(&self, tip_height: u32, coinbase_maturity: u32) -> bool {
        if !self.is_coinbase {
            return true;
        }
        match self.height {
            Some(height) => tip_height >= height.saturating_add(coinbase_maturity),
            None => false,
        }
    }
}

/// Outputs reserved by a locally built transaction that has not been seen on chain yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSpend {
    pub txid: Txid,
    pub outpoints: Vec<OutPoint>,
}

/// A spend of an outpoint the ledger has not seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OrphanSpend {
    spender: Txid,
    /// Tip height when the spend was observed.
    seen_at: u32,
}

/// Map from outpoint to tracked output, plus the chain view needed to age them.
#[derive(Debug)]
pub struct Ledger {
    params: ChainParams,
    /// Watched output scripts and the address each one pays.
    watched: HashMap<ScriptBuf, Address>,
    outputs: BTreeMap<OutPoint, TrackedOutput>,
    /// Spends of outpoints seen before the output itself.
    orphan_spends: HashMap<OutPoint, OrphanSpend>,
    pending: HashMap<Txid, PendingSpend>,
    block_hashes: BTreeMap<u32, BlockHash>,
    tip_height: u32,
}

impl Ledger {
    pub fn new(params: ChainParams) -> Self {
        Self {
            params,
            watched: HashMap::new(),
            outputs: BTreeMap::new(),
            orphan_spends: HashMap::new(),
            pending: HashMap::new(),
            block_hashes: BTreeMap::new(),
            tip_height: 0,
        }
    }

    /// Start tracking outputs paying `address`.
    pub fn watch(&mut self, address: Address) {
        self.watched.insert(address.script_pubkey(), address);
    }

    pub fn is_watched(&self, address: &Address) -> bool {
        self.watched.contains_key(&address.script_pubkey())
    }

    pub fn tip_height(&self) -> u32 {
        self.tip_height
    }

    /// Hash of the block ingested at `height` on the ledger's current chain.
    pub fn block_hash(&self, height: u32) -> Option<BlockHash> {
        self.block_hashes.get(&height).copied()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&TrackedOutput> {
        self.outputs.get(outpoint)
    }

    /// Every tracked output, spent or not, ordered by outpoint.
    pub fn outputs(&self) -> impl Iterator<Item = &TrackedOutput> {
        self.outputs.values()
    }

    /// Applies a chain notification.
    pub fn ingest(&mut self, notification: &ChainNotification) {
        match notification {
            ChainNotification::BlockConnected {
                height,
                hash,
                transactions,
            } => self.connect_block(*height, *hash, transactions),
            ChainNotification::BlockDisconnected {
                height,
                hash,
            } => self.disconnect_block(*height, *hash),
            ChainNotification::TransactionAccepted {
                transaction,
            } => self.apply_transaction(transaction, None),
        }
    }

    fn connect_block(&mut self, height: u32, hash: BlockHash, transactions: &[Transaction]) {
        match self.block_hashes.get(&height) {
            Some(known) if *known == hash => {
                tracing::trace!("block {} at height {} already ingested", hash, height);
            }
            Some(_) => {
                // A different block at a known height implies a reorg we were not told about.
                tracing::info!("replacing block at height {} with {}", height, hash);
                self.rewind_to(height);
                self.block_hashes.insert(height, hash);
                self.tip_height = height;
            }
            None => {
                self.block_hashes.insert(height, hash);
                self.tip_height = self.tip_height.max(height);
            }
        }

        for tx in transactions {
            self.apply_transaction(tx, Some(height));
        }
        self.prune_orphan_spends();
    }

    /// Forgets orphan spends older than the coinbase maturity window.
    ///
    /// An output still unseen that many blocks after its spend is not ours.
    fn prune_orphan_spends(&mut self) {
        let tip_height = self.tip_height;
        let maturity = self.params.coinbase_maturity;
        let before = self.orphan_spends.len();
        self.orphan_spends
            .retain(|_, orphan| tip_height.saturating_sub(orphan.seen_at) <= maturity);
        let pruned = before - self.orphan_spends.len();
        if pruned > 0 {
            tracing::trace!("pruned {} orphan spends at height {}", pruned, tip_height);
        }
    }

    fn disconnect_block(&mut self, height: u32, hash: BlockHash) {
        if self.block_hashes.get(&height) != Some(&hash) {
            tracing::debug!("ignoring disconnect of unknown block {} at height {}", hash, height);
            return;
        }
        tracing::info!("disconnecting block {} at height {}", hash, height);
        self.rewind_to(height);
    }

    /// Undo every block at or above `height`.
    ///
    /// Regular outputs return to the unconfirmed set since their transactions go
    /// back to the mempool. Coinbase outputs cannot exist outside their block and
    /// are dropped.
    fn rewind_to(&mut self, height: u32) {
        let _ = self.block_hashes.split_off(&height);
        self.outputs.retain(|_, output| match output.height {
            Some(h) if h >= height => !output.is_coinbase,
            _ => true,
        });
        for output in self.outputs.values_mut() {
            if output.height.is_some_and(|h| h >= height) {
                output.height = None;
            }
        }
        self.tip_height = height.saturating_sub(1);
    }

    fn apply_transaction(&mut self, tx: &Transaction, height: Option<u32>) {
        let txid = tx.txid();

        if !tx.is_coin_base() {
            for input in &tx.input {
                let outpoint = input.previous_output;
                match self.outputs.get_mut(&outpoint) {
                    Some(output) => {
                        if let Some(previous) = output.spent_by.replace(txid) {
                            if previous != txid {
                                tracing::warn!(
                                    "output {} spent by {} replaces spend by {}",
                                    outpoint,
                                    txid,
                                    previous
                                );
                            }
                        }
                    }
                    None => {
                        self.orphan_spends.insert(
                            outpoint,
                            OrphanSpend {
                                spender: txid,
                                seen_at: self.tip_height,
                            },
                        );
                    }
                }
            }
        }

        // The node has seen our transaction, so its inputs are no longer a local reservation.
        self.pending.remove(&txid);

        for (vout, out) in tx.output.iter().enumerate() {
            let Some(address) = self.watched.get(&out.script_pubkey) else {
                continue;
            };
            let outpoint = OutPoint::new(txid, vout as u32);
            let spent_by = self.orphan_spends.remove(&outpoint).map(|orphan| orphan.spender);
            let output = self.outputs.entry(outpoint).or_insert_with(|| TrackedOutput {
                outpoint,
                value: out.value,
                address: address.clone(),
                height: None,
                is_coinbase: tx.is_coin_base(),
                spent_by: None,
                seen_unconfirmed: height.is_none(),
            });
            if output.spent_by.is_none() {
                output.spent_by = spent_by;
            }
            if height.is_some() {
                output.height = height;
            }
        }
    }

    fn is_spendable(&self, output: &TrackedOutput, min_confirmations: u32) -> bool {
        !output.is_spent()
            && output.confirmations(self.tip_height) >= min_confirmations
            && output.is_mature(self.tip_height, self.params.coinbase_maturity)
    }

    /// Unspent outputs with at least `min_confirmations`, ordered by outpoint.
    ///
    /// `0` includes unconfirmed outputs. Immature coinbase outputs are never returned.
    pub fn spendable_outputs(&self, min_confirmations: u32) -> Vec<&TrackedOutput> {
        self.outputs
            .values()
            .filter(|output| self.is_spendable(output, min_confirmations))
            .collect()
    }

    pub fn balance(&self, address: &Address, min_confirmations: u32) -> u64 {
        self.spendable_outputs(min_confirmations)
            .into_iter()
            .filter(|output| output.address == *address)
            .map(|output| output.value)
            .sum()
    }

    pub fn total_balance(&self, min_confirmations: u32) -> u64 {
        self.spendable_outputs(min_confirmations).into_iter().map(|output| output.value).sum()
    }

    /// Reserves `outpoints` for the locally built transaction `spender`.
    ///
    /// All-or-nothing: if any outpoint is untracked or already spent the ledger is left untouched.
    pub fn mark_spent(&mut self, outpoints: &[OutPoint], spender: Txid) -> WalletResult<()> {
        for outpoint in outpoints {
            let output = self.outputs.get(outpoint).ok_or(WalletError::UnknownOutput(*outpoint))?;
            if output.is_spent() {
                return Err(WalletError::OutputAlreadySpent(*outpoint));
            }
        }
        let duplicate = (1..outpoints.len()).find(|&i| outpoints[..i].contains(&outpoints[i]));
        if let Some(index) = duplicate {
            return Err(WalletError::OutputAlreadySpent(outpoints[index]));
        }

        for outpoint in outpoints {
            if let Some(output) = self.outputs.get_mut(outpoint) {
                output.spent_by = Some(spender);
            }
        }
        self.pending.insert(
            spender,
            PendingSpend {
                txid: spender,
                outpoints: outpoints.to_vec(),
            },
        );
        Ok(())
    }

    /// Rolls back a pending spend, returning its outputs to the unspent set.
    pub fn release(&mut self, txid: &Txid) -> Vec<OutPoint> {
        let Some(pending) = self.pending.remove(txid) else {
            return Vec::new();
        };
        let mut released = Vec::with_capacity(pending.outpoints.len());
        for outpoint in pending.outpoints {
            if let Some(output) = self.outputs.get_mut(&outpoint) {
                if output.spent_by == Some(*txid) {
                    output.spent_by = None;
                    released.push(outpoint);
                }
            }
        }
        released
    }

    /// Releases individual outputs reserved by pending spends.
    ///
    /// Outputs spent by a transaction the node has already seen are left alone.
    pub fn unlock(&mut self, outpoints: &[OutPoint]) -> usize {
        let mut unlocked = 0;
        for outpoint in outpoints {
            let Some(output) = self.outputs.get_mut(outpoint) else {
                continue;
            };
            let Some(spender) = output.spent_by else {
                continue;
            };
            let Some(pending) = self.pending.get_mut(&spender) else {
                continue;
            };
            pending.outpoints.retain(|o| o != outpoint);
            if pending.outpoints.is_empty() {
                self.pending.remove(&spender);
            }
            output.spent_by = None;
            unlocked += 1;
        }
        unlocked
    }

    pub fn pending_spends(&self) -> impl Iterator<Item = &PendingSpend> {
        self.pending.values()
    }
}
