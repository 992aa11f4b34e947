//! In-memory HD wallet embedded in the harness.
//!
//! [`MemWallet`] puts the [`KeyRing`] and [`Ledger`] behind one
//! `tokio::sync::RwLock`. Address allocation, notification intake and
//! transaction construction take the write lock; balance queries take the
//! read lock. Chain notifications are pulled from the attached node by
//! [`MemWallet::refresh`], which the sync controller calls before every
//! wallet-dependent poll.

pub mod coin_selection;
pub mod fee;
pub mod keyring;
pub mod ledger;
pub mod signer;
pub mod transaction_builder;

use std::sync::Arc;

use dashcore::consensus::encode;
use dashcore::{Address, BlockHash, OutPoint, Txid};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex, RwLock};

pub use coin_selection::{CoinSelector, SelectionResult};
pub use fee::{DUST_THRESHOLD, FeeRate};
pub use keyring::{DerivedKey, KeyRing, SEED_LEN, Seed};
pub use ledger::{Ledger, PendingSpend, TrackedOutput};
pub use signer::SignatureError;
pub use transaction_builder::{CreatedTransaction, TransactionBuilder};

use crate::chain_params::ChainParams;
use crate::error::{HarnessError, Result, WalletError, WalletResult};
use crate::rpc::{ChainNotification, NotificationReceiver, RpcClient};

/// Key ring and ledger, always locked together.
#[derive(Debug)]
pub struct WalletState {
    pub keyring: KeyRing,
    pub ledger: Ledger,
}

/// The harness wallet.
pub struct MemWallet {
    state: RwLock<WalletState>,
    coinbase_address: Address,
    rpc: RwLock<Option<Arc<dyn RpcClient>>>,
    notifications: Mutex<Option<NotificationReceiver>>,
}

impl MemWallet {
    /// Creates a wallet and reserves its first address for coinbase payouts.
    pub fn new(seed: &Seed, params: ChainParams) -> WalletResult<Self> {
        let mut keyring = KeyRing::new(seed, params.clone())?;
        let mut ledger = Ledger::new(params);
        let coinbase_address = keyring.new_address()?;
        ledger.watch(coinbase_address.clone());

        Ok(Self {
            state: RwLock::new(WalletState {
                keyring,
                ledger,
            }),
            coinbase_address,
            rpc: RwLock::new(None),
            notifications: Mutex::new(None),
        })
    }

    /// Wallet for harness number `id`.
    pub fn for_harness(id: u32, params: ChainParams) -> WalletResult<Self> {
        Self::new(&Seed::for_harness(id), params)
    }

    /// Address that receives the rewards of blocks mined by the harness.
    pub fn coinbase_address(&self) -> &Address {
        &self.coinbase_address
    }

    pub async fn new_address(&self) -> WalletResult<Address> {
        let mut state = self.state.write().await;
        let address = state.keyring.new_address()?;
        state.ledger.watch(address.clone());
        Ok(address)
    }

    pub async fn balance(&self, address: &Address, min_confirmations: u32) -> u64 {
        self.state.read().await.ledger.balance(address, min_confirmations)
    }

    pub async fn total_balance(&self, min_confirmations: u32) -> u64 {
        self.state.read().await.ledger.total_balance(min_confirmations)
    }

    /// Spendable balance with at least one confirmation.
    pub async fn confirmed_balance(&self) -> u64 {
        self.total_balance(1).await
    }

    pub async fn spendable_outputs(&self, min_confirmations: u32) -> Vec<TrackedOutput> {
        let state = self.state.read().await;
        state.ledger.spendable_outputs(min_confirmations).into_iter().cloned().collect()
    }

    /// Height of the last block the wallet ingested.
    pub async fn synced_height(&self) -> u32 {
        self.state.read().await.ledger.tip_height()
    }

    /// Hash of the block the wallet ingested at `height`, if it is on the wallet's chain.
    pub async fn block_hash(&self, height: u32) -> Option<BlockHash> {
        self.state.read().await.ledger.block_hash(height)
    }

    /// Applies a notification directly, bypassing the attached node.
    pub async fn ingest(&self, notification: &ChainNotification) {
        self.state.write().await.ledger.ingest(notification);
    }

    /// Runs `f` with shared access to the wallet state.
    pub async fn with_state<T>(&self, f: impl FnOnce(&WalletState) -> T) -> T {
        f(&*self.state.read().await)
    }

    /// Funds and signs a payment, reserving its inputs.
    pub async fn create_transaction(
        &self,
        outputs: &[(Address, u64)],
        fee_rate: FeeRate,
    ) -> WalletResult<CreatedTransaction> {
        let builder = outputs.iter().try_fold(
            TransactionBuilder::new().set_fee_rate(fee_rate),
            |builder, (address, amount)| builder.add_output(address, *amount),
        )?;
        self.build(builder).await
    }

    /// Runs a preconfigured builder under the wallet's write lock.
    pub async fn build(&self, builder: TransactionBuilder) -> WalletResult<CreatedTransaction> {
        let mut guard = self.state.write().await;
        let WalletState {
            keyring,
            ledger,
        } = &mut *guard;
        builder.build(keyring, ledger)
    }

    /// Creates a payment and submits it to the attached node.
    ///
    /// If the node rejects it, the reserved inputs are released again.
    pub async fn send_outputs(
        &self,
        outputs: &[(Address, u64)],
        fee_rate: FeeRate,
    ) -> WalletResult<Txid> {
        let rpc = self.rpc().await.ok_or(WalletError::NotAttached)?;
        let created = self.create_transaction(outputs, fee_rate).await?;
        let bytes = encode::serialize(&created.transaction);

        match rpc.send_raw_transaction(&bytes).await {
            Ok(txid) => {
                tracing::debug!("broadcast transaction {}", txid);
                Ok(txid)
            }
            Err(source) => {
                let released = self.state.write().await.ledger.release(&created.txid);
                tracing::warn!(
                    "transaction {} rejected ({}), released {} outputs",
                    created.txid,
                    source,
                    released.len()
                );
                Err(WalletError::Broadcast {
                    txid: created.txid,
                    source,
                })
            }
        }
    }

    /// Returns outputs reserved by transactions that were never broadcast.
    pub async fn unlock_outputs(&self, outpoints: &[OutPoint]) -> usize {
        self.state.write().await.ledger.unlock(outpoints)
    }

    /// Subscribes to the node's chain notifications.
    pub async fn attach(&self, rpc: Arc<dyn RpcClient>) -> Result<()> {
        let receiver = rpc.subscribe_chain_notifications().await?;
        *self.notifications.lock().await = Some(receiver);
        *self.rpc.write().await = Some(rpc);
        Ok(())
    }

    pub async fn rpc(&self) -> Option<Arc<dyn RpcClient>> {
        self.rpc.read().await.clone()
    }

    /// Drains pending chain notifications into the ledger.
    ///
    /// A closed stream is re-subscribed; the new stream replays the active chain,
    /// which ingestion tolerates. Returns the number of notifications applied.
    pub async fn refresh(&self) -> Result<usize> {
        let mut notifications = self.notifications.lock().await;
        let mut pending = Vec::new();
        let mut resubscribed = false;

        loop {
            let Some(receiver) = notifications.as_mut() else {
                return Err(HarnessError::Wallet(WalletError::NotAttached));
            };
            match receiver.try_recv() {
                Ok(notification) => pending.push(notification),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) if !resubscribed => {
                    let rpc = self.rpc().await.ok_or(WalletError::NotAttached)?;
                    tracing::info!("chain notification stream closed, resubscribing");
                    *notifications = Some(rpc.subscribe_chain_notifications().await?);
                    resubscribed = true;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }

        if !pending.is_empty() {
            let mut state = self.state.write().await;
            for notification in &pending {
                state.ledger.ingest(notification);
            }
            tracing::trace!(
                "ingested {} notifications, wallet at height {}",
                pending.len(),
                state.ledger.tip_height()
            );
        }
        Ok(pending.len())
    }
}

impl std::fmt::Debug for MemWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemWallet")
            .field("coinbase_address", &self.coinbase_address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashcore::hashes::Hash;
    use dashcore::{ScriptBuf, Transaction, TxIn, TxOut, Witness};

    fn fund(to: &Address, value: u64, height: u32) -> ChainNotification {
        let input = TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from(height.to_le_bytes().to_vec()),
            sequence: 0xffffffff,
            witness: Witness::default(),
        };
        ChainNotification::BlockConnected {
            height,
            hash: BlockHash::hash(&height.to_le_bytes()),
            transactions: vec![Transaction {
                version: 3,
                lock_time: 0,
                input: vec![input],
                output: vec![TxOut {
                    value,
                    script_pubkey: to.script_pubkey(),
                }],
                special_transaction_payload: None,
            }],
        }
    }

    fn wallet() -> MemWallet {
        MemWallet::for_harness(21, ChainParams::regtest().with_coinbase_maturity(1)).unwrap()
    }

    #[tokio::test]
    async fn addresses_are_watched() {
        let wallet = wallet();
        let address = wallet.new_address().await.unwrap();
        assert_ne!(&address, wallet.coinbase_address());

        wallet.ingest(&fund(&address, 1_000, 1)).await;
        wallet.ingest(&fund(&address, 2_000, 2)).await;
        assert_eq!(wallet.balance(&address, 1).await, 1_000);
        assert_eq!(wallet.balance(&address, 0).await, 1_000);
        assert_eq!(wallet.synced_height().await, 2);
        assert_eq!(wallet.block_hash(2).await, Some(BlockHash::hash(&2u32.to_le_bytes())));
        assert_eq!(wallet.block_hash(3).await, None);
    }

    #[tokio::test]
    async fn concurrent_creates_do_not_double_spend() {
        let wallet = Arc::new(wallet());
        let address = wallet.coinbase_address().clone();
        wallet.ingest(&fund(&address, 10_000_000, 1)).await;
        wallet
            .ingest(&ChainNotification::BlockConnected {
                height: 2,
                hash: BlockHash::hash(b"empty"),
                transactions: vec![],
            })
            .await;
        assert_eq!(wallet.confirmed_balance().await, 10_000_000);

        let target = wallet.new_address().await.unwrap();
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let wallet = Arc::clone(&wallet);
                let outputs = [(target.clone(), 6_000_000)];
                tokio::spawn(async move {
                    wallet.create_transaction(&outputs, FeeRate::normal()).await
                })
            })
            .collect();

        let mut successes = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => successes += 1,
                Err(err) => assert!(matches!(err, WalletError::InsufficientFunds { .. })),
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn send_requires_attached_node() {
        let wallet = wallet();
        let target = wallet.new_address().await.unwrap();
        assert!(matches!(
            wallet.send_outputs(&[(target, 1_000)], FeeRate::normal()).await,
            Err(WalletError::NotAttached)
        ));
        assert!(matches!(
            wallet.refresh().await,
            Err(HarnessError::Wallet(WalletError::NotAttached))
        ));
    }
}
