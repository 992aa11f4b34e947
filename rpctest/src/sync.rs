//! Synchronization points.
//!
//! Tests block on a [`SyncPoint`] instead of sleeping: the controller polls
//! the harnessed nodes (and the wallet, for wallet points) until the condition
//! holds or the wait times out. Polling sleeps between attempts and every wait
//! is bounded by its own timeout, so concurrent waits never affect each other.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};

use dashcore::{Address, BlockHash, Txid};

use crate::error::{HarnessError, SyncError, SyncResult};
use crate::rpc::RpcClient;
use crate::wallet::MemWallet;

/// Timeout and poll interval of a single wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitOptions {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Same poll interval, different timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_millis(100))
    }
}

/// A condition over node and wallet state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPoint {
    /// Every node is at or above this height with the same best block.
    Height(u32),
    /// Every node has the transaction in its mempool.
    MempoolContains(Txid),
    /// The wallet's balance for `address` is at least `amount`.
    Balance {
        address: Address,
        min_confirmations: u32,
        amount: u64,
    },
    /// Every node reports the same best block.
    BlocksConverged,
    /// Every node reports the same mempool.
    MempoolsMatch,
    /// The wallet has ingested the first node's best block, which is at or above
    /// this height. Without nodes only the wallet's height is checked.
    WalletSynced(u32),
}

impl SyncPoint {
    fn needs_wallet(&self) -> bool {
        matches!(
            self,
            SyncPoint::Balance {
                ..
            } | SyncPoint::WalletSynced(_)
        )
    }
}

impl fmt::Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPoint::Height(height) => write!(f, "all nodes at height >= {height}"),
            SyncPoint::MempoolContains(txid) => write!(f, "{txid} in every mempool"),
            SyncPoint::Balance {
                address,
                min_confirmations,
                amount,
            } => write!(
                f,
                "balance of {address} >= {amount} with {min_confirmations} confirmations"
            ),
            SyncPoint::BlocksConverged => f.write_str("best blocks converged"),
            SyncPoint::MempoolsMatch => f.write_str("mempools match"),
            SyncPoint::WalletSynced(height) => {
                write!(f, "wallet synced to the node's best block at height >= {height}")
            }
        }
    }
}

/// Proof that a sync point held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Satisfied {
    pub point: SyncPoint,
    pub elapsed: Duration,
    pub polls: u32,
}

/// Which node state [`join_nodes`] waits to agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Blocks,
    Mempools,
}

/// Polls nodes and an optional wallet until sync points hold.
#[derive(Clone, Default)]
pub struct SyncController {
    nodes: Vec<Arc<dyn RpcClient>>,
    wallet: Option<Arc<MemWallet>>,
}

impl SyncController {
    pub fn new(nodes: Vec<Arc<dyn RpcClient>>) -> Self {
        Self {
            nodes,
            wallet: None,
        }
    }

    pub fn with_wallet(mut self, wallet: Arc<MemWallet>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn add_node(&mut self, node: Arc<dyn RpcClient>) {
        self.nodes.push(node);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Blocks until `point` holds or `options.timeout` elapses.
    ///
    /// Poll failures are logged and retried; the last one is reported with the timeout.
    pub async fn wait_for(
        &self,
        point: &SyncPoint,
        options: WaitOptions,
    ) -> SyncResult<Satisfied> {
        if self.nodes.is_empty() && !point.needs_wallet() {
            return Err(SyncError::NoNodes);
        }
        if point.needs_wallet() && self.wallet.is_none() {
            return Err(SyncError::Wallet(
                "no wallet attached to the sync controller".to_string(),
            ));
        }

        let started = Instant::now();
        let mut polls = 0u32;
        let mut last_error: Option<String> = None;

        let outcome = timeout(options.timeout, async {
            loop {
                polls += 1;
                match self.check(point).await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!("poll for {} failed: {}", point, e);
                        last_error = Some(e.to_string());
                    }
                }
                sleep(options.poll_interval).await;
            }
        })
        .await;

        let elapsed = started.elapsed();
        match outcome {
            Ok(()) => {
                tracing::trace!("{} satisfied after {:?} ({} polls)", point, elapsed, polls);
                Ok(Satisfied {
                    point: point.clone(),
                    elapsed,
                    polls,
                })
            }
            Err(_) => {
                tracing::warn!("timed out after {:?} waiting for {}", elapsed, point);
                Err(SyncError::TimedOut {
                    condition: point.to_string(),
                    waited: elapsed,
                    last_error,
                })
            }
        }
    }

    /// One evaluation of `point`.
    async fn check(&self, point: &SyncPoint) -> Result<bool, HarnessError> {
        match point {
            SyncPoint::Height(target) => {
                let tips = self.best_blocks().await?;
                Ok(tips.iter().all(|(height, _)| height >= target) && converged(&tips))
            }
            SyncPoint::MempoolContains(txid) => {
                for node in &self.nodes {
                    if !node.get_raw_mempool().await?.contains(txid) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            SyncPoint::Balance {
                address,
                min_confirmations,
                amount,
            } => {
                let wallet = self.refreshed_wallet().await?;
                Ok(wallet.balance(address, *min_confirmations).await >= *amount)
            }
            SyncPoint::BlocksConverged => Ok(converged(&self.best_blocks().await?)),
            SyncPoint::MempoolsMatch => {
                let mut mempools: Vec<HashSet<Txid>> = Vec::with_capacity(self.nodes.len());
                for node in &self.nodes {
                    mempools.push(node.get_raw_mempool().await?);
                }
                Ok(mempools.windows(2).all(|pair| pair[0] == pair[1]))
            }
            SyncPoint::WalletSynced(target) => {
                let wallet = self.refreshed_wallet().await?;
                let synced = wallet.synced_height().await;
                let Some(node) = self.nodes.first() else {
                    return Ok(synced >= *target);
                };
                // Same height after a reorg is not enough, the block must match too.
                let (tip, hash) = node.get_best_block().await?;
                Ok(tip >= *target
                    && synced == tip
                    && wallet.block_hash(tip).await == Some(hash))
            }
        }
    }

    async fn best_blocks(&self) -> Result<Vec<(u32, BlockHash)>, HarnessError> {
        let mut tips = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            tips.push(node.get_best_block().await?);
        }
        Ok(tips)
    }

    async fn refreshed_wallet(&self) -> Result<&Arc<MemWallet>, HarnessError> {
        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| SyncError::Wallet("no wallet attached".to_string()))?;
        wallet.refresh().await?;
        Ok(wallet)
    }
}

impl fmt::Debug for SyncController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncController")
            .field("nodes", &self.nodes.len())
            .field("wallet", &self.wallet.is_some())
            .finish()
    }
}

fn converged(tips: &[(u32, BlockHash)]) -> bool {
    tips.windows(2).all(|pair| pair[0] == pair[1])
}

/// Waits until every node agrees on its best block or its mempool.
pub async fn join_nodes(
    nodes: &[Arc<dyn RpcClient>],
    join: JoinType,
    options: WaitOptions,
) -> SyncResult<Satisfied> {
    let controller = SyncController::new(nodes.to_vec());
    let point = match join {
        JoinType::Blocks => SyncPoint::BlocksConverged,
        JoinType::Mempools => SyncPoint::MempoolsMatch,
    };
    controller.wait_for(&point, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_params::ChainParams;
    use crate::test_utils::MockNode;
    use crate::wallet::FeeRate;

    fn options(secs: u64) -> WaitOptions {
        WaitOptions::new(Duration::from_secs(secs), Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn height_wait_times_out_without_mining() {
        let node = MockNode::new(ChainParams::regtest());
        let controller = SyncController::new(vec![node.clone() as Arc<dyn RpcClient>]);

        let started = Instant::now();
        let err = controller.wait_for(&SyncPoint::Height(50), options(30)).await.unwrap_err();

        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(30));
        assert!(waited < Duration::from_secs(31));
        match err {
            SyncError::TimedOut {
                condition,
                last_error,
                ..
            } => {
                assert!(condition.contains("50"));
                assert!(last_error.is_none());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn height_wait_sees_blocks_mined_later() {
        let node = MockNode::new(ChainParams::regtest());
        let controller = SyncController::new(vec![node.clone() as Arc<dyn RpcClient>]);
        let miner = MockNode::new(ChainParams::regtest()).miner_address();

        let mining = {
            let node = node.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(2)).await;
                node.generate_blocks(5, &miner).await
            })
        };

        let satisfied = controller.wait_for(&SyncPoint::Height(5), options(30)).await.unwrap();
        assert!(satisfied.elapsed >= Duration::from_secs(2));
        assert!(satisfied.polls > 1);
        mining.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_errors_are_retried_and_reported() {
        let node = MockNode::new(ChainParams::regtest());
        node.set_unreachable(true);
        let controller = SyncController::new(vec![node.clone() as Arc<dyn RpcClient>]);

        let err = controller.wait_for(&SyncPoint::BlocksConverged, options(1)).await.unwrap_err();
        match err {
            SyncError::TimedOut {
                last_error: Some(message),
                ..
            } => assert!(message.contains("unreachable")),
            other => panic!("unexpected error {other:?}"),
        }

        node.set_unreachable(false);
        controller.wait_for(&SyncPoint::BlocksConverged, options(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waits_are_independent() {
        let node = MockNode::new(ChainParams::regtest());
        let controller = SyncController::new(vec![node.clone() as Arc<dyn RpcClient>]);
        let miner = node.miner_address();
        node.generate_blocks(3, &miner).await.unwrap();

        let (short, long) = tokio::join!(
            controller.wait_for(&SyncPoint::Height(10), options(1)),
            controller.wait_for(&SyncPoint::Height(3), options(30)),
        );
        assert!(matches!(short, Err(SyncError::TimedOut { .. })));
        assert!(long.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn balance_point_refreshes_wallet() {
        let params = ChainParams::regtest().with_coinbase_maturity(1);
        let node = MockNode::new(params.clone());
        let wallet = Arc::new(MemWallet::for_harness(40, params).unwrap());
        wallet.attach(node.clone()).await.unwrap();
        let address = wallet.coinbase_address().clone();

        let controller = SyncController::new(vec![node.clone() as Arc<dyn RpcClient>])
            .with_wallet(wallet.clone());
        node.generate_blocks(2, &address).await.unwrap();

        let point = SyncPoint::Balance {
            address: address.clone(),
            min_confirmations: 1,
            amount: 1,
        };
        controller.wait_for(&point, options(5)).await.unwrap();
        assert!(wallet.balance(&address, 1).await > 0);
        controller.wait_for(&SyncPoint::WalletSynced(2), options(5)).await.unwrap();

        let target = wallet.new_address().await.unwrap();
        let txid = wallet.send_outputs(&[(target, 1_000_000)], FeeRate::normal()).await.unwrap();
        controller.wait_for(&SyncPoint::MempoolContains(txid), options(5)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wallet_synced_requires_matching_block_hash() {
        let params = ChainParams::regtest().with_coinbase_maturity(1);
        let node = MockNode::new(params.clone());
        let wallet = Arc::new(MemWallet::for_harness(41, params).unwrap());
        wallet.attach(node.clone()).await.unwrap();
        let controller = SyncController::new(vec![node.clone() as Arc<dyn RpcClient>])
            .with_wallet(wallet.clone());

        let miner = node.miner_address();
        node.generate_blocks(3, &miner).await.unwrap();
        controller.wait_for(&SyncPoint::WalletSynced(3), options(5)).await.unwrap();
        let stale = wallet.block_hash(3).await;

        // Replace block 3 without telling the wallet.
        node.hold_notifications(true);
        node.invalidate_block(3).unwrap();
        node.generate_blocks(1, &miner).await.unwrap();
        let (height, hash) = node.get_best_block().await.unwrap();
        assert_eq!(height, 3);
        assert_ne!(Some(hash), stale);
        assert_eq!(wallet.synced_height().await, 3);

        let err = controller.wait_for(&SyncPoint::WalletSynced(3), options(2)).await.unwrap_err();
        assert!(matches!(err, SyncError::TimedOut { .. }));

        node.hold_notifications(false);
        controller.wait_for(&SyncPoint::WalletSynced(3), options(5)).await.unwrap();
        assert_eq!(wallet.block_hash(3).await, Some(hash));
    }

    #[tokio::test]
    async fn empty_controller_rejected() {
        let controller = SyncController::default();
        assert!(matches!(
            controller.wait_for(&SyncPoint::Height(1), options(1)).await,
            Err(SyncError::NoNodes)
        ));
        assert!(matches!(
            controller.wait_for(&SyncPoint::WalletSynced(1), options(1)).await,
            Err(SyncError::Wallet(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn join_nodes_waits_for_relay() {
        let a = MockNode::new(ChainParams::regtest());
        let b = MockNode::new(ChainParams::regtest());
        let miner = a.miner_address();
        a.generate_blocks(4, &miner).await.unwrap();

        let nodes: Vec<Arc<dyn RpcClient>> = vec![a.clone() as Arc<dyn RpcClient>, b.clone()];
        assert!(join_nodes(&nodes, JoinType::Blocks, options(1)).await.is_err());

        a.add_node(b.p2p_addr()).await.unwrap();
        join_nodes(&nodes, JoinType::Blocks, options(5)).await.unwrap();
        join_nodes(&nodes, JoinType::Mempools, options(5)).await.unwrap();
        assert_eq!(b.get_best_block().await.unwrap().0, 4);
    }
}
