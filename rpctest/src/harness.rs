//! Harness lifecycle management.
//!
//! A [`Harness`] owns one node, reached through [`NodeControl`], plus the
//! in-memory wallet that node mines to. It contains:
//! - Construction and the process-wide registry (`new`, `active_harnesses`, `tear_down_all`)
//! - Startup with bounded exponential backoff (`start`, `set_up`)
//! - Peering and mining (`connect_nodes`, `mine`)
//! - Waiting on sync points with crash detection (`wait_for`)
//! - Shutdown with a grace period (`stop`, `tear_down`)

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, PoisonError};
use std::time::Duration;

use dashcore::{Address, BlockHash, OutPoint, Txid};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

use crate::config::{HarnessConfig, NodeConfig};
use crate::error::{HarnessError, NodeError, Result};
use crate::node::{ExitInfo, NodeControl, ProcessHandle};
use crate::rpc::RpcClient;
use crate::sync::{Satisfied, SyncController, SyncPoint, WaitOptions};
use crate::wallet::{FeeRate, MemWallet};

static NEXT_HARNESS_ID: AtomicU32 = AtomicU32::new(1);

static HARNESSES: LazyLock<std::sync::Mutex<HashMap<u32, Arc<Harness>>>> =
    LazyLock::new(|| std::sync::Mutex::new(HashMap::new()));

fn registry() -> std::sync::MutexGuard<'static, HashMap<u32, Arc<Harness>>> {
    HARNESSES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Every harness that has been created and not yet torn down, by id.
pub fn active_harnesses() -> Vec<Arc<Harness>> {
    let mut harnesses: Vec<_> = registry().values().cloned().collect();
    harnesses.sort_by_key(|harness| harness.id);
    harnesses
}

/// Tears down every active harness.
///
/// All harnesses are attempted; the first failure is returned.
pub async fn tear_down_all() -> Result<()> {
    let mut first_error = None;
    for harness in active_harnesses() {
        if let Err(e) = harness.tear_down().await {
            tracing::error!("failed to tear down harness {}: {}", harness.id, e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Lifecycle state of a harnessed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Unstarted,
    Running,
    /// Stopped on request. Terminal.
    Stopped,
    /// Exited on its own. Terminal, never restarted.
    Crashed(ExitInfo),
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Stopped | NodeState::Crashed(_))
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Unstarted => f.write_str("unstarted"),
            NodeState::Running => f.write_str("running"),
            NodeState::Stopped => f.write_str("stopped"),
            NodeState::Crashed(exit) => write!(f, "crashed ({exit})"),
        }
    }
}

/// A running node: its process and an RPC client for it.
#[derive(Clone)]
pub struct NodeHandle {
    pub process: ProcessHandle,
    pub rpc: Arc<dyn RpcClient>,
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle").field("process", &self.process).finish_non_exhaustive()
    }
}

struct Lifecycle {
    state: NodeState,
    node: Option<NodeHandle>,
    /// RPC clients of nodes this one was connected to.
    peers: Vec<Arc<dyn RpcClient>>,
}

/// One node under test plus its wallet.
pub struct Harness {
    id: u32,
    config: HarnessConfig,
    node_config: NodeConfig,
    control: Arc<dyn NodeControl>,
    wallet: Arc<MemWallet>,
    // Set only when the harness created the data directory itself.
    temp_dir: std::sync::Mutex<Option<TempDir>>,
    // Serializes start and stop; never held across sync waits.
    lifecycle: Mutex<Lifecycle>,
}

impl Harness {
    /// Creates and registers a harness. The node is not started.
    ///
    /// A `config.node` supplied by the caller is used as is. Otherwise the node
    /// gets a fresh temporary data directory and free loopback ports.
    pub fn new(control: Arc<dyn NodeControl>, config: HarnessConfig) -> Result<Arc<Self>> {
        config.validate().map_err(HarnessError::Config)?;

        let id = NEXT_HARNESS_ID.fetch_add(1, Ordering::Relaxed);
        let wallet = Arc::new(MemWallet::for_harness(id, config.params.clone())?);

        let (node_config, temp_dir) = match &config.node {
            Some(node) => (node.clone(), None),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(&format!("dashcore-rpctest-{}-{}-", config.params.name, id))
                    .tempdir()
                    .map_err(NodeError::Spawn)?;
                let node = NodeConfig::ephemeral(&config.params, dir.path())
                    .map_err(NodeError::Spawn)?;
                (node, Some(dir))
            }
        };

        let harness = Arc::new(Self {
            id,
            config,
            node_config,
            control,
            wallet,
            temp_dir: std::sync::Mutex::new(temp_dir),
            lifecycle: Mutex::new(Lifecycle {
                state: NodeState::Unstarted,
                node: None,
                peers: Vec::new(),
            }),
        });
        registry().insert(id, harness.clone());
        tracing::debug!("created harness {}", id);
        Ok(harness)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Settings the node process is launched with.
    pub fn node_config(&self) -> &NodeConfig {
        &self.node_config
    }

    pub fn wallet(&self) -> &Arc<MemWallet> {
        &self.wallet
    }

    pub async fn state(&self) -> NodeState {
        self.lifecycle.lock().await.state.clone()
    }

    /// The running node.
    pub async fn node(&self) -> Result<NodeHandle> {
        let lifecycle = self.lifecycle.lock().await;
        match (&lifecycle.state, &lifecycle.node) {
            (NodeState::Running, Some(node)) => Ok(node.clone()),
            (NodeState::Crashed(exit), _) => Err(self.crashed(exit)),
            _ => Err(NodeError::NotRunning(self.id).into()),
        }
    }

    pub async fn rpc(&self) -> Result<Arc<dyn RpcClient>> {
        Ok(self.node().await?.rpc)
    }

    fn crashed(&self, exit: &ExitInfo) -> HarnessError {
        NodeError::Crashed {
            node: self.id,
            exit: exit.to_string(),
        }
        .into()
    }

    /// Launches the node and waits until it answers RPC.
    ///
    /// Connection attempts back off exponentially from `startup_backoff_initial`
    /// to `startup_backoff_max`. Past `startup_timeout` the process is killed and
    /// [`NodeError::StartupTimeout`] returned. The wallet is attached on success.
    pub async fn start(&self) -> Result<NodeHandle> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != NodeState::Unstarted {
            return Err(NodeError::AlreadyStarted(self.id).into());
        }

        tracing::info!("Starting harness {} ({})", self.id, self.config.params.name);
        let process = self.control.start(&self.node_config).await?;

        let started = Instant::now();
        let mut backoff = self.config.startup_backoff_initial;
        let mut attempts = 0u32;
        let rpc = loop {
            attempts += 1;
            let last_error = match self.control.connect_rpc(&process).await {
                Ok(rpc) => match rpc.get_best_block().await {
                    Ok(_) => break rpc,
                    Err(e) => e.to_string(),
                },
                Err(e) => e.to_string(),
            };

            if let Some(exit) = self.control.exit_status(&process).await {
                tracing::error!("harness {} node exited during startup: {}", self.id, exit);
                let err = self.crashed(&exit);
                lifecycle.state = NodeState::Crashed(exit);
                return Err(err);
            }

            let waited = started.elapsed();
            if waited >= self.config.startup_timeout {
                tracing::error!(
                    "harness {} node unreachable after {} attempts: {}",
                    self.id,
                    attempts,
                    last_error
                );
                if let Err(e) = self.control.kill(&process).await {
                    tracing::warn!("failed to kill unreachable node of harness {}: {}", self.id, e);
                }
                lifecycle.state = NodeState::Stopped;
                return Err(NodeError::StartupTimeout {
                    node: self.id,
                    waited,
                    last_error,
                }
                .into());
            }

            tracing::debug!(
                "harness {} node not reachable yet ({}), retrying in {:?}",
                self.id,
                last_error,
                backoff
            );
            sleep(backoff.min(self.config.startup_timeout - waited)).await;
            backoff = (backoff * 2).min(self.config.startup_backoff_max);
        };

        self.wallet.attach(rpc.clone()).await?;

        let node = NodeHandle {
            process,
            rpc,
        };
        lifecycle.state = NodeState::Running;
        lifecycle.node = Some(node.clone());
        tracing::info!("harness {} running after {:?}", self.id, started.elapsed());
        Ok(node)
    }

    /// Starts the node and, with `create_test_chain`, mines enough blocks
    /// that the wallet holds `num_mature_outputs` spendable coinbase outputs.
    pub async fn set_up(&self, create_test_chain: bool, num_mature_outputs: u32) -> Result<()> {
        self.start().await?;
        if create_test_chain {
            let blocks = self.config.params.coinbase_maturity + num_mature_outputs;
            tracing::info!("harness {} creating test chain of {} blocks", self.id, blocks);
            self.mine(blocks, None).await?;
        }
        Ok(())
    }

    /// Mines `count` blocks, to the wallet's coinbase address by default.
    ///
    /// Returns once every connected node has the new tip and the wallet has
    /// ingested it.
    pub async fn mine(&self, count: u32, to: Option<&Address>) -> Result<Vec<BlockHash>> {
        let rpc = self.rpc().await?;
        let to = to.cloned().unwrap_or_else(|| self.wallet.coinbase_address().clone());

        let hashes = match rpc.generate_blocks(count, &to).await {
            Ok(hashes) => hashes,
            Err(e) => return Err(self.crash_or(e.into()).await),
        };
        let (height, _) = match rpc.get_best_block().await {
            Ok(tip) => tip,
            Err(e) => return Err(self.crash_or(e.into()).await),
        };
        tracing::debug!("harness {} mined {} blocks, tip {}", self.id, count, height);

        self.wait_for(&SyncPoint::Height(height)).await?;
        self.wait_for(&SyncPoint::WalletSynced(height)).await?;
        Ok(hashes)
    }

    /// Sync controller over this node, its peers and the wallet.
    pub async fn sync_controller(&self) -> Result<SyncController> {
        let (node, peers) = {
            let lifecycle = self.lifecycle.lock().await;
            match (&lifecycle.state, &lifecycle.node) {
                (NodeState::Running, Some(node)) => (node.rpc.clone(), lifecycle.peers.clone()),
                (NodeState::Crashed(exit), _) => return Err(self.crashed(exit)),
                _ => return Err(NodeError::NotRunning(self.id).into()),
            }
        };
        let mut nodes = vec![node];
        nodes.extend(peers);
        Ok(SyncController::new(nodes).with_wallet(self.wallet.clone()))
    }

    /// Waits for `point` with the configured defaults.
    pub async fn wait_for(&self, point: &SyncPoint) -> Result<Satisfied> {
        self.wait_for_with(point, self.config.wait_options()).await
    }

    /// Waits for `point`, failing early with [`NodeError::Crashed`] if the node dies.
    pub async fn wait_for_with(
        &self,
        point: &SyncPoint,
        options: WaitOptions,
    ) -> Result<Satisfied> {
        let controller = self.sync_controller().await?;
        let process = self.node().await?.process;

        tokio::select! {
            result = controller.wait_for(point, options) => match result {
                Ok(satisfied) => Ok(satisfied),
                Err(e) => Err(self.crash_or(e.into()).await),
            },
            exit = self.watch_exit(&process, options.poll_interval) => {
                Err(self.mark_crashed(exit).await)
            }
        }
    }

    async fn watch_exit(&self, process: &ProcessHandle, interval: Duration) -> ExitInfo {
        loop {
            if let Some(exit) = self.control.exit_status(process).await {
                return exit;
            }
            sleep(interval).await;
        }
    }

    async fn mark_crashed(&self, exit: ExitInfo) -> HarnessError {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == NodeState::Running {
            tracing::error!("harness {} node crashed: {}", self.id, exit);
            lifecycle.state = NodeState::Crashed(exit.clone());
        }
        self.crashed(&exit)
    }

    /// Replaces `err` with a crash report if the node has exited.
    async fn crash_or(&self, err: HarnessError) -> HarnessError {
        let process = match self.lifecycle.lock().await.node.as_ref() {
            Some(node) => node.process.clone(),
            None => return err,
        };
        match self.control.exit_status(&process).await {
            Some(exit) => self.mark_crashed(exit).await,
            None => err,
        }
    }

    /// Requests a graceful shutdown, killing the node if it outlives the grace period.
    ///
    /// Stopping a stopped or crashed harness is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let node = match (&lifecycle.state, lifecycle.node.clone()) {
            (NodeState::Running, Some(node)) => node,
            (NodeState::Unstarted, _) => return Err(NodeError::NotRunning(self.id).into()),
            _ => return Ok(()),
        };

        tracing::info!("Stopping harness {}", self.id);
        if let Err(e) = self.control.stop(&node.process).await {
            tracing::debug!("stop request for harness {} failed: {}", self.id, e);
        }

        let deadline = Instant::now() + self.config.stop_grace_period;
        while self.control.is_alive(&node.process).await {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "harness {} node still running {:?} after stop, killing it",
                    self.id,
                    self.config.stop_grace_period
                );
                if let Err(e) = self.control.kill(&node.process).await {
                    tracing::warn!("failed to kill node of harness {}: {}", self.id, e);
                }
                break;
            }
            sleep(self.config.poll_interval).await;
        }

        lifecycle.state = NodeState::Stopped;
        lifecycle.node = None;
        lifecycle.peers.clear();
        Ok(())
    }

    /// Stops the node and unregisters the harness.
    ///
    /// A data directory the harness created is removed. One supplied through
    /// [`HarnessConfig::node`] is left in place.
    pub async fn tear_down(&self) -> Result<()> {
        let stopped = match self.stop().await {
            Err(HarnessError::Node(NodeError::NotRunning(_))) => Ok(()),
            other => other,
        };

        let temp_dir = self.temp_dir.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(dir) = temp_dir {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!("failed to remove {}: {}", path.display(), e);
            }
        }

        registry().remove(&self.id);
        tracing::debug!("tore down harness {}", self.id);
        stopped
    }

    /// Creates, signs and broadcasts a payment from the wallet.
    pub async fn send_outputs(
        &self,
        outputs: &[(Address, u64)],
        fee_rate: FeeRate,
    ) -> Result<Txid> {
        self.node().await?;
        Ok(self.wallet.send_outputs(outputs, fee_rate).await?)
    }

    /// Releases outputs reserved by transactions that were never broadcast.
    pub async fn unlock_outputs(&self, outpoints: &[OutPoint]) -> usize {
        self.wallet.unlock_outputs(outpoints).await
    }

    /// Wallet balance with at least one confirmation, after draining pending notifications.
    pub async fn confirmed_balance(&self) -> Result<u64> {
        self.wallet.refresh().await?;
        Ok(self.wallet.confirmed_balance().await)
    }
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("id", &self.id)
            .field("network", &self.config.params.name)
            .finish_non_exhaustive()
    }
}

/// Peers `a` with `b` and waits until `a` reports the new connection.
///
/// Afterwards each harness includes the other's node in its height waits.
pub async fn connect_nodes(a: &Harness, b: &Harness) -> Result<()> {
    let node_a = a.node().await?;
    let node_b = b.node().await?;

    let before = node_a.rpc.peer_count().await?;
    node_a.rpc.add_node(node_b.process.p2p_addr).await?;

    let options = a.config.wait_options();
    let deadline = Instant::now() + options.timeout;
    loop {
        if node_a.rpc.peer_count().await? > before {
            break;
        }
        if Instant::now() >= deadline {
            return Err(crate::error::SyncError::TimedOut {
                condition: format!("harness {} to peer with harness {}", a.id, b.id),
                waited: options.timeout,
                last_error: None,
            }
            .into());
        }
        sleep(options.poll_interval).await;
    }

    a.lifecycle.lock().await.peers.push(node_b.rpc.clone());
    b.lifecycle.lock().await.peers.push(node_a.rpc.clone());
    tracing::info!("connected harness {} to harness {}", a.id, b.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_params::ChainParams;
    use crate::error::{RpcError, SyncError};
    use crate::test_utils::MockNode;

    fn config() -> HarnessConfig {
        HarnessConfig::new(ChainParams::regtest().with_coinbase_maturity(5))
            .with_sync_timeout(Duration::from_secs(5))
            .with_stop_grace_period(Duration::from_secs(2))
    }

    fn harness(node: &Arc<MockNode>) -> Arc<Harness> {
        Harness::new(node.clone(), config()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn start_retries_until_reachable() {
        let node = MockNode::new(config().params);
        node.set_rpc_failures(3);
        let harness = harness(&node);

        let started = Instant::now();
        harness.start().await.unwrap();
        // 100 + 200 + 400 ms of backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(700) && elapsed < Duration::from_millis(800));
        assert_eq!(harness.state().await, NodeState::Running);
        assert!(matches!(
            harness.start().await,
            Err(HarnessError::Node(NodeError::AlreadyStarted(_)))
        ));

        harness.tear_down().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn start_times_out() {
        let node = MockNode::new(config().params);
        node.set_unreachable(true);
        let config = config().with_startup_timeout(Duration::from_secs(3));
        let harness = Harness::new(node.clone(), config).unwrap();

        let err = harness.start().await.unwrap_err();
        match err {
            HarnessError::Node(NodeError::StartupTimeout {
                waited,
                last_error,
                ..
            }) => {
                assert!(waited >= Duration::from_secs(3));
                assert!(last_error.contains("unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(harness.state().await, NodeState::Stopped);
        harness.tear_down().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn set_up_funds_the_wallet() {
        let node = MockNode::new(config().params);
        let harness = harness(&node);

        harness.set_up(true, 3).await.unwrap();
        assert_eq!(node.height(), 8);
        assert_eq!(
            harness.confirmed_balance().await.unwrap(),
            3 * crate::test_utils::BLOCK_SUBSIDY
        );
        assert!(active_harnesses().iter().any(|h| h.id() == harness.id()));

        harness.tear_down().await.unwrap();
        assert!(!active_harnesses().iter().any(|h| h.id() == harness.id()));
        assert_eq!(harness.state().await, NodeState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_kills_unresponsive_node() {
        let node = MockNode::new(config().params);
        node.set_ignore_stop(true);
        let harness = harness(&node);
        let process = harness.start().await.unwrap().process;

        let started = Instant::now();
        harness.stop().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(harness.state().await, NodeState::Stopped);
        assert_eq!(node.exit_status(&process).await.and_then(|exit| exit.code), None);

        // Stopping again is a no-op.
        harness.stop().await.unwrap();
        harness.tear_down().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn crash_is_reported_not_timed_out() {
        let node = MockNode::new(config().params);
        let harness = harness(&node);
        harness.start().await.unwrap();

        let waiter = {
            let harness = harness.clone();
            tokio::spawn(async move { harness.wait_for(&SyncPoint::Height(10)).await })
        };
        sleep(Duration::from_millis(500)).await;
        node.crash(3);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, HarnessError::Node(NodeError::Crashed { .. })));
        assert!(matches!(
            harness.state().await,
            NodeState::Crashed(ExitInfo {
                code: Some(3),
                ..
            })
        ));
        assert!(matches!(
            harness.mine(1, None).await,
            Err(HarnessError::Node(NodeError::Crashed { .. }))
        ));

        harness.tear_down().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinct_from_crash() {
        let node = MockNode::new(config().params);
        let harness = harness(&node);
        harness.start().await.unwrap();

        let err = harness.wait_for(&SyncPoint::Height(10)).await.unwrap_err();
        assert!(matches!(err, HarnessError::Sync(SyncError::TimedOut { .. })));
        assert_eq!(harness.state().await, NodeState::Running);
        harness.tear_down().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connected_harnesses_share_blocks() {
        let node_a = MockNode::new(config().params);
        let node_b = MockNode::new(config().params);
        let a = harness(&node_a);
        let b = harness(&node_b);
        a.start().await.unwrap();
        b.start().await.unwrap();

        connect_nodes(&a, &b).await.unwrap();
        a.mine(2, None).await.unwrap();
        assert_eq!(node_b.height(), 2);

        let rpc_b = b.rpc().await.unwrap();
        assert_eq!(rpc_b.peer_count().await, Ok(1));

        a.tear_down().await.unwrap();
        b.tear_down().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn send_outputs_rolls_back_on_rejection() {
        let node = MockNode::new(config().params);
        let harness = harness(&node);
        harness.set_up(true, 1).await.unwrap();
        let target = harness.wallet().new_address().await.unwrap();

        node.reject_transactions(Some("insufficient priority"));
        let outputs = [(target.clone(), 1_000_000)];
        let err = harness.send_outputs(&outputs, FeeRate::normal()).await.unwrap_err();
        match err {
            HarnessError::Wallet(crate::error::WalletError::Broadcast {
                source,
                ..
            }) => assert_eq!(source, RpcError::Rejected("insufficient priority".to_string())),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(harness.wallet().spendable_outputs(1).await.len(), 1);

        node.reject_transactions(None);
        let txid = harness.send_outputs(&outputs, FeeRate::normal()).await.unwrap();
        harness.wait_for(&SyncPoint::MempoolContains(txid)).await.unwrap();
        harness.tear_down().await.unwrap();
    }

    #[tokio::test]
    async fn owned_data_dir_is_removed_at_tear_down() {
        let node = MockNode::new(config().params);
        let a = harness(&node);
        let b = harness(&MockNode::new(config().params));

        let data_dir = a.node_config().data_dir.clone();
        assert!(data_dir.is_dir());
        assert_ne!(data_dir, b.node_config().data_dir);
        assert_ne!(a.node_config().rpc_listen, b.node_config().rpc_listen);

        a.tear_down().await.unwrap();
        assert!(!data_dir.exists());
        // Still there after its sibling is torn down.
        assert!(b.node_config().data_dir.is_dir());
        b.tear_down().await.unwrap();
    }

    #[tokio::test]
    async fn supplied_node_config_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dash.conf"), "regtest=1\n").unwrap();

        let params = config().params;
        let node_config = NodeConfig::ephemeral(&params, dir.path())
            .unwrap()
            .with_executable("/opt/dash/bin/dashd")
            .with_arg("-debug=net");
        let node = MockNode::new(params);
        let harness = Harness::new(node.clone(), config().with_node(node_config.clone())).unwrap();
        assert_eq!(harness.node_config(), &node_config);

        harness.start().await.unwrap();
        harness.tear_down().await.unwrap();
        assert!(dir.path().join("dash.conf").is_file());
    }
}
