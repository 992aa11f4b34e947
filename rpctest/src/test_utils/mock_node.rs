//! In-memory regtest node.
//!
//! `MockNode` implements both [`RpcClient`] and [`NodeControl`], so a harness
//! can run end to end without a `dashd` binary. It keeps a real UTXO set,
//! validates submitted transactions (inputs, coinbase maturity and P2PKH
//! signatures), pushes chain notifications and relays blocks and transactions
//! to peers. Peers find each other through a process-wide registry keyed by
//! the node's fake P2P address.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use dashcore::blockdata::constants::COIN_VALUE;
use dashcore::blockdata::script::Builder;
use dashcore::consensus::encode;
use dashcore::hashes::{Hash, sha256};
use dashcore::{Address, BlockHash, OutPoint, PublicKey, Transaction, TxIn, TxOut, Txid, Witness};
use secp256k1::{Secp256k1, SecretKey, VerifyOnly};
use tokio::sync::mpsc;

use crate::chain_params::ChainParams;
use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult, RpcError, RpcResult};
use crate::node::{ExitInfo, NodeControl, ProcessHandle};
use crate::rpc::{ChainNotification, NotificationReceiver, RpcClient};
use crate::wallet::signer::verify_input;

/// Coinbase value of every mocked block, before fees.
pub const BLOCK_SUBSIDY: u64 = 500 * COIN_VALUE;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PORT: AtomicU16 = AtomicU16::new(30_000);
static NODES: LazyLock<Mutex<HashMap<SocketAddr, Weak<MockNode>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lookup(addr: &SocketAddr) -> Option<Arc<MockNode>> {
    lock(&NODES).get(addr).and_then(Weak::upgrade)
}

#[derive(Debug, Clone)]
struct UtxoEntry {
    output: TxOut,
    height: u32,
    is_coinbase: bool,
}

#[derive(Debug, Clone)]
struct MockBlock {
    hash: BlockHash,
    transactions: Vec<Transaction>,
}

#[derive(Debug, Clone)]
struct MempoolEntry {
    tx: Transaction,
    txid: Txid,
    fee: u64,
}

struct ChainState {
    /// Active chain; index is height, index 0 is genesis.
    blocks: Vec<MockBlock>,
    /// Outputs spent by each block, for disconnects.
    undo: Vec<Vec<(OutPoint, UtxoEntry)>>,
    utxos: HashMap<OutPoint, UtxoEntry>,
    /// Insertion ordered, so parents always precede children.
    mempool: Vec<MempoolEntry>,
    subscribers: Vec<mpsc::UnboundedSender<ChainNotification>>,
    /// Notifications queued while delivery is held back.
    held: Option<Vec<ChainNotification>>,
    peers: Vec<SocketAddr>,
    running: bool,
    started: bool,
    exit: Option<ExitInfo>,
    relay: bool,
    unreachable: bool,
    rpc_failures: u32,
    ignore_stop: bool,
    reject_reason: Option<String>,
    start_failure: Option<String>,
    extra_nonce: u64,
}

impl ChainState {
    fn tip_height(&self) -> u32 {
        (self.blocks.len() - 1) as u32
    }

    fn tip_hash(&self) -> BlockHash {
        self.blocks[self.blocks.len() - 1].hash
    }

    fn notify(&mut self, notifications: Vec<ChainNotification>) {
        if let Some(held) = &mut self.held {
            held.extend(notifications);
            return;
        }
        self.subscribers.retain(|subscriber| {
            notifications.iter().all(|notification| subscriber.send(notification.clone()).is_ok())
        });
    }

    fn shut_down(&mut self, exit: ExitInfo) {
        self.running = false;
        self.exit = Some(exit);
        self.subscribers.clear();
        self.held = self.held.as_ref().map(|_| Vec::new());
    }

    fn is_confirmed(&self, txid: &Txid) -> bool {
        self.blocks.iter().any(|block| block.transactions.iter().any(|tx| tx.txid() == *txid))
    }

    fn mempool_output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.mempool
            .iter()
            .find(|entry| entry.txid == outpoint.txid)
            .and_then(|entry| entry.tx.output.get(outpoint.vout as usize).cloned())
    }

    fn mempool_spender(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.mempool
            .iter()
            .find(|entry| entry.tx.input.iter().any(|input| input.previous_output == *outpoint))
            .map(|entry| entry.txid)
    }

    /// Checks `tx` against the chain tip and mempool, returning its fee.
    fn validate(
        &self,
        tx: &Transaction,
        secp: &Secp256k1<VerifyOnly>,
        coinbase_maturity: u32,
    ) -> RpcResult<u64> {
        let reject = |reason: &str| Err(RpcError::Rejected(reason.to_string()));

        if tx.is_coin_base() {
            return reject("coinbase");
        }
        if tx.input.is_empty() {
            return reject("bad-txns-vin-empty");
        }
        if tx.output.is_empty() {
            return reject("bad-txns-vout-empty");
        }
        if self.is_confirmed(&tx.txid()) {
            return reject("txn-already-known");
        }

        let mut output_value = 0u64;
        for output in &tx.output {
            output_value = match output_value.checked_add(output.value) {
                Some(value) => value,
                None => return reject("bad-txns-txouttotal-toolarge"),
            };
        }

        let next_height = self.tip_height() + 1;
        let mut seen = HashSet::new();
        let mut input_value = 0u64;
        for (index, input) in tx.input.iter().enumerate() {
            let outpoint = input.previous_output;
            if !seen.insert(outpoint) {
                return reject("bad-txns-inputs-duplicate");
            }
            if self.mempool_spender(&outpoint).is_some() {
                return reject("txn-mempool-conflict");
            }
            let prev = match self.utxos.get(&outpoint) {
                Some(entry) => {
                    if entry.is_coinbase && next_height - entry.height < coinbase_maturity {
                        return reject("bad-txns-premature-spend-of-coinbase");
                    }
                    entry.output.clone()
                }
                None => match self.mempool_output(&outpoint) {
                    Some(output) => output,
                    None => return reject("bad-txns-inputs-missingorspent"),
                },
            };
            verify_input(secp, tx, index, &prev.script_pubkey).map_err(|e| {
                RpcError::Rejected(format!("mandatory-script-verify-flag-failed ({e})"))
            })?;
            input_value = match input_value.checked_add(prev.value) {
                Some(value) => value,
                None => return reject("bad-txns-inputvalues-outofrange"),
            };
        }

        if input_value < output_value {
            return reject("bad-txns-in-belowout");
        }
        Ok(input_value - output_value)
    }

    /// Applies a block on top of the tip and drops the mempool entries it
    /// confirms or conflicts with.
    fn connect(&mut self, block: MockBlock) -> ChainNotification {
        let height = self.blocks.len() as u32;
        let mut undo = Vec::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            if !tx.is_coin_base() {
                for input in &tx.input {
                    if let Some(entry) = self.utxos.remove(&input.previous_output) {
                        undo.push((input.previous_output, entry));
                    }
                }
            }
            for (vout, output) in tx.output.iter().enumerate() {
                self.utxos.insert(
                    OutPoint::new(txid, vout as u32),
                    UtxoEntry {
                        output: output.clone(),
                        height,
                        is_coinbase: tx.is_coin_base(),
                    },
                );
            }
        }

        let confirmed: HashSet<Txid> = block.transactions.iter().map(Transaction::txid).collect();
        self.mempool.retain(|entry| !confirmed.contains(&entry.txid));
        self.purge_mempool();

        let notification = ChainNotification::BlockConnected {
            height,
            hash: block.hash,
            transactions: block.transactions.clone(),
        };
        self.blocks.push(block);
        self.undo.push(undo);
        notification
    }

    /// Removes the tip, returning its notification and the transactions that may
    /// re-enter the mempool.
    fn disconnect_tip(&mut self) -> Option<(ChainNotification, Vec<Transaction>)> {
        if self.blocks.len() <= 1 {
            return None;
        }
        let height = self.tip_height();
        let block = self.blocks.pop()?;
        let undo = self.undo.pop().unwrap_or_default();

        for tx in &block.transactions {
            let txid = tx.txid();
            for vout in 0..tx.output.len() {
                self.utxos.remove(&OutPoint::new(txid, vout as u32));
            }
        }
        for (outpoint, entry) in undo {
            self.utxos.insert(outpoint, entry);
        }

        let returned = block.transactions.into_iter().filter(|tx| !tx.is_coin_base()).collect();
        Some((
            ChainNotification::BlockDisconnected {
                height,
                hash: block.hash,
            },
            returned,
        ))
    }

    /// Drops mempool entries whose inputs no longer exist, children after parents.
    fn purge_mempool(&mut self) {
        let entries = std::mem::take(&mut self.mempool);
        for entry in entries {
            let valid = entry.tx.input.iter().all(|input| {
                self.utxos.contains_key(&input.previous_output)
                    || self.mempool_output(&input.previous_output).is_some()
            });
            let conflicted = entry
                .tx
                .input
                .iter()
                .any(|input| self.mempool_spender(&input.previous_output).is_some());
            if valid && !conflicted {
                self.mempool.push(entry);
            }
        }
    }

    /// Adds transactions back to the mempool after a disconnect.
    fn readmit(
        &mut self,
        transactions: Vec<Transaction>,
        secp: &Secp256k1<VerifyOnly>,
        coinbase_maturity: u32,
    ) -> Vec<ChainNotification> {
        let mut notifications = Vec::new();
        for tx in transactions {
            let txid = tx.txid();
            if self.mempool.iter().any(|entry| entry.txid == txid) {
                continue;
            }
            if let Ok(fee) = self.validate(&tx, secp, coinbase_maturity) {
                notifications.push(ChainNotification::TransactionAccepted {
                    transaction: tx.clone(),
                });
                self.mempool.push(MempoolEntry {
                    tx,
                    txid,
                    fee,
                });
            }
        }
        notifications
    }
}

/// An in-memory regtest node.
pub struct MockNode {
    id: u64,
    params: ChainParams,
    p2p_addr: SocketAddr,
    miner_address: Address,
    this: Weak<MockNode>,
    secp: Secp256k1<VerifyOnly>,
    state: Mutex<ChainState>,
}

impl MockNode {
    /// Creates a running node holding only the genesis block.
    pub fn new(params: ChainParams) -> Arc<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let p2p_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let miner_address = unowned_address(id, &params);
        let genesis = MockBlock {
            hash: BlockHash::hash(format!("{} genesis", params.name).as_bytes()),
            transactions: Vec::new(),
        };

        let node = Arc::new_cyclic(|this| Self {
            id,
            params,
            p2p_addr,
            miner_address,
            this: this.clone(),
            secp: Secp256k1::verification_only(),
            state: Mutex::new(ChainState {
                blocks: vec![genesis],
                undo: vec![Vec::new()],
                utxos: HashMap::new(),
                mempool: Vec::new(),
                subscribers: Vec::new(),
                held: None,
                peers: Vec::new(),
                running: true,
                started: false,
                exit: None,
                relay: true,
                unreachable: false,
                rpc_failures: 0,
                ignore_stop: false,
                reject_reason: None,
                start_failure: None,
                extra_nonce: 0,
            }),
        });
        lock(&NODES).insert(p2p_addr, Arc::downgrade(&node));
        node
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address peers use to reach this node with `add_node`.
    pub fn p2p_addr(&self) -> SocketAddr {
        self.p2p_addr
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// An address no wallet owns, for mining blocks nobody tracks.
    pub fn miner_address(&self) -> Address {
        self.miner_address.clone()
    }

    pub fn height(&self) -> u32 {
        lock(&self.state).tip_height()
    }

    pub fn mempool_len(&self) -> usize {
        lock(&self.state).mempool.len()
    }

    /// Stops relaying blocks and transactions to and from peers.
    pub fn set_relay(&self, relay: bool) {
        lock(&self.state).relay = relay;
    }

    /// Makes every RPC request fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Fails the next `count` RPC connection attempts, like a node still warming up.
    pub fn set_rpc_failures(&self, count: u32) {
        lock(&self.state).rpc_failures = count;
    }

    /// Ignores graceful stop requests, so only a kill ends the node.
    pub fn set_ignore_stop(&self, ignore: bool) {
        lock(&self.state).ignore_stop = ignore;
    }

    /// Queues chain notifications instead of delivering them. Releasing the hold
    /// delivers the queue in order.
    pub fn hold_notifications(&self, hold: bool) {
        let mut state = lock(&self.state);
        match (hold, state.held.take()) {
            (true, queued) => state.held = Some(queued.unwrap_or_default()),
            (false, Some(queued)) => state.notify(queued),
            (false, None) => {}
        }
    }

    /// Rejects every submitted transaction with `reason`.
    pub fn reject_transactions(&self, reason: Option<&str>) {
        lock(&self.state).reject_reason = reason.map(str::to_string);
    }

    /// Makes the next `start` fail to spawn.
    pub fn fail_next_start(&self, reason: &str) {
        lock(&self.state).start_failure = Some(reason.to_string());
    }

    /// Simulates the process dying with `code`.
    pub fn crash(&self, code: i32) {
        tracing::debug!("mock node {} crashing with code {}", self.id, code);
        lock(&self.state).shut_down(ExitInfo {
            code: Some(code),
            detail: "crashed".to_string(),
        });
    }

    /// Disconnects every block from the tip down to `height`, like `invalidateblock`.
    pub fn invalidate_block(&self, height: u32) -> RpcResult<()> {
        {
            let mut state = lock(&self.state);
            if height == 0 || height > state.tip_height() {
                return Err(RpcError::Rejected(format!("no block at height {height}")));
            }
            let mut notifications = Vec::new();
            let mut returned = Vec::new();
            while state.tip_height() >= height {
                let Some((notification, txs)) = state.disconnect_tip() else {
                    break;
                };
                notifications.push(notification);
                returned.push(txs);
            }
            // Lowest block first so parents re-enter before children.
            for txs in returned.into_iter().rev() {
                let readmitted = state.readmit(txs, &self.secp, self.params.coinbase_maturity);
                notifications.extend(readmitted);
            }
            state.notify(notifications);
        }
        Ok(())
    }

    fn check_reachable(&self, state: &ChainState) -> RpcResult<()> {
        if !state.running {
            return Err(RpcError::Connection(format!("node {} is not running", self.id)));
        }
        if state.unreachable {
            return Err(RpcError::Connection(format!("node {} unreachable", self.id)));
        }
        Ok(())
    }

    fn reachable(&self) -> RpcResult<()> {
        self.check_reachable(&lock(&self.state))
    }

    fn check_process(&self, process: &ProcessHandle) -> NodeResult<()> {
        if process.id != self.id {
            return Err(NodeError::UnknownProcess(process.id));
        }
        Ok(())
    }

    fn live_peers(&self) -> Vec<Arc<MockNode>> {
        let addrs = lock(&self.state).peers.clone();
        addrs
            .iter()
            .filter_map(lookup)
            .filter(|peer| {
                let state = lock(&peer.state);
                state.running && state.relay
            })
            .collect()
    }

    fn relays(&self) -> bool {
        let state = lock(&self.state);
        state.running && state.relay
    }

    fn snapshot(&self) -> Vec<MockBlock> {
        lock(&self.state).blocks.clone()
    }

    fn relay_chain(&self) {
        if !self.relays() {
            return;
        }
        let blocks = self.snapshot();
        for peer in self.live_peers() {
            peer.receive_chain(blocks.clone());
        }
    }

    fn relay_transaction(&self, tx: &Transaction) {
        if !self.relays() {
            return;
        }
        for peer in self.live_peers() {
            peer.receive_transaction(tx.clone());
        }
    }

    /// Switches to `blocks` if it is longer than the active chain.
    fn receive_chain(&self, blocks: Vec<MockBlock>) {
        {
            let mut state = lock(&self.state);
            if !state.running || blocks.len() <= state.blocks.len() {
                return;
            }
            let fork = state
                .blocks
                .iter()
                .zip(&blocks)
                .position(|(ours, theirs)| ours.hash != theirs.hash)
                .unwrap_or(state.blocks.len());
            if fork == 0 {
                // Different genesis: not the same network.
                return;
            }

            let mut notifications = Vec::new();
            let mut returned = Vec::new();
            while state.blocks.len() > fork {
                let Some((notification, txs)) = state.disconnect_tip() else {
                    break;
                };
                notifications.push(notification);
                returned.push(txs);
            }
            for block in blocks.into_iter().skip(fork) {
                notifications.push(state.connect(block));
            }
            for txs in returned.into_iter().rev() {
                let readmitted = state.readmit(txs, &self.secp, self.params.coinbase_maturity);
                notifications.extend(readmitted);
            }
            tracing::trace!("mock node {} adopted chain at height {}", self.id, state.tip_height());
            state.notify(notifications);
        }
        self.relay_chain();
    }

    fn receive_transaction(&self, tx: Transaction) {
        if self.accept_transaction(tx.clone()).unwrap_or(false) {
            self.relay_transaction(&tx);
        }
    }

    /// Adds `tx` to the mempool. Returns whether it was new.
    fn accept_transaction(&self, tx: Transaction) -> RpcResult<bool> {
        let mut state = lock(&self.state);
        let txid = tx.txid();
        if state.mempool.iter().any(|entry| entry.txid == txid) {
            return Ok(false);
        }
        let fee = state.validate(&tx, &self.secp, self.params.coinbase_maturity)?;
        state.mempool.push(MempoolEntry {
            tx: tx.clone(),
            txid,
            fee,
        });
        state.notify(vec![ChainNotification::TransactionAccepted {
            transaction: tx,
        }]);
        Ok(true)
    }

    fn mine_block(&self, state: &mut ChainState, to: &Address) -> ChainNotification {
        let height = state.tip_height() + 1;
        state.extra_nonce += 1;

        let coinbase_input = TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new()
                .push_slice(height.to_le_bytes())
                .push_slice(self.id.to_le_bytes())
                .push_slice(state.extra_nonce.to_le_bytes())
                .into_script(),
            sequence: 0xffffffff,
            witness: Witness::default(),
        };
        let fees = state.mempool.iter().fold(0u64, |total, entry| total.saturating_add(entry.fee));
        let coinbase = Transaction {
            version: 3,
            lock_time: 0,
            input: vec![coinbase_input],
            output: vec![TxOut {
                value: BLOCK_SUBSIDY.saturating_add(fees),
                script_pubkey: to.script_pubkey(),
            }],
            special_transaction_payload: None,
        };

        let mut transactions = vec![coinbase];
        transactions.extend(state.mempool.iter().map(|entry| entry.tx.clone()));

        let mut preimage = state.tip_hash().to_byte_array().to_vec();
        preimage.extend_from_slice(&height.to_le_bytes());
        for tx in &transactions {
            preimage.extend_from_slice(tx.txid().as_byte_array());
        }

        state.connect(MockBlock {
            hash: BlockHash::hash(&preimage),
            transactions,
        })
    }
}

fn mempool_transactions(state: &Mutex<ChainState>) -> Vec<Transaction> {
    lock(state).mempool.iter().map(|entry| entry.tx.clone()).collect()
}

/// A P2PKH address whose key is derived from the node id and kept by nobody.
fn unowned_address(id: u64, params: &ChainParams) -> Address {
    let secp = Secp256k1::signing_only();
    let mut nonce = 0u32;
    loop {
        let mut preimage = b"mock node miner".to_vec();
        preimage.extend_from_slice(&id.to_le_bytes());
        preimage.extend_from_slice(&nonce.to_le_bytes());
        let digest = sha256::Hash::hash(&preimage);
        if let Ok(key) = SecretKey::from_slice(digest.as_byte_array()) {
            let pubkey = PublicKey::new(secp256k1::PublicKey::from_secret_key(&secp, &key));
            return Address::p2pkh(&pubkey, params.network);
        }
        nonce += 1;
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        lock(&NODES).remove(&self.p2p_addr);
    }
}

impl std::fmt::Debug for MockNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNode")
            .field("id", &self.id)
            .field("p2p_addr", &self.p2p_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RpcClient for MockNode {
    async fn get_best_block(&self) -> RpcResult<(u32, BlockHash)> {
        let state = lock(&self.state);
        self.check_reachable(&state)?;
        Ok((state.tip_height(), state.tip_hash()))
    }

    async fn generate_blocks(&self, count: u32, to: &Address) -> RpcResult<Vec<BlockHash>> {
        let hashes = {
            let mut state = lock(&self.state);
            self.check_reachable(&state)?;
            let mut notifications = Vec::with_capacity(count as usize);
            let mut hashes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let notification = self.mine_block(&mut state, to);
                if let ChainNotification::BlockConnected {
                    hash,
                    ..
                } = &notification
                {
                    hashes.push(*hash);
                }
                notifications.push(notification);
            }
            state.notify(notifications);
            hashes
        };
        self.relay_chain();
        Ok(hashes)
    }

    async fn get_raw_mempool(&self) -> RpcResult<HashSet<Txid>> {
        let state = lock(&self.state);
        self.check_reachable(&state)?;
        Ok(state.mempool.iter().map(|entry| entry.txid).collect())
    }

    async fn send_raw_transaction(&self, tx: &[u8]) -> RpcResult<Txid> {
        {
            let state = lock(&self.state);
            self.check_reachable(&state)?;
            if let Some(reason) = &state.reject_reason {
                return Err(RpcError::Rejected(reason.clone()));
            }
        }
        let tx: Transaction = encode::deserialize(tx)?;
        let txid = tx.txid();
        if self.accept_transaction(tx.clone())? {
            self.relay_transaction(&tx);
        }
        Ok(txid)
    }

    async fn subscribe_chain_notifications(&self) -> RpcResult<NotificationReceiver> {
        let mut state = lock(&self.state);
        self.check_reachable(&state)?;
        let (sender, receiver) = mpsc::unbounded_channel();

        for (height, block) in state.blocks.iter().enumerate().skip(1) {
            let _ = sender.send(ChainNotification::BlockConnected {
                height: height as u32,
                hash: block.hash,
                transactions: block.transactions.clone(),
            });
        }
        for entry in &state.mempool {
            let _ = sender.send(ChainNotification::TransactionAccepted {
                transaction: entry.tx.clone(),
            });
        }
        state.subscribers.push(sender);
        Ok(receiver)
    }

    async fn add_node(&self, addr: SocketAddr) -> RpcResult<()> {
        self.reachable()?;
        if addr == self.p2p_addr {
            return Err(RpcError::Rejected("cannot connect to self".to_string()));
        }
        let peer = lookup(&addr)
            .filter(|peer| lock(&peer.state).running)
            .ok_or_else(|| RpcError::Connection(format!("no node listening on {addr}")))?;

        {
            let mut state = lock(&self.state);
            if !state.peers.contains(&addr) {
                state.peers.push(addr);
            }
        }
        {
            let mut state = lock(&peer.state);
            if !state.peers.contains(&self.p2p_addr) {
                state.peers.push(self.p2p_addr);
            }
        }

        // Initial sync in both directions.
        if self.relays() && peer.relays() {
            peer.receive_chain(self.snapshot());
            self.receive_chain(peer.snapshot());
            let ours = mempool_transactions(&self.state);
            let theirs = mempool_transactions(&peer.state);
            for tx in ours {
                peer.receive_transaction(tx);
            }
            for tx in theirs {
                self.receive_transaction(tx);
            }
        }
        Ok(())
    }

    async fn peer_count(&self) -> RpcResult<usize> {
        let addrs = {
            let state = lock(&self.state);
            self.check_reachable(&state)?;
            state.peers.clone()
        };
        Ok(addrs.iter().filter_map(lookup).filter(|peer| lock(&peer.state).running).count())
    }

    async fn stop_node(&self) -> RpcResult<()> {
        let mut state = lock(&self.state);
        self.check_reachable(&state)?;
        if !state.ignore_stop {
            state.shut_down(ExitInfo {
                code: Some(0),
                detail: "stopped".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeControl for MockNode {
    async fn start(&self, config: &NodeConfig) -> NodeResult<ProcessHandle> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.start_failure.take() {
            return Err(NodeError::Spawn(std::io::Error::other(reason)));
        }
        if state.started && state.running {
            return Err(NodeError::AlreadyStarted(self.id as u32));
        }
        state.started = true;
        state.running = true;
        state.exit = None;
        Ok(ProcessHandle {
            id: self.id,
            pid: None,
            p2p_addr: self.p2p_addr,
            config: config.clone(),
        })
    }

    async fn stop(&self, process: &ProcessHandle) -> NodeResult<()> {
        self.check_process(process)?;
        let mut state = lock(&self.state);
        if state.running && !state.ignore_stop {
            state.shut_down(ExitInfo {
                code: Some(0),
                detail: "stopped".to_string(),
            });
        }
        Ok(())
    }

    async fn kill(&self, process: &ProcessHandle) -> NodeResult<()> {
        self.check_process(process)?;
        let mut state = lock(&self.state);
        if state.running {
            state.shut_down(ExitInfo {
                code: None,
                detail: "killed".to_string(),
            });
        }
        Ok(())
    }

    async fn is_alive(&self, process: &ProcessHandle) -> bool {
        process.id == self.id && lock(&self.state).running
    }

    async fn exit_status(&self, process: &ProcessHandle) -> Option<ExitInfo> {
        if process.id != self.id {
            return None;
        }
        lock(&self.state).exit.clone()
    }

    async fn connect_rpc(&self, process: &ProcessHandle) -> RpcResult<Arc<dyn RpcClient>> {
        if process.id != self.id {
            return Err(RpcError::Connection(format!("unknown process {}", process.id)));
        }
        {
            let mut state = lock(&self.state);
            self.check_reachable(&state)?;
            if state.rpc_failures > 0 {
                state.rpc_failures -= 1;
                return Err(RpcError::Connection(format!(
                    "node {} unreachable (warming up)",
                    self.id
                )));
            }
        }
        let this =
            self.this.upgrade().ok_or_else(|| RpcError::Connection("node dropped".to_string()))?;
        Ok(this as Arc<dyn RpcClient>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::{FeeRate, MemWallet};

    async fn funded_wallet(node: &Arc<MockNode>, id: u32) -> MemWallet {
        let wallet = MemWallet::for_harness(id, node.params().clone()).unwrap();
        wallet.attach(node.clone()).await.unwrap();
        node.generate_blocks(node.params().coinbase_maturity + 1, wallet.coinbase_address())
            .await
            .unwrap();
        wallet.refresh().await.unwrap();
        wallet
    }

    #[tokio::test]
    async fn mined_blocks_pay_the_coinbase_address() {
        let node = MockNode::new(ChainParams::regtest().with_coinbase_maturity(2));
        let wallet = funded_wallet(&node, 1).await;

        assert_eq!(node.height(), 3);
        assert_eq!(wallet.synced_height().await, 3);
        assert_eq!(wallet.confirmed_balance().await, BLOCK_SUBSIDY);
    }

    #[tokio::test]
    async fn double_spend_rejected() {
        let node = MockNode::new(ChainParams::regtest().with_coinbase_maturity(1));
        let wallet = funded_wallet(&node, 2).await;
        let target = wallet.new_address().await.unwrap();

        let first = wallet
            .create_transaction(&[(target.clone(), COIN_VALUE)], FeeRate::normal())
            .await
            .unwrap();
        wallet.unlock_outputs(&first.outpoints()).await;
        let second = wallet
            .create_transaction(&[(target, 2 * COIN_VALUE)], FeeRate::normal())
            .await
            .unwrap();
        assert_eq!(first.outpoints(), second.outpoints());

        node.send_raw_transaction(&encode::serialize(&first.transaction)).await.unwrap();
        let err =
            node.send_raw_transaction(&encode::serialize(&second.transaction)).await.unwrap_err();
        assert_eq!(err, RpcError::Rejected("txn-mempool-conflict".to_string()));
    }

    #[tokio::test]
    async fn tampered_signature_rejected() {
        let node = MockNode::new(ChainParams::regtest().with_coinbase_maturity(1));
        let wallet = funded_wallet(&node, 3).await;
        let target = wallet.new_address().await.unwrap();

        let mut created =
            wallet.create_transaction(&[(target, COIN_VALUE)], FeeRate::normal()).await.unwrap();
        created.transaction.output[0].value += 1;
        let err =
            node.send_raw_transaction(&encode::serialize(&created.transaction)).await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Rejected(reason) if reason.starts_with("mandatory-script-verify")
        ));
    }

    #[tokio::test]
    async fn immature_coinbase_rejected() {
        let node = MockNode::new(ChainParams::regtest());
        let wallet = MemWallet::for_harness(4, node.params().clone()).unwrap();
        wallet.attach(node.clone()).await.unwrap();
        node.generate_blocks(1, wallet.coinbase_address()).await.unwrap();
        wallet.refresh().await.unwrap();

        let created = wallet
            .build(
                crate::wallet::TransactionBuilder::new()
                    .add_output(wallet.coinbase_address(), COIN_VALUE)
                    .unwrap(),
            )
            .await;
        // The wallet applies the same maturity rule as the node.
        assert!(created.is_err());
    }

    #[tokio::test]
    async fn invalidate_block_emits_disconnect() {
        let node = MockNode::new(ChainParams::regtest());
        let mut notifications = node.subscribe_chain_notifications().await.unwrap();
        let miner = node.miner_address();
        let hashes = node.generate_blocks(2, &miner).await.unwrap();

        node.invalidate_block(2).unwrap();
        assert_eq!(node.height(), 1);

        let mut received = Vec::new();
        while let Ok(notification) = notifications.try_recv() {
            received.push(notification);
        }
        assert_eq!(received.len(), 3);
        assert_eq!(
            received[2],
            ChainNotification::BlockDisconnected {
                height: 2,
                hash: hashes[1],
            }
        );
        assert!(node.invalidate_block(5).is_err());
    }

    #[tokio::test]
    async fn held_notifications_arrive_on_release() {
        let node = MockNode::new(ChainParams::regtest());
        let mut notifications = node.subscribe_chain_notifications().await.unwrap();
        let miner = node.miner_address();

        node.hold_notifications(true);
        let hashes = node.generate_blocks(2, &miner).await.unwrap();
        node.invalidate_block(2).unwrap();
        assert!(notifications.try_recv().is_err());

        node.hold_notifications(false);
        let mut received = Vec::new();
        while let Ok(notification) = notifications.try_recv() {
            received.push(notification);
        }
        assert_eq!(received.len(), 3);
        assert_eq!(
            received[2],
            ChainNotification::BlockDisconnected {
                height: 2,
                hash: hashes[1],
            }
        );
    }

    #[tokio::test]
    async fn output_total_overflow_rejected() {
        let node = MockNode::new(ChainParams::regtest().with_coinbase_maturity(1));
        let wallet = funded_wallet(&node, 5).await;
        let target = wallet.new_address().await.unwrap();

        let mut created =
            wallet.create_transaction(&[(target, COIN_VALUE)], FeeRate::normal()).await.unwrap();
        created.transaction.output[0].value = u64::MAX;
        let err =
            node.send_raw_transaction(&encode::serialize(&created.transaction)).await.unwrap_err();
        assert_eq!(err, RpcError::Rejected("bad-txns-txouttotal-toolarge".to_string()));
    }

    #[test]
    fn miner_address_is_stable_per_node() {
        let a = MockNode::new(ChainParams::regtest());
        let b = MockNode::new(ChainParams::regtest());
        assert_eq!(a.miner_address(), a.miner_address());
        assert_ne!(a.miner_address(), b.miner_address());
    }

    #[tokio::test]
    async fn peers_converge_on_longest_chain() {
        let a = MockNode::new(ChainParams::regtest());
        let b = MockNode::new(ChainParams::regtest());
        a.generate_blocks(2, &a.miner_address()).await.unwrap();
        b.generate_blocks(3, &b.miner_address()).await.unwrap();

        a.add_node(b.p2p_addr()).await.unwrap();
        assert_eq!(a.get_best_block().await.unwrap(), b.get_best_block().await.unwrap());
        assert_eq!(a.peer_count().await.unwrap(), 1);
        assert_eq!(b.peer_count().await.unwrap(), 1);

        a.generate_blocks(1, &a.miner_address()).await.unwrap();
        assert_eq!(b.height(), 4);

        b.set_relay(false);
        a.generate_blocks(1, &a.miner_address()).await.unwrap();
        assert_eq!(b.height(), 4);
        assert_eq!(a.height(), 5);
    }

    #[tokio::test]
    async fn stopped_node_is_unreachable() {
        let node = MockNode::new(ChainParams::regtest());
        let config = NodeConfig::new(node.params(), "/tmp/unused");
        let process = node.start(&config).await.unwrap();
        assert!(matches!(node.start(&config).await, Err(NodeError::AlreadyStarted(_))));

        node.stop_node().await.unwrap();
        assert!(!node.is_alive(&process).await);
        assert_eq!(node.exit_status(&process).await.map(|exit| exit.success()), Some(true));
        assert!(matches!(node.get_best_block().await, Err(RpcError::Connection(_))));
    }
}
