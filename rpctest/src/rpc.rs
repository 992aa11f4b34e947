//! Remote-procedure interface of a harnessed node.
//!
//! The harness never talks to a node except through [`RpcClient`]. The wire
//! protocol behind it is not this crate's concern; tests use
//! [`crate::test_utils::MockNode`] and real runs plug in a client through
//! [`crate::node::RpcConnector`].

use std::collections::HashSet;
use std::net::SocketAddr;

use async_trait::async_trait;
use dashcore::{Address, BlockHash, Transaction, Txid};
use tokio::sync::mpsc;

use crate::error::RpcResult;

/// Chain-state change pushed by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainNotification {
    /// A block was connected to the active chain.
    BlockConnected {
        height: u32,
        hash: BlockHash,
        transactions: Vec<Transaction>,
    },
    /// The block at `height` was disconnected by a reorg.
    BlockDisconnected {
        height: u32,
        hash: BlockHash,
    },
    /// A transaction entered the mempool.
    TransactionAccepted {
        transaction: Transaction,
    },
}

impl ChainNotification {
    /// Height the notification refers to, if it is a block event.
    pub fn height(&self) -> Option<u32> {
        match self {
            ChainNotification::BlockConnected {
                height,
                ..
            }
            | ChainNotification::BlockDisconnected {
                height,
                ..
            } => Some(*height),
            ChainNotification::TransactionAccepted {
                ..
            } => None,
        }
    }
}

/// Receiving half of a chain notification subscription.
pub type NotificationReceiver = mpsc::UnboundedReceiver<ChainNotification>;

/// Client for a single node's RPC endpoint.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Height and hash of the node's best block.
    async fn get_best_block(&self) -> RpcResult<(u32, BlockHash)>;

    /// Mines `count` blocks paying the coinbase to `to`, returning their hashes.
    async fn generate_blocks(&self, count: u32, to: &Address) -> RpcResult<Vec<BlockHash>>;

    async fn get_raw_mempool(&self) -> RpcResult<HashSet<Txid>>;

    /// Submits a serialized transaction.
    async fn send_raw_transaction(&self, tx: &[u8]) -> RpcResult<Txid>;

    /// Subscribes to chain notifications.
    ///
    /// The stream starts with every block of the current active chain, so a new
    /// subscription replays history from the beginning.
    async fn subscribe_chain_notifications(&self) -> RpcResult<NotificationReceiver>;

    /// Asks the node to open a P2P connection to `addr`.
    async fn add_node(&self, addr: SocketAddr) -> RpcResult<()>;

    async fn peer_count(&self) -> RpcResult<usize>;

    /// Requests a graceful shutdown.
    async fn stop_node(&self) -> RpcResult<()>;
}
