//! Integration-test harness for Dash Core nodes.
//!
//! This library starts and supervises regtest nodes and drives them from an
//! embedded in-memory HD wallet:
//!
//! - Derive P2PKH addresses from a per-harness seed
//! - Track wallet outputs from chain notifications, including reorgs
//! - Build and sign payments with largest-first coin selection
//! - Block on sync points (heights, mempools, balances) with bounded polling
//! - Start, peer, mine on and stop nodes, detecting crashes
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dashcore_rpctest::node::{ProcessNodeControl, RpcConnector};
//! use dashcore_rpctest::wallet::FeeRate;
//! use dashcore_rpctest::{Harness, HarnessConfig};
//!
//! async fn run(connector: Arc<dyn RpcConnector>) -> dashcore_rpctest::Result<()> {
//!     let control = Arc::new(ProcessNodeControl::new(connector));
//!     let harness = Harness::new(control, HarnessConfig::regtest())?;
//!
//!     // Start the node and mine 100 + 25 blocks to the wallet.
//!     harness.set_up(true, 25).await?;
//!
//!     let to = harness.wallet().new_address().await?;
//!     let txid = harness.send_outputs(&[(to, 100_000_000)], FeeRate::normal()).await?;
//!     harness.mine(1, None).await?;
//!     println!("confirmed {txid}");
//!
//!     harness.tear_down().await
//! }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod chain_params;
pub mod config;
pub mod error;
pub mod harness;
pub mod logging;
pub mod node;
pub mod rpc;
pub mod sync;
pub mod wallet;

// Re-export main types for convenience
pub use chain_params::ChainParams;
pub use dashcore;
pub use dashcore::Address;
pub use config::{HarnessConfig, NodeConfig};
pub use error::{
    HarnessError, LoggingError, LoggingResult, NodeError, Result, RpcError, SyncError, WalletError,
};
pub use harness::{
    Harness, NodeHandle, NodeState, active_harnesses, connect_nodes, tear_down_all,
};
pub use logging::{init_console_logging, init_test_logging};
pub use sync::{JoinType, Satisfied, SyncController, SyncPoint, WaitOptions, join_nodes};
pub use wallet::MemWallet;
