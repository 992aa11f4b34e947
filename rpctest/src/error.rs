//! Error types for the RPC test harness.

use std::io;
use std::time::Duration;

use dashcore::consensus::encode;
use dashcore::{Address, OutPoint, Txid};
use thiserror::Error;

/// Main error type for the RPC test harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),
}

/// Errors raised by the in-memory wallet.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Invalid seed: expected {expected} bytes, got {actual}")]
    InvalidSeed {
        expected: usize,
        actual: usize,
    },

    #[error("Key derivation failed at index {index}: {reason}")]
    KeyDerivation {
        index: u32,
        reason: String,
    },

    #[error("Address {0} was not produced by this wallet")]
    UnknownAddress(Address),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        available: u64,
        required: u64,
    },

    #[error("Output {0} is already spent")]
    OutputAlreadySpent(OutPoint),

    #[error("Output {0} is not tracked by the ledger")]
    UnknownOutput(OutPoint),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("No outputs provided")]
    NoOutputs,

    #[error("Transaction {txid} rejected by node: {source}")]
    Broadcast {
        txid: Txid,
        #[source]
        source: RpcError,
    },

    #[error("Wallet is not attached to a node")]
    NotAttached,
}

/// Synchronization errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The condition did not hold before the deadline. The node is left untouched.
    #[error(
        "Timed out after {waited:?} waiting for {condition}{}",
        describe_last_error(.last_error)
    )]
    TimedOut {
        condition: String,
        waited: Duration,
        last_error: Option<String>,
    },

    #[error("No nodes to synchronize")]
    NoNodes,

    /// A request that is not retried failed.
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Wallet refresh failed: {0}")]
    Wallet(String),
}

fn describe_last_error(last_error: &Option<String>) -> String {
    last_error.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default()
}

impl SyncError {
    /// Returns a static string representing the error category.
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::TimedOut {
                ..
            } => "timeout",
            SyncError::NoNodes => "state",
            SyncError::Rpc(_) => "rpc",
            SyncError::Wallet(_) => "wallet",
        }
    }
}

/// Node lifecycle errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Node {node} did not become reachable within {waited:?}: {last_error}")]
    StartupTimeout {
        node: u32,
        waited: Duration,
        last_error: String,
    },

    #[error("Node {node} crashed: {exit}")]
    Crashed {
        node: u32,
        exit: String,
    },

    #[error("Node {0} is not running")]
    NotRunning(u32),

    #[error("Node {0} was already started")]
    AlreadyStarted(u32),

    #[error("Failed to spawn node process: {0}")]
    Spawn(#[from] io::Error),

    #[error("Node executable unavailable: {0}")]
    Executable(String),

    #[error("Unknown process {0}")]
    UnknownProcess(u64),
}

/// Errors reported by an RPC client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Chain notification stream closed")]
    NotificationsClosed,

    #[error("Unsupported request: {0}")]
    Unsupported(String),

    #[error("Malformed payload: {0}")]
    Decode(String),
}

impl From<encode::Error> for RpcError {
    fn from(err: encode::Error) -> Self {
        RpcError::Decode(err.to_string())
    }
}

/// Type alias for Result with HarnessError.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Type alias for logging results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;

/// Type alias for wallet operation results.
pub type WalletResult<T> = std::result::Result<T, WalletError>;

/// Type alias for sync operation results.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Type alias for node lifecycle results.
pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// Type alias for RPC results.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use dashcore::hashes::Hash;

    use super::*;

    #[test]
    fn timed_out_message_includes_last_error() {
        let err = SyncError::TimedOut {
            condition: "height >= 50".to_string(),
            waited: Duration::from_secs(30),
            last_error: Some("Connection failed: refused".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("height >= 50"));
        assert!(msg.contains("refused"));
        assert_eq!(err.category(), "timeout");
    }

    #[test]
    fn broadcast_error_keeps_source() {
        use std::error::Error as _;
        let err = WalletError::Broadcast {
            txid: Txid::all_zeros(),
            source: RpcError::Rejected("bad-txns-inputs-missingorspent".into()),
        };
        assert!(err.source().is_some());
        let harness: HarnessError = err.into();
        assert!(matches!(harness, HarnessError::Wallet(WalletError::Broadcast { .. })));
    }
}
