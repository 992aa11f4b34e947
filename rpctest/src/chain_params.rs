//! Chain parameters consumed by the harness.
//!
//! Supplied once at harness construction and never mutated afterwards.

use dashcore::Network;

/// Network-specific constants the wallet and lifecycle manager depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    /// Human readable network name, passed to the node as a flag.
    pub name: String,
    /// Network the wallet encodes and parses addresses for.
    pub network: Network,
    /// Confirmations a coinbase output needs before it may be spent.
    pub coinbase_maturity: u32,
    /// P2P port the node listens on when not told otherwise.
    pub default_p2p_port: u16,
    /// RPC port the node listens on when not told otherwise.
    pub default_rpc_port: u16,
}

impl ChainParams {
    /// Dash regression test network.
    pub fn regtest() -> Self {
        Self {
            name: "regtest".to_string(),
            network: Network::Regtest,
            coinbase_maturity: 100,
            default_p2p_port: 19899,
            default_rpc_port: 19898,
        }
    }

    /// Dash test network.
    pub fn testnet() -> Self {
        Self {
            name: "testnet".to_string(),
            network: Network::Testnet,
            coinbase_maturity: 100,
            default_p2p_port: 19999,
            default_rpc_port: 19998,
        }
    }

    /// Dash main network. Only useful for address encoding tests.
    pub fn mainnet() -> Self {
        Self {
            name: "mainnet".to_string(),
            network: Network::Dash,
            coinbase_maturity: 100,
            default_p2p_port: 9999,
            default_rpc_port: 9998,
        }
    }

    /// Override the coinbase maturity, for nodes started with a custom consensus rule.
    pub fn with_coinbase_maturity(mut self, maturity: u32) -> Self {
        self.coinbase_maturity = maturity;
        self
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::regtest()
    }
}
