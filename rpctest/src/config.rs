//! Configuration for harnessed nodes.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::time::Duration;

use crate::chain_params::ChainParams;
use crate::sync::WaitOptions;

/// How a single node process is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Node binary. `None` resolves it through [`crate::node::executable_path`].
    pub executable: Option<PathBuf>,

    /// Data directory handed to the node.
    pub data_dir: PathBuf,

    /// P2P listen address.
    pub listen: SocketAddr,

    /// RPC listen address.
    pub rpc_listen: SocketAddr,

    pub rpc_user: String,

    pub rpc_password: String,

    /// Network name passed as `-<network>`.
    pub network: String,

    /// Additional command line arguments.
    pub extra_args: Vec<String>,
}

impl NodeConfig {
    /// Configuration listening on the network's default ports.
    pub fn new(params: &ChainParams, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: None,
            data_dir: data_dir.into(),
            listen: local_addr(params.default_p2p_port),
            rpc_listen: local_addr(params.default_rpc_port),
            rpc_user: "user".to_string(),
            rpc_password: "pass".to_string(),
            network: params.name.clone(),
            extra_args: Vec::new(),
        }
    }

    /// Configuration on two loopback ports that are free right now.
    ///
    /// The ports are released before the node binds them, so another process may
    /// still take one in between.
    pub fn ephemeral(params: &ChainParams, data_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let p2p = TcpListener::bind(local_addr(0))?;
        let rpc = TcpListener::bind(local_addr(0))?;
        Ok(Self::new(params, data_dir)
            .with_listen(p2p.local_addr()?)
            .with_rpc_listen(rpc.local_addr()?))
    }

    /// Set the node binary.
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the P2P listen address.
    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    /// Set the RPC listen address.
    pub fn with_rpc_listen(mut self, addr: SocketAddr) -> Self {
        self.rpc_listen = addr;
        self
    }

    /// Append a command line argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Full argument list for the node process.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-{}", self.network),
            format!("-datadir={}", self.data_dir.display()),
            format!("-port={}", self.listen.port()),
            format!("-rpcport={}", self.rpc_listen.port()),
            format!("-rpcuser={}", self.rpc_user),
            format!("-rpcpassword={}", self.rpc_password),
            "-listen".to_string(),
            "-server".to_string(),
            "-txindex".to_string(),
            "-debug".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Configuration for a harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Network constants shared by the node and the wallet.
    pub params: ChainParams,

    /// Node process settings, used verbatim.
    ///
    /// `None` gives every harness a private temporary data directory, removed at
    /// teardown, and free loopback ports.
    pub node: Option<NodeConfig>,

    /// Longest time to wait for a freshly started node to answer RPC.
    pub startup_timeout: Duration,

    /// First delay between startup connection attempts.
    pub startup_backoff_initial: Duration,

    /// Upper bound on the delay between startup connection attempts.
    pub startup_backoff_max: Duration,

    /// How long a node may take to exit after a graceful stop before it is killed.
    pub stop_grace_period: Duration,

    /// Default timeout for sync points.
    pub sync_timeout: Duration,

    /// Default interval between sync point polls.
    pub poll_interval: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new(ChainParams::regtest())
    }
}

impl HarnessConfig {
    /// Create a configuration for the given network.
    pub fn new(params: ChainParams) -> Self {
        Self {
            node: None,
            params,
            startup_timeout: Duration::from_secs(30),
            startup_backoff_initial: Duration::from_millis(100),
            startup_backoff_max: Duration::from_secs(2),
            stop_grace_period: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Create a configuration for regtest.
    pub fn regtest() -> Self {
        Self::new(ChainParams::regtest())
    }

    /// Set node process settings. The data directory is left in place at teardown.
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = Some(node);
        self
    }

    /// Set startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set startup backoff bounds.
    pub fn with_startup_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.startup_backoff_initial = initial;
        self.startup_backoff_max = max;
        self
    }

    /// Set stop grace period.
    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Set the default sync timeout.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Set the default poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait options built from the sync defaults.
    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions::new(self.sync_timeout, self.poll_interval)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.startup_timeout.is_zero() {
            return Err("startup_timeout must be > 0".to_string());
        }

        if self.startup_backoff_initial.is_zero() {
            return Err("startup_backoff_initial must be > 0".to_string());
        }

        if self.startup_backoff_initial > self.startup_backoff_max {
            return Err("startup_backoff_initial must not exceed startup_backoff_max".to_string());
        }

        if self.poll_interval.is_zero() {
            return Err("poll_interval must be > 0".to_string());
        }

        if self.poll_interval > self.sync_timeout {
            return Err("poll_interval must not exceed sync_timeout".to_string());
        }

        if let Some(node) = &self.node {
            if node.listen == node.rpc_listen {
                return Err(format!("P2P and RPC both listen on {}", node.listen));
            }

            if node.network != self.params.name {
                return Err(format!(
                    "node network {} does not match chain parameters {}",
                    node.network, self.params.name
                ));
            }
        }

        Ok(())
    }
}
