//! Node process control.
//!
//! [`NodeControl`] is the seam between the lifecycle manager and whatever runs
//! the node. [`ProcessNodeControl`] launches real `dashd` processes with
//! `tokio::process`; tests use [`crate::test_utils::MockNode`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell, oneshot, watch};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult, RpcResult};
use crate::rpc::RpcClient;

/// Environment variable naming the node binary.
pub const DASHD_PATH_ENV: &str = "DASHD_PATH";

/// Identity of a launched node process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Unique within the control that issued it.
    pub id: u64,
    /// OS process id, when there is one.
    pub pid: Option<u32>,
    /// Address other nodes use to peer with this one.
    pub p2p_addr: SocketAddr,
    pub config: NodeConfig,
}

/// How a node process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub detail: String,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {} ({})", code, self.detail),
            None => write!(f, "terminated ({})", self.detail),
        }
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            detail: status.to_string(),
        }
    }
}

/// Launches and supervises node processes.
#[async_trait]
pub trait NodeControl: Send + Sync {
    /// Spawns a node. Returns as soon as the process exists; it may not answer RPC yet.
    async fn start(&self, config: &NodeConfig) -> NodeResult<ProcessHandle>;

    /// Requests a graceful shutdown without waiting for the process to exit.
    async fn stop(&self, process: &ProcessHandle) -> NodeResult<()>;

    /// Terminates the process immediately.
    async fn kill(&self, process: &ProcessHandle) -> NodeResult<()>;

    async fn is_alive(&self, process: &ProcessHandle) -> bool;

    /// Exit information once the process has ended.
    async fn exit_status(&self, process: &ProcessHandle) -> Option<ExitInfo>;

    /// Opens an RPC client for the process. Fails while the node is not yet reachable.
    async fn connect_rpc(&self, process: &ProcessHandle) -> RpcResult<Arc<dyn RpcClient>>;
}

/// Opens RPC clients for real node processes.
#[async_trait]
pub trait RpcConnector: Send + Sync {
    async fn connect(&self, config: &NodeConfig) -> RpcResult<Arc<dyn RpcClient>>;
}

static EXECUTABLE: OnceCell<PathBuf> = OnceCell::const_new();

/// Path of the node binary, resolved once per process.
///
/// Concurrent first callers wait for a single resolution.
pub async fn executable_path() -> NodeResult<PathBuf> {
    executable_path_with(|| async { locate_executable() }).await
}

/// Like [`executable_path`] with a custom resolver, which runs at most once
/// per process.
pub async fn executable_path_with<F, Fut>(resolve: F) -> NodeResult<PathBuf>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = NodeResult<PathBuf>>,
{
    EXECUTABLE
        .get_or_try_init(|| async {
            let path = resolve().await?;
            tracing::info!("Using node executable {:?}", path);
            Ok(path)
        })
        .await
        .cloned()
}

fn locate_executable() -> NodeResult<PathBuf> {
    if let Some(path) = std::env::var_os(DASHD_PATH_ENV) {
        let path = PathBuf::from(path);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(NodeError::Executable(format!("{DASHD_PATH_ENV} points to missing file {path:?}")))
        };
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).map(|dir| dir.join("dashd")).find(|path| path.is_file())
        })
        .ok_or_else(|| NodeError::Executable(format!("dashd not found; set {DASHD_PATH_ENV}")))
}

struct ManagedProcess {
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

/// Runs nodes as child processes.
pub struct ProcessNodeControl {
    connector: Arc<dyn RpcConnector>,
    processes: Mutex<HashMap<u64, ManagedProcess>>,
    next_id: AtomicU64,
}

impl ProcessNodeControl {
    pub fn new(connector: Arc<dyn RpcConnector>) -> Self {
        Self {
            connector,
            processes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn resolve_executable(config: &NodeConfig) -> NodeResult<PathBuf> {
        match &config.executable {
            Some(path) => Ok(path.clone()),
            None => executable_path().await,
        }
    }

    async fn exit_receiver(
        &self,
        process: &ProcessHandle,
    ) -> NodeResult<watch::Receiver<Option<ExitInfo>>> {
        let processes = self.processes.lock().await;
        processes
            .get(&process.id)
            .map(|managed| managed.exit.clone())
            .ok_or(NodeError::UnknownProcess(process.id))
    }
}

fn ensure_data_dir(path: &Path) -> NodeResult<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[async_trait]
impl NodeControl for ProcessNodeControl {
    async fn start(&self, config: &NodeConfig) -> NodeResult<ProcessHandle> {
        let executable = Self::resolve_executable(config).await?;
        ensure_data_dir(&config.data_dir)?;

        tracing::info!("Starting node...");
        tracing::info!("  Binary: {:?}", executable);
        tracing::info!("  Datadir: {:?}", config.data_dir);
        tracing::info!("  P2P: {}", config.listen);
        tracing::info!("  RPC: {}", config.rpc_listen);

        let mut child = Command::new(&executable)
            .args(config.args())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!("dashd stderr: {}", line);
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Owns the child until it exits, publishing the exit status.
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("failed to kill node process {}: {}", id, e);
                    }
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo::from(status),
                Err(e) => ExitInfo {
                    code: None,
                    detail: format!("wait failed: {e}"),
                },
            };
            tracing::debug!("node process {} exited: {}", id, info);
            let _ = exit_tx.send(Some(info));
        });

        self.processes.lock().await.insert(
            id,
            ManagedProcess {
                kill: Some(kill_tx),
                exit: exit_rx,
            },
        );

        Ok(ProcessHandle {
            id,
            pid,
            p2p_addr: config.listen,
            config: config.clone(),
        })
    }

    async fn stop(&self, process: &ProcessHandle) -> NodeResult<()> {
        self.exit_receiver(process).await?;
        // dashd shuts down cleanly on the `stop` RPC.
        match self.connect_rpc(process).await {
            Ok(rpc) => {
                if let Err(e) = rpc.stop_node().await {
                    tracing::debug!("stop request to node process {} failed: {}", process.id, e);
                }
            }
            Err(e) => tracing::debug!("cannot reach node process {} to stop it: {}", process.id, e),
        }
        Ok(())
    }

    async fn kill(&self, process: &ProcessHandle) -> NodeResult<()> {
        let mut processes = self.processes.lock().await;
        let managed = processes.get_mut(&process.id).ok_or(NodeError::UnknownProcess(process.id))?;
        if let Some(kill) = managed.kill.take() {
            let _ = kill.send(());
        }
        Ok(())
    }

    async fn is_alive(&self, process: &ProcessHandle) -> bool {
        match self.exit_receiver(process).await {
            Ok(exit) => exit.borrow().is_none(),
            Err(_) => false,
        }
    }

    async fn exit_status(&self, process: &ProcessHandle) -> Option<ExitInfo> {
        self.exit_receiver(process).await.ok().and_then(|exit| exit.borrow().clone())
    }

    async fn connect_rpc(&self, process: &ProcessHandle) -> RpcResult<Arc<dyn RpcClient>> {
        self.connector.connect(&process.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_params::ChainParams;
    use crate::error::RpcError;
    use std::time::Duration;

    struct Refusing;

    #[async_trait]
    impl RpcConnector for Refusing {
        async fn connect(&self, _config: &NodeConfig) -> RpcResult<Arc<dyn RpcClient>> {
            Err(RpcError::Connection("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn executable_resolved_once() {
        let first = executable_path_with(|| async { Ok(PathBuf::from("/opt/dash/bin/dashd")) })
            .await
            .unwrap();
        let second = executable_path_with(|| async {
            Err(NodeError::Executable("resolver ran twice".to_string()))
        })
        .await
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exit_info_display() {
        let exit = ExitInfo {
            code: Some(1),
            detail: "exit status: 1".to_string(),
        };
        assert!(!exit.success());
        assert_eq!(exit.to_string(), "exit code 1 (exit status: 1)");
    }

    #[tokio::test]
    async fn unknown_process_rejected() {
        let control = ProcessNodeControl::new(Arc::new(Refusing));
        let config = NodeConfig::new(&ChainParams::regtest(), "/tmp/unused");
        let process = ProcessHandle {
            id: 42,
            pid: None,
            p2p_addr: config.listen,
            config,
        };
        assert!(matches!(control.kill(&process).await, Err(NodeError::UnknownProcess(42))));
        assert!(matches!(control.stop(&process).await, Err(NodeError::UnknownProcess(42))));
        assert!(!control.is_alive(&process).await);
        assert_eq!(control.exit_status(&process).await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::ephemeral(&ChainParams::regtest(), dir.path().join("node"))
            .unwrap()
            .with_executable("/bin/false");
        let control = ProcessNodeControl::new(Arc::new(Refusing));

        let process = control.start(&config).await.unwrap();
        assert!(dir.path().join("node").is_dir());

        let exit = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(exit) = control.exit_status(&process).await {
                    return exit;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(exit.code, Some(1));
        assert!(!control.is_alive(&process).await);
        assert!(matches!(control.connect_rpc(&process).await, Err(RpcError::Connection(_))));
    }
}
