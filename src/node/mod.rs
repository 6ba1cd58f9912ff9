//! Node collaborator interfaces
//!
//! A `TestNodeFactory` turns a `NodeConfig` (argv, data directory, ports,
//! network) into a `TestNode` handle. The handle owns whatever backs the
//! node (an OS process for `ConsoleNode`, shared memory for the simulated
//! backend) and must release it on `stop` and on drop.
//!
//! Block generation goes through the node's RPC interface, which this crate
//! treats as opaque: process-backed nodes get their RPC client from an
//! injected `RpcConnector`.

mod console;

pub use console::{ConsoleNode, ConsoleNodeFactory, DEFAULT_NODE_EXECUTABLE};

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;

use chain_params::ChainParams;
use thiserror::Error;

use crate::ports::PortBlock;

/// Errors reported by node handles and factories
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to launch node: {0}")]
    Spawn(String),

    #[error("node exited unexpectedly: {0}")]
    Exited(String),

    #[error("node not started")]
    NotStarted,

    #[error("node RPC not connected")]
    NotConnected,

    #[error("node RPC error: {0}")]
    Rpc(String),

    #[error("failed to stop node: {0}")]
    Stop(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Everything a factory needs to launch one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Owning harness id, for logging and naming
    pub harness_id: String,
    /// Fully assembled command-line arguments
    pub args: Vec<String>,
    /// Node data directory (inside the harness directory)
    pub data_dir: PathBuf,
    /// Ports reserved for this harness
    pub ports: PortBlock,
    /// Network identity, passed through unmodified
    pub params: ChainParams,
    /// Forward node stdout/stderr to the log
    pub debug_output: bool,
}

impl NodeConfig {
    /// Loopback address of the node's RPC listener
    pub fn rpc_endpoint(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.ports.node_rpc))
    }
}

/// A running (or startable) node owned by exactly one harness.
pub trait TestNode: Send {
    /// Launch the node. Calling `start` on a started node is a no-op.
    fn start(&mut self) -> Result<(), NodeError>;

    /// One readiness check.
    ///
    /// `Ok(false)` means "not yet"; an error means the node can never become
    /// ready (e.g. the process exited).
    fn poll_ready(&mut self) -> Result<bool, NodeError>;

    /// Address of the node's RPC interface
    fn rpc_endpoint(&self) -> SocketAddr;

    /// Mine `blocks` blocks paying `address`; returns the new tip height
    fn generate(&mut self, blocks: u32, address: &str) -> Result<u64, NodeError>;

    /// Current tip height
    fn best_height(&mut self) -> Result<u64, NodeError>;

    /// True while the backing process (or simulation) is alive
    fn is_running(&mut self) -> bool;

    /// OS process id, when backed by a process
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Terminate the node. Must be safe to call more than once.
    fn stop(&mut self) -> Result<(), NodeError>;
}

/// Produces node handles on request.
pub trait TestNodeFactory: Send + Sync {
    fn new_node(&self, config: NodeConfig) -> Result<Box<dyn TestNode>, NodeError>;
}

/// RPC client for a running node.
pub trait NodeRpc: Send {
    fn generate(&mut self, blocks: u32, address: &str) -> Result<u64, NodeError>;
    fn best_height(&mut self) -> Result<u64, NodeError>;
}

/// Opens RPC clients against process-backed nodes.
pub trait RpcConnector: Send + Sync {
    fn connect(&self, config: &NodeConfig) -> Result<Box<dyn NodeRpc>, NodeError>;
}
