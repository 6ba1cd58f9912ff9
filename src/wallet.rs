//! Wallet collaborator interfaces
//!
//! The harness core never speaks a wallet protocol itself. It asks a
//! `TestWalletFactory` for a wallet bound to a node's RPC endpoint and then
//! only uses the handful of queries it needs to decide when a chain is
//! ready for tests.

use std::net::SocketAddr;
use std::path::PathBuf;

use chain_params::ChainParams;
use thiserror::Error;

/// Errors reported by wallet implementations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("node at {0} is unreachable")]
    NodeUnreachable(SocketAddr),

    #[error("wallet not started")]
    NotStarted,

    #[error("wallet already stopped")]
    Stopped,

    #[error("wallet backend error: {0}")]
    Backend(String),
}

/// Everything a factory needs to build a wallet for one harness.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Owning harness id, for logging and naming
    pub harness_id: String,
    /// RPC endpoint of the harness node
    pub node_rpc: SocketAddr,
    /// Port reserved for the wallet's own RPC listener
    pub wallet_rpc_port: u16,
    /// Directory the wallet may write into (inside the harness directory)
    pub data_dir: PathBuf,
    /// Network identity, passed through unmodified
    pub params: ChainParams,
    /// Forward wallet output to the log
    pub debug_output: bool,
}

/// A wallet bound to one node.
pub trait TestWallet: Send {
    /// Connect to the node and begin tracking the chain
    fn start(&mut self) -> Result<(), WalletError>;

    /// Address block rewards should be paid to
    fn mining_address(&self) -> String;

    /// Fresh receiving address
    fn new_address(&mut self) -> Result<String, WalletError>;

    /// Catch up with the node's current tip; returns the synced height
    fn sync(&mut self) -> Result<u64, WalletError>;

    /// Number of coinbase outputs owned by the wallet that are past the
    /// maturity depth
    fn mature_outputs(&mut self) -> Result<u32, WalletError>;

    /// Spendable balance in atoms
    fn mature_balance(&mut self) -> Result<u64, WalletError>;

    /// Release any resources. Must be safe to call more than once.
    fn stop(&mut self) -> Result<(), WalletError>;
}

/// Produces wallets on request.
pub trait TestWalletFactory: Send + Sync {
    fn new_wallet(&self, config: WalletConfig) -> Result<Box<dyn TestWallet>, WalletError>;
}
