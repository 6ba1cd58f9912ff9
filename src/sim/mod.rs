//! Simulated node and wallet backend
//!
//! An in-process stand-in for a real node binary and wallet, used by the
//! smoke command and by tests. Nodes register a chain in a shared
//! `SimNetwork` keyed by their RPC port, so:
//! - two nodes started on the same port collide, just like real listeners
//! - wallets find their node through the RPC endpoint they are given
//! - `live_nodes()` tells tests whether anything was leaked
//!
//! Failure injection (`SimFailures`) covers the error paths of spawning:
//! nodes that never become ready, chains that stop growing, and wallets
//! that refuse to initialise.

mod failure;
mod node;
mod wallet;

pub use failure::SimFailures;
pub use node::{SimNode, SimNodeFactory, SIM_NODE_FILE};
pub use wallet::{SimWallet, SimWalletFactory};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Chain kept by one simulated node.
#[derive(Debug, Clone)]
pub struct SimChain {
    /// Coinbase recipient per height; index 0 is genesis (no recipient)
    coinbase: Vec<Option<String>>,
    maturity: u32,
    subsidy: u64,
}

impl SimChain {
    fn new(maturity: u32, subsidy: u64) -> Self {
        Self {
            coinbase: vec![None],
            maturity,
            subsidy,
        }
    }

    pub fn height(&self) -> u64 {
        (self.coinbase.len() - 1) as u64
    }

    fn push_block(&mut self, address: &str) {
        self.coinbase.push(Some(address.to_string()));
    }

    /// Coinbase outputs paying `address` that are buried at least
    /// `maturity` blocks deep as seen from `tip`.
    pub fn mature_outputs(&self, address: &str, tip: u64) -> u32 {
        let tip = tip.min(self.height());
        let count = self
            .coinbase
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(height, owner)| {
                owner.as_deref() == Some(address) && *height as u64 + u64::from(self.maturity) <= tip
            })
            .count();
        count as u32
    }

    pub fn subsidy(&self) -> u64 {
        self.subsidy
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    /// Chains by node RPC port
    chains: HashMap<u16, SimChain>,
    started_total: u64,
}

/// Shared registry of simulated nodes.
#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Node factory bound to this network
    pub fn node_factory(&self, failures: SimFailures) -> SimNodeFactory {
        SimNodeFactory::new(self.clone(), failures)
    }

    /// Wallet factory bound to this network
    pub fn wallet_factory(&self, failures: SimFailures) -> SimWalletFactory {
        SimWalletFactory::new(self.clone(), failures)
    }

    /// Nodes currently running
    pub fn live_nodes(&self) -> usize {
        self.lock().chains.len()
    }

    /// Nodes ever started
    pub fn started_total(&self) -> u64 {
        self.lock().started_total
    }

    /// Tip height of the node listening on `rpc_port`
    pub fn height(&self, rpc_port: u16) -> Option<u64> {
        self.lock().chains.get(&rpc_port).map(SimChain::height)
    }

    /// Make the node on `rpc_port` vanish as if its process died. Its
    /// handle still believes it is started.
    pub fn crash(&self, rpc_port: u16) -> bool {
        let crashed = self.unregister(rpc_port);
        if crashed {
            debug!(port = rpc_port, "simulated node crashed");
        }
        crashed
    }

    fn register(&self, rpc_port: u16, chain: SimChain) -> bool {
        let mut state = self.lock();
        if state.chains.contains_key(&rpc_port) {
            return false;
        }
        state.chains.insert(rpc_port, chain);
        state.started_total += 1;
        true
    }

    fn unregister(&self, rpc_port: u16) -> bool {
        self.lock().chains.remove(&rpc_port).is_some()
    }

    fn with_chain<T>(&self, rpc_port: u16, f: impl FnOnce(&mut SimChain) -> T) -> Option<T> {
        self.lock().chains.get_mut(&rpc_port).map(f)
    }
}
