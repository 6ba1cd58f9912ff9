//! Simulated wallet

use tracing::debug;

use super::{SimFailures, SimNetwork};
use crate::wallet::{TestWallet, TestWalletFactory, WalletConfig, WalletError};

/// Produces `SimWallet`s that read chains from one `SimNetwork`.
#[derive(Debug, Clone)]
pub struct SimWalletFactory {
    network: SimNetwork,
    failures: SimFailures,
}

impl SimWalletFactory {
    pub fn new(network: SimNetwork, failures: SimFailures) -> Self {
        Self { network, failures }
    }
}

impl TestWalletFactory for SimWalletFactory {
    fn new_wallet(&self, config: WalletConfig) -> Result<Box<dyn TestWallet>, WalletError> {
        if let Some(message) = &self.failures.wallet_init_error {
            return Err(WalletError::Backend(message.clone()));
        }
        if self.network.height(config.node_rpc.port()).is_none() {
            return Err(WalletError::NodeUnreachable(config.node_rpc));
        }
        Ok(Box::new(SimWallet {
            network: self.network.clone(),
            address: format!("sim-{}", config.harness_id),
            config,
            sync_error: self.failures.wallet_sync_error.clone(),
            started: false,
            stopped: false,
            synced_height: 0,
            issued: 0,
        }))
    }
}

#[derive(Debug)]
pub struct SimWallet {
    network: SimNetwork,
    config: WalletConfig,
    address: String,
    sync_error: Option<String>,
    started: bool,
    stopped: bool,
    synced_height: u64,
    /// Receiving addresses handed out
    issued: u32,
}

impl SimWallet {
    fn port(&self) -> u16 {
        self.config.node_rpc.port()
    }

    fn ensure_active(&self) -> Result<(), WalletError> {
        if self.stopped {
            Err(WalletError::Stopped)
        } else if !self.started {
            Err(WalletError::NotStarted)
        } else {
            Ok(())
        }
    }
}

impl TestWallet for SimWallet {
    fn start(&mut self) -> Result<(), WalletError> {
        if self.stopped {
            return Err(WalletError::Stopped);
        }
        if self.network.height(self.port()).is_none() {
            return Err(WalletError::NodeUnreachable(self.config.node_rpc));
        }
        self.started = true;
        debug!(harness = %self.config.harness_id, address = %self.address, "simulated wallet started");
        Ok(())
    }

    fn mining_address(&self) -> String {
        self.address.clone()
    }

    fn new_address(&mut self) -> Result<String, WalletError> {
        self.ensure_active()?;
        self.issued += 1;
        Ok(format!("{}-{}", self.address, self.issued))
    }

    fn sync(&mut self) -> Result<u64, WalletError> {
        self.ensure_active()?;
        if let Some(message) = &self.sync_error {
            return Err(WalletError::Backend(message.clone()));
        }
        let height = self
            .network
            .height(self.port())
            .ok_or(WalletError::NodeUnreachable(self.config.node_rpc))?;
        self.synced_height = height;
        Ok(height)
    }

    fn mature_outputs(&mut self) -> Result<u32, WalletError> {
        self.ensure_active()?;
        let (address, tip) = (self.address.clone(), self.synced_height);
        self.network
            .with_chain(self.port(), |chain| chain.mature_outputs(&address, tip))
            .ok_or(WalletError::NodeUnreachable(self.config.node_rpc))
    }

    fn mature_balance(&mut self) -> Result<u64, WalletError> {
        let outputs = self.mature_outputs()?;
        let subsidy = self
            .network
            .with_chain(self.port(), |chain| chain.subsidy())
            .ok_or(WalletError::NodeUnreachable(self.config.node_rpc))?;
        Ok(u64::from(outputs) * subsidy)
    }

    fn stop(&mut self) -> Result<(), WalletError> {
        self.stopped = true;
        Ok(())
    }
}
