//! Simulated node

use std::fs;
use std::net::SocketAddr;
use std::thread;

use serde_json::json;
use tracing::debug;

use super::{SimChain, SimFailures, SimNetwork};
use crate::node::{NodeConfig, NodeError, TestNode, TestNodeFactory};

/// Marker file written into the node data directory on start
pub const SIM_NODE_FILE: &str = "sim-node.json";

/// Produces `SimNode`s registered in one `SimNetwork`.
#[derive(Debug, Clone)]
pub struct SimNodeFactory {
    network: SimNetwork,
    failures: SimFailures,
}

impl SimNodeFactory {
    pub fn new(network: SimNetwork, failures: SimFailures) -> Self {
        Self { network, failures }
    }
}

impl TestNodeFactory for SimNodeFactory {
    fn new_node(&self, config: NodeConfig) -> Result<Box<dyn TestNode>, NodeError> {
        Ok(Box::new(SimNode {
            network: self.network.clone(),
            failures: self.failures.clone(),
            config,
            started: false,
            polls: 0,
        }))
    }
}

#[derive(Debug)]
pub struct SimNode {
    network: SimNetwork,
    failures: SimFailures,
    config: NodeConfig,
    started: bool,
    polls: u32,
}

impl SimNode {
    fn port(&self) -> u16 {
        self.config.ports.node_rpc
    }

    fn ensure_started(&self) -> Result<(), NodeError> {
        if self.started {
            Ok(())
        } else {
            Err(NodeError::NotStarted)
        }
    }
}

impl TestNode for SimNode {
    fn start(&mut self) -> Result<(), NodeError> {
        if self.started {
            return Ok(());
        }
        if let Some(delay) = self.failures.start_delay {
            thread::sleep(delay);
        }

        fs::create_dir_all(&self.config.data_dir)?;
        let marker = json!({
            "harness": self.config.harness_id,
            "network": self.config.params.name,
            "args": self.config.args,
            "ports": self.config.ports,
        });
        fs::write(
            self.config.data_dir.join(SIM_NODE_FILE),
            serde_json::to_vec_pretty(&marker).map_err(|e| NodeError::Spawn(e.to_string()))?,
        )?;

        let chain = SimChain::new(self.config.params.coinbase_maturity, self.config.params.block_subsidy);
        if !self.network.register(self.port(), chain) {
            return Err(NodeError::Spawn(format!("RPC port {} already in use", self.port())));
        }
        self.started = true;
        debug!(harness = %self.config.harness_id, port = self.port(), "simulated node started");
        Ok(())
    }

    fn poll_ready(&mut self) -> Result<bool, NodeError> {
        self.ensure_started()?;
        if self.failures.never_ready {
            return Ok(false);
        }
        self.polls += 1;
        Ok(self.polls > self.failures.ready_after_polls)
    }

    fn rpc_endpoint(&self) -> SocketAddr {
        self.config.rpc_endpoint()
    }

    fn generate(&mut self, blocks: u32, address: &str) -> Result<u64, NodeError> {
        self.ensure_started()?;
        let stall = self.failures.stall_at_height;
        self.network
            .with_chain(self.port(), |chain| {
                for _ in 0..blocks {
                    if stall.is_some_and(|limit| chain.height() >= limit) {
                        break;
                    }
                    chain.push_block(address);
                }
                chain.height()
            })
            .ok_or_else(|| NodeError::Exited("simulated chain is gone".to_string()))
    }

    fn best_height(&mut self) -> Result<u64, NodeError> {
        self.ensure_started()?;
        self.network
            .height(self.port())
            .ok_or_else(|| NodeError::Exited("simulated chain is gone".to_string()))
    }

    fn is_running(&mut self) -> bool {
        self.started && self.network.height(self.port()).is_some()
    }

    fn stop(&mut self) -> Result<(), NodeError> {
        if self.started {
            self.network.unregister(self.port());
            self.started = false;
            debug!(harness = %self.config.harness_id, "simulated node stopped");
        }
        Ok(())
    }
}

impl Drop for SimNode {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortAllocator;
    use chain_params::ChainParams;
    use tempfile::TempDir;

    fn config(dir: &TempDir, ports: &PortAllocator) -> NodeConfig {
        NodeConfig {
            harness_id: "sim-1".to_string(),
            args: vec!["--simnet".to_string()],
            data_dir: dir.path().join("data"),
            ports: ports.next().unwrap(),
            params: ChainParams::simnet().with_coinbase_maturity(2),
            debug_output: false,
        }
    }

    #[test]
    fn test_lifecycle_registers_and_unregisters() {
        let dir = TempDir::new().unwrap();
        let ports = PortAllocator::new(30_000, 3);
        let network = SimNetwork::new();
        let factory = network.node_factory(SimFailures::none().with_ready_after(2));

        let mut node = factory.new_node(config(&dir, &ports)).unwrap();
        assert!(matches!(node.poll_ready(), Err(NodeError::NotStarted)));
        node.start().unwrap();
        assert!(dir.path().join("data").join(SIM_NODE_FILE).is_file());
        assert_eq!(network.live_nodes(), 1);

        assert!(!node.poll_ready().unwrap());
        assert!(!node.poll_ready().unwrap());
        assert!(node.poll_ready().unwrap());

        assert_eq!(node.generate(4, "addr").unwrap(), 4);
        assert_eq!(node.best_height().unwrap(), 4);

        node.stop().unwrap();
        node.stop().unwrap();
        assert!(!node.is_running());
        assert_eq!(network.live_nodes(), 0);
    }

    #[test]
    fn test_stall_caps_height() {
        let dir = TempDir::new().unwrap();
        let ports = PortAllocator::new(30_100, 3);
        let network = SimNetwork::new();
        let factory = network.node_factory(SimFailures::stall_at(3));

        let mut node = factory.new_node(config(&dir, &ports)).unwrap();
        node.start().unwrap();
        assert_eq!(node.generate(10, "addr").unwrap(), 3);
        assert_eq!(node.generate(1, "addr").unwrap(), 3);
    }

    #[test]
    fn test_drop_unregisters() {
        let dir = TempDir::new().unwrap();
        let ports = PortAllocator::new(30_200, 3);
        let network = SimNetwork::new();
        {
            let mut node = network
                .node_factory(SimFailures::none())
                .new_node(config(&dir, &ports))
                .unwrap();
            node.start().unwrap();
            assert_eq!(network.live_nodes(), 1);
        }
        assert_eq!(network.live_nodes(), 0);
    }

    #[test]
    fn test_port_collision_fails_start() {
        let dir = TempDir::new().unwrap();
        let network = SimNetwork::new();
        let factory = network.node_factory(SimFailures::none());
        let ports = PortAllocator::new(30_300, 3);
        let cfg = config(&dir, &ports);

        let mut first = factory.new_node(cfg.clone()).unwrap();
        let mut second = factory.new_node(cfg).unwrap();
        first.start().unwrap();
        assert!(matches!(second.start(), Err(NodeError::Spawn(_))));
        // The failed node must not tear down the first one's chain
        drop(second);
        assert_eq!(network.live_nodes(), 1);
    }
}
