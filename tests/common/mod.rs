//! Shared helpers for harness integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use coin_harness::config::{SetupConfig, SpawnerSettings, TimeoutSettings};
use coin_harness::sim::{SimFailures, SimNetwork};
use coin_harness::{ChainParams, ChainSpawner, PortAllocator, SpawnTimeouts, SpawnerConfig};
use tempfile::TempDir;

/// Maturity used by simulated chains in tests
pub const TEST_MATURITY: u32 = 4;

/// Timeouts short enough for failure tests to finish quickly
pub fn fast_timeouts() -> SpawnTimeouts {
    SpawnTimeouts {
        node_start: Duration::from_millis(400),
        maturation: Duration::from_millis(400),
        poll_initial: Duration::from_millis(5),
        poll_max: Duration::from_millis(25),
    }
}

pub fn test_params() -> ChainParams {
    ChainParams::simnet().with_coinbase_maturity(TEST_MATURITY)
}

/// Spawner on the simulated backend with its own port allocator
pub fn sim_spawner(
    root: &TempDir,
    network: &SimNetwork,
    failures: SimFailures,
    name: &str,
    mature_outputs: u32,
    base_port: u16,
) -> Arc<ChainSpawner> {
    let config = SpawnerConfig::new(name, root.path(), test_params())
        .with_mature_outputs(mature_outputs)
        .with_timeouts(fast_timeouts());
    Arc::new(ChainSpawner::new(
        config,
        Arc::new(PortAllocator::new(base_port, 3)),
        Arc::new(network.node_factory(failures.clone())),
        Arc::new(network.wallet_factory(failures)),
    ))
}

/// Setup config rooted in `root` with small maturity and short timeouts
pub fn fast_config(root: &TempDir, base_port: u16) -> SetupConfig {
    let mut mature = SpawnerSettings::new("mature5");
    mature.num_mature_outputs = 5;

    let mut config = SetupConfig {
        base_port,
        temp_root: Some(root.path().to_path_buf()),
        coinbase_maturity: Some(TEST_MATURITY),
        timeouts: TimeoutSettings {
            node_start_seconds: 1,
            maturation_seconds: 1,
            poll_initial_millis: 5,
            poll_max_millis: 25,
        },
        ..SetupConfig::default()
    };
    config.spawners.push(mature);
    config
}

/// Entries directly under `root`
pub fn entries(root: &TempDir) -> usize {
    std::fs::read_dir(root.path()).map(|d| d.count()).unwrap_or(0)
}
