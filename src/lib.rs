//! Coin Harness - node/wallet test harness pool
//!
//! This crate runs blockchain node + wallet pairs ("harnesses") for
//! integration tests. It allocates non-colliding ports, isolates every
//! harness in its own directory under one temporary tree, reuses harnesses
//! across tests through a pool, and guarantees that every process and
//! directory is released on teardown.
//!
//! The node binary and wallet are opaque collaborators supplied through
//! `TestNodeFactory` and `TestWalletFactory`.

pub mod args;
pub mod config;
pub mod error;
pub mod harness;
pub mod node;
pub mod pool;
pub mod ports;
pub mod setup;
pub mod sim;
pub mod spawner;
pub mod wallet;
pub mod workdir;

pub use args::{StartArg, StartArgs};
pub use chain_params::ChainParams;
pub use config::SetupConfig;
pub use error::{DisposalError, DisposalFailure, HarnessError, HarnessResult};
pub use harness::{Harness, HarnessId, HarnessState};
pub use node::{TestNode, TestNodeFactory};
pub use pool::{HarnessPool, Lease, PoolError};
pub use ports::{PortAllocator, PortBlock};
pub use setup::{SetupError, SimpleTestSetup};
pub use spawner::{CancelToken, ChainSpawner, SpawnTimeouts, SpawnerConfig};
pub use wallet::{TestWallet, TestWalletFactory};
pub use workdir::WorkingDir;
