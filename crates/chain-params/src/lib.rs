//! Chain parameter presets
//!
//! A `ChainParams` value identifies the network a harness runs on. The
//! harness core never interprets it beyond two things:
//! - the command-line selector handed to the node (`--simnet`, `--regtest`, ...)
//! - the coinbase maturity depth, needed to decide when outputs are spendable
//!
//! Everything else is passed through to node and wallet factories unmodified.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default coinbase maturity shared by the bundled presets.
pub const DEFAULT_COINBASE_MATURITY: u32 = 100;

/// Block subsidy in atoms used by the bundled presets (50 coins).
pub const DEFAULT_BLOCK_SUBSIDY: u64 = 5_000_000_000;

/// Network identity for a harness node and wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainParams {
    /// Canonical network name (e.g. "simnet")
    pub name: String,

    /// Node command-line selector, without leading dashes.
    ///
    /// `None` means the node's default network needs no selector.
    pub net_flag: Option<String>,

    /// Number of blocks a coinbase output must be buried under before it
    /// can be spent.
    pub coinbase_maturity: u32,

    /// Coinbase subsidy per block, in atoms
    pub block_subsidy: u64,
}

impl ChainParams {
    /// Simulation network: private, instant difficulty, used by most tests.
    pub fn simnet() -> Self {
        Self {
            name: "simnet".to_string(),
            net_flag: Some("simnet".to_string()),
            coinbase_maturity: DEFAULT_COINBASE_MATURITY,
            block_subsidy: DEFAULT_BLOCK_SUBSIDY,
        }
    }

    /// Regression test network.
    pub fn regtest() -> Self {
        Self {
            name: "regtest".to_string(),
            net_flag: Some("regtest".to_string()),
            coinbase_maturity: DEFAULT_COINBASE_MATURITY,
            block_subsidy: DEFAULT_BLOCK_SUBSIDY,
        }
    }

    /// Public test network.
    pub fn testnet() -> Self {
        Self {
            name: "testnet".to_string(),
            net_flag: Some("testnet".to_string()),
            coinbase_maturity: DEFAULT_COINBASE_MATURITY,
            block_subsidy: DEFAULT_BLOCK_SUBSIDY,
        }
    }

    /// Same network with a different maturity depth.
    ///
    /// Useful for simulated backends where generating a hundred blocks per
    /// harness is wasted time.
    pub fn with_coinbase_maturity(mut self, maturity: u32) -> Self {
        self.coinbase_maturity = maturity;
        self
    }

    /// Names of the bundled presets
    pub fn known_networks() -> &'static [&'static str] {
        &["simnet", "regtest", "testnet"]
    }
}

impl fmt::Display for ChainParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Error parsing a network name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown network '{0}' (expected one of: simnet, regtest, testnet)")]
pub struct UnknownNetwork(pub String);

impl FromStr for ChainParams {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simnet" => Ok(Self::simnet()),
            "regtest" | "regnet" => Ok(Self::regtest()),
            "testnet" | "testnet3" => Ok(Self::testnet()),
            _ => Err(UnknownNetwork(s.to_string())),
        }
    }
}
