//! Setup configuration
//!
//! Configuration layers, lowest precedence first:
//! 1. Built-in defaults (`SetupConfig::default()`)
//! 2. A TOML file (`SetupConfig::load`)
//! 3. Command-line overrides applied by the binary
//!
//! Example:
//!
//! ```toml
//! base_port = 20000
//! network = "simnet"
//! default_spawner = "simnet0"
//!
//! [timeouts]
//! node_start_seconds = 30
//!
//! [[spawners]]
//! name = "simnet0"
//! num_mature_outputs = 0
//!
//! [spawners.extra_args]
//! txindex = true          # flag without value
//! debuglevel = "debug"    # flag with value
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chain_params::{ChainParams, UnknownNetwork};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::args::{ArgsError, StartArg, StartArgs};
use crate::node::DEFAULT_NODE_EXECUTABLE;
use crate::ports::{DEFAULT_BASE_PORT, MIN_PORT_STRIDE};
use crate::spawner::SpawnTimeouts;
use crate::workdir::DEFAULT_PREFIX;

/// Upper bound for the node-start and maturation timeouts (1 hour)
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Network(#[from] UnknownNetwork),

    #[error("spawner '{spawner}': {source}")]
    Args {
        spawner: String,
        #[source]
        source: ArgsError,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Value of one `extra_args` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// `true` adds a bare flag, `false` leaves it out
    Switch(bool),
    Number(i64),
    Text(String),
}

/// Timeout section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Maximum wait for node readiness (default: 30)
    pub node_start_seconds: u64,
    /// Maximum wait for mature outputs (default: 120)
    pub maturation_seconds: u64,
    /// First readiness/maturation poll delay (default: 50)
    pub poll_initial_millis: u64,
    /// Backoff ceiling (default: 1000)
    pub poll_max_millis: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            node_start_seconds: 30,
            maturation_seconds: 120,
            poll_initial_millis: 50,
            poll_max_millis: 1000,
        }
    }
}

impl TimeoutSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_start_seconds == 0 || self.node_start_seconds > MAX_TIMEOUT_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "node_start_seconds must be in (0, {}], got {}",
                MAX_TIMEOUT_SECONDS, self.node_start_seconds
            )));
        }
        if self.maturation_seconds == 0 || self.maturation_seconds > MAX_TIMEOUT_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "maturation_seconds must be in (0, {}], got {}",
                MAX_TIMEOUT_SECONDS, self.maturation_seconds
            )));
        }
        if self.poll_initial_millis == 0 {
            return Err(ConfigError::Invalid("poll_initial_millis must be > 0".to_string()));
        }
        if self.poll_max_millis < self.poll_initial_millis {
            return Err(ConfigError::Invalid(format!(
                "poll_max_millis ({}) must be >= poll_initial_millis ({})",
                self.poll_max_millis, self.poll_initial_millis
            )));
        }
        Ok(())
    }

    pub fn to_spawn_timeouts(&self) -> SpawnTimeouts {
        SpawnTimeouts {
            node_start: Duration::from_secs(self.node_start_seconds),
            maturation: Duration::from_secs(self.maturation_seconds),
            poll_initial: Duration::from_millis(self.poll_initial_millis),
            poll_max: Duration::from_millis(self.poll_max_millis),
        }
    }
}

/// One `[[spawners]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpawnerSettings {
    pub name: String,

    #[serde(default)]
    pub num_mature_outputs: u32,

    #[serde(default = "default_true")]
    pub debug_node_output: bool,

    #[serde(default = "default_true")]
    pub debug_wallet_output: bool,

    #[serde(default)]
    pub extra_args: BTreeMap<String, ArgValue>,
}

fn default_true() -> bool {
    true
}

impl SpawnerSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_mature_outputs: 0,
            debug_node_output: true,
            debug_wallet_output: true,
            extra_args: BTreeMap::new(),
        }
    }

    /// Typed form of `extra_args`
    pub fn start_args(&self) -> Result<StartArgs, ConfigError> {
        let args = self.extra_args.iter().filter_map(|(name, value)| match value {
            ArgValue::Switch(true) => Some(StartArg::flag(name.clone())),
            ArgValue::Switch(false) => None,
            ArgValue::Number(n) => Some(StartArg::with_value(name.clone(), n)),
            ArgValue::Text(text) => Some(StartArg::with_value(name.clone(), text)),
        });
        StartArgs::from_args(args).map_err(|source| ConfigError::Args {
            spawner: self.name.clone(),
            source,
        })
    }
}

/// Complete configuration for a `SimpleTestSetup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetupConfig {
    /// First port handed out (default: 20000)
    pub base_port: u16,

    /// Ports reserved per harness (default: 3)
    pub port_stride: u16,

    /// Name prefix of the setup's temporary directory
    pub working_dir_prefix: String,

    /// Parent of the temporary directory (default: system temp dir)
    pub temp_root: Option<PathBuf>,

    /// Network preset name (default: "simnet")
    pub network: String,

    /// Override of the preset's coinbase maturity
    pub coinbase_maturity: Option<u32>,

    /// Node binary for process-backed setups (default: "pfcd")
    pub node_executable: PathBuf,

    /// Spawner the pool is created with
    pub default_spawner: String,

    /// Harnesses to pre-spawn from the default spawner during setup
    pub warm_harnesses: u32,

    pub timeouts: TimeoutSettings,

    pub spawners: Vec<SpawnerSettings>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        let mut simnet0 = SpawnerSettings::new("simnet0");
        simnet0
            .extra_args
            .insert("txindex".to_string(), ArgValue::Switch(true));

        Self {
            base_port: DEFAULT_BASE_PORT,
            port_stride: MIN_PORT_STRIDE,
            working_dir_prefix: DEFAULT_PREFIX.to_string(),
            temp_root: None,
            network: "simnet".to_string(),
            coinbase_maturity: None,
            node_executable: PathBuf::from(DEFAULT_NODE_EXECUTABLE),
            default_spawner: "simnet0".to_string(),
            warm_harnesses: 0,
            timeouts: TimeoutSettings::default(),
            spawners: vec![simnet0, SpawnerSettings::new("simnet00")],
        }
    }
}

impl SetupConfig {
    /// Parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text; missing fields take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SetupConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate()?;

        if self.port_stride < MIN_PORT_STRIDE {
            return Err(ConfigError::Invalid(format!(
                "port_stride must be >= {}, got {}",
                MIN_PORT_STRIDE, self.port_stride
            )));
        }
        if self.base_port == 0 || u32::from(self.base_port) + u32::from(self.port_stride) - 1 > u32::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "base_port {} leaves no room for a block of {} ports",
                self.base_port, self.port_stride
            )));
        }

        self.chain_params()?;

        if self.spawners.is_empty() {
            return Err(ConfigError::Invalid("at least one spawner is required".to_string()));
        }
        let mut names = HashSet::new();
        for spawner in &self.spawners {
            let valid_name = !spawner.name.is_empty()
                && spawner
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid_name {
                return Err(ConfigError::Invalid(format!(
                    "spawner name '{}' must be non-empty and use only [A-Za-z0-9_-]",
                    spawner.name
                )));
            }
            if !names.insert(spawner.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate spawner name '{}'",
                    spawner.name
                )));
            }
            spawner.start_args()?;
        }
        if !names.contains(self.default_spawner.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "default_spawner '{}' is not defined",
                self.default_spawner
            )));
        }
        Ok(())
    }

    /// Network preset with the maturity override applied
    pub fn chain_params(&self) -> Result<ChainParams, ConfigError> {
        let params: ChainParams = self.network.parse()?;
        Ok(match self.coinbase_maturity {
            Some(maturity) => params.with_coinbase_maturity(maturity),
            None => params,
        })
    }

    pub fn spawner(&self, name: &str) -> Option<&SpawnerSettings> {
        self.spawners.iter().find(|s| s.name == name)
    }
}
