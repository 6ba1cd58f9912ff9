//! Test setup facade
//!
//! `SimpleTestSetup` wires everything a test suite needs:
//! - one working directory for the whole run
//! - one port allocator, shared explicitly by every spawner so harnesses of
//!   different spawners can never collide
//! - one `ChainSpawner` per configured recipe (`simnet0`, `simnet00`, ...)
//! - a pool created with the default spawner and the others registered
//!
//! `tear_down` closes the pool (killing every node) before removing the
//! working directory those nodes were writing into. Dropping the setup
//! without calling `tear_down` still tears it down.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chain_params::ChainParams;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, SetupConfig};
use crate::error::DisposalError;
use crate::node::{ConsoleNodeFactory, RpcConnector, TestNodeFactory};
use crate::pool::{HarnessPool, Lease, PoolError, PoolResult};
use crate::ports::PortAllocator;
use crate::sim::{SimFailures, SimNetwork};
use crate::spawner::{ChainSpawner, SpawnerConfig};
use crate::wallet::TestWalletFactory;
use crate::workdir::WorkingDir;

/// Errors building a setup. Nothing created before the failure survives it.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create working directory: {0}")]
    WorkingDir(#[source] io::Error),

    #[error("warm-up failed: {source}")]
    WarmUp {
        #[source]
        source: PoolError,
        /// Failures while tearing down what warm-up had already created
        teardown: Option<DisposalError>,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// The assembled test environment.
pub struct SimpleTestSetup {
    pool: HarnessPool,
    spawners: BTreeMap<String, Arc<ChainSpawner>>,
    node_factory: Arc<dyn TestNodeFactory>,
    wallet_factory: Arc<dyn TestWalletFactory>,
    ports: Arc<PortAllocator>,
    params: ChainParams,
    working_dir: WorkingDir,
    torn_down: bool,
}

impl SimpleTestSetup {
    /// Build a setup from `config` and the given collaborators.
    pub fn setup(
        config: &SetupConfig,
        node_factory: Arc<dyn TestNodeFactory>,
        wallet_factory: Arc<dyn TestWalletFactory>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let params = config.chain_params()?;

        let working_dir = match &config.temp_root {
            Some(root) => WorkingDir::create_in(root, &config.working_dir_prefix),
            None => WorkingDir::create(&config.working_dir_prefix),
        }
        .map_err(SetupError::WorkingDir)?;

        let ports = Arc::new(PortAllocator::new(config.base_port, config.port_stride));
        let timeouts = config.timeouts.to_spawn_timeouts();

        let mut spawners = BTreeMap::new();
        for settings in &config.spawners {
            let spawner_config = SpawnerConfig {
                name: settings.name.clone(),
                working_dir: working_dir.path().to_path_buf(),
                debug_node_output: settings.debug_node_output,
                debug_wallet_output: settings.debug_wallet_output,
                num_mature_outputs: settings.num_mature_outputs,
                extra_args: settings.start_args()?,
                params: params.clone(),
                timeouts,
            };
            let spawner = ChainSpawner::new(
                spawner_config,
                Arc::clone(&ports),
                Arc::clone(&node_factory),
                Arc::clone(&wallet_factory),
            );
            spawners.insert(settings.name.clone(), Arc::new(spawner));
        }

        let default = spawners
            .get(&config.default_spawner)
            .cloned()
            .ok_or_else(|| PoolError::UnknownSpawner(config.default_spawner.clone()))?;
        let pool = HarnessPool::new(default);
        for (name, spawner) in &spawners {
            if *name != config.default_spawner {
                pool.register_spawner(Arc::clone(spawner))?;
            }
        }

        let mut setup = Self {
            pool,
            spawners,
            node_factory,
            wallet_factory,
            ports,
            params,
            working_dir,
            torn_down: false,
        };
        info!(
            dir = %setup.working_dir.path().display(),
            network = %setup.params,
            spawners = setup.spawners.len(),
            base_port = config.base_port,
            "test setup ready"
        );

        if let Err(source) = setup.warm_up(config.warm_harnesses) {
            let teardown = setup.tear_down().err();
            return Err(SetupError::WarmUp { source, teardown });
        }
        Ok(setup)
    }

    /// Setup backed by the in-process simulated node and wallet.
    pub fn simulated(config: &SetupConfig, failures: SimFailures) -> Result<(Self, SimNetwork), SetupError> {
        let network = SimNetwork::new();
        let setup = Self::setup(
            config,
            Arc::new(network.node_factory(failures.clone())),
            Arc::new(network.wallet_factory(failures)),
        )?;
        Ok((setup, network))
    }

    /// Setup launching `config.node_executable` as real node processes.
    pub fn console(
        config: &SetupConfig,
        connector: Arc<dyn RpcConnector>,
        wallet_factory: Arc<dyn TestWalletFactory>,
    ) -> Result<Self, SetupError> {
        let node_factory = ConsoleNodeFactory::new(config.node_executable.clone(), connector);
        Self::setup(config, Arc::new(node_factory), wallet_factory)
    }

    /// Pre-spawn `count` harnesses of the default spawner and park them idle
    fn warm_up(&self, count: u32) -> PoolResult<()> {
        let leases = (0..count)
            .map(|_| self.pool.checkout_default())
            .collect::<PoolResult<Vec<Lease>>>()?;
        for lease in leases {
            self.pool.checkin(lease)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &HarnessPool {
        &self.pool
    }

    pub fn spawner(&self, name: &str) -> Option<&Arc<ChainSpawner>> {
        self.spawners.get(name)
    }

    pub fn spawner_names(&self) -> impl Iterator<Item = &str> {
        self.spawners.keys().map(String::as_str)
    }

    /// Check out a harness from the named spawner
    pub fn checkout(&self, spawner: &str) -> PoolResult<Lease> {
        self.pool.checkout(spawner)
    }

    pub fn checkin(&self, lease: Lease) -> PoolResult<()> {
        self.pool.checkin(lease)
    }

    pub fn node_factory(&self) -> &Arc<dyn TestNodeFactory> {
        &self.node_factory
    }

    pub fn wallet_factory(&self) -> &Arc<dyn TestWalletFactory> {
        &self.wallet_factory
    }

    /// Port allocator shared by all spawners of this setup
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn working_dir(&self) -> &Path {
        self.working_dir.path()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Dispose every harness, then remove the working directory.
    ///
    /// Both steps always run; their failures are reported together. Only
    /// the first call does anything.
    pub fn tear_down(&mut self) -> Result<(), DisposalError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let mut errors = DisposalError::new();
        if let Err(e) = self.pool.close() {
            errors.extend(e);
        }
        if let Err(e) = self.working_dir.dispose() {
            errors.extend(e);
        }

        if errors.is_empty() {
            info!(dir = %self.working_dir.path().display(), "test setup torn down");
        } else {
            warn!(failures = errors.len(), error = %errors, "test setup torn down with failures");
        }
        errors.into_result()
    }
}

impl Drop for SimpleTestSetup {
    fn drop(&mut self) {
        if !self.torn_down {
            if let Err(e) = self.tear_down() {
                warn!(error = %e, "tear down on drop failed");
            }
        }
    }
}
