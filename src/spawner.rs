//! Harness spawner
//!
//! A `ChainSpawner` is a reusable recipe: every `spawn` produces a new
//! harness with the same network and maturity target but its own ports and
//! directory. Spawning:
//! 1. reserve a port block from the shared allocator
//! 2. create `<working_dir>/<spawner>/<harness-id>`
//! 3. launch the node with default arguments overridden by the extra ones
//! 4. poll readiness with exponential backoff until `node_start` elapses
//! 5. build and start the wallet against the node's RPC endpoint
//! 6. mine `coinbase_maturity + num_mature_outputs` blocks to the wallet and
//!    wait until it reports the mature outputs, bounded by `maturation`
//!
//! Whatever was created before a failure (node, wallet, directory) is owned
//! by the harness under construction and released before the error is
//! returned, including when the caller cancels or the spawning thread
//! unwinds. A successful spawn returns the harness in IDLE.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chain_params::ChainParams;
use tracing::{debug, info, warn};

use crate::args::{StartArg, StartArgs};
use crate::error::{HarnessError, HarnessResult};
use crate::harness::{remove_dir, Harness, HarnessId, HarnessState};
use crate::node::{NodeConfig, TestNode, TestNodeFactory};
use crate::ports::{PortAllocator, PortBlock};
use crate::wallet::{TestWallet, TestWalletFactory, WalletConfig, WalletError};

/// Blocks requested per generate call while maturing
const GENERATE_BATCH: u32 = 25;

/// Bounds for every blocking wait inside `spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnTimeouts {
    /// Maximum time for the node to become ready
    pub node_start: Duration,
    /// Maximum time to reach the mature-output target
    pub maturation: Duration,
    /// First poll delay
    pub poll_initial: Duration,
    /// Poll delay ceiling for the exponential backoff
    pub poll_max: Duration,
}

impl Default for SpawnTimeouts {
    fn default() -> Self {
        Self {
            node_start: Duration::from_secs(30),
            maturation: Duration::from_secs(120),
            poll_initial: Duration::from_millis(50),
            poll_max: Duration::from_secs(1),
        }
    }
}

/// Doubling poll delay capped at `max`.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    next: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    fn new(timeouts: &SpawnTimeouts) -> Self {
        Self {
            next: timeouts.poll_initial,
            initial: timeouts.poll_initial,
            max: timeouts.poll_max.max(timeouts.poll_initial),
        }
    }

    /// Sleep for the current delay, but never past `deadline`
    fn wait(&mut self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(self.next.min(remaining));
        self.next = (self.next * 2).min(self.max);
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Shared flag a caller flips to abort an in-flight spawn.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> HarnessResult<()> {
        if self.is_cancelled() {
            Err(HarnessError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Recipe for one family of harnesses.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Spawner name, also the directory and harness-id prefix
    pub name: String,
    /// Root under which the spawner keeps harness directories
    pub working_dir: PathBuf,
    /// Forward node output to the log
    pub debug_node_output: bool,
    /// Forward wallet output to the log
    pub debug_wallet_output: bool,
    /// Mature coinbase outputs the wallet must own before `spawn` returns
    pub num_mature_outputs: u32,
    /// Extra node arguments; these win over the defaults
    pub extra_args: StartArgs,
    /// Network identity handed to node and wallet
    pub params: ChainParams,
    pub timeouts: SpawnTimeouts,
}

impl SpawnerConfig {
    /// Spawner for `params` with an empty chain and no extra arguments
    pub fn new(name: impl Into<String>, working_dir: impl Into<PathBuf>, params: ChainParams) -> Self {
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            debug_node_output: false,
            debug_wallet_output: false,
            num_mature_outputs: 0,
            extra_args: StartArgs::new(),
            params,
            timeouts: SpawnTimeouts::default(),
        }
    }

    pub fn with_mature_outputs(mut self, count: u32) -> Self {
        self.num_mature_outputs = count;
        self
    }

    pub fn with_extra_args(mut self, args: StartArgs) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_timeouts(mut self, timeouts: SpawnTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_debug_output(mut self, node: bool, wallet: bool) -> Self {
        self.debug_node_output = node;
        self.debug_wallet_output = wallet;
        self
    }
}

/// Removes a fresh harness directory unless disarmed.
///
/// Only covers the window before a node exists; from then on the harness
/// itself owns the directory and disposes everything on error or unwind.
struct DirGuard {
    id: HarnessId,
    dir: Option<PathBuf>,
}

impl DirGuard {
    fn disarm(&mut self) {
        self.dir = None;
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = remove_dir(&dir) {
                warn!(harness = %self.id, path = %dir.display(), error = %e, "failed to remove directory of aborted spawn");
            }
        }
    }
}

/// Wallet slot of a harness whose wallet has not been built yet
struct PendingWallet;

impl TestWallet for PendingWallet {
    fn start(&mut self) -> Result<(), WalletError> {
        Err(WalletError::NotStarted)
    }

    fn mining_address(&self) -> String {
        String::new()
    }

    fn new_address(&mut self) -> Result<String, WalletError> {
        Err(WalletError::NotStarted)
    }

    fn sync(&mut self) -> Result<u64, WalletError> {
        Err(WalletError::NotStarted)
    }

    fn mature_outputs(&mut self) -> Result<u32, WalletError> {
        Err(WalletError::NotStarted)
    }

    fn mature_balance(&mut self) -> Result<u64, WalletError> {
        Err(WalletError::NotStarted)
    }

    fn stop(&mut self) -> Result<(), WalletError> {
        Ok(())
    }
}

/// Produces harnesses from one `SpawnerConfig`.
pub struct ChainSpawner {
    config: SpawnerConfig,
    ports: Arc<PortAllocator>,
    node_factory: Arc<dyn TestNodeFactory>,
    wallet_factory: Arc<dyn TestWalletFactory>,
    /// Last harness sequence number handed out
    seq: AtomicU64,
}

impl std::fmt::Debug for ChainSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSpawner")
            .field("config", &self.config)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl ChainSpawner {
    /// `ports` may be (and in a setup always is) shared with other spawners.
    pub fn new(
        config: SpawnerConfig,
        ports: Arc<PortAllocator>,
        node_factory: Arc<dyn TestNodeFactory>,
        wallet_factory: Arc<dyn TestWalletFactory>,
    ) -> Self {
        Self {
            config,
            ports,
            node_factory,
            wallet_factory,
            seq: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    /// Harnesses this spawner has started building
    pub fn spawned(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Directory holding this spawner's harness directories
    pub fn spawner_dir(&self) -> PathBuf {
        self.config.working_dir.join(&self.config.name)
    }

    /// Build a ready harness.
    pub fn spawn(&self) -> HarnessResult<Harness> {
        self.spawn_with_cancel(&CancelToken::new())
    }

    /// Build a ready harness, giving up with `Cancelled` once `cancel` fires.
    pub fn spawn_with_cancel(&self, cancel: &CancelToken) -> HarnessResult<Harness> {
        cancel.check()?;
        let ports = self.ports.next()?;
        let id = HarnessId::new(&self.config.name, self.seq.fetch_add(1, Ordering::SeqCst) + 1);

        let result = self.build(id.clone(), ports, cancel);
        match &result {
            Ok(harness) => info!(
                harness = %id,
                ports = %ports,
                dir = %harness.dir().display(),
                mature_outputs = self.config.num_mature_outputs,
                "harness spawned"
            ),
            Err(e) => warn!(harness = %id, ports = %ports, kind = e.kind(), error = %e, "harness spawn failed"),
        }
        result
    }

    fn build(&self, id: HarnessId, ports: PortBlock, cancel: &CancelToken) -> HarnessResult<Harness> {
        let spawner_dir = self.spawner_dir();
        fs::create_dir_all(&spawner_dir).map_err(|source| HarnessError::Directory {
            path: spawner_dir.clone(),
            source,
        })?;
        let dir = spawner_dir.join(id.as_str());
        fs::create_dir(&dir).map_err(|source| HarnessError::Directory {
            path: dir.clone(),
            source,
        })?;
        let mut guard = DirGuard {
            id: id.clone(),
            dir: Some(dir.clone()),
        };
        cancel.check()?;

        let args = self.node_args(ports, &dir)?;
        debug!(harness = %id, args = ?args.to_argv(), "launching node");
        let node_config = NodeConfig {
            harness_id: id.to_string(),
            args: args.to_argv(),
            data_dir: dir.join("node"),
            ports,
            params: self.config.params.clone(),
            debug_output: self.config.debug_node_output,
        };
        let node = self.node_factory.new_node(node_config)?;

        // From here on dropping `harness` stops whatever was started and
        // removes the directory
        let mut harness = Harness::new(
            id.clone(),
            self.config.name.clone(),
            ports,
            dir.clone(),
            self.config.params.clone(),
            node,
            Box::new(PendingWallet),
        );
        guard.disarm();

        harness.node().start()?;
        self.wait_ready(&id, harness.node(), cancel)?;

        let wallet_config = WalletConfig {
            harness_id: id.to_string(),
            node_rpc: harness.node().rpc_endpoint(),
            wallet_rpc_port: ports.wallet_rpc,
            data_dir: dir.join("wallet"),
            params: self.config.params.clone(),
            debug_output: self.config.debug_wallet_output,
        };
        let wallet_init = |source: WalletError| HarnessError::WalletInit {
            harness: id.to_string(),
            source,
        };
        harness.attach_wallet(self.wallet_factory.new_wallet(wallet_config).map_err(wallet_init)?);
        harness.wallet().start().map_err(wallet_init)?;

        if self.config.num_mature_outputs > 0 {
            let (node, wallet) = harness.parts();
            self.mature(&id, node, wallet, cancel)?;
        }

        if let Err(e) = harness.transition(HarnessState::Idle) {
            warn!(harness = %id, error = %e, "unexpected harness state");
        }
        Ok(harness)
    }

    /// Default node arguments for `ports`/`dir`, overridden by the extra ones
    fn node_args(&self, ports: PortBlock, dir: &Path) -> HarnessResult<StartArgs> {
        let mut defaults = StartArgs::new();
        if let Some(flag) = &self.config.params.net_flag {
            defaults.insert(StartArg::flag(flag.clone()))?;
        }
        defaults.insert(StartArg::with_value("listen", format!("127.0.0.1:{}", ports.node_p2p)))?;
        defaults.insert(StartArg::with_value("rpclisten", format!("127.0.0.1:{}", ports.node_rpc)))?;
        defaults.insert(StartArg::with_value("datadir", dir.join("node").join("data").display()))?;
        defaults.insert(StartArg::with_value("logdir", dir.join("node").join("logs").display()))?;
        Ok(defaults.merged_with(&self.config.extra_args))
    }

    fn wait_ready(&self, id: &HarnessId, node: &mut dyn TestNode, cancel: &CancelToken) -> HarnessResult<()> {
        let timeouts = &self.config.timeouts;
        let start = Instant::now();
        let deadline = start + timeouts.node_start;
        let mut backoff = Backoff::new(timeouts);
        let mut polls = 0u32;

        loop {
            cancel.check()?;
            polls += 1;
            if node.poll_ready()? {
                debug!(harness = %id, polls, elapsed = ?start.elapsed(), "node ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::NodeStartTimeout {
                    harness: id.to_string(),
                    waited: start.elapsed(),
                });
            }
            backoff.wait(deadline);
        }
    }

    fn mature(
        &self,
        id: &HarnessId,
        node: &mut dyn TestNode,
        wallet: &mut dyn TestWallet,
        cancel: &CancelToken,
    ) -> HarnessResult<()> {
        let wanted = self.config.num_mature_outputs;
        let target = u64::from(self.config.params.coinbase_maturity) + u64::from(wanted);
        let address = wallet.mining_address();
        let wallet_err = |source: WalletError| HarnessError::Wallet {
            harness: id.to_string(),
            source,
        };

        let timeouts = &self.config.timeouts;
        let start = Instant::now();
        let deadline = start + timeouts.maturation;
        let mut backoff = Backoff::new(timeouts);

        loop {
            cancel.check()?;
            let height = node.best_height()?;
            wallet.sync().map_err(wallet_err)?;
            let got = wallet.mature_outputs().map_err(wallet_err)?;
            if got >= wanted {
                debug!(harness = %id, height, mature_outputs = got, elapsed = ?start.elapsed(), "chain matured");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::MaturationTimeout {
                    harness: id.to_string(),
                    wanted,
                    got,
                    waited: start.elapsed(),
                });
            }

            if height < target {
                let batch = (target - height).min(u64::from(GENERATE_BATCH)) as u32;
                let new_height = node.generate(batch, &address)?;
                if new_height > height {
                    backoff.reset();
                    continue;
                }
                debug!(harness = %id, height, "block generation stalled");
            }
            // Either generation stalled or the wallet has not caught up yet
            backoff.wait(deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimFailures, SimNetwork};
    use tempfile::TempDir;

    fn fast_timeouts() -> SpawnTimeouts {
        SpawnTimeouts {
            node_start: Duration::from_millis(300),
            maturation: Duration::from_millis(300),
            poll_initial: Duration::from_millis(5),
            poll_max: Duration::from_millis(20),
        }
    }

    fn spawner(network: &SimNetwork, failures: SimFailures, config: SpawnerConfig) -> ChainSpawner {
        ChainSpawner::new(
            config,
            Arc::new(PortAllocator::new(25_000, 3)),
            Arc::new(network.node_factory(failures.clone())),
            Arc::new(network.wallet_factory(failures)),
        )
    }

    fn params() -> ChainParams {
        ChainParams::simnet().with_coinbase_maturity(4)
    }

    #[test]
    fn test_node_args_defaults_and_overrides() {
        let dir = TempDir::new().unwrap();
        let network = SimNetwork::new();
        let extra = StartArgs::new()
            .flag("txindex")
            .unwrap()
            .value("listen", "127.0.0.1:1")
            .unwrap();
        let config = SpawnerConfig::new("simnet0", dir.path(), params()).with_extra_args(extra);
        let spawner = spawner(&network, SimFailures::none(), config);

        let ports = PortBlock { node_p2p: 100, node_rpc: 101, wallet_rpc: 102, stride: 3 };
        let argv = spawner.node_args(ports, Path::new("/h")).unwrap().to_argv();
        assert_eq!(argv[0], "--simnet");
        assert_eq!(argv[1], "--listen=127.0.0.1:1");
        assert_eq!(argv[2], "--rpclisten=127.0.0.1:101");
        assert!(argv.contains(&"--txindex".to_string()));
        assert_eq!(argv.len(), 6);
    }

    #[test]
    fn test_spawn_empty_chain() {
        let dir = TempDir::new().unwrap();
        let network = SimNetwork::new();
        let config = SpawnerConfig::new("simnet0", dir.path(), params()).with_timeouts(fast_timeouts());
        let spawner = spawner(&network, SimFailures::none(), config);

        let mut harness = spawner.spawn().unwrap();
        assert_eq!(harness.id().as_str(), "simnet0-1");
        assert_eq!(harness.state(), HarnessState::Idle);
        assert!(harness.dir().starts_with(dir.path().join("simnet0")));
        assert!(harness.dir().is_dir());
        assert_eq!(harness.node().best_height().unwrap(), 0);
        assert_eq!(harness.wallet().mature_balance().unwrap(), 0);
        assert_eq!(spawner.spawned(), 1);
    }

    #[test]
    fn test_spawn_matures_exact_outputs() {
        let dir = TempDir::new().unwrap();
        let network = SimNetwork::new();
        let config = SpawnerConfig::new("mature", dir.path(), params())
            .with_mature_outputs(5)
            .with_timeouts(fast_timeouts());
        let spawner = spawner(&network, SimFailures::none(), config);

        let mut harness = spawner.spawn().unwrap();
        assert_eq!(harness.node().best_height().unwrap(), 9);
        assert_eq!(harness.wallet().mature_outputs().unwrap(), 5);
        assert_eq!(harness.state(), HarnessState::Idle);
    }

    #[test]
    fn test_pending_wallet_refuses_queries() {
        let mut wallet = PendingWallet;
        assert_eq!(wallet.sync(), Err(WalletError::NotStarted));
        assert_eq!(wallet.mature_outputs(), Err(WalletError::NotStarted));
        assert_eq!(wallet.stop(), Ok(()));
    }

    #[test]
    fn test_wallet_failure_while_maturing_is_not_an_init_failure() {
        let dir = TempDir::new().unwrap();
        let network = SimNetwork::new();
        let config = SpawnerConfig::new("rescan", dir.path(), params())
            .with_mature_outputs(2)
            .with_timeouts(fast_timeouts());
        let spawner = spawner(&network, SimFailures::wallet_sync("rescan failed"), config);

        let err = spawner.spawn().unwrap_err();
        assert_eq!(err.kind(), "WALLET");
        assert_eq!(network.live_nodes(), 0);
        assert!(!spawner.spawner_dir().join("rescan-1").exists());
    }

    #[test]
    fn test_readiness_timeout_cleans_up() {
        let dir = TempDir::new().unwrap();
        let network = SimNetwork::new();
        let config = SpawnerConfig::new("stuck", dir.path(), params()).with_timeouts(fast_timeouts());
        let spawner = spawner(&network, SimFailures::never_ready(), config);

        let err = spawner.spawn().unwrap_err();
        assert!(matches!(err, HarnessError::NodeStartTimeout { .. }), "{}", err);
        assert_eq!(network.live_nodes(), 0);
        assert!(!spawner.spawner_dir().join("stuck-1").exists());
    }

    #[test]
    fn test_cancel_before_spawn() {
        let dir = TempDir::new().unwrap();
        let network = SimNetwork::new();
        let config = SpawnerConfig::new("c", dir.path(), params());
        let spawner = spawner(&network, SimFailures::none(), config);

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(spawner.spawn_with_cancel(&cancel), Err(HarnessError::Cancelled)));
        assert_eq!(network.started_total(), 0);
    }

    #[test]
    fn test_backoff_caps() {
        let timeouts = SpawnTimeouts {
            poll_initial: Duration::from_millis(1),
            poll_max: Duration::from_millis(3),
            ..SpawnTimeouts::default()
        };
        let mut backoff = Backoff::new(&timeouts);
        let deadline = Instant::now() + Duration::from_secs(1);
        backoff.wait(deadline);
        assert_eq!(backoff.next, Duration::from_millis(2));
        backoff.wait(deadline);
        backoff.wait(deadline);
        assert_eq!(backoff.next, Duration::from_millis(3));
        backoff.reset();
        assert_eq!(backoff.next, Duration::from_millis(1));
    }
}
