//! Process-backed node tests
//!
//! A shell script stands in for the node binary; the test itself plays the
//! RPC listener and wallet.

#![cfg(unix)]

mod common;

use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use coin_harness::node::{ConsoleNodeFactory, NodeConfig, NodeError, NodeRpc, RpcConnector, TestNodeFactory};
use coin_harness::wallet::{TestWallet, TestWalletFactory, WalletConfig, WalletError};
use coin_harness::{ChainSpawner, HarnessError, HarnessState, PortAllocator, SpawnerConfig};
use common::fast_timeouts;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tempfile::TempDir;

/// Node stand-in that records its pid, then idles
fn fake_node(dir: &Path, pid_file: &Path) -> PathBuf {
    let path = dir.join("fake-node.sh");
    let body = format!("#!/bin/sh\necho $$ > \"{}\"\nexec sleep 30\n", pid_file.display());
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Pid written by the script, waiting briefly for it to appear
fn read_pid(pid_file: &Path) -> Pid {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(raw) = fs::read_to_string(pid_file) {
            if let Ok(pid) = raw.trim().parse() {
                return Pid::from_raw(pid);
            }
        }
        assert!(Instant::now() < deadline, "script never wrote its pid");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Node stand-in that forks its real work into a background child, the
/// way wrapper scripts and daemons with helpers do
fn forking_node(dir: &Path, pid_file: &Path, inner_pid_file: &Path) -> PathBuf {
    let path = dir.join("forking-node.sh");
    let body = format!(
        "#!/bin/sh\necho $$ > \"{}\"\nsleep 30 &\necho $! > \"{}\"\necho started\nwait\n",
        pid_file.display(),
        inner_pid_file.display()
    );
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Exited, or a zombie nobody has reaped yet
fn process_gone(pid: Pid) -> bool {
    if kill(pid, None) == Err(Errno::ESRCH) {
        return true;
    }
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| {
            stat.rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

fn assert_process_gone(pid: Pid) {
    // Signals are delivered asynchronously
    let deadline = Instant::now() + Duration::from_secs(2);
    while !process_gone(pid) {
        assert!(Instant::now() < deadline, "process {pid} survived");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Chain height shared between the fake RPC and the fake wallet
#[derive(Clone, Default)]
struct SharedChain(Arc<AtomicU64>);

struct ChainRpc(SharedChain);

impl NodeRpc for ChainRpc {
    fn generate(&mut self, blocks: u32, _address: &str) -> Result<u64, NodeError> {
        Ok(self.0 .0.fetch_add(u64::from(blocks), Ordering::SeqCst) + u64::from(blocks))
    }

    fn best_height(&mut self) -> Result<u64, NodeError> {
        Ok(self.0 .0.load(Ordering::SeqCst))
    }
}

struct ChainConnector(SharedChain);

impl RpcConnector for ChainConnector {
    fn connect(&self, _config: &NodeConfig) -> Result<Box<dyn NodeRpc>, NodeError> {
        Ok(Box::new(ChainRpc(self.0.clone())))
    }
}

struct NoRpc;

impl RpcConnector for NoRpc {
    fn connect(&self, _config: &NodeConfig) -> Result<Box<dyn NodeRpc>, NodeError> {
        Err(NodeError::Rpc("unreachable".to_string()))
    }
}

/// Wallet that owns every block after the first `maturity`
struct ChainWallet {
    chain: SharedChain,
    maturity: u64,
    subsidy: u64,
    synced: u64,
}

impl TestWallet for ChainWallet {
    fn start(&mut self) -> Result<(), WalletError> {
        Ok(())
    }

    fn mining_address(&self) -> String {
        "miner".to_string()
    }

    fn new_address(&mut self) -> Result<String, WalletError> {
        Ok("fresh".to_string())
    }

    fn sync(&mut self) -> Result<u64, WalletError> {
        self.synced = self.chain.0.load(Ordering::SeqCst);
        Ok(self.synced)
    }

    fn mature_outputs(&mut self) -> Result<u32, WalletError> {
        Ok(self.synced.saturating_sub(self.maturity) as u32)
    }

    fn mature_balance(&mut self) -> Result<u64, WalletError> {
        Ok(u64::from(self.mature_outputs()?) * self.subsidy)
    }

    fn stop(&mut self) -> Result<(), WalletError> {
        Ok(())
    }
}

struct ChainWalletFactory(SharedChain);

impl TestWalletFactory for ChainWalletFactory {
    fn new_wallet(&self, config: WalletConfig) -> Result<Box<dyn TestWallet>, WalletError> {
        Ok(Box::new(ChainWallet {
            chain: self.0.clone(),
            maturity: u64::from(config.params.coinbase_maturity),
            subsidy: config.params.block_subsidy,
            synced: 0,
        }))
    }
}

#[test]
fn test_readiness_timeout_kills_process() {
    let temp = TempDir::new().unwrap();
    let pid_file = temp.path().join("node.pid");
    let exe = fake_node(temp.path(), &pid_file);
    let chain = SharedChain::default();

    let spawner = ChainSpawner::new(
        SpawnerConfig::new("console", temp.path().join("work"), common::test_params())
            .with_timeouts(fast_timeouts()),
        Arc::new(PortAllocator::new(47_000, 3)),
        Arc::new(ConsoleNodeFactory::new(exe, Arc::new(NoRpc)).with_stop_grace(Duration::from_secs(2))),
        Arc::new(ChainWalletFactory(chain)),
    );

    let err = spawner.spawn().unwrap_err();
    assert!(matches!(err, HarnessError::NodeStartTimeout { .. }), "got {err}");

    assert_process_gone(read_pid(&pid_file));
    assert_eq!(fs::read_dir(spawner.spawner_dir()).unwrap().count(), 0);
}

#[test]
fn test_spawn_mature_and_dispose_process_node() {
    let temp = TempDir::new().unwrap();
    let pid_file = temp.path().join("node.pid");
    let exe = fake_node(temp.path(), &pid_file);
    let chain = SharedChain::default();

    let ports = Arc::new(PortAllocator::new(47_100, 3));
    // The test owns the RPC port so the readiness check can connect
    let _listener = TcpListener::bind(("127.0.0.1", 47_101)).unwrap();

    let spawner = ChainSpawner::new(
        SpawnerConfig::new("console", temp.path().join("work"), common::test_params())
            .with_mature_outputs(3)
            .with_timeouts(fast_timeouts()),
        ports,
        Arc::new(
            ConsoleNodeFactory::new(exe, Arc::new(ChainConnector(chain.clone())))
                .with_stop_grace(Duration::from_secs(2)),
        ),
        Arc::new(ChainWalletFactory(chain.clone())),
    );

    let mut harness = spawner.spawn().unwrap();
    assert_eq!(harness.state(), HarnessState::Idle);
    assert_eq!(harness.node().best_height().unwrap(), u64::from(common::TEST_MATURITY) + 3);
    assert_eq!(harness.wallet().mature_outputs().unwrap(), 3);

    let info = harness.info();
    let pid = Pid::from_raw(info.node_pid.expect("node pid") as i32);
    assert_eq!(read_pid(&pid_file), pid);
    let dir = harness.dir().to_path_buf();
    assert!(dir.join("node").is_dir());

    harness.dispose().unwrap();
    harness.dispose().unwrap();
    assert_eq!(harness.state(), HarnessState::Disposed);
    assert_process_gone(pid);
    assert!(!dir.exists());
}

#[test]
fn test_stop_kills_forked_children_without_hanging() {
    let temp = TempDir::new().unwrap();
    let pid_file = temp.path().join("node.pid");
    let inner_pid_file = temp.path().join("inner.pid");
    let exe = forking_node(temp.path(), &pid_file, &inner_pid_file);

    let factory = ConsoleNodeFactory::new(exe, Arc::new(NoRpc)).with_stop_grace(Duration::from_secs(1));
    let config = NodeConfig {
        harness_id: "console-1".to_string(),
        args: Vec::new(),
        data_dir: temp.path().join("node"),
        ports: PortAllocator::new(47_200, 3).next().unwrap(),
        params: common::test_params(),
        // Piped output: the background child inherits the pipes
        debug_output: true,
    };
    let mut node = factory.new_node(config).unwrap();
    node.start().unwrap();
    let leader = read_pid(&pid_file);
    let inner = read_pid(&inner_pid_file);

    let start = Instant::now();
    node.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5), "stop took {:?}", start.elapsed());
    assert!(!node.is_running());
    assert_process_gone(leader);
    assert_process_gone(inner);
}
