//! Process-backed node
//!
//! `ConsoleNode` launches the node executable as a child process:
//! - stdout/stderr are forwarded line by line to `tracing` when the harness
//!   asked for debug output, otherwise discarded
//! - readiness means the process is alive, its RPC port accepts TCP
//!   connections and the injected `RpcConnector` hands back a client
//! - stop sends SIGTERM to the node's process group, waits out a grace
//!   period, then kills and reaps; anything left in the group is killed
//!   so helpers the node forked cannot outlive it
//!
//! Dropping a `ConsoleNode` stops it, so a handle can never leak a process.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{NodeConfig, NodeError, NodeRpc, RpcConnector, TestNode, TestNodeFactory};

/// Executable looked up on `PATH` when none is configured
pub const DEFAULT_NODE_EXECUTABLE: &str = "pfcd";

/// Time allowed between SIGTERM and SIGKILL
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Timeout for a single TCP readiness check
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Interval between exit checks while waiting out the grace period
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long `stop` waits for the output pumps to drain
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds `ConsoleNode`s for a fixed executable.
pub struct ConsoleNodeFactory {
    executable: PathBuf,
    connector: Arc<dyn RpcConnector>,
    stop_grace: Duration,
    connect_timeout: Duration,
}

impl ConsoleNodeFactory {
    pub fn new(executable: impl Into<PathBuf>, connector: Arc<dyn RpcConnector>) -> Self {
        Self {
            executable: executable.into(),
            connector,
            stop_grace: DEFAULT_STOP_GRACE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the SIGTERM grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl TestNodeFactory for ConsoleNodeFactory {
    fn new_node(&self, config: NodeConfig) -> Result<Box<dyn TestNode>, NodeError> {
        Ok(Box::new(ConsoleNode {
            executable: self.executable.clone(),
            connector: Arc::clone(&self.connector),
            stop_grace: self.stop_grace,
            connect_timeout: self.connect_timeout,
            config,
            child: None,
            rpc: None,
            pumps: Vec::new(),
        }))
    }
}

/// A node running as a child process.
pub struct ConsoleNode {
    executable: PathBuf,
    connector: Arc<dyn RpcConnector>,
    stop_grace: Duration,
    connect_timeout: Duration,
    config: NodeConfig,
    child: Option<Child>,
    rpc: Option<Box<dyn NodeRpc>>,
    /// Output forwarding threads
    pumps: Vec<JoinHandle<()>>,
}

impl ConsoleNode {
    fn rpc(&mut self) -> Result<&mut Box<dyn NodeRpc>, NodeError> {
        self.rpc.as_mut().ok_or(NodeError::NotConnected)
    }

    fn pump<R: Read + Send + 'static>(harness: String, stream: &'static str, reader: R) -> JoinHandle<()> {
        thread::spawn(move || {
            for line in BufReader::new(reader).lines().map_while(Result::ok) {
                debug!(target: "coin_harness::node_output", harness = %harness, stream, "{}", line);
            }
        })
    }

    /// SIGTERM, bounded wait, then SIGKILL. The whole process group is
    /// signalled; the leader is reaped.
    fn terminate(child: &mut Child, grace: Duration) -> Result<(), NodeError> {
        let result = Self::terminate_leader(child, grace);
        // Descendants can outlive the leader and keep its output pipes open
        #[cfg(unix)]
        signal_group(child.id(), nix::sys::signal::Signal::SIGKILL);
        result
    }

    fn terminate_leader(child: &mut Child, grace: Duration) -> Result<(), NodeError> {
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        signal_group(child.id(), nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        warn!(pid = child.id(), "node ignored SIGTERM, killing");
        #[cfg(unix)]
        signal_group(child.id(), nix::sys::signal::Signal::SIGKILL);
        if let Err(e) = child.kill() {
            // Already dead from the group kill
            if child.try_wait()?.is_none() {
                return Err(NodeError::Stop(format!("kill pid {}: {}", child.id(), e)));
            }
        }
        child.wait()?;
        Ok(())
    }

    /// Join the output pumps, giving up on any still blocked after
    /// `PUMP_JOIN_TIMEOUT`.
    fn join_pumps(&mut self) {
        let deadline = Instant::now() + PUMP_JOIN_TIMEOUT;
        while self.pumps.iter().any(|p| !p.is_finished()) && Instant::now() < deadline {
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        for pump in self.pumps.drain(..) {
            if !pump.is_finished() {
                warn!(harness = %self.config.harness_id, "node output still open after stop, detaching pump");
            } else if pump.join().is_err() {
                warn!(harness = %self.config.harness_id, "node output pump panicked");
            }
        }
    }
}

/// Send `signal` to the process group led by `pid`. A group that no
/// longer exists is not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, signal = ?signal, error = %e, "failed to signal node process group"),
    }
}

impl TestNode for ConsoleNode {
    fn start(&mut self) -> Result<(), NodeError> {
        if self.child.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.config.data_dir)?;

        let (stdout, stderr) = if self.config.debug_output {
            (Stdio::piped(), Stdio::piped())
        } else {
            (Stdio::null(), Stdio::null())
        };

        let mut command = Command::new(&self.executable);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        // Own process group, so stop reaches everything the node forks
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|e| NodeError::Spawn(format!("{}: {}", self.executable.display(), e)))?;

        if let Some(out) = child.stdout.take() {
            self.pumps.push(Self::pump(self.config.harness_id.clone(), "stdout", out));
        }
        if let Some(err) = child.stderr.take() {
            self.pumps.push(Self::pump(self.config.harness_id.clone(), "stderr", err));
        }

        info!(
            harness = %self.config.harness_id,
            pid = child.id(),
            executable = %self.executable.display(),
            "node process started"
        );
        self.child = Some(child);
        Ok(())
    }

    fn poll_ready(&mut self) -> Result<bool, NodeError> {
        let child = self.child.as_mut().ok_or(NodeError::NotStarted)?;
        if let Some(status) = child.try_wait()? {
            return Err(NodeError::Exited(status.to_string()));
        }

        let endpoint = self.config.rpc_endpoint();
        if TcpStream::connect_timeout(&endpoint, self.connect_timeout).is_err() {
            return Ok(false);
        }

        if self.rpc.is_none() {
            match self.connector.connect(&self.config) {
                Ok(rpc) => self.rpc = Some(rpc),
                Err(e) => {
                    debug!(harness = %self.config.harness_id, error = %e, "RPC not accepting clients yet");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn rpc_endpoint(&self) -> SocketAddr {
        self.config.rpc_endpoint()
    }

    fn generate(&mut self, blocks: u32, address: &str) -> Result<u64, NodeError> {
        self.rpc()?.generate(blocks, address)
    }

    fn best_height(&mut self) -> Result<u64, NodeError> {
        self.rpc()?.best_height()
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn stop(&mut self) -> Result<(), NodeError> {
        self.rpc = None;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let pid = child.id();
        let result = Self::terminate(&mut child, self.stop_grace);
        self.join_pumps();
        match &result {
            Ok(()) => info!(harness = %self.config.harness_id, pid, "node process stopped"),
            Err(e) => warn!(harness = %self.config.harness_id, pid, error = %e, "node process did not stop cleanly"),
        }
        result
    }
}

impl Drop for ConsoleNode {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.stop() {
                warn!(harness = %self.config.harness_id, error = %e, "failed to stop node on drop");
            }
        }
    }
}
