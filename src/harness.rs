//! A running node + wallet pair
//!
//! Harness states: SPAWNING → IDLE ⇄ IN_USE → DISPOSED
//! with SPAWNING → DISPOSED when a spawn fails part way.
//!
//! A `Harness` exclusively owns its node and wallet handles and its
//! directory. `dispose` releases all three and reports every failure.

use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chain_params::ChainParams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DisposalError, DisposalFailure};
use crate::node::TestNode;
use crate::ports::PortBlock;
use crate::wallet::TestWallet;

/// Identifier of a harness, unique within a setup (`<spawner>-<n>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HarnessId(String);

impl HarnessId {
    pub fn new(spawner: &str, seq: u64) -> Self {
        Self(format!("{}-{}", spawner, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HarnessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a harness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarnessState {
    /// Being built by a spawner
    Spawning,
    /// Owned by the pool, free for checkout
    Idle,
    /// Checked out by a test
    InUse,
    /// Processes stopped and directory removed
    Disposed,
}

impl HarnessState {
    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: HarnessState) -> bool {
        matches!(
            (self, target),
            (HarnessState::Spawning, HarnessState::Idle)
                | (HarnessState::Spawning, HarnessState::Disposed)
                | (HarnessState::Idle, HarnessState::InUse)
                | (HarnessState::Idle, HarnessState::Disposed)
                | (HarnessState::InUse, HarnessState::Idle)
                | (HarnessState::InUse, HarnessState::Disposed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HarnessState::Disposed)
    }
}

/// Errors for harness state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("harness {harness}: invalid state transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub harness: HarnessId,
    pub from: HarnessState,
    pub to: HarnessState,
}

/// Plain-data view of a harness, for logs and reports
#[derive(Debug, Clone, Serialize)]
pub struct HarnessInfo {
    pub id: HarnessId,
    pub spawner: String,
    pub state: HarnessState,
    pub network: String,
    pub ports: PortBlock,
    pub dir: PathBuf,
    pub node_rpc: SocketAddr,
    pub node_pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// One node + wallet pair produced by a spawner.
pub struct Harness {
    id: HarnessId,
    spawner: String,
    ports: PortBlock,
    dir: PathBuf,
    params: ChainParams,
    state: HarnessState,
    created_at: DateTime<Utc>,
    node: Box<dyn TestNode>,
    wallet: Box<dyn TestWallet>,
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("id", &self.id)
            .field("spawner", &self.spawner)
            .field("state", &self.state)
            .field("ports", &self.ports)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Wrap a freshly built node. Starts in SPAWNING; dropping it from here
    /// on releases whatever the spawner has started so far.
    pub(crate) fn new(
        id: HarnessId,
        spawner: String,
        ports: PortBlock,
        dir: PathBuf,
        params: ChainParams,
        node: Box<dyn TestNode>,
        wallet: Box<dyn TestWallet>,
    ) -> Self {
        Self {
            id,
            spawner,
            ports,
            dir,
            params,
            state: HarnessState::Spawning,
            created_at: Utc::now(),
            node,
            wallet,
        }
    }

    pub fn id(&self) -> &HarnessId {
        &self.id
    }

    /// Name of the spawner that produced this harness
    pub fn spawner(&self) -> &str {
        &self.spawner
    }

    pub fn ports(&self) -> PortBlock {
        self.ports
    }

    /// Harness-local directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn node(&mut self) -> &mut dyn TestNode {
        self.node.as_mut()
    }

    pub fn wallet(&mut self) -> &mut dyn TestWallet {
        self.wallet.as_mut()
    }

    /// Node and wallet borrowed together
    pub(crate) fn parts(&mut self) -> (&mut dyn TestNode, &mut dyn TestWallet) {
        (self.node.as_mut(), self.wallet.as_mut())
    }

    /// Replace the wallet handle while the harness is still being built
    pub(crate) fn attach_wallet(&mut self, wallet: Box<dyn TestWallet>) {
        self.wallet = wallet;
    }

    pub fn info(&self) -> HarnessInfo {
        HarnessInfo {
            id: self.id.clone(),
            spawner: self.spawner.clone(),
            state: self.state,
            network: self.params.name.clone(),
            ports: self.ports,
            dir: self.dir.clone(),
            node_rpc: self.node.rpc_endpoint(),
            node_pid: self.node.pid(),
            created_at: self.created_at,
        }
    }

    /// Move to `target`, rejecting transitions the lifecycle does not allow
    pub(crate) fn transition(&mut self, target: HarnessState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(target) {
            return Err(InvalidTransition {
                harness: self.id.clone(),
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        Ok(())
    }

    /// Stop wallet and node, then remove the harness directory.
    ///
    /// Every step runs even if an earlier one failed. Disposing an already
    /// disposed harness does nothing.
    pub fn dispose(&mut self) -> Result<(), DisposalError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.state = HarnessState::Disposed;

        let mut errors = DisposalError::new();
        if let Err(e) = self.wallet.stop() {
            errors.push(DisposalFailure::new(format!("harness {} wallet", self.id), e));
        }
        if let Err(e) = self.node.stop() {
            errors.push(DisposalFailure::new(format!("harness {} node", self.id), e));
        }
        if let Err(e) = remove_dir(&self.dir) {
            errors.push(DisposalFailure::new(self.dir.display().to_string(), e));
        }

        if errors.is_empty() {
            info!(harness = %self.id, "harness disposed");
        } else {
            warn!(harness = %self.id, error = %errors, "harness disposed with errors");
        }
        errors.into_result()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(harness = %self.id, error = %e, "dispose on drop failed");
        }
    }
}

/// Remove a directory tree, treating "already gone" as success
pub(crate) fn remove_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use HarnessState::*;
        assert!(Spawning.can_transition_to(Idle));
        assert!(Spawning.can_transition_to(Disposed));
        assert!(Idle.can_transition_to(InUse));
        assert!(InUse.can_transition_to(Idle));
        assert!(InUse.can_transition_to(Disposed));
        assert!(Idle.can_transition_to(Disposed));
    }

    #[test]
    fn test_invalid_transitions() {
        use HarnessState::*;
        assert!(!Spawning.can_transition_to(InUse));
        assert!(!Idle.can_transition_to(Spawning));
        assert!(!InUse.can_transition_to(Spawning));
        assert!(!Disposed.can_transition_to(Idle));
        assert!(!Disposed.can_transition_to(InUse));
        assert!(!Disposed.can_transition_to(Disposed));
        assert!(Disposed.is_terminal());
    }

    #[test]
    fn test_harness_id_format() {
        let id = HarnessId::new("simnet0", 3);
        assert_eq!(id.as_str(), "simnet0-3");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"simnet0-3\"");
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_string(&HarnessState::InUse).unwrap(), "\"IN_USE\"");
    }

    #[test]
    fn test_remove_dir_missing_is_ok() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(remove_dir(&temp.path().join("missing")).is_ok());
    }
}
