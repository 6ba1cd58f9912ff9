//! Error taxonomy for harness lifecycle operations
//!
//! Spawn-path failures are reported through `HarnessError` after local
//! cleanup has run. Teardown paths never stop at the first failure: they
//! collect every `DisposalFailure` into a `DisposalError` and keep going.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::args::ArgsError;
use crate::node::NodeError;
use crate::wallet::WalletError;

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors from allocating, spawning and disposing harnesses.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("port allocation exhausted: block at offset {offset} from base {base} exceeds port range")]
    AllocationExhausted { base: u16, offset: u32 },

    #[error("node for harness {harness} did not become ready within {waited:?}")]
    NodeStartTimeout { harness: String, waited: Duration },

    #[error("wallet init failed for harness {harness}: {source}")]
    WalletInit {
        harness: String,
        #[source]
        source: WalletError,
    },

    #[error("wallet of harness {harness} failed while maturing: {source}")]
    Wallet {
        harness: String,
        #[source]
        source: WalletError,
    },

    #[error("harness {harness} reached {got} of {wanted} mature outputs before {waited:?} elapsed")]
    MaturationTimeout {
        harness: String,
        wanted: u32,
        got: u32,
        waited: Duration,
    },

    #[error(transparent)]
    Disposal(#[from] DisposalError),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("harness directory {path} could not be created: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid start arguments: {0}")]
    InvalidArgs(#[from] ArgsError),

    #[error("spawn cancelled")]
    Cancelled,
}

impl HarnessError {
    /// Stable machine-readable kind, used in reports and logs
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::AllocationExhausted { .. } => "ALLOCATION_EXHAUSTED",
            HarnessError::NodeStartTimeout { .. } => "NODE_START_TIMEOUT",
            HarnessError::WalletInit { .. } => "WALLET_INIT",
            HarnessError::Wallet { .. } => "WALLET",
            HarnessError::MaturationTimeout { .. } => "MATURATION_TIMEOUT",
            HarnessError::Disposal(_) => "DISPOSAL",
            HarnessError::Node(_) => "NODE",
            HarnessError::Directory { .. } => "DIRECTORY",
            HarnessError::InvalidArgs(_) => "INVALID_ARGS",
            HarnessError::Cancelled => "CANCELLED",
        }
    }
}

/// A single resource that could not be released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposalFailure {
    /// What was being released ("harness simnet0-1 node", a directory path, ...)
    pub resource: String,
    /// Why it failed
    pub reason: String,
}

impl DisposalFailure {
    pub fn new(resource: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for DisposalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.reason)
    }
}

/// Aggregate of every cleanup failure seen during a teardown pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisposalError {
    pub failures: Vec<DisposalFailure>,
}

impl DisposalError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure
    pub fn push(&mut self, failure: DisposalFailure) {
        self.failures.push(failure);
    }

    /// Fold another aggregate into this one
    pub fn extend(&mut self, other: DisposalError) {
        self.failures.extend(other.failures);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// `Ok(())` when nothing failed, otherwise `Err(self)`
    pub fn into_result(self) -> Result<(), DisposalError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for DisposalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource(s) failed to dispose", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for DisposalError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposal_error_empty_is_ok() {
        assert!(DisposalError::new().into_result().is_ok());
    }

    #[test]
    fn test_disposal_error_aggregates() {
        let mut first = DisposalError::new();
        first.push(DisposalFailure::new("node a", "still running"));

        let mut second = DisposalError::new();
        second.push(DisposalFailure::new("/tmp/x", "permission denied"));
        first.extend(second);

        assert_eq!(first.len(), 2);
        let message = first.to_string();
        assert!(message.starts_with("2 resource(s) failed to dispose"));
        assert!(message.contains("node a: still running"));
        assert!(message.contains("/tmp/x: permission denied"));
        assert!(first.into_result().is_err());
    }

    #[test]
    fn test_error_kinds_are_distinct() {
        let exhausted = HarnessError::AllocationExhausted { base: 20000, offset: 50000 };
        let timeout = HarnessError::NodeStartTimeout {
            harness: "h".to_string(),
            waited: Duration::from_secs(1),
        };
        let maturation = HarnessError::MaturationTimeout {
            harness: "h".to_string(),
            wanted: 5,
            got: 2,
            waited: Duration::from_secs(1),
        };
        assert_eq!(exhausted.kind(), "ALLOCATION_EXHAUSTED");
        assert_eq!(timeout.kind(), "NODE_START_TIMEOUT");
        assert_eq!(maturation.kind(), "MATURATION_TIMEOUT");
        let wallet = HarnessError::Wallet {
            harness: "h".to_string(),
            source: WalletError::Backend("rescan failed".to_string()),
        };
        assert_eq!(wallet.kind(), "WALLET");
        assert_ne!(wallet.kind(), "WALLET_INIT");
        assert!(maturation.to_string().contains("2 of 5"));
    }
}
