//! Scratch directory tree for a test setup
//!
//! A `WorkingDir` owns one uniquely named temporary directory. All spawner
//! and harness directories live underneath it. `dispose` removes the whole
//! tree exactly once; later calls are no-ops. If the handle is dropped
//! without `dispose`, the tree is still removed (errors are only logged).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tempfile::{Builder, TempDir};
use tracing::{debug, info, warn};

use crate::error::{DisposalError, DisposalFailure};

/// Default name prefix for setup directories
pub const DEFAULT_PREFIX: &str = "simpleregtest";

/// Handle to the setup's temporary directory tree.
#[derive(Debug)]
pub struct WorkingDir {
    path: PathBuf,
    /// `None` once disposed
    dir: Mutex<Option<TempDir>>,
}

impl WorkingDir {
    /// Create a unique directory under the system temp root.
    pub fn create(prefix: &str) -> io::Result<Self> {
        Self::create_in(std::env::temp_dir(), prefix)
    }

    /// Create a unique directory under `root`, creating `root` if needed.
    pub fn create_in(root: impl AsRef<Path>, prefix: &str) -> io::Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;

        let dir = Builder::new().prefix(&format!("{}-", prefix)).tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        info!(path = %path.display(), "created working directory");

        Ok(Self {
            path,
            dir: Mutex::new(Some(dir)),
        })
    }

    /// Root of the tree. Remains valid (as a path) after disposal.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_disposed(&self) -> bool {
        self.dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Remove the tree.
    ///
    /// Safe to call repeatedly; only the first call does any work. A
    /// removal failure is reported but the handle still counts as disposed.
    pub fn dispose(&self) -> Result<(), DisposalError> {
        let dir = self.dir.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(dir) = dir else {
            debug!(path = %self.path.display(), "working directory already disposed");
            return Ok(());
        };

        let mut errors = DisposalError::new();
        match dir.close() {
            Ok(()) => info!(path = %self.path.display(), "removed working directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "working directory already gone");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove working directory");
                errors.push(DisposalFailure::new(self.path.display().to_string(), e));
            }
        }
        errors.into_result()
    }
}
