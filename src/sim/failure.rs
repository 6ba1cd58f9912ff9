//! Failure injection for the simulated backend

use std::time::Duration;

/// Knobs for making simulated nodes and wallets misbehave.
#[derive(Debug, Clone, Default)]
pub struct SimFailures {
    /// Readiness checks that report "not yet" before the node is ready
    pub ready_after_polls: u32,
    /// Node never reports ready
    pub never_ready: bool,
    /// Chain stops growing once it reaches this height
    pub stall_at_height: Option<u64>,
    /// Wallet factory fails with this message
    pub wallet_init_error: Option<String>,
    /// Every wallet sync fails with this message
    pub wallet_sync_error: Option<String>,
    /// Delay added to every node start
    pub start_delay: Option<Duration>,
}

impl SimFailures {
    /// Everything behaves
    pub fn none() -> Self {
        Self::default()
    }

    pub fn never_ready() -> Self {
        Self {
            never_ready: true,
            ..Self::default()
        }
    }

    pub fn stall_at(height: u64) -> Self {
        Self {
            stall_at_height: Some(height),
            ..Self::default()
        }
    }

    pub fn wallet_init(message: impl Into<String>) -> Self {
        Self {
            wallet_init_error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn wallet_sync(message: impl Into<String>) -> Self {
        Self {
            wallet_sync_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Require `polls` failed readiness checks first
    pub fn with_ready_after(mut self, polls: u32) -> Self {
        self.ready_after_polls = polls;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }
}
