//! Port allocation for harness processes
//!
//! Every harness needs three listening ports (node P2P, node RPC, wallet
//! RPC). The allocator hands out contiguous blocks of `stride` ports starting
//! at `base`, never reusing a block for the lifetime of the allocator. One
//! allocator is shared by every spawner of a setup so that harnesses from
//! differently-configured spawners still never collide.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// Default first port handed out
pub const DEFAULT_BASE_PORT: u16 = 20_000;

/// Ports reserved per harness: node P2P, node RPC, wallet RPC
pub const MIN_PORT_STRIDE: u16 = 3;

/// The ports assigned to one harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PortBlock {
    /// Node peer-to-peer listener
    pub node_p2p: u16,
    /// Node RPC listener
    pub node_rpc: u16,
    /// Wallet RPC listener
    pub wallet_rpc: u16,
    /// Width of the reserved block (>= 3)
    pub stride: u16,
}

impl PortBlock {
    /// Lowest port in the block
    pub fn first(&self) -> u16 {
        self.node_p2p
    }

    /// Highest port reserved by the block
    pub fn last(&self) -> u16 {
        self.node_p2p + (self.stride - 1)
    }

    /// True when the two blocks share any port
    pub fn overlaps(&self, other: &PortBlock) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }
}

impl fmt::Display for PortBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first(), self.last())
    }
}

/// Monotonic, process-local port allocator.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    stride: u16,
    /// Offset of the next block relative to `base`
    offset: Mutex<u32>,
}

impl PortAllocator {
    /// Create an allocator. `stride` is raised to `MIN_PORT_STRIDE` if smaller.
    pub fn new(base: u16, stride: u16) -> Self {
        Self {
            base,
            stride: stride.max(MIN_PORT_STRIDE),
            offset: Mutex::new(0),
        }
    }

    /// Allocator starting at `DEFAULT_BASE_PORT` with the minimum stride
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BASE_PORT, MIN_PORT_STRIDE)
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn stride(&self) -> u16 {
        self.stride
    }

    /// Reserve the next block.
    ///
    /// Fails with `AllocationExhausted` once a block would run past port
    /// 65535; the offset is not advanced in that case.
    pub fn next(&self) -> HarnessResult<PortBlock> {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);

        let first = u32::from(self.base) + *offset;
        let last = first + u32::from(self.stride) - 1;
        if last > u32::from(u16::MAX) {
            return Err(HarnessError::AllocationExhausted {
                base: self.base,
                offset: *offset,
            });
        }
        *offset += u32::from(self.stride);

        // first <= last <= u16::MAX, so these narrowings are lossless
        let first = first as u16;
        let block = PortBlock {
            node_p2p: first,
            node_rpc: first + 1,
            wallet_rpc: first + 2,
            stride: self.stride,
        };
        debug!(ports = %block, "allocated port block");
        Ok(block)
    }

    /// Number of blocks handed out so far
    pub fn allocated(&self) -> u32 {
        let offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset / u32::from(self.stride)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::with_defaults()
    }
}
