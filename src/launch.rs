//! Launch configuration for the selection kernel.
//!
//! The input is split into `grid_size` blocks of `block_size` threads, one
//! element per thread. The grid must cover the input exactly: a partial
//! block would read past the end of the input, so uneven lengths are
//! rejected here instead of being handled inside the kernel.

use crate::{SelError, SelResult};

/// Value marking an output slot that holds no index.
pub const SENTINEL: i32 = -1;

/// Default threads per block.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Largest block size any backend accepts. Device backends may lower this
/// to their own work-group limit.
pub const MAX_BLOCK_SIZE: usize = 1024;

/// Elements examined by each thread. The kernel only supports one: with more,
/// a block could qualify more elements than its shared buffer holds.
pub const ELEMENTS_PER_THREAD: usize = 1;

/// Validated grid geometry for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Threads per block.
    pub block_size: usize,
    /// Number of blocks (`len / block_size`).
    pub grid_size: usize,
    /// Elements per thread (always [`ELEMENTS_PER_THREAD`]).
    pub elements_per_thread: usize,
}

impl LaunchConfig {
    /// Validate a launch over `len` elements against the global block size limit.
    pub fn new(len: usize, block_size: usize, elements_per_thread: usize) -> SelResult<Self> {
        Self::with_max_block_size(len, block_size, elements_per_thread, MAX_BLOCK_SIZE)
    }

    /// Validate a launch against a device-specific block size limit.
    pub fn with_max_block_size(
        len: usize,
        block_size: usize,
        elements_per_thread: usize,
        max_block_size: usize,
    ) -> SelResult<Self> {
        if elements_per_thread != ELEMENTS_PER_THREAD {
            return Err(SelError::UnsupportedElementsPerThread(elements_per_thread));
        }
        let max = max_block_size.min(MAX_BLOCK_SIZE);
        if block_size == 0 || block_size > max {
            return Err(SelError::InvalidBlockSize { block_size, max });
        }
        if len > i32::MAX as usize {
            return Err(SelError::InputTooLarge(len));
        }
        let span = block_size * elements_per_thread;
        if len % span != 0 {
            return Err(SelError::UnalignedInput { len, block_size });
        }
        Ok(LaunchConfig {
            block_size,
            grid_size: len / span,
            elements_per_thread,
        })
    }

    /// Total number of elements covered by the grid.
    pub fn len(&self) -> usize {
        self.grid_size * self.block_size * self.elements_per_thread
    }

    /// Whether the grid is empty.
    pub fn is_empty(&self) -> bool {
        self.grid_size == 0
    }

    /// Re-check this configuration against a lower device limit.
    pub(crate) fn check_device_limit(&self, device_max: usize) -> SelResult<()> {
        if self.block_size > device_max {
            return Err(SelError::InvalidBlockSize {
                block_size: self.block_size,
                max: device_max,
            });
        }
        Ok(())
    }
}
