//! GPU-parallel stream compaction.
//!
//! Given an array of `f32` values and a threshold, `gpusel` produces the
//! indices of every value at or above the threshold. The work is done by a
//! grid of thread blocks, one element per thread: each block compacts its
//! qualifying indices into block-shared memory, then reserves a contiguous
//! range of the output with a single atomic add on a global counter.
//!
//! **Backends:**
//!
//! | Backend  | Kernel                  | Availability              |
//! |----------|-------------------------|---------------------------|
//! | `Cpu`    | in-process block device | always                    |
//! | `OpenCl` | `kernels/select.cl`     | `opencl` feature + device |
//! | `WebGpu` | `kernels/select.wgsl`   | `webgpu` feature + device |
//!
//! The output order depends on scheduling. Treat the selected prefix as a
//! set, or sort it.
//!
//! # Usage
//!
//! ```rust
//! use gpusel::{select, SelectOptions};
//!
//! let mut input = vec![0.0f32; 1024];
//! input[100] = 1.0;
//! input[900] = 1.0;
//!
//! let selection = select(&input, 0.5, &SelectOptions::default()).unwrap();
//! assert_eq!(selection.count, 2);
//! assert_eq!(selection.sorted(), vec![100, 900]);
//! ```

pub mod cpu;
pub mod input;
pub mod launch;
pub mod select;
pub mod verify;

#[cfg(feature = "opencl")]
pub mod opencl;

#[cfg(feature = "webgpu")]
pub mod webgpu;

#[cfg(test)]
mod validation;

pub use cpu::{ArrivalOrder, Schedule};
pub use launch::{LaunchConfig, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, SENTINEL};
pub use select::{select, Backend, LaunchStats, SelectOptions, Selection};

/// Error types for gpusel operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SelError {
    /// Input length is not a whole number of blocks.
    #[error("input length {len} is not a multiple of block size {block_size}")]
    UnalignedInput { len: usize, block_size: usize },
    /// Block size is zero or exceeds the device limit.
    #[error("block size {block_size} outside 1..={max}")]
    InvalidBlockSize { block_size: usize, max: usize },
    /// Only one element per thread is supported.
    #[error("{0} elements per thread requested, only 1 is supported")]
    UnsupportedElementsPerThread(usize),
    /// Input has more elements than an `i32` index can address, or more
    /// bytes than the device can bind.
    #[error("input of {0} elements is too large")]
    InputTooLarge(usize),
    /// The device failed to launch, transfer, or returned an impossible result.
    #[error("device error: {0}")]
    Device(String),
    /// The requested backend is not available.
    #[error("unsupported backend or device")]
    Unsupported,
    /// The compacted set differs from the reference set.
    #[error(
        "verification failed: {missing} missing, {unexpected} unexpected, {duplicates} duplicate indices"
    )]
    VerificationMismatch {
        missing: usize,
        unexpected: usize,
        duplicates: usize,
    },
}

pub type SelResult<T> = Result<T, SelError>;
