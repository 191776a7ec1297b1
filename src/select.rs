//! Launch harness.
//!
//! Validates the launch configuration, prepares the output buffer and
//! counter, launches the selection kernel once on the chosen backend and
//! waits for it to finish. The result exposes the whole output buffer
//! together with the final count, the grid geometry and timing.

use std::time::Duration;

use crate::cpu::{CpuDevice, Schedule};
use crate::launch::{LaunchConfig, DEFAULT_BLOCK_SIZE, ELEMENTS_PER_THREAD, SENTINEL};
use crate::{SelError, SelResult};

/// Compute backend for the selection kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// In-process thread-block device (always available).
    #[default]
    Cpu,
    /// OpenCL device (requires `opencl` feature and a device).
    #[cfg(feature = "opencl")]
    OpenCl,
    /// WebGPU device via wgpu (requires `webgpu` feature).
    #[cfg(feature = "webgpu")]
    WebGpu,
}

/// Options controlling a selection launch.
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// Which device runs the kernel.
    pub backend: Backend,
    /// Threads per block. The input length must be a multiple of this.
    pub block_size: usize,
    /// Elements examined per thread. Only 1 is supported; anything else is
    /// rejected before launch.
    pub elements_per_thread: usize,
    /// Block workers for the CPU backend. 0 = auto (all cores).
    pub threads: usize,
    /// Thread interleaving for the CPU backend.
    pub schedule: Schedule,
    /// OpenCL engine handle, required when `backend` is `Backend::OpenCl`.
    #[cfg(feature = "opencl")]
    pub opencl_engine: Option<std::sync::Arc<crate::opencl::OpenClEngine>>,
    /// WebGPU engine handle, required when `backend` is `Backend::WebGpu`.
    #[cfg(feature = "webgpu")]
    pub webgpu_engine: Option<std::sync::Arc<crate::webgpu::WebGpuEngine>>,
}

impl Default for SelectOptions {
    fn default() -> Self {
        SelectOptions {
            backend: Backend::Cpu,
            block_size: DEFAULT_BLOCK_SIZE,
            elements_per_thread: ELEMENTS_PER_THREAD,
            threads: 0,
            schedule: Schedule::default(),
            #[cfg(feature = "opencl")]
            opencl_engine: None,
            #[cfg(feature = "webgpu")]
            webgpu_engine: None,
        }
    }
}

/// Raw result read back from a device after the kernel completed.
#[derive(Debug)]
pub(crate) struct DeviceOutput {
    /// Whole `Selec` buffer.
    pub selec: Vec<i32>,
    /// Final value of the global counter.
    pub count: i32,
    /// Kernel execution time (device timestamps when available).
    pub elapsed: Duration,
}

/// Timing and traffic of one launch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LaunchStats {
    /// Kernel execution time.
    pub elapsed: Duration,
    /// Bytes of input read by the kernel.
    pub bytes_read: u64,
    /// Bytes of selected indices written by the kernel.
    pub bytes_written: u64,
}

impl LaunchStats {
    fn new(elapsed: Duration, len: usize, count: usize) -> Self {
        LaunchStats {
            elapsed,
            bytes_read: (len * std::mem::size_of::<f32>()) as u64,
            bytes_written: (count * std::mem::size_of::<i32>()) as u64,
        }
    }

    /// Effective memory bandwidth in GB/s, or `None` for a zero-length launch.
    pub fn bandwidth_gbps(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some((self.bytes_read + self.bytes_written) as f64 / secs / 1e9)
    }
}

/// Output of one selection launch.
#[derive(Debug, Clone)]
pub struct Selection {
    /// The whole output buffer. The first `count` entries are selected
    /// indices in unspecified order; the rest hold [`SENTINEL`].
    pub indices: Vec<i32>,
    /// Number of selected elements (final value of the global counter).
    pub count: usize,
    /// Grid geometry used for the launch.
    pub config: LaunchConfig,
    /// Timing of the launch.
    pub stats: LaunchStats,
}

impl Selection {
    /// The selected indices, in device order.
    pub fn selected(&self) -> &[i32] {
        &self.indices[..self.count]
    }

    /// The selected indices, ascending.
    pub fn sorted(&self) -> Vec<i32> {
        let mut sorted = self.selected().to_vec();
        sorted.sort_unstable();
        sorted
    }

    /// Output slots past the selected prefix.
    pub fn tail(&self) -> &[i32] {
        &self.indices[self.count..]
    }
}

/// Select the indices `i` with `input[i] >= limit`.
///
/// `input.len()` must be a multiple of `options.block_size`; see
/// [`crate::input::pad_to_block`] for inputs that are not. Blocks until the
/// kernel has completed.
pub fn select(input: &[f32], limit: f32, options: &SelectOptions) -> SelResult<Selection> {
    let config = LaunchConfig::new(input.len(), options.block_size, options.elements_per_thread)?;

    if config.is_empty() {
        return Ok(Selection {
            indices: Vec::new(),
            count: 0,
            config,
            stats: LaunchStats::default(),
        });
    }

    let output = match options.backend {
        Backend::Cpu => CpuDevice::new(options.threads, options.schedule).launch(input, limit, &config)?,
        #[cfg(feature = "opencl")]
        Backend::OpenCl => {
            let engine = options.opencl_engine.as_ref().ok_or(SelError::Unsupported)?;
            engine.select(input, limit, &config)?
        }
        #[cfg(feature = "webgpu")]
        Backend::WebGpu => {
            let engine = options.webgpu_engine.as_ref().ok_or(SelError::Unsupported)?;
            engine.select(input, limit, &config)?
        }
    };

    finish(output, input.len(), config)
}

/// Check a device result for impossible values and wrap it.
fn finish(output: DeviceOutput, len: usize, config: LaunchConfig) -> SelResult<Selection> {
    if output.selec.len() != len {
        return Err(SelError::Device(format!(
            "read back {} output slots, expected {len}",
            output.selec.len()
        )));
    }
    let count = usize::try_from(output.count)
        .ok()
        .filter(|&c| c <= len)
        .ok_or_else(|| SelError::Device(format!("counter out of range: {}", output.count)))?;

    let stats = LaunchStats::new(output.elapsed, len, count);
    log::debug!(
        "selected {count} of {len} in {:.3} ms",
        stats.elapsed.as_secs_f64() * 1000.0
    );

    Ok(Selection {
        indices: output.selec,
        count,
        config,
        stats,
    })
}
