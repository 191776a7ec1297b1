//! OpenCL backend.
//!
//! Runs `kernels/select.cl` with one work-item per input element. The block
//! size is a compile-time constant of the kernel (`-DBLOCK_SIZE=`), so a
//! program is built on first use of each block size and cached.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────────┐     ┌──────────────┐
//! │  Host (CPU)  │────▶│    OpenCL Device      │────▶│  Host (CPU)  │
//! │  a, selec=-1 │     │  select_them          │     │  selec,      │
//! │  counter=0   │     │  local pack + 1 add   │     │  counter     │
//! └──────────────┘     └───────────────────────┘     └──────────────┘
//! ```
//!
//! # Feature Gate
//!
//! This module is only available when compiled with the `opencl` feature:
//! ```bash
//! cargo build --features opencl
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # #[cfg(feature = "opencl")]
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use gpusel::opencl::OpenClEngine;
//! use gpusel::{select, Backend, SelectOptions};
//!
//! let engine = Arc::new(OpenClEngine::new()?);
//! println!("Using device: {}", engine.device_name());
//!
//! let opts = SelectOptions {
//!     backend: Backend::OpenCl,
//!     opencl_engine: Some(engine),
//!     ..Default::default()
//! };
//! let selection = select(&vec![1.0f32; 4096], 0.5, &opts)?;
//! assert_eq!(selection.count, 4096);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::ptr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{get_all_devices, Device, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE};
use opencl3::program::Program;
use opencl3::types::{cl_device_type, cl_float, cl_int, CL_BLOCKING};

use crate::launch::{LaunchConfig, SENTINEL};
use crate::select::DeviceOutput;
use crate::{SelError, SelResult};

/// Embedded OpenCL kernel source for the selection kernel.
const SELECT_KERNEL_SOURCE: &str = include_str!("../../kernels/select.cl");

/// Kernel entry point name.
const SELECT_KERNEL_NAME: &str = "select_them";

/// Block size used when smoke-testing a device during engine creation.
const PROBE_BLOCK_SIZE: usize = 64;

/// Information about a discovered OpenCL device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Device vendor string.
    pub vendor: String,
    /// Whether this is a GPU device (vs CPU or accelerator).
    pub is_gpu: bool,
    /// Maximum work-group size supported by the device.
    pub max_work_group_size: usize,
    /// Global memory size in bytes.
    pub global_mem_size: u64,
}

/// Probe all available OpenCL devices without creating an engine.
///
/// Returns an empty vec if no OpenCL runtime is installed or no
/// devices are found (never errors).
pub fn probe_devices() -> Vec<DeviceInfo> {
    let Ok(device_ids) = get_all_devices(CL_DEVICE_TYPE_ALL) else {
        return Vec::new();
    };

    device_ids
        .into_iter()
        .map(|id| {
            let dev = Device::new(id);
            let dev_type: cl_device_type = dev.dev_type().unwrap_or(0);
            DeviceInfo {
                name: dev.name().unwrap_or_default().trim().to_string(),
                vendor: dev.vendor().unwrap_or_default().trim().to_string(),
                is_gpu: (dev_type & CL_DEVICE_TYPE_GPU) != 0,
                max_work_group_size: dev.max_work_group_size().unwrap_or(1),
                global_mem_size: dev.global_mem_size().unwrap_or(0),
            }
        })
        .collect()
}

/// Return the number of available OpenCL devices. Returns 0 if OpenCL is
/// not available.
pub fn device_count() -> usize {
    get_all_devices(CL_DEVICE_TYPE_ALL)
        .map(|ids| ids.len())
        .unwrap_or(0)
}

fn device_err(what: &'static str) -> impl FnOnce(ClError) -> SelError {
    move |err| SelError::Device(format!("{what}: {err}"))
}

fn build_flags(block_size: usize) -> String {
    format!("-Werror -DBLOCK_SIZE={block_size}")
}

/// OpenCL compute engine.
///
/// Manages the device, context, command queue and the compiled selection
/// kernels. Create one engine and reuse it across launches.
///
/// Note: `Debug` is implemented manually because the OpenCL handle
/// types from `opencl3` don't implement `Debug`.
pub struct OpenClEngine {
    device: Device,
    context: Context,
    queue: CommandQueue,
    /// Compiled `select_them`, keyed by block size. Held locked for the
    /// whole dispatch since kernel arguments are per-kernel state.
    kernels: Mutex<HashMap<usize, Kernel>>,
    device_name: String,
    max_work_group_size: usize,
    max_alloc_size: u64,
    profiling: bool,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for context, command queue,
// and memory objects. Kernels are only touched under the `kernels` lock.
unsafe impl Send for OpenClEngine {}
unsafe impl Sync for OpenClEngine {}

impl std::fmt::Debug for OpenClEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClEngine")
            .field("device_name", &self.device_name)
            .field("max_work_group_size", &self.max_work_group_size)
            .field("profiling", &self.profiling)
            .finish_non_exhaustive()
    }
}

impl OpenClEngine {
    /// Create a new engine, selecting the best available GPU device.
    ///
    /// Falls back to the first usable device of any type. Returns
    /// `SelError::Unsupported` if no device can build the kernel.
    pub fn new() -> SelResult<Self> {
        Self::create(false)
    }

    /// Create a new engine with profiling enabled.
    ///
    /// With profiling on, the command queue records event timestamps and
    /// the reported kernel time is the device-measured execution time.
    pub fn with_profiling(profiling: bool) -> SelResult<Self> {
        Self::create(profiling)
    }

    fn create(profiling: bool) -> SelResult<Self> {
        let all_ids = get_all_devices(CL_DEVICE_TYPE_ALL).map_err(|_| SelError::Unsupported)?;
        if all_ids.is_empty() {
            return Err(SelError::Unsupported);
        }

        // Discrete GPUs first (most global memory), then everything else.
        let mut gpu_ids = get_all_devices(CL_DEVICE_TYPE_GPU).unwrap_or_default();
        gpu_ids.sort_by_key(|id| std::cmp::Reverse(Device::new(*id).global_mem_size().unwrap_or(0)));
        let candidates: Vec<_> = gpu_ids.iter().chain(all_ids.iter()).copied().collect();

        let queue_props = if profiling {
            CL_QUEUE_PROFILING_ENABLE
        } else {
            0
        };

        // Some drivers accept context and queue creation but fail on real
        // kernel code, so a candidate must also build the selection kernel.
        let mut chosen = None;
        for &id in &candidates {
            let dev = Device::new(id);
            let Ok(ctx) = Context::from_device(&dev) else {
                continue;
            };
            #[allow(deprecated)]
            let Ok(q) = CommandQueue::create_default(&ctx, queue_props) else {
                continue;
            };
            let probe = build_flags(PROBE_BLOCK_SIZE.min(dev.max_work_group_size().unwrap_or(1)));
            if let Err(log) = Program::create_and_build_from_source(&ctx, SELECT_KERNEL_SOURCE, &probe) {
                log::debug!("opencl: skipping {:?}: {log}", dev.name().unwrap_or_default());
                continue;
            }
            chosen = Some((dev, ctx, q));
            break;
        }
        let (device, context, queue) = chosen.ok_or(SelError::Unsupported)?;

        let device_name = device.name().unwrap_or_default().trim().to_string();
        let max_work_group_size = device.max_work_group_size().unwrap_or(1);
        let max_alloc_size = device.max_mem_alloc_size().unwrap_or(u64::MAX);
        log::debug!("opencl: using {device_name} (max work-group {max_work_group_size})");

        Ok(OpenClEngine {
            device,
            context,
            queue,
            kernels: Mutex::new(HashMap::new()),
            device_name,
            max_work_group_size,
            max_alloc_size,
            profiling,
        })
    }

    /// Return the name of the selected compute device.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Return the maximum work-group size for the device.
    pub fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    /// Whether profiling is enabled on this engine.
    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Extract elapsed time in milliseconds from a completed OpenCL event.
    ///
    /// Returns `None` if profiling is disabled or the event doesn't have
    /// timing data.
    pub fn event_elapsed_ms(event: &Event) -> Option<f64> {
        let start = event.profiling_command_start().ok()?;
        let end = event.profiling_command_end().ok()?;
        Some((end - start) as f64 / 1_000_000.0)
    }

    fn build_kernel(&self, block_size: usize) -> SelResult<Kernel> {
        let program = Program::create_and_build_from_source(
            &self.context,
            SELECT_KERNEL_SOURCE,
            &build_flags(block_size),
        )
        .map_err(|log| SelError::Device(format!("building select kernel: {log}")))?;
        let kernel =
            Kernel::create(&program, SELECT_KERNEL_NAME).map_err(device_err("creating kernel"))?;

        // Register pressure can push the kernel's limit below the device's.
        let kernel_max = kernel
            .get_work_group_size(self.device.id())
            .unwrap_or(self.max_work_group_size);
        if block_size > kernel_max {
            return Err(SelError::InvalidBlockSize {
                block_size,
                max: kernel_max,
            });
        }
        log::debug!("opencl: built select kernel for block size {block_size}");
        Ok(kernel)
    }

    /// Run the selection kernel over `input` and read back the result.
    pub(crate) fn select(
        &self,
        input: &[f32],
        limit: f32,
        config: &LaunchConfig,
    ) -> SelResult<DeviceOutput> {
        config.check_device_limit(self.max_work_group_size)?;
        let n = input.len();
        if (n * std::mem::size_of::<f32>()) as u64 > self.max_alloc_size {
            return Err(SelError::InputTooLarge(n));
        }

        let mut kernels = self
            .kernels
            .lock()
            .map_err(|_| SelError::Device("kernel cache poisoned".into()))?;
        if !kernels.contains_key(&config.block_size) {
            let kernel = self.build_kernel(config.block_size)?;
            kernels.insert(config.block_size, kernel);
        }
        let kernel = kernels
            .get(&config.block_size)
            .ok_or_else(|| SelError::Device("kernel cache miss".into()))?;

        let mut a_buf = unsafe {
            Buffer::<cl_float>::create(&self.context, CL_MEM_READ_ONLY, n, ptr::null_mut())
                .map_err(device_err("allocating input"))?
        };
        let mut selec_buf = unsafe {
            Buffer::<cl_int>::create(&self.context, CL_MEM_READ_WRITE, n, ptr::null_mut())
                .map_err(device_err("allocating output"))?
        };
        let mut counter_buf = unsafe {
            Buffer::<cl_int>::create(&self.context, CL_MEM_READ_WRITE, 1, ptr::null_mut())
                .map_err(device_err("allocating counter"))?
        };

        let sentinels = vec![SENTINEL; n];
        unsafe {
            self.queue
                .enqueue_write_buffer(&mut a_buf, CL_BLOCKING, 0, input, &[])
                .map_err(device_err("uploading input"))?
                .wait()
                .map_err(device_err("uploading input"))?;
            self.queue
                .enqueue_write_buffer(&mut selec_buf, CL_BLOCKING, 0, &sentinels, &[])
                .map_err(device_err("clearing output"))?
                .wait()
                .map_err(device_err("clearing output"))?;
            self.queue
                .enqueue_write_buffer(&mut counter_buf, CL_BLOCKING, 0, &[0], &[])
                .map_err(device_err("zeroing counter"))?
                .wait()
                .map_err(device_err("zeroing counter"))?;
        }

        let limit_arg: cl_float = limit;
        let t0 = Instant::now();
        let kernel_event = unsafe {
            ExecuteKernel::new(kernel)
                .set_arg(&a_buf)
                .set_arg(&selec_buf)
                .set_arg(&limit_arg)
                .set_arg(&counter_buf)
                .set_global_work_size(n)
                .set_local_work_size(config.block_size)
                .enqueue_nd_range(&self.queue)
                .map_err(device_err("launching select_them"))?
        };
        kernel_event
            .wait()
            .map_err(device_err("waiting for select_them"))?;
        let wall = t0.elapsed();
        drop(kernels);

        let elapsed = if self.profiling {
            match Self::event_elapsed_ms(&kernel_event) {
                Some(ms) => {
                    log::debug!("opencl select_them: {ms:.3} ms");
                    Duration::from_secs_f64(ms / 1000.0)
                }
                None => {
                    log::warn!("opencl: no event timestamps, using wall-clock time");
                    wall
                }
            }
        } else {
            wall
        };

        let mut selec = vec![0 as cl_int; n];
        let mut count = [0 as cl_int; 1];
        unsafe {
            self.queue
                .enqueue_read_buffer(&selec_buf, CL_BLOCKING, 0, &mut selec, &[])
                .map_err(device_err("reading output"))?
                .wait()
                .map_err(device_err("reading output"))?;
            self.queue
                .enqueue_read_buffer(&counter_buf, CL_BLOCKING, 0, &mut count, &[])
                .map_err(device_err("reading counter"))?
                .wait()
                .map_err(device_err("reading counter"))?;
        }

        Ok(DeviceOutput {
            selec,
            count: count[0],
            elapsed,
        })
    }
}
