//! WebGPU (wgpu) backend.
//!
//! Runs `kernels/select.wgsl` on any adapter wgpu supports (Vulkan, Metal,
//! DX12). The workgroup size is a shader constant, so one pipeline is built
//! per block size on first use and cached.
//!
//! # Feature Gate
//!
//! This module is only available when compiled with the `webgpu` feature:
//! ```bash
//! cargo build --features webgpu
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # #[cfg(feature = "webgpu")]
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use gpusel::webgpu::WebGpuEngine;
//! use gpusel::{select, Backend, SelectOptions};
//!
//! let engine = Arc::new(WebGpuEngine::new()?);
//! println!("Using device: {}", engine.device_name());
//!
//! let opts = SelectOptions {
//!     backend: Backend::WebGpu,
//!     block_size: 256,
//!     webgpu_engine: Some(engine),
//!     ..Default::default()
//! };
//! let selection = select(&vec![0.5f32; 4096], 0.5, &opts)?;
//! assert_eq!(selection.count, 4096);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use wgpu::util::DeviceExt;

use crate::launch::{LaunchConfig, SENTINEL};
use crate::select::DeviceOutput;
use crate::{SelError, SelResult};

#[cfg(test)]
#[path = "tests.rs"]
mod tests;

/// Embedded WGSL kernel source for the selection kernel (without its
/// `BLOCK_SIZE` constant).
const SELECT_KERNEL_SOURCE: &str = include_str!("../../kernels/select.wgsl");

/// Kernel entry point name.
const SELECT_KERNEL_NAME: &str = "select_them";

/// Uniform block matching `Params` in select.wgsl. 4 x 4 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SelectParams {
    limit: f32,
    n: u32,
    blocks_x: u32,
    num_blocks: u32,
}

// SAFETY: SelectParams is repr(C) with four 4-byte fields and no padding.
unsafe impl bytemuck::Pod for SelectParams {}
unsafe impl bytemuck::Zeroable for SelectParams {}

/// Information about a discovered WebGPU device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Device vendor string.
    pub vendor: String,
    /// Whether this is a GPU device (discrete or integrated).
    pub is_gpu: bool,
    /// Maximum invocations per workgroup.
    pub max_work_group_size: usize,
}

/// Probe all available WebGPU devices without creating an engine.
pub fn probe_devices() -> Vec<DeviceInfo> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .map(|adapter| {
            let info = adapter.get_info();
            let limits = adapter.limits();
            DeviceInfo {
                name: info.name.clone(),
                vendor: format!("{:?}", info.vendor),
                is_gpu: matches!(
                    info.device_type,
                    wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu
                ),
                max_work_group_size: limits.max_compute_invocations_per_workgroup as usize,
            }
        })
        .collect()
}

/// Return the number of available WebGPU devices.
pub fn device_count() -> usize {
    probe_devices().len()
}

/// WGSL source with the workgroup size baked in.
fn shader_source(block_size: usize) -> String {
    format!("const BLOCK_SIZE: u32 = {block_size}u;\n{SELECT_KERNEL_SOURCE}")
}

/// WebGPU compute engine.
///
/// Manages the wgpu device, queue and the per-block-size pipelines.
/// Create one engine and reuse it across launches.
pub struct WebGpuEngine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    /// Compiled `select_them` pipelines keyed by block size.
    pipelines: Mutex<HashMap<usize, wgpu::ComputePipeline>>,
    device_name: String,
    /// Maximum invocations per workgroup.
    max_work_group_size: usize,
    /// Maximum workgroups per dispatch dimension (typically 65535).
    max_workgroups_per_dim: u32,
    /// Maximum storage buffer binding size in bytes.
    max_buffer_size: u32,
    profiling: bool,
    /// GPU timestamp profiler (None when profiling is off or unsupported).
    profiler: Option<Mutex<wgpu_profiler::GpuProfiler>>,
}

impl std::fmt::Debug for WebGpuEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebGpuEngine")
            .field("device_name", &self.device_name)
            .field("max_work_group_size", &self.max_work_group_size)
            .field("profiling", &self.profiling)
            .finish_non_exhaustive()
    }
}

/// Decode a mapped readback into `i32`s. Copies, so `raw` need not be
/// 4-byte aligned.
fn decode_i32s(raw: &[u8]) -> Vec<i32> {
    bytemuck::pod_collect_to_vec(raw)
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> SelResult<MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| SelError::Device(format!("{what} lock poisoned")))
}

impl WebGpuEngine {
    /// Create a new engine, selecting the best available GPU device.
    pub fn new() -> SelResult<Self> {
        Self::create(false)
    }

    /// Create a new engine with profiling enabled.
    ///
    /// When profiling is on, `TIMESTAMP_QUERY` is requested and the kernel
    /// is timed with `wgpu-profiler`. Adapters without timestamp support
    /// fall back to wall-clock timing.
    pub fn with_profiling(profiling: bool) -> SelResult<Self> {
        Self::create(profiling)
    }

    fn create(profiling: bool) -> SelResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .map_err(|_| SelError::Unsupported)?;

        let info = adapter.get_info();
        let device_name = info.name.clone();

        // Software adapters are too slow for compute work.
        if matches!(info.device_type, wgpu::DeviceType::Cpu) {
            return Err(SelError::Unsupported);
        }

        // The default block size needs more than the downlevel limit of
        // 256 invocations, so take what the adapter offers.
        let limits = adapter.limits();
        let max_work_group_size = (limits.max_compute_invocations_per_workgroup as usize)
            .min(limits.max_compute_workgroup_size_x as usize);
        let max_workgroups_per_dim = limits.max_compute_workgroups_per_dimension;
        let max_buffer_size = limits.max_storage_buffer_binding_size;

        let supports_timestamps = adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        let use_timestamps = profiling && supports_timestamps;
        if profiling && !supports_timestamps {
            log::warn!("webgpu: {device_name} has no timestamp queries, using wall-clock time");
        }
        let required_features = if use_timestamps {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("gpusel-webgpu"),
            required_features,
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::Performance,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|_| SelError::Unsupported)?;

        let profiler = if use_timestamps {
            wgpu_profiler::GpuProfiler::new(&device, wgpu_profiler::GpuProfilerSettings::default())
                .ok()
                .map(Mutex::new)
        } else {
            None
        };

        log::debug!("webgpu: using {device_name} (max workgroup {max_work_group_size})");

        Ok(WebGpuEngine {
            device,
            queue,
            pipelines: Mutex::new(HashMap::new()),
            device_name,
            max_work_group_size,
            max_workgroups_per_dim,
            max_buffer_size,
            profiling,
            profiler,
        })
    }

    /// Return the name of the selected compute device.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Return the maximum workgroup size for the device.
    pub fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    /// Whether profiling is enabled on this engine.
    pub fn profiling(&self) -> bool {
        self.profiling
    }

    /// Block the host until all submitted GPU work completes.
    fn poll_wait(&self) -> SelResult<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|e| SelError::Device(format!("poll: {e}")))
    }

    fn create_buffer_init(&self, label: &str, data: &[u8], usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage,
            })
    }

    fn create_buffer(&self, label: &str, size: u64, usage: wgpu::BufferUsages) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Read a buffer back to the CPU.
    fn read_buffer(&self, buffer: &wgpu::Buffer, size: u64) -> SelResult<Vec<u8>> {
        let staging = self.create_buffer(
            "staging",
            size,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read_buffer"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.poll_wait()?;
        rx.recv()
            .map_err(|_| SelError::Device("readback callback dropped".into()))?
            .map_err(|e| SelError::Device(format!("mapping readback buffer: {e}")))?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    /// Compute 2D tiling dimensions for a given workgroup count.
    fn tile_workgroups(&self, workgroups: usize) -> SelResult<(u32, u32)> {
        let max = self.max_workgroups_per_dim as usize;
        if workgroups <= max {
            return Ok((workgroups as u32, 1));
        }
        let wy = workgroups.div_ceil(max);
        if wy > max {
            return Err(SelError::InputTooLarge(workgroups));
        }
        Ok((max as u32, wy as u32))
    }

    /// Build (or fetch) the pipeline for `block_size`.
    fn pipeline(&self, block_size: usize) -> SelResult<wgpu::ComputePipeline> {
        let mut cache = lock(&self.pipelines, "pipeline cache")?;
        if let Some(p) = cache.get(&block_size) {
            return Ok(p.clone());
        }

        let t0 = Instant::now();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("select"),
                source: wgpu::ShaderSource::Wgsl(shader_source(block_size).into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("select_them"),
                layout: None,
                module: &module,
                entry_point: Some(SELECT_KERNEL_NAME),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(SelError::Device(format!("building select pipeline: {err}")));
        }
        log::debug!(
            "webgpu: compiled select.wgsl for block size {block_size} in {:.3} ms",
            t0.elapsed().as_secs_f64() * 1000.0
        );

        cache.insert(block_size, pipeline.clone());
        Ok(pipeline)
    }

    /// Record the selection dispatch, wrapped in a profiler query when
    /// timestamps are available.
    fn record_dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        (wx, wy): (u32, u32),
    ) -> SelResult<()> {
        let mut profiler = match &self.profiler {
            Some(p) => Some(lock(p, "profiler")?),
            None => None,
        };
        let query = profiler
            .as_mut()
            .map(|p| p.begin_pass_query(SELECT_KERNEL_NAME, encoder));
        let timestamp_writes = query.as_ref().and_then(|q| q.compute_pass_timestamp_writes());

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(SELECT_KERNEL_NAME),
                timestamp_writes,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(wx, wy, 1);
        }

        if let (Some(p), Some(q)) = (profiler.as_mut(), query) {
            p.end_query(encoder, q);
            p.resolve_queries(encoder);
        }
        Ok(())
    }

    /// Collect the kernel time of the last profiled frame.
    fn profiled_kernel_time(&self) -> SelResult<Option<Duration>> {
        let Some(p) = &self.profiler else {
            return Ok(None);
        };
        if lock(p, "profiler")?.end_frame().is_err() {
            return Ok(None);
        }
        self.poll_wait()?;
        let results = lock(p, "profiler")?.process_finished_frame(self.queue.get_timestamp_period());
        let secs: f64 = results
            .unwrap_or_default()
            .iter()
            .filter_map(|r| r.time.as_ref().map(|t| t.end - t.start))
            .sum();
        Ok((secs > 0.0).then(|| Duration::from_secs_f64(secs)))
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
        let bytes = (n * std::mem::size_of::<f32>()) as u64;
        if bytes > self.max_buffer_size as u64 {
            return Err(SelError::InputTooLarge(n));
        }
        let (wx, wy) = self.tile_workgroups(config.grid_size)?;
        let pipeline = self.pipeline(config.block_size)?;

        let a_buf = self.create_buffer_init(
            "select_a",
            bytemuck::cast_slice(input),
            wgpu::BufferUsages::STORAGE,
        );
        let sentinels = vec![SENTINEL; n];
        let selec_buf = self.create_buffer_init(
            "select_selec",
            bytemuck::cast_slice(&sentinels),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        );
        let counter_buf = self.create_buffer_init(
            "select_counter",
            bytemuck::cast_slice(&[0i32]),
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        );
        let params = SelectParams {
            limit,
            n: n as u32,
            blocks_x: wx,
            num_blocks: config.grid_size as u32,
        };
        let params_buf = self.create_buffer_init(
            "select_params",
            bytemuck::bytes_of(&params),
            wgpu::BufferUsages::UNIFORM,
        );

        let bg_layout = pipeline.get_bind_group_layout(0);
        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("select_bg"),
            layout: &bg_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: a_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: selec_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: counter_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });

        log::debug!(
            "webgpu launch: {} blocks x {} threads as {wx}x{wy} workgroups",
            config.grid_size,
            config.block_size
        );

        let t0 = Instant::now();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(SELECT_KERNEL_NAME),
            });
        self.record_dispatch(&mut encoder, &pipeline, &bg, (wx, wy))?;
        self.queue.submit(Some(encoder.finish()));
        self.poll_wait()?;
        let wall = t0.elapsed();

        let elapsed = match self.profiled_kernel_time()? {
            Some(t) => {
                log::debug!("webgpu select_them: {:.3} ms", t.as_secs_f64() * 1000.0);
                t
            }
            None => wall,
        };

        let raw_selec = self.read_buffer(&selec_buf, bytes)?;
        let raw_count = self.read_buffer(&counter_buf, std::mem::size_of::<i32>() as u64)?;
        let selec = decode_i32s(&raw_selec);
        let count: i32 = bytemuck::pod_read_unaligned(&raw_count);

        Ok(DeviceOutput {
            selec,
            count,
            elapsed,
        })
    }
}
