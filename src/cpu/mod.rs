//! In-process thread-block device.
//!
//! Runs the selection kernel on the host with the same memory model as a
//! GPU: a grid of independent blocks, block-shared memory that lives only as
//! long as its block, barriers between phases, and a single grid-wide atomic
//! counter. It is always available and serves as the reference backend.
//!
//! Two schedules are provided:
//!
//! - [`Schedule::Lockstep`]: one worker runs a whole block, executing each
//!   phase for every logical thread before starting the next phase. The
//!   [`ArrivalOrder`] controls in which order threads reach the atomics,
//!   so different interleavings can be replayed deterministically.
//! - [`Schedule::Threaded`]: every logical thread is an OS thread and the
//!   phases are separated by a real [`Barrier`]. The block-local and global
//!   counters are raced for real.
//!
//! In both schedules, blocks are handed to a pool of workers through an
//! atomic cursor, so blocks complete and reserve output in any order.

mod block;


use std::io;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Barrier, Condvar, Mutex, PoisonError};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::launch::{LaunchConfig, SENTINEL};
use crate::select::DeviceOutput;
use crate::{SelError, SelResult};

use block::{run_phase, BlockShared, KernelArgs, ThreadIdx, PHASES};

/// Salt used to permute the block issue order (thread orders use the block index).
const BLOCK_ORDER_SALT: u64 = u64::MAX;

/// Order in which the logical threads of a block reach each phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArrivalOrder {
    /// Thread 0 first.
    #[default]
    Ascending,
    /// Last thread first.
    Descending,
    /// A seeded random permutation, different for every block and phase.
    /// Blocks are also issued in a permuted order.
    Shuffled { seed: u64 },
}

impl ArrivalOrder {
    /// Permutation of `0..len` for the given salt.
    pub(crate) fn permutation(&self, len: usize, salt: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        match *self {
            ArrivalOrder::Ascending => {}
            ArrivalOrder::Descending => order.reverse(),
            ArrivalOrder::Shuffled { seed } => {
                let mut rng = StdRng::seed_from_u64(seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                order.shuffle(&mut rng);
            }
        }
        order
    }
}

/// How the CPU device interleaves the threads of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Phase-by-phase execution on one worker per block.
    Lockstep(ArrivalOrder),
    /// One OS thread per logical thread, real barriers.
    Threaded,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Lockstep(ArrivalOrder::Ascending)
    }
}

/// Resolve thread count: 0 = auto (available_parallelism), otherwise use the given value.
pub(crate) fn resolve_thread_count(threads: usize) -> usize {
    if threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        threads
    }
}

/// Upper bound on live OS threads for [`Schedule::Threaded`], summed over
/// all block workers.
pub(crate) const MAX_THREADED_OS_THREADS: usize = 4096;

/// Host-side thread-block device.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CpuDevice {
    threads: usize,
    schedule: Schedule,
}

impl CpuDevice {
    /// Create a device with `threads` block workers (0 = one per core).
    pub(crate) fn new(threads: usize, schedule: Schedule) -> Self {
        CpuDevice { threads, schedule }
    }

    /// Number of block workers used for a grid of blocks of `block_dim`
    /// threads.
    ///
    /// Under [`Schedule::Threaded`] every worker holds `block_dim` OS threads
    /// while it runs a block, so the worker count is capped to keep the total
    /// within [`MAX_THREADED_OS_THREADS`].
    pub(crate) fn worker_count(&self, grid_size: usize, block_dim: usize) -> usize {
        let workers = resolve_thread_count(self.threads).min(grid_size);
        match self.schedule {
            Schedule::Lockstep(_) => workers,
            Schedule::Threaded => workers.min((MAX_THREADED_OS_THREADS / block_dim.max(1)).max(1)),
        }
    }

    /// Launch the selection kernel over `input` and wait for completion.
    ///
    /// Allocates `Selec` pre-filled with the sentinel and a zeroed counter,
    /// runs every block, then reads both back.
    pub(crate) fn launch(
        &self,
        input: &[f32],
        limit: f32,
        config: &LaunchConfig,
    ) -> SelResult<DeviceOutput> {
        if input.len() != config.len() {
            return Err(SelError::UnalignedInput {
                len: input.len(),
                block_size: config.block_size,
            });
        }

        let selec: Box<[AtomicI32]> = (0..input.len())
            .map(|_| AtomicI32::new(SENTINEL))
            .collect();
        let counter = AtomicI32::new(0);
        let args = KernelArgs {
            a: input,
            selec: &selec,
            limit,
            counter: &counter,
        };

        let block_order = match self.schedule {
            Schedule::Lockstep(order) => order.permutation(config.grid_size, BLOCK_ORDER_SALT),
            Schedule::Threaded => (0..config.grid_size).collect(),
        };
        let cursor = AtomicUsize::new(0);
        let workers = self.worker_count(config.grid_size, config.block_size);
        log::debug!(
            "cpu launch: {} blocks x {} threads on {} workers ({:?})",
            config.grid_size,
            config.block_size,
            workers,
            self.schedule
        );

        let t0 = Instant::now();
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (args, block_order, cursor) = (&args, &block_order, &cursor);
                let schedule = self.schedule;
                let block_dim = config.block_size;
                let spawned = std::thread::Builder::new()
                    .name(format!("gpusel-block-{worker}"))
                    .spawn_scoped(scope, move || -> SelResult<()> {
                        loop {
                            let next = cursor.fetch_add(1, Ordering::Relaxed);
                            let Some(&block) = block_order.get(next) else {
                                return Ok(());
                            };
                            match schedule {
                                Schedule::Lockstep(order) => {
                                    run_block_lockstep(args, block, block_dim, order)
                                }
                                Schedule::Threaded => run_block_threaded(args, block, block_dim)?,
                            }
                        }
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    // The running workers drain the cursor on their own.
                    Err(e) if !handles.is_empty() => {
                        log::warn!("cpu launch: {} of {workers} workers started: {e}", handles.len());
                        break;
                    }
                    Err(e) => return Err(SelError::Device(format!("spawning block worker: {e}"))),
                }
            }

            for handle in handles {
                handle
                    .join()
                    .map_err(|_| SelError::Device("cpu block worker panicked".into()))??;
            }
            Ok(())
        })?;
        let elapsed = t0.elapsed();

        Ok(DeviceOutput {
            selec: selec.iter().map(|v| v.load(Ordering::Relaxed)).collect(),
            count: counter.load(Ordering::Relaxed),
            elapsed,
        })
    }
}

/// Run one block on the calling thread, phase by phase.
fn run_block_lockstep(args: &KernelArgs<'_>, block: usize, block_dim: usize, order: ArrivalOrder) {
    let shared = BlockShared::new(block_dim);
    for (p, phase) in PHASES.into_iter().enumerate() {
        let salt = ((block as u64) << 2) | p as u64;
        for thread in order.permutation(block_dim, salt) {
            let t = ThreadIdx {
                block,
                thread,
                block_dim,
            };
            run_phase(phase, args, &shared, t);
        }
    }
    log::trace!(
        "block {block}: {} selected at offset {}",
        shared.local_count(),
        shared.offset()
    );
}

/// Holds the threads of a block until all of them exist.
struct StartGate {
    state: Mutex<Option<bool>>,
    cv: Condvar,
}

impl StartGate {
    fn new() -> Self {
        StartGate {
            state: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Release every waiting thread. `run == false` makes them exit.
    fn open(&self, run: bool) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(run);
        self.cv.notify_all();
    }

    /// Block until the gate opens and return whether to run.
    fn wait(&self) -> bool {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = self
            .cv
            .wait_while(guard, |state| state.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *guard == Some(true)
    }
}

/// Run one block with an OS thread per logical thread.
fn run_block_threaded(args: &KernelArgs<'_>, block: usize, block_dim: usize) -> SelResult<()> {
    run_block_threaded_with(args, block, block_dim, &|_| Ok(()))
}

/// [`run_block_threaded`] with a hook consulted before each thread is
/// spawned. A hook error is handled like a failed spawn.
///
/// No thread enters the kernel until all `block_dim` threads exist, so a
/// failed spawn never leaves the others waiting on a barrier that cannot
/// fill.
fn run_block_threaded_with(
    args: &KernelArgs<'_>,
    block: usize,
    block_dim: usize,
    before_spawn: &dyn Fn(usize) -> io::Result<()>,
) -> SelResult<()> {
    let shared = BlockShared::new(block_dim);
    let barrier = Barrier::new(block_dim);
    let gate = StartGate::new();
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(block_dim);
        let mut failed = None;
        for thread in 0..block_dim {
            let (shared, barrier, gate) = (&shared, &barrier, &gate);
            let spawned = before_spawn(thread).and_then(|()| {
                std::thread::Builder::new().spawn_scoped(scope, move || {
                    if !gate.wait() {
                        return;
                    }
                    let t = ThreadIdx {
                        block,
                        thread,
                        block_dim,
                    };
                    for (p, phase) in PHASES.into_iter().enumerate() {
                        if p > 0 {
                            barrier.wait();
                        }
                        run_phase(phase, args, shared, t);
                    }
                })
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    failed = Some((thread, e));
                    break;
                }
            }
        }

        gate.open(failed.is_none());
        let joined = handles.into_iter().try_for_each(|h| {
            h.join()
                .map_err(|_| SelError::Device(format!("block {block}: thread panicked")))
        });
        match failed {
            Some((thread, e)) => Err(SelError::Device(format!(
                "block {block}: failed to spawn thread {thread} of {block_dim}: {e}"
            ))),
            None => joined,
        }
    })?;
    log::trace!(
        "block {block}: {} selected at offset {}",
        shared.local_count(),
        shared.offset()
    );
    Ok(())
}
