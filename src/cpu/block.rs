//! Per-block body of the selection kernel.
//!
//! Each logical thread runs the same four phases. The executor in
//! `cpu/mod.rs` decides how threads interleave within a phase; the only
//! guarantee a phase may rely on is that every thread of the block has
//! finished the previous phase (the barrier).
//!
//! ```text
//!  Init       selec_smem[t] = -1, counter_smem = 0 (thread 0)
//!  ── barrier ──
//!  Compact    if a[idx] >= limit: selec_smem[counter_smem++] = idx
//!  ── barrier ──
//!  Reserve    offset_smem = counter.fetch_add(counter_smem) (thread 0)
//!  ── barrier ──
//!  Writeback  if selec_smem[t] != -1: selec[offset_smem + t] = selec_smem[t]
//! ```

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::launch::SENTINEL;

/// Kernel arguments shared by every block of one launch.
pub(crate) struct KernelArgs<'a> {
    /// Input values, one per thread.
    pub a: &'a [f32],
    /// Output indices, pre-filled with the sentinel.
    pub selec: &'a [AtomicI32],
    /// Selection threshold (inclusive).
    pub limit: f32,
    /// Grid-wide count of selected elements, zero at launch.
    pub counter: &'a AtomicI32,
}

/// Block-shared memory, alive for the duration of one block.
pub(crate) struct BlockShared {
    selec_smem: Box<[AtomicI32]>,
    counter_smem: AtomicU32,
    offset_smem: AtomicI32,
}

impl BlockShared {
    pub(crate) fn new(block_dim: usize) -> Self {
        // Contents are unspecified until Init runs, as on a device.
        BlockShared {
            selec_smem: (0..block_dim).map(|_| AtomicI32::new(0)).collect(),
            counter_smem: AtomicU32::new(0),
            offset_smem: AtomicI32::new(0),
        }
    }

    /// Number of indices compacted into this block so far.
    pub(crate) fn local_count(&self) -> u32 {
        self.counter_smem.load(Ordering::Relaxed)
    }

    /// Offset reserved in the output by the Reserve phase.
    pub(crate) fn offset(&self) -> i32 {
        self.offset_smem.load(Ordering::Relaxed)
    }

    /// Snapshot of the block-local buffer.
    #[cfg(test)]
    pub(crate) fn buffer(&self) -> Vec<i32> {
        self.selec_smem
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect()
    }
}

/// Position of one logical thread in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThreadIdx {
    pub block: usize,
    pub thread: usize,
    pub block_dim: usize,
}

impl ThreadIdx {
    /// Index of the input element owned by this thread.
    pub(crate) fn global(&self) -> usize {
        self.block * self.block_dim + self.thread
    }

    /// Whether this thread performs the block's single-thread duties.
    fn is_leader(&self) -> bool {
        self.thread == 0
    }
}

/// Kernel phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Init,
    Compact,
    Reserve,
    Writeback,
}

pub(crate) const PHASES: [Phase; 4] = [Phase::Init, Phase::Compact, Phase::Reserve, Phase::Writeback];

/// Run one phase for one thread.
pub(crate) fn run_phase(phase: Phase, args: &KernelArgs<'_>, shared: &BlockShared, t: ThreadIdx) {
    match phase {
        Phase::Init => init(shared, t),
        Phase::Compact => compact(args, shared, t),
        Phase::Reserve => reserve(args, shared, t),
        Phase::Writeback => writeback(args, shared, t),
    }
}

fn init(shared: &BlockShared, t: ThreadIdx) {
    shared.selec_smem[t.thread].store(SENTINEL, Ordering::Relaxed);
    if t.is_leader() {
        shared.counter_smem.store(0, Ordering::Relaxed);
    }
}

fn compact(args: &KernelArgs<'_>, shared: &BlockShared, t: ThreadIdx) {
    let idx = t.global();
    if args.a[idx] >= args.limit {
        let slot = shared.counter_smem.fetch_add(1, Ordering::Relaxed) as usize;
        debug_assert!(
            slot < shared.selec_smem.len(),
            "block {} compacted more than {} elements",
            t.block,
            t.block_dim
        );
        shared.selec_smem[slot].store(idx as i32, Ordering::Relaxed);
    }
}

fn reserve(args: &KernelArgs<'_>, shared: &BlockShared, t: ThreadIdx) {
    if t.is_leader() {
        let local = shared.counter_smem.load(Ordering::Relaxed) as i32;
        let offset = args.counter.fetch_add(local, Ordering::AcqRel);
        shared.offset_smem.store(offset, Ordering::Relaxed);
    }
}

fn writeback(args: &KernelArgs<'_>, shared: &BlockShared, t: ThreadIdx) {
    let value = shared.selec_smem[t.thread].load(Ordering::Relaxed);
    if value != SENTINEL {
        let dst = shared.offset_smem.load(Ordering::Relaxed) as usize + t.thread;
        args.selec[dst].store(value, Ordering::Relaxed);
    }
}
