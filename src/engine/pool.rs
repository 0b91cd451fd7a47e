//! DSP helper threads.
//!
//! When `cpus_used > 1` the RT thread hands the extra slots of each barrier
//! to parked helpers and runs slot 0 itself, then spins until the helpers
//! check in.  Helpers never allocate in steady state and never touch a
//! module outside their slot, so the per-module cells stay uncontended.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use super::rt::{DspGraph, RtBarrier, run_module};
use crate::regs::Regs;

/// One pending slot assignment.  All pointers are owned by the caller of
/// `run_barrier`, which blocks until `done` hits zero, so they outlive the
/// helper's use.
struct JobCell {
    graph: AtomicPtr<DspGraph>,
    slot: AtomicPtr<Vec<usize>>,
    regs: AtomicPtr<Regs>,
    done: AtomicPtr<AtomicUsize>,
    nframes: AtomicU32,
    shutdown: AtomicBool,
}

impl JobCell {
    fn new() -> Self {
        JobCell {
            graph: AtomicPtr::new(std::ptr::null_mut()),
            slot: AtomicPtr::new(std::ptr::null_mut()),
            regs: AtomicPtr::new(std::ptr::null_mut()),
            done: AtomicPtr::new(std::ptr::null_mut()),
            nframes: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        }
    }
}

struct Helper {
    thread: Option<JoinHandle<()>>,
    cell: Arc<JobCell>,
}

pub struct DspPool {
    helpers: Vec<Helper>,
}

impl DspPool {
    /// Spawn `cpus_used - 1` helpers (slot 0 stays on the RT thread).
    pub fn new(cpus_used: u32) -> Option<Self> {
        let extra = cpus_used.saturating_sub(1) as usize;
        if extra == 0 {
            return None;
        }
        let mut helpers = Vec::with_capacity(extra);
        for i in 0..extra {
            let cell = Arc::new(JobCell::new());
            let thread_cell = cell.clone();
            let thread = std::thread::Builder::new()
                .name(format!("synthpod-dsp-{}", i + 1))
                .spawn(move || helper_main(thread_cell))
                .ok()?;
            helpers.push(Helper {
                thread: Some(thread),
                cell,
            });
        }
        log::info!("dsp pool: {} helper thread(s)", extra);
        Some(DspPool { helpers })
    }

    /// Execute one barrier: helpers take slots 1.., the calling thread runs
    /// slot 0, then waits for the join.
    pub fn run_barrier(
        &self,
        graph: &DspGraph,
        barrier: &RtBarrier,
        nframes: u32,
        regs: &Regs,
        scratch: &mut Vec<u8>,
    ) {
        let extra = barrier.slots.len().saturating_sub(1);
        let handed = extra.min(self.helpers.len());
        let done = AtomicUsize::new(handed);

        for (helper, slot) in self.helpers.iter().zip(barrier.slots[1..1 + handed].iter()) {
            let cell = &helper.cell;
            cell.nframes.store(nframes, Ordering::Relaxed);
            cell.regs.store(regs as *const Regs as *mut Regs, Ordering::Relaxed);
            cell.slot
                .store(slot as *const Vec<usize> as *mut Vec<usize>, Ordering::Relaxed);
            cell.done
                .store(&done as *const AtomicUsize as *mut AtomicUsize, Ordering::Relaxed);
            // The graph pointer is the wake condition; release-publish it.
            cell.graph
                .store(graph as *const DspGraph as *mut DspGraph, Ordering::Release);
            if let Some(t) = &helper.thread {
                t.thread().unpark();
            }
        }

        // Slot 0 plus any slots beyond the helper count run here.
        for &idx in &barrier.slots[0] {
            run_module(graph, idx, nframes, scratch, regs);
        }
        for slot in barrier.slots[1 + handed..].iter() {
            for &idx in slot {
                run_module(graph, idx, nframes, scratch, regs);
            }
        }

        while done.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
    }
}

impl Drop for DspPool {
    fn drop(&mut self) {
        for helper in &self.helpers {
            helper.cell.shutdown.store(true, Ordering::Release);
            if let Some(t) = &helper.thread {
                t.thread().unpark();
            }
        }
        for helper in &mut self.helpers {
            if let Some(t) = helper.thread.take() {
                let _ = t.join();
            }
        }
    }
}

fn helper_main(cell: Arc<JobCell>) {
    let mut scratch: Vec<u8> = Vec::new();
    scratch.reserve_exact(64 * 1024);

    loop {
        let graph = cell.graph.swap(std::ptr::null_mut(), Ordering::Acquire);
        if graph.is_null() {
            if cell.shutdown.load(Ordering::Acquire) {
                break;
            }
            std::thread::park();
            continue;
        }

        let nframes = cell.nframes.load(Ordering::Relaxed);
        let slot = cell.slot.load(Ordering::Relaxed);
        let regs = cell.regs.load(Ordering::Relaxed);
        let done = cell.done.load(Ordering::Relaxed);

        // SAFETY: run_barrier keeps all referenced data alive until `done`
        // reaches zero, which only happens after this block finishes.
        unsafe {
            let graph = &*graph;
            let slot: &Vec<usize> = &*slot;
            let regs = &*regs;
            for &idx in slot {
                run_module(graph, idx, nframes, &mut scratch, regs);
            }
            (*done).fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// Keep the compiler honest about what crosses the thread boundary.
const _: () = {
    const fn assert_sync<T: Sync>() {}
    assert_sync::<DspGraph>();
    assert_sync::<Regs>();
};
