//! The realtime engine.
//!
//! [`DspState::process`] is the audio callback body.  It drains the rings,
//! walks the compiled graph barrier by barrier, mixes fan-in, emits
//! subscription notifications and runs automation - without ever touching
//! the heap or blocking.  Faults are counted, never fatal; a period always
//! completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use atomic_refcell::AtomicRefCell;
use basedrop::{Shared, SharedCell};

use crate::atom::{self, SeqIter};
use crate::automation::{self, AutoKind, AutoSlot, SlotSink};
use crate::graph::module::{ModuleDsp, ProfileSlot, RtModule};
use crate::graph::port::PortBuf;
use crate::plugin::types::{PortDirection, PortType};
use crate::protocol::compact;
use crate::regs::Regs;
use crate::ring::{RingRx, RingTx};
use crate::urid::Urid;

/// Upper bound on concurrently subscribed ports.
pub const SUBS_MAX: usize = 512;
/// Scratch sizes, reserved once at construction.
const FRAME_SCRATCH: usize = 64 * 1024;
const ATOM_SCRATCH: usize = 64 * 1024;
const OBJ_SCRATCH: usize = 256;
/// At most this many fan-in sources merge into one atom sink.
pub const ATOM_MERGE_MAX: usize = 16;

// ---------------------------------------------------------------------------
// Compiled graph
// ---------------------------------------------------------------------------

/// Where a module input takes its data from when its own buffer is elided.
#[derive(Debug, Clone, Copy)]
pub enum Binding {
    /// Single incident edge with unit gain: read the producer's buffer.
    Borrow { src_module: usize, src_port: u32 },
    /// Single feedback edge: read the previous-period holding buffer.
    BorrowFeedback { feedback: usize },
}

/// One fan-in source of a mixer.
#[derive(Debug, Clone, Copy)]
pub struct MixSource {
    pub module: usize,
    pub port: u32,
    pub gain: f32,
    /// When set, read from the feedback holding buffer instead.
    pub feedback: Option<usize>,
}

/// Fan-in mixing into one sink input port; runs just before the sink
/// module, on the thread that runs it.  Sources are ordered by scheduler
/// position (the Control tie-break).
#[derive(Debug, Clone)]
pub struct MixTask {
    pub sink_port: u32,
    pub ty: PortType,
    pub sources: Vec<MixSource>,
}

/// End-of-period copy of a producer port into a holding buffer, read by
/// feedback consumers in the next period.
pub struct FeedbackTask {
    pub src_module: usize,
    pub src_port: u32,
    pub buf: AtomicRefCell<PortBuf>,
}

pub struct ModuleEntry {
    pub rt: Shared<RtModule>,
    /// Input ports bound away from their own buffer; applied every period.
    pub borrows: Vec<(u32, Binding)>,
    pub mixes: Vec<MixTask>,
}

pub struct RtBarrier {
    pub slots: Vec<Vec<usize>>,
}

/// The compiled, RT-consumable graph.  Built on the worker, swapped in by
/// pointer, retired by the collector once RT releases it.
pub struct DspGraph {
    /// Sorted by URN; `urns[i]` is `modules[i].rt.urn`.
    pub urns: Vec<Urid>,
    pub modules: Vec<ModuleEntry>,
    pub barriers: Vec<RtBarrier>,
    pub feedbacks: Vec<FeedbackTask>,
    pub autos: AtomicRefCell<Vec<AutoSlot>>,
    pub source_idx: usize,
    pub sink_idx: usize,
    /// Atom port carrying external events on the system source/sink.
    pub source_event_port: u32,
    pub sink_event_port: u32,
    pub cpus_used: u32,
    pub generation: u64,
}

impl DspGraph {
    pub fn module_index(&self, urn: Urid) -> Option<usize> {
        self.urns.binary_search(&urn).ok()
    }
}

// ---------------------------------------------------------------------------
// RT fault counters
// ---------------------------------------------------------------------------

/// Lock-free counters readable from any thread; the RT log.
#[derive(Debug, Default)]
pub struct RtCounters {
    /// Messages dropped because a ring was full.
    pub ring_full: AtomicU64,
    /// Subscription table overflows.
    pub subs_full: AtomicU64,
    /// Atom sequences that could not take another event.
    pub seq_full: AtomicU64,
    /// Lookups that failed on RT (stale URN etc.).
    pub stale: AtomicU64,
    /// Periods whose CPU time exceeded the deadline.
    pub xruns: AtomicU64,
    pub periods: AtomicU64,
}

// ---------------------------------------------------------------------------
// DSP state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubSlot {
    urn: Urid,
    index: u32,
    protocol: Urid,
}

pub struct DspState {
    cell: Arc<SharedCell<DspGraph>>,
    ui_rx: RingRx,
    ui_tx: RingTx,
    wk_rx: RingRx,
    wk_tx: RingTx,
    regs: Arc<Regs>,
    subs: Vec<SubSlot>,
    scratch: Vec<u8>,
    atom_scratch: Vec<u8>,
    obj_scratch: [u8; OBJ_SCRATCH],
    pool: Option<super::pool::DspPool>,
    pub counters: Arc<RtCounters>,
    pub profile: Arc<ProfileSlot>,
    sample_rate: u32,
}

impl DspState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cell: Arc<SharedCell<DspGraph>>,
        ui_rx: RingRx,
        ui_tx: RingTx,
        wk_rx: RingRx,
        wk_tx: RingTx,
        regs: Arc<Regs>,
        pool: Option<super::pool::DspPool>,
        sample_rate: u32,
    ) -> Self {
        let mut scratch = Vec::new();
        scratch.reserve_exact(FRAME_SCRATCH);
        let mut atom_scratch = Vec::new();
        atom_scratch.reserve_exact(ATOM_SCRATCH);
        DspState {
            cell,
            ui_rx,
            ui_tx,
            wk_rx,
            wk_tx,
            regs,
            subs: Vec::with_capacity(SUBS_MAX),
            scratch,
            atom_scratch,
            obj_scratch: [0; OBJ_SCRATCH],
            pool,
            counters: Arc::new(RtCounters::default()),
            profile: Arc::new(ProfileSlot::default()),
            sample_rate,
        }
    }

    /// One audio period.  `inputs`/`outputs` are the driver's channel
    /// buffers; `midi_in`/`midi_out` are atom sequences for external
    /// events.  `nframes` must not exceed the period size the graph was
    /// compiled for.
    pub fn process(
        &mut self,
        nframes: u32,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        midi_in: &[u8],
        midi_out: &mut [u8],
    ) {
        let t0 = Instant::now();
        let graph = self.cell.get();

        // 1a. Worker -> RT: responses, subscription installs, forwards.
        self.drain_worker_ring(&graph);
        // 1b. UI -> RT: direct port writes; the rest bounces to the worker.
        self.drain_ui_ring(&graph);

        // 2. External inputs into the system source module.
        self.feed_source(&graph, nframes, inputs, midi_in);

        // 3. Walk the barriers.
        for barrier in &graph.barriers {
            let multi = barrier.slots.len() > 1;
            if multi && let Some(pool) = &self.pool {
                pool.run_barrier(&graph, barrier, nframes, &self.regs, &mut self.atom_scratch);
            } else {
                for slot in &barrier.slots {
                    for &idx in slot {
                        run_module(&graph, idx, nframes, &mut self.atom_scratch, &self.regs);
                    }
                }
            }
            // Serial epilogue per barrier: forward scheduled work blobs.
            for slot in &barrier.slots {
                for &idx in slot {
                    self.forward_work(&graph, idx);
                }
            }
        }

        // 4. System sink -> driver.
        self.drain_sink(&graph, nframes, outputs, midi_out);

        // 5. Previous-period holds for feedback edges.
        run_feedback(&graph, nframes);

        // 6. Subscription notifications (at most one per port per period).
        self.notify(&graph, nframes);

        // 7. Automation against the source's event streams.
        self.run_automation(&graph);

        self.counters.periods.fetch_add(1, Ordering::Relaxed);
        let spent = t0.elapsed().as_nanos() as u64;
        self.profile.record(spent);
        let budget_ns = (nframes as u64).saturating_mul(1_000_000_000) / self.sample_rate.max(1) as u64;
        if spent > budget_ns {
            self.counters.xruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ── Ring draining ──

    fn drain_worker_ring(&mut self, graph: &DspGraph) {
        let payload = self.regs.synthpod.payload;
        let subscription_list = self.regs.synthpod.subscription_list;
        let float_protocol = self.regs.protocol.float_protocol;
        let event_transfer = self.regs.protocol.event_transfer;
        loop {
            let Some(header) = self.wk_rx.recv(&mut self.scratch) else {
                break;
            };
            let verb = header.type_urid;
            if verb == float_protocol || verb == event_transfer {
                // Worker-prepared port writes (preset/patch application).
                self.apply_port_write(graph, verb);
            } else if verb == payload {
                // Work response for a module, delivered before its next run.
                if let Some((urn, blob)) = compact::parse_work(&self.scratch) {
                    match graph.module_index(urn) {
                        Some(idx) => {
                            let mut dsp = graph.modules[idx].rt.dsp.borrow_mut();
                            dsp.instance.deliver_response(blob);
                        }
                        None => {
                            self.counters.stale.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            } else if verb == subscription_list {
                if let Some((urn, index, protocol, add)) =
                    compact::parse_sub_install(&self.scratch)
                {
                    let slot = SubSlot {
                        urn,
                        index,
                        protocol,
                    };
                    if add {
                        if !self.subs.contains(&slot) {
                            if self.subs.len() < SUBS_MAX {
                                self.subs.push(slot);
                            } else {
                                self.counters.subs_full.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    } else {
                        self.subs.retain(|x| {
                            !(x.urn == urn && x.index == index && x.protocol == protocol)
                        });
                    }
                }
            } else {
                // Worker-prepared echo/notification: forward to the UI.
                if !self.ui_tx.send(verb, &self.scratch) {
                    self.counters.ring_full.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn drain_ui_ring(&mut self, graph: &DspGraph) {
        let float_protocol = self.regs.protocol.float_protocol;
        let event_transfer = self.regs.protocol.event_transfer;
        loop {
            let Some(header) = self.ui_rx.recv(&mut self.scratch) else {
                break;
            };
            let verb = header.type_urid;
            if verb == float_protocol || verb == event_transfer {
                self.apply_port_write(graph, verb);
                // Mirror float writes so the worker model stays current for
                // bundle saves.
                if verb == float_protocol && !self.wk_tx.send(verb, &self.scratch) {
                    self.counters.ring_full.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                // Everything else is non-RT work: bounce to the worker.
                if !self.wk_tx.send(verb, &self.scratch) {
                    self.counters.ring_full.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Apply a compact float/event port write from `self.scratch`.
    fn apply_port_write(&mut self, graph: &DspGraph, verb: Urid) {
        if verb == self.regs.protocol.float_protocol {
            if let Some((urn, index, value)) = compact::parse_port_float(&self.scratch) {
                match graph.module_index(urn) {
                    Some(idx) => {
                        graph.modules[idx].rt.dsp.borrow_mut().set_control(index, value);
                    }
                    None => {
                        self.counters.stale.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        } else if let Some((urn, index, bytes)) = compact::parse_port_event(&self.scratch) {
            match graph.module_index(urn) {
                Some(idx) => {
                    // bytes = atom header + body; inject as one event.
                    if bytes.len() >= atom::ATOM_HEADER {
                        let size =
                            u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                        let ty = u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                        let body = &bytes[8..(8 + size).min(bytes.len())];
                        let mut dsp = graph.modules[idx].rt.dsp.borrow_mut();
                        if !dsp.inject_event(index, 0, ty, body) {
                            self.counters.seq_full.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                None => {
                    self.counters.stale.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    // ── Driver boundary ──

    fn feed_source(&mut self, graph: &DspGraph, nframes: u32, inputs: &[&[f32]], midi_in: &[u8]) {
        let entry = &graph.modules[graph.source_idx];
        let mut dsp = entry.rt.dsp.borrow_mut();
        let mut audio_chan = 0usize;
        for port in &mut dsp.ports {
            if port.direction != PortDirection::Output {
                continue;
            }
            match port.ty {
                PortType::Audio => {
                    let dst = port.buf.stream_mut(nframes);
                    match inputs.get(audio_chan) {
                        Some(src) => {
                            let n = dst.len().min(src.len());
                            dst[..n].copy_from_slice(&src[..n]);
                            dst[n..].fill(0.0);
                        }
                        None => dst.fill(0.0),
                    }
                    audio_chan += 1;
                }
                PortType::Atom if port.index == graph.source_event_port => {
                    let dst = port.buf.atom_bytes_mut();
                    let total = atom::sequence_total(midi_in);
                    if total >= atom::SEQ_HEADER && total <= dst.len() {
                        dst[..total].copy_from_slice(&midi_in[..total]);
                    } else {
                        atom::init_sequence(dst, false, self.regs.atom.sequence);
                    }
                }
                _ => {}
            }
        }
    }

    fn drain_sink(
        &mut self,
        graph: &DspGraph,
        nframes: u32,
        outputs: &mut [&mut [f32]],
        midi_out: &mut [u8],
    ) {
        let entry = &graph.modules[graph.sink_idx];
        let mut dsp = entry.rt.dsp.borrow_mut();
        let mut audio_chan = 0usize;

        if midi_out.len() >= atom::SEQ_HEADER {
            atom::init_sequence(midi_out, false, self.regs.atom.sequence);
        }

        for port in &mut dsp.ports {
            if port.direction != PortDirection::Input {
                continue;
            }
            match port.ty {
                PortType::Audio => {
                    if let Some(dst) = outputs.get_mut(audio_chan) {
                        let src = port.buf.stream(nframes);
                        let n = dst.len().min(src.len());
                        dst[..n].copy_from_slice(&src[..n]);
                        for s in dst[n..].iter_mut() {
                            *s = 0.0;
                        }
                    }
                    audio_chan += 1;
                }
                PortType::Atom if port.index == graph.sink_event_port => {
                    let src = port.buf.atom_bytes();
                    let total = atom::sequence_total(src);
                    if total >= atom::SEQ_HEADER
                        && total <= midi_out.len()
                        && atom::sequence_has_events(src)
                    {
                        midi_out[..total].copy_from_slice(&src[..total]);
                    }
                    // Flushed; clear for upstream automation events.
                    port.buf.reset_atom_input(self.regs.atom.sequence);
                }
                _ => {}
            }
        }
    }

    // ── Work forwarding ──

    fn forward_work(&mut self, graph: &DspGraph, idx: usize) {
        let entry = &graph.modules[idx];
        let urn = entry.rt.urn;
        let mut dsp = entry.rt.dsp.borrow_mut();
        while dsp.instance.take_work(&mut self.scratch) {
            let ok = self.wk_tx.send_parts(
                self.regs.synthpod.payload,
                &[&compact::work_header(urn), &self.scratch],
            );
            if !ok {
                self.counters.ring_full.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ── Notifications ──

    fn notify(&mut self, graph: &DspGraph, nframes: u32) {
        let p = &self.regs.protocol;
        for i in 0..self.subs.len() {
            let sub = self.subs[i];
            let Some(idx) = graph.module_index(sub.urn) else {
                continue;
            };
            let dsp = graph.modules[idx].rt.dsp.borrow();
            let Some(port) = dsp.port(sub.index) else {
                continue;
            };
            let ok = if sub.protocol == p.float_protocol && port.ty == PortType::Control {
                self.ui_tx.send(
                    p.float_protocol,
                    &compact::port_float(sub.urn, sub.index, port.buf.control()),
                )
            } else if sub.protocol == p.peak_protocol && port.ty.is_sample_stream() {
                let peak = port
                    .buf
                    .stream(nframes)
                    .iter()
                    .fold(0.0f32, |acc, &s| acc.max(s.abs()));
                self.ui_tx.send(
                    p.peak_protocol,
                    &compact::port_peak(sub.urn, sub.index, nframes, peak),
                )
            } else if (sub.protocol == p.event_transfer || sub.protocol == p.atom_transfer)
                && port.ty == PortType::Atom
            {
                if atom::sequence_has_events(port.buf.atom_bytes()) {
                    let total = atom::sequence_total(port.buf.atom_bytes());
                    self.ui_tx.send_parts(
                        p.event_transfer,
                        &[
                            &compact::port_event_header(sub.urn, sub.index),
                            &port.buf.atom_bytes()[..total],
                        ],
                    )
                } else {
                    true
                }
            } else {
                true
            };
            if !ok {
                self.counters.ring_full.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ── Automation ──

    fn run_automation(&mut self, graph: &DspGraph) {
        let regs = self.regs.clone();
        let mut autos = graph.autos.borrow_mut();
        if autos.is_empty() {
            return;
        }

        self.scan_external_events(graph, &mut autos, &regs);
        self.emit_upstream(graph, &mut autos, &regs);
    }

    fn scan_external_events(&mut self, graph: &DspGraph, autos: &mut [AutoSlot], regs: &Regs) {
        let source = &graph.modules[graph.source_idx];
        let src_dsp = source.rt.dsp.borrow();
        for port in &src_dsp.ports {
            if port.ty != PortType::Atom || port.direction != PortDirection::Output {
                continue;
            }
            for ev in SeqIter::new(port.buf.atom_bytes()) {
                if ev.type_urid == regs.midi.midi_event {
                    let Some((ch, ctrl, val)) = atom::midi_as_controller(ev.body) else {
                        continue;
                    };
                    for slot in autos.iter_mut() {
                        if !slot.snk_enabled {
                            continue;
                        }
                        let was_learning = slot.learning;
                        if let Some(v) = slot.accept_midi(ch, ctrl, val) {
                            self.write_auto_sink(graph, slot, v, regs);
                            if was_learning {
                                self.report_learn(slot);
                            }
                        }
                    }
                } else if ev.type_urid == regs.osc_event {
                    let Some((path, value)) = automation::osc_parse(ev.body) else {
                        continue;
                    };
                    for slot in autos.iter_mut() {
                        if !slot.snk_enabled {
                            continue;
                        }
                        let was_learning = slot.learning;
                        if let Some(v) = slot.accept_osc(path, value) {
                            self.write_auto_sink(graph, slot, v, regs);
                            if was_learning {
                                self.report_learn(slot);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Bidirectional surfaces: when the sink value moved, synthesise the
    /// inverse-mapped event into the external event stream.
    fn emit_upstream(&mut self, graph: &DspGraph, autos: &mut [AutoSlot], regs: &Regs) {
        for slot in autos.iter_mut() {
            if !slot.src_enabled {
                continue;
            }
            let SlotSink::Port { module, port } = slot.sink else {
                continue;
            };
            let value = {
                let Some(entry) = graph.modules.get(module) else {
                    continue;
                };
                let dsp = entry.rt.dsp.borrow();
                let Some(p) = dsp.port(port) else {
                    continue;
                };
                p.buf.control()
            };
            if value.to_bits() == slot.upstream_last.to_bits() {
                continue;
            }
            slot.upstream_last = value;
            let v = slot.remap_upstream(f64::from(value));

            let sink_entry = &graph.modules[graph.sink_idx];
            let mut sink_dsp = sink_entry.rt.dsp.borrow_mut();
            let injected = match slot.kind {
                AutoKind::Midi => {
                    let cc = atom::midi_controller(
                        slot.channel.max(0) as u8,
                        slot.controller.max(0) as u8,
                        v.round().clamp(0.0, 127.0) as u8,
                    );
                    sink_dsp.inject_event(graph.sink_event_port, 0, regs.midi.midi_event, &cc)
                }
                AutoKind::Osc => {
                    let path_len = slot.path_len;
                    let mut msg = [0u8; automation::OSC_PATH_MAX + 16];
                    match automation::osc_write_float(
                        &mut msg,
                        &slot.path[..path_len],
                        v as f32,
                    ) {
                        Some(n) => sink_dsp.inject_event(
                            graph.sink_event_port,
                            0,
                            regs.osc_event,
                            &msg[..n],
                        ),
                        None => true,
                    }
                }
            };
            if !injected {
                self.counters.seq_full.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn write_auto_sink(&mut self, graph: &DspGraph, slot: &AutoSlot, value: f64, regs: &Regs) {
        match slot.sink {
            SlotSink::Port { module, port } => {
                let Some(entry) = graph.modules.get(module) else {
                    return;
                };
                entry.rt.dsp.borrow_mut().set_control(port, value as f32);
            }
            SlotSink::Param {
                module,
                port,
                property,
                range,
            } => {
                let Some(entry) = graph.modules.get(module) else {
                    return;
                };
                // Serialise the value in the parameter's declared range type.
                let a = &regs.atom;
                let mut vbuf = [0u8; 8];
                let (vlen, vtype) = if range == a.double {
                    vbuf.copy_from_slice(&value.to_ne_bytes());
                    (8, a.double)
                } else if range == a.int {
                    vbuf[..4].copy_from_slice(&(value as i32).to_ne_bytes());
                    (4, a.int)
                } else if range == a.long {
                    vbuf.copy_from_slice(&(value as i64).to_ne_bytes());
                    (8, a.long)
                } else if range == a.bool_ {
                    vbuf[..4].copy_from_slice(&i32::from(value >= 0.5).to_ne_bytes());
                    (4, a.bool_)
                } else {
                    vbuf[..4].copy_from_slice(&(value as f32).to_ne_bytes());
                    (4, a.float)
                };
                let Some(len) = atom::patch_set_body(
                    &mut self.obj_scratch,
                    regs.patch.set,
                    regs.patch.property,
                    regs.patch.value,
                    a.urid,
                    property,
                    vtype,
                    &vbuf[..vlen],
                ) else {
                    return;
                };
                let body = {
                    let (head, _) = self.obj_scratch.split_at(len);
                    head
                };
                let mut dsp = entry.rt.dsp.borrow_mut();
                if !dsp.inject_event(port, 0, regs.atom.object, body) {
                    self.counters.seq_full.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn report_learn(&mut self, slot: &AutoSlot) {
        let kind = match slot.kind {
            AutoKind::Midi => 0u32,
            AutoKind::Osc => 1u32,
        };
        let ok = self.wk_tx.send_parts(
            self.regs.synthpod.learning,
            &[
                &compact::learn_header(slot.id, kind, slot.channel, slot.controller),
                slot.path_bytes(),
            ],
        );
        if !ok {
            self.counters.ring_full.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Module execution (also called from DSP helper threads)
// ---------------------------------------------------------------------------

/// Run one module for a period: rebind borrowed inputs, mix fan-in, reset
/// output sequences, `run`, clear consumed input sequences, profile.
/// Touches only this module's cell plus immutable borrows of its
/// producers, so distinct modules of one barrier may run concurrently.
pub(crate) fn run_module(
    graph: &DspGraph,
    idx: usize,
    nframes: u32,
    atom_scratch: &mut Vec<u8>,
    regs: &Regs,
) {
    let entry = &graph.modules[idx];
    let is_source = idx == graph.source_idx;
    let is_sink = idx == graph.sink_idx;
    let mut dsp = entry.rt.dsp.borrow_mut();

    if !entry.rt.enabled.load(Ordering::Acquire) {
        for port in &mut dsp.ports {
            if port.direction == PortDirection::Output {
                match port.ty {
                    PortType::Audio | PortType::Cv => port.buf.zero_stream(nframes),
                    PortType::Atom => port.buf.reset_atom_output(regs.atom.sequence),
                    PortType::Control => {}
                }
            }
        }
        return;
    }

    // A recompile may have retargeted any input since the last period;
    // rebind everything to its own buffer first, then apply the elision
    // overrides.  Shared borrows only for the overrides: several consumers
    // in one barrier may point at the same producer.
    dsp.bind_own_buffers();
    for &(port_idx, binding) in &entry.borrows {
        let ptr = match binding {
            Binding::Borrow {
                src_module,
                src_port,
            } => {
                let src = graph.modules[src_module].rt.dsp.borrow();
                src.port(src_port).map(|p| p.buf.shared_ptr())
            }
            Binding::BorrowFeedback { feedback } => {
                Some(graph.feedbacks[feedback].buf.borrow().shared_ptr())
            }
        };
        if let Some(ptr) = ptr {
            dsp.instance.connect_port(port_idx, ptr);
        }
    }

    // Fan-in mixers.
    for mix in &entry.mixes {
        run_mix(graph, &mut dsp, mix, nframes, atom_scratch, regs);
    }

    // Output sequences advertise their capacity before run (the system
    // source's event stream was already formatted by the engine).
    if !is_source {
        for port in &mut dsp.ports {
            if port.ty == PortType::Atom && port.direction == PortDirection::Output {
                port.buf.reset_atom_output(regs.atom.sequence);
            }
        }
    }

    let t0 = Instant::now();
    dsp.instance.run(nframes);
    dsp.instance.end_run();
    entry.rt.profile.record(t0.elapsed().as_nanos() as u64);

    // Consumed input sequences reset to empty so post-period injections
    // accumulate cleanly.  The system sink's event stream is flushed to the
    // driver first; the engine clears it in drain_sink.
    if !is_sink {
        for port in &mut dsp.ports {
            if port.ty == PortType::Atom && port.direction == PortDirection::Input {
                port.buf.reset_atom_input(regs.atom.sequence);
            }
        }
    }
}

fn run_mix(
    graph: &DspGraph,
    dsp: &mut ModuleDsp,
    mix: &MixTask,
    nframes: u32,
    atom_scratch: &mut Vec<u8>,
    regs: &Regs,
) {
    match mix.ty {
        PortType::Audio | PortType::Cv => {
            let Some(sink) = dsp.port_mut(mix.sink_port) else {
                return;
            };
            let dst = sink.buf.stream_mut(nframes);
            dst.fill(0.0);
            for src in &mix.sources {
                match src.feedback {
                    Some(fb) => {
                        let hold = graph.feedbacks[fb].buf.borrow();
                        for (d, s) in dst.iter_mut().zip(hold.stream(nframes)) {
                            *d += src.gain * s;
                        }
                    }
                    None => {
                        let sdsp = graph.modules[src.module].rt.dsp.borrow();
                        let Some(sport) = sdsp.port(src.port) else {
                            continue;
                        };
                        for (d, s) in dst.iter_mut().zip(sport.buf.stream(nframes)) {
                            *d += src.gain * s;
                        }
                    }
                }
            }
        }
        PortType::Control => {
            // Last writer in scheduler order wins; sources are pre-sorted.
            let mut value = None;
            for src in &mix.sources {
                let v = match src.feedback {
                    Some(fb) => Some(graph.feedbacks[fb].buf.borrow().control()),
                    None => {
                        let sdsp = graph.modules[src.module].rt.dsp.borrow();
                        sdsp.port(src.port).map(|p| p.buf.control())
                    }
                };
                if let Some(v) = v {
                    value = Some(v);
                }
            }
            if let Some(v) = value {
                dsp.set_control(mix.sink_port, v);
            }
        }
        PortType::Atom => {
            let Some(sink) = dsp.port_mut(mix.sink_port) else {
                return;
            };
            // Preserve events injected between periods, then merge all
            // incident streams in timestamp order.  Gain is ignored.
            let injected = atom::sequence_total(sink.buf.atom_bytes());
            atom_scratch.clear();
            atom_scratch.extend_from_slice(&sink.buf.atom_bytes()[..injected]);
            sink.buf.reset_atom_input(regs.atom.sequence);

            let mut borrows: [Option<atomic_refcell::AtomicRef<'_, ModuleDsp>>; ATOM_MERGE_MAX] =
                std::array::from_fn(|_| None);
            let mut hold_borrows: [Option<atomic_refcell::AtomicRef<'_, PortBuf>>;
                ATOM_MERGE_MAX] = std::array::from_fn(|_| None);
            let mut iters: [Option<std::iter::Peekable<SeqIter<'_>>>; ATOM_MERGE_MAX + 1] =
                std::array::from_fn(|_| None);

            iters[0] = Some(SeqIter::new(atom_scratch).peekable());
            for (i, src) in mix.sources.iter().take(ATOM_MERGE_MAX).enumerate() {
                match src.feedback {
                    Some(fb) => {
                        let hold = graph.feedbacks[fb].buf.borrow();
                        // SAFETY: the guard is parked in hold_borrows for
                        // the whole merge; the slice only aliases reads.
                        let bytes: &[u8] = unsafe {
                            std::slice::from_raw_parts(
                                hold.atom_bytes().as_ptr(),
                                hold.atom_bytes().len(),
                            )
                        };
                        hold_borrows[i] = Some(hold);
                        iters[i + 1] = Some(SeqIter::new(bytes).peekable());
                    }
                    None => {
                        let sdsp = graph.modules[src.module].rt.dsp.borrow();
                        let bytes: Option<&[u8]> = sdsp.port(src.port).map(|sport| unsafe {
                            std::slice::from_raw_parts(
                                sport.buf.atom_bytes().as_ptr(),
                                sport.buf.atom_bytes().len(),
                            )
                        });
                        borrows[i] = Some(sdsp);
                        if let Some(bytes) = bytes {
                            iters[i + 1] = Some(SeqIter::new(bytes).peekable());
                        }
                    }
                }
            }

            loop {
                // Pick the earliest pending event across all streams.
                let mut best: Option<(usize, i64)> = None;
                for (i, it) in iters.iter_mut().enumerate() {
                    if let Some(it) = it
                        && let Some(ev) = it.peek()
                        && best.is_none_or(|(_, t)| ev.frames < t)
                    {
                        best = Some((i, ev.frames));
                    }
                }
                let Some((i, _)) = best else {
                    break;
                };
                let Some(ev) = iters[i].as_mut().and_then(|it| it.next()) else {
                    break;
                };
                if !atom::sequence_append(
                    sink.buf.atom_bytes_mut(),
                    ev.frames,
                    ev.type_urid,
                    ev.body,
                ) {
                    break;
                }
            }
        }
    }
}

/// Copy feedback producers into their holding buffers (serial epilogue).
fn run_feedback(graph: &DspGraph, nframes: u32) {
    for task in &graph.feedbacks {
        let sdsp = graph.modules[task.src_module].rt.dsp.borrow();
        let Some(sport) = sdsp.port(task.src_port) else {
            continue;
        };
        let mut hold = task.buf.borrow_mut();
        match sport.buf.ty() {
            PortType::Audio | PortType::Cv => {
                hold.stream_mut(nframes).copy_from_slice(sport.buf.stream(nframes));
            }
            PortType::Control => hold.set_control(sport.buf.control()),
            PortType::Atom => {
                let total = atom::sequence_total(sport.buf.atom_bytes());
                let dst = hold.atom_bytes_mut();
                if total <= dst.len() {
                    dst[..total].copy_from_slice(&sport.buf.atom_bytes()[..total]);
                }
            }
        }
    }
}
