//! Modules: one plugin instance plus its port state.
//!
//! A module has two halves.  [`Module`] is the model-side bookkeeping owned
//! by the worker thread (descriptor, cached values, presets, canvas
//! position).  [`RtModule`] is the DSP half referenced by the compiled
//! graph and driven by the RT thread; it is shared via `basedrop::Shared`
//! so retired graphs release it without freeing on the RT path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use atomic_refcell::AtomicRefCell;
use basedrop::Shared;

use super::port::PortBuf;
use crate::atom::Value;
use crate::error::Result;
use crate::plugin::host::{self, InlineSurface, PluginHooks, PluginInstance};
use crate::plugin::types::*;
use crate::regs::Regs;
use crate::urid::{Urid, UridMap};

/// Profiling window: exponential moving average over ~256 periods.
const PROFILE_WINDOW: u64 = 256;

/// Lock-free per-module timing, written by RT, snapshotted elsewhere.
#[derive(Debug)]
pub struct ProfileSlot {
    last_ns: AtomicU64,
    avg_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Default for ProfileSlot {
    fn default() -> Self {
        ProfileSlot {
            last_ns: AtomicU64::new(0),
            avg_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }
}

impl ProfileSlot {
    /// Called from the RT thread after each `run`.
    #[inline]
    pub fn record(&self, ns: u64) {
        self.last_ns.store(ns, Ordering::Relaxed);
        let avg = self.avg_ns.load(Ordering::Relaxed);
        let next = avg + (ns.saturating_sub(avg) / PROFILE_WINDOW)
            - (avg.saturating_sub(ns) / PROFILE_WINDOW);
        self.avg_ns.store(next, Ordering::Relaxed);
        self.min_ns.fetch_min(ns.max(1), Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    /// Read and reset the min/max window.  Returns (min, avg, max) in ns.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        let min = self.min_ns.swap(u64::MAX, Ordering::Relaxed);
        let max = self.max_ns.swap(0, Ordering::Relaxed);
        let avg = self.avg_ns.load(Ordering::Relaxed);
        (if min == u64::MAX { 0 } else { min }, avg, max)
    }

    pub fn last(&self) -> u64 {
        self.last_ns.load(Ordering::Relaxed)
    }
}

/// One port of the DSP half: metadata plus its owned buffer.
pub struct RtPort {
    pub index: u32,
    pub ty: PortType,
    pub direction: PortDirection,
    pub atom_kinds: AtomKinds,
    pub buf: PortBuf,
}

/// DSP state of a module; borrowed from the RT thread only (the worker
/// touches it solely before handover or after retirement).
pub struct ModuleDsp {
    pub instance: Box<dyn PluginInstance>,
    pub ports: Vec<RtPort>,
}

impl ModuleDsp {
    /// Bind every port to its own buffer.  The RT engine calls this each
    /// period before applying connection overrides, so a graph swap can
    /// never leave a port pointing at a retired buffer.
    pub fn bind_own_buffers(&mut self) {
        for port in &mut self.ports {
            let ptr = port.buf.as_ptr();
            self.instance.connect_port(port.index, ptr);
        }
    }

    pub fn port(&self, index: u32) -> Option<&RtPort> {
        // Ports are usually dense; fall back to a scan for sparse tables.
        match self.ports.get(index as usize) {
            Some(p) if p.index == index => Some(p),
            _ => self.ports.iter().find(|p| p.index == index),
        }
    }

    pub fn port_mut(&mut self, index: u32) -> Option<&mut RtPort> {
        let dense = matches!(self.ports.get(index as usize), Some(p) if p.index == index);
        if dense {
            self.ports.get_mut(index as usize)
        } else {
            self.ports.iter_mut().find(|p| p.index == index)
        }
    }

    /// Write a control input; RT-safe.
    pub fn set_control(&mut self, index: u32, value: f32) {
        if let Some(port) = self.port_mut(index)
            && port.ty == PortType::Control
        {
            port.buf.set_control(value);
        }
    }

    /// Append an event to an atom input; RT-safe.  Returns false when the
    /// port is missing or the sequence is full.
    pub fn inject_event(&mut self, index: u32, frames: i64, type_urid: Urid, body: &[u8]) -> bool {
        match self.port_mut(index) {
            Some(port) if port.ty == PortType::Atom => {
                crate::atom::sequence_append(port.buf.atom_bytes_mut(), frames, type_urid, body)
            }
            _ => false,
        }
    }
}

/// The shared DSP half.
pub struct RtModule {
    pub urn: Urid,
    pub builtin: Option<host::BuiltinKind>,
    pub dsp: AtomicRefCell<ModuleDsp>,
    pub profile: ProfileSlot,
    /// Cleared by `moduleDisabled`; a disabled module is skipped and its
    /// outputs are silenced.  Atomic so the worker can flip it while RT
    /// runs.
    pub enabled: std::sync::atomic::AtomicBool,
}

/// Current value of one plugin parameter.
#[derive(Debug, Clone)]
pub struct ParamState {
    pub spec: ParamSpec,
    pub value: Value,
}

/// Model-side module owned by the worker thread.
pub struct Module {
    pub urn: Urid,
    /// The `urn:uuid:` URI interned as `urn` - this is what bundles store.
    pub urn_uri: String,
    pub spec: PluginSpec,
    pub position: (f32, f32),
    pub alias: Option<String>,
    pub enabled: bool,
    /// Selected UI variant (0 = none).
    pub ui_urn: Urid,
    /// Cached control-port values, port index -> value.
    pub control_values: HashMap<u32, f32>,
    pub params: Vec<ParamState>,
    pub presets: Vec<PresetInfo>,
    pub hooks: PluginHooks,
    pub rt: Shared<RtModule>,
    pub display: Option<InlineSurface>,
    /// Last profiling snapshot (min, avg, max) in ns.
    pub profile: (u64, u64, u64),
}

impl Module {
    /// Instantiate a module on the worker thread: plugin load, buffers,
    /// port binding, activate.  Not visible to RT until the next graph
    /// handover.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        urn_uri: String,
        spec: PluginSpec,
        sample_rate: f64,
        nframes: u32,
        seq_size: u32,
        urid: &Arc<UridMap>,
        regs: &Regs,
        coll: &basedrop::Handle,
    ) -> Result<Module> {
        let urn = urid.map(&urn_uri);

        let instance = host::instantiate(&spec, sample_rate, nframes, seq_size, urid)?;
        let hooks = instance.hooks();

        let mut ports = Vec::with_capacity(spec.ports.len());
        let mut control_values = HashMap::new();
        for p in &spec.ports {
            let mut buf = PortBuf::new(p.ty, nframes, p.atom_capacity, p.default);
            match (p.ty, p.direction) {
                (PortType::Atom, PortDirection::Input) => buf.reset_atom_input(regs.atom.sequence),
                (PortType::Atom, PortDirection::Output) => {
                    buf.reset_atom_output(regs.atom.sequence)
                }
                (PortType::Control, _) => {
                    control_values.insert(p.index, p.default);
                }
                _ => {}
            }
            ports.push(RtPort {
                index: p.index,
                ty: p.ty,
                direction: p.direction,
                atom_kinds: p.atom_kinds,
                buf,
            });
        }

        let mut dsp = ModuleDsp { instance, ports };
        dsp.bind_own_buffers();
        dsp.instance.activate();

        let params = spec
            .params
            .iter()
            .map(|p| ParamState {
                value: default_param_value(p, regs),
                spec: p.clone(),
            })
            .collect();

        let builtin = host::BuiltinKind::from_uri(&spec.uri);
        let rt = Shared::new(
            coll,
            RtModule {
                urn,
                builtin,
                dsp: AtomicRefCell::new(dsp),
                profile: ProfileSlot::default(),
                enabled: std::sync::atomic::AtomicBool::new(true),
            },
        );

        Ok(Module {
            urn,
            urn_uri,
            spec,
            position: (0.0, 0.0),
            alias: None,
            enabled: true,
            ui_urn: 0,
            control_values,
            params,
            presets: Vec::new(),
            hooks,
            rt,
            display: None,
            profile: (0, 0, 0),
        })
    }

    /// Cached value of a control port (model side).
    pub fn get_port_value(&self, index: u32) -> Option<f32> {
        self.control_values.get(&index).copied()
    }

    /// Update the model cache, clamping to the declared range.
    pub fn set_port_value(&mut self, index: u32, value: f32) -> Option<f32> {
        let spec = self.spec.port_by_index(index)?;
        if spec.ty != PortType::Control {
            return None;
        }
        let clamped = if spec.min < spec.max {
            value.clamp(spec.min, spec.max)
        } else {
            value
        };
        self.control_values.insert(index, clamped);
        Some(clamped)
    }

    pub fn param(&self, property: Urid) -> Option<&ParamState> {
        self.params.iter().find(|p| p.spec.property == property)
    }

    pub fn param_mut(&mut self, property: Urid) -> Option<&mut ParamState> {
        self.params.iter_mut().find(|p| p.spec.property == property)
    }

    /// Pull the RT profiling counters into the model.
    pub fn profile_sample(&mut self) -> (u64, u64, u64) {
        self.profile = self.rt.profile.snapshot();
        self.profile
    }

    pub fn is_builtin(&self) -> bool {
        self.rt.builtin.is_some()
    }

    pub fn is_system_source(&self) -> bool {
        self.rt.builtin == Some(host::BuiltinKind::Source)
    }

    pub fn is_system_sink(&self) -> bool {
        self.rt.builtin == Some(host::BuiltinKind::Sink)
    }
}

fn default_param_value(spec: &ParamSpec, regs: &Regs) -> Value {
    let a = &regs.atom;
    if spec.range == a.bool_ {
        Value::Bool(false)
    } else if spec.range == a.int {
        Value::Int(0)
    } else if spec.range == a.long {
        Value::Long(0)
    } else if spec.range == a.double {
        Value::Double(0.0)
    } else if spec.range == a.string {
        Value::String(String::new())
    } else if spec.range == a.path {
        Value::Path(String::new())
    } else if spec.range == a.uri {
        Value::Uri(String::new())
    } else if spec.range == a.urid {
        Value::Urid(0)
    } else if spec.range == a.chunk {
        Value::Chunk(Vec::new())
    } else {
        Value::Float(0.0)
    }
}

/// Mint a fresh module URN URI.
pub fn fresh_urn_uri() -> String {
    format!("urn:uuid:{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::db::{builtin_spec, stereo_uri};

    fn test_module(uri: &str) -> (Module, Arc<UridMap>, basedrop::Collector) {
        let urid = UridMap::new();
        let regs = Regs::new(&urid);
        let coll = basedrop::Collector::new();
        let spec = builtin_spec(uri).unwrap();
        let m = Module::new(
            fresh_urn_uri(),
            spec,
            48000.0,
            512,
            4096,
            &urid,
            &regs,
            &coll.handle(),
        )
        .unwrap();
        (m, urid, coll)
    }

    #[test]
    fn control_values_default_and_clamp() {
        let (mut m, _urid, _coll) = test_module(&stereo_uri());
        assert_eq!(m.get_port_value(4), Some(1.0));
        assert_eq!(m.set_port_value(4, 9.0), Some(4.0));
        assert_eq!(m.get_port_value(4), Some(4.0));
        // Audio port has no control value.
        assert_eq!(m.set_port_value(0, 1.0), None);
    }

    #[test]
    fn profile_slot_window() {
        let slot = ProfileSlot::default();
        slot.record(1000);
        slot.record(3000);
        let (min, _avg, max) = slot.snapshot();
        assert_eq!(min, 1000);
        assert_eq!(max, 3000);
        // Window resets after snapshot.
        slot.record(2000);
        let (min, _avg, max) = slot.snapshot();
        assert_eq!(min, 2000);
        assert_eq!(max, 2000);
    }
}
