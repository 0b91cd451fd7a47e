//! Plugin instance hosting.
//!
//! [`PluginInstance`] is the capability set the RT engine drives:
//! `connect_port`, `activate`, `run`, `deactivate`, plus the worker and
//! state hand-offs.  Two implementations:
//!
//! - [`DlPlugin`]: a real plugin opened from its shared object with
//!   `dlopen`, instantiated with the engine's feature set.
//! - [`BuiltinInstance`]: the system modules (source, sink, stereo,
//!   monoatom) wired by port signature only.
//!
//! Off-RT operations (plugin `work()`, state save/restore, inline-display
//! render) go through raw-pointer hooks captured at instantiation so the
//! worker thread never contends with the RT thread for the instance itself.

use std::ffi::{CStr, CString, c_void};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rtrb::{Consumer, Producer, RingBuffer};

use super::db;
use super::ffi::*;
use super::types::PluginSpec;
use crate::error::{Error, Result};
use crate::urid::{LV2UridUnmap, Urid, UridMap};

/// Capacity of the per-instance RT->worker staging ring for scheduled work.
const SCHEDULE_RING_SIZE: usize = 4096;

/// One key/value pair of plugin state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateProp {
    pub key: Urid,
    pub type_urid: Urid,
    pub flags: u32,
    pub value: Vec<u8>,
}

/// ARGB surface rendered by a plugin for the patch canvas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineSurface {
    pub width: u32,
    pub height: u32,
    pub argb: Vec<u32>,
}

// ---------------------------------------------------------------------------
// Off-RT hooks
// ---------------------------------------------------------------------------

/// Raw handles for calling the plugin's worker interface from the worker
/// thread while the RT thread keeps running the instance.
#[derive(Clone, Copy)]
pub struct WorkerHook {
    handle: LV2_Handle,
    iface: *const LV2_Worker_Interface,
}

// The pointers stay valid for the lifetime of the owning module; the LV2
// worker contract permits `work()` concurrent with `run()`.
unsafe impl Send for WorkerHook {}

impl WorkerHook {
    /// Dispatch one work request; responses are collected into `responses`.
    pub fn work(&self, data: &[u8], responses: &mut Vec<Vec<u8>>) {
        struct RespondCtx<'a> {
            out: &'a mut Vec<Vec<u8>>,
        }

        unsafe extern "C" fn respond(
            handle: LV2_Worker_Respond_Handle,
            size: u32,
            data: *const c_void,
        ) -> LV2_Worker_Status {
            if handle.is_null() {
                return LV2_WORKER_ERR_UNKNOWN;
            }
            let ctx = unsafe { &mut *(handle as *mut RespondCtx) };
            let payload = if size > 0 && !data.is_null() {
                unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) }.to_vec()
            } else {
                Vec::new()
            };
            ctx.out.push(payload);
            LV2_WORKER_SUCCESS
        }

        let mut ctx = RespondCtx { out: responses };
        unsafe {
            let iface = &*self.iface;
            (iface.work)(
                self.handle,
                respond,
                &mut ctx as *mut RespondCtx as LV2_Worker_Respond_Handle,
                data.len() as u32,
                if data.is_empty() {
                    std::ptr::null()
                } else {
                    data.as_ptr() as *const c_void
                },
            );
        }
    }
}

/// Raw handles for the plugin's state interface.
#[derive(Clone, Copy)]
pub struct StateHook {
    handle: LV2_Handle,
    iface: *const LV2_State_Interface,
}

unsafe impl Send for StateHook {}

impl StateHook {
    pub fn save(&self) -> Vec<StateProp> {
        struct StoreCtx {
            props: Vec<StateProp>,
        }

        unsafe extern "C" fn store(
            handle: LV2_State_Handle,
            key: u32,
            value: *const c_void,
            size: usize,
            type_: u32,
            flags: u32,
        ) -> LV2_State_Status {
            if handle.is_null() || value.is_null() {
                return LV2_STATE_ERR_UNKNOWN;
            }
            let ctx = unsafe { &mut *(handle as *mut StoreCtx) };
            let bytes = unsafe { std::slice::from_raw_parts(value as *const u8, size) };
            ctx.props.push(StateProp {
                key,
                type_urid: type_,
                flags,
                value: bytes.to_vec(),
            });
            LV2_STATE_SUCCESS
        }

        let mut ctx = StoreCtx { props: Vec::new() };
        unsafe {
            let iface = &*self.iface;
            (iface.save)(
                self.handle,
                store,
                &mut ctx as *mut StoreCtx as LV2_State_Handle,
                LV2_STATE_IS_POD | LV2_STATE_IS_PORTABLE,
                std::ptr::null(),
            );
        }
        ctx.props
    }

    pub fn restore(&self, props: &[StateProp]) -> bool {
        struct RetrieveCtx<'a> {
            props: &'a [StateProp],
        }

        unsafe extern "C" fn retrieve(
            handle: LV2_State_Handle,
            key: u32,
            size: *mut usize,
            type_: *mut u32,
            flags: *mut u32,
        ) -> *const c_void {
            if handle.is_null() {
                return std::ptr::null();
            }
            let ctx = unsafe { &*(handle as *const RetrieveCtx) };
            match ctx.props.iter().find(|p| p.key == key) {
                Some(p) => unsafe {
                    if !size.is_null() {
                        *size = p.value.len();
                    }
                    if !type_.is_null() {
                        *type_ = p.type_urid;
                    }
                    if !flags.is_null() {
                        *flags = p.flags;
                    }
                    p.value.as_ptr() as *const c_void
                },
                None => std::ptr::null(),
            }
        }

        let ctx = RetrieveCtx { props };
        let status = unsafe {
            let iface = &*self.iface;
            (iface.restore)(
                self.handle,
                retrieve,
                &ctx as *const RetrieveCtx as LV2_State_Handle,
                0,
                std::ptr::null(),
            )
        };
        status == LV2_STATE_SUCCESS
    }
}

/// Raw handles for the inline-display render interface.
#[derive(Clone, Copy)]
pub struct IdispHook {
    handle: LV2_Handle,
    iface: *const LV2_Inline_Display_Interface,
    flag: *const AtomicBool,
}

unsafe impl Send for IdispHook {}

impl IdispHook {
    /// Whether the plugin queued a redraw since the last render.
    pub fn take_queued(&self) -> bool {
        unsafe { &*self.flag }.swap(false, Ordering::AcqRel)
    }

    pub fn render(&self, w: u32, h: u32) -> Option<InlineSurface> {
        let surf = unsafe { ((*self.iface).render)(self.handle, w, h) };
        if surf.is_null() {
            return None;
        }
        let s = unsafe { &*surf };
        if s.data.is_null() || s.width <= 0 || s.height <= 0 {
            return None;
        }
        let (w, h, stride) = (s.width as usize, s.height as usize, s.stride as usize);
        let mut argb = Vec::with_capacity(w * h);
        for row in 0..h {
            let line = unsafe { std::slice::from_raw_parts(s.data.add(row * stride), w * 4) };
            for px in line.chunks_exact(4) {
                argb.push(u32::from_ne_bytes([px[0], px[1], px[2], px[3]]));
            }
        }
        Some(InlineSurface {
            width: s.width as u32,
            height: s.height as u32,
            argb,
        })
    }
}

/// All off-RT hooks of an instance, captured once after instantiation.
#[derive(Default, Clone, Copy)]
pub struct PluginHooks {
    pub worker: Option<WorkerHook>,
    pub state: Option<StateHook>,
    pub idisp: Option<IdispHook>,
}

unsafe impl Send for PluginHooks {}

// ---------------------------------------------------------------------------
// The instance trait
// ---------------------------------------------------------------------------

/// RT-facing capability set of one plugin instance.
pub trait PluginInstance: Send + Sync {
    /// Bind a port buffer; the pointer must stay valid until rebound.
    fn connect_port(&mut self, index: u32, data: *mut c_void);

    fn activate(&mut self) {}

    /// RT-safe: no allocation, no blocking, bounded time.
    fn run(&mut self, nframes: u32);

    fn deactivate(&mut self) {}

    /// Pop one scheduled work blob into `scratch` (cleared first).
    /// Called on RT after `run`; returns `false` when none is pending.
    fn take_work(&mut self, _scratch: &mut Vec<u8>) -> bool {
        false
    }

    /// Deliver a worker response; called on RT before the next `run`.
    fn deliver_response(&mut self, _data: &[u8]) {}

    /// Called on RT after responses were delivered.
    fn end_run(&mut self) {}

    /// Off-RT hook set (worker/state/inline display).
    fn hooks(&self) -> PluginHooks {
        PluginHooks::default()
    }
}

// ---------------------------------------------------------------------------
// dlopen-hosted plugins
// ---------------------------------------------------------------------------

/// Context handed to the plugin as the worker-schedule feature.  The
/// producer is only touched from the RT thread (inside `run`), the consumer
/// only from the RT thread after `run` - the cell never sees concurrent
/// access.
struct ScheduleCtx {
    prod: std::cell::UnsafeCell<Producer<u8>>,
}

unsafe extern "C" fn schedule_work_callback(
    handle: LV2_Worker_Schedule_Handle,
    size: u32,
    data: *const c_void,
) -> LV2_Worker_Status {
    if handle.is_null() {
        return LV2_WORKER_ERR_UNKNOWN;
    }
    let ctx = unsafe { &*(handle as *const ScheduleCtx) };
    let prod = unsafe { &mut *ctx.prod.get() };

    let total = 4 + size as usize;
    let Ok(chunk) = prod.write_chunk_uninit(total) else {
        return LV2_WORKER_ERR_NO_SPACE;
    };
    let payload = if size > 0 && !data.is_null() {
        unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) }
    } else {
        &[]
    };
    let written = chunk.fill_from_iter(
        size.to_ne_bytes()
            .into_iter()
            .chain(payload.iter().copied()),
    );
    debug_assert_eq!(written, total);
    LV2_WORKER_SUCCESS
}

unsafe extern "C" fn queue_draw_callback(handle: *mut c_void) {
    if !handle.is_null() {
        unsafe { &*(handle as *const AtomicBool) }.store(true, Ordering::Release);
    }
}

/// Heap-pinned option values the `LV2_Options_Option` array points into.
struct OptionValues {
    sample_rate: f32,
    block_length: i32,
    seq_size: i32,
}

/// A plugin instance opened from its shared object.
pub struct DlPlugin {
    /// dlopen handle - closed on drop, after cleanup.
    lib: *mut c_void,
    descriptor: *const LV2Descriptor,
    handle: LV2_Handle,
    active: bool,

    // Feature plumbing.  All heap-pinned: the plugin stores these pointers.
    _urid_map: Box<lv2_raw::urid::LV2UridMap>,
    _urid_unmap: Box<LV2UridUnmap>,
    _schedule: Box<LV2_Worker_Schedule>,
    sched_ctx: *mut ScheduleCtx,
    _idisp: Box<LV2_Inline_Display>,
    idisp_flag: *mut AtomicBool,
    _options: Box<[LV2_Options_Option; 5]>,
    _option_values: Box<OptionValues>,
    _features: Vec<Box<lv2_raw::core::LV2Feature>>,

    /// Consumer half of the schedule staging ring.
    work_rx: Consumer<u8>,

    worker_iface: *const LV2_Worker_Interface,
    state_iface: *const LV2_State_Interface,
    idisp_iface: *const LV2_Inline_Display_Interface,

    pub plugin_uri: String,
}

// The instance is created on the worker thread and then driven from the RT
// thread only; hooks use dedicated raw copies.
unsafe impl Send for DlPlugin {}
unsafe impl Sync for DlPlugin {}

impl DlPlugin {
    /// Open `spec.binary_path`, locate the descriptor matching `spec.uri`
    /// and instantiate it with the engine feature set.
    pub fn load(
        spec: &PluginSpec,
        sample_rate: f64,
        max_block: u32,
        seq_size: u32,
        urid: &Arc<UridMap>,
    ) -> Result<Self> {
        if spec.binary_path.is_empty() {
            return Err(Error::plugin(format!("{}: no binary", spec.uri)));
        }
        let c_path = CString::new(spec.binary_path.as_str())
            .map_err(|_| Error::plugin("binary path contains NUL"))?;

        let lib = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
        if lib.is_null() {
            return Err(Error::plugin(format!(
                "dlopen failed for {}",
                spec.binary_path
            )));
        }

        let sym = unsafe { libc::dlsym(lib, LV2_DESCRIPTOR_SYMBOL.as_ptr()) };
        if sym.is_null() {
            unsafe { libc::dlclose(lib) };
            return Err(Error::plugin(format!(
                "{}: no lv2_descriptor symbol",
                spec.binary_path
            )));
        }
        let descriptor_fn: LV2_Descriptor_Function = unsafe { std::mem::transmute(sym) };

        // Walk the descriptor table for the matching URI.
        let mut descriptor: *const LV2Descriptor = std::ptr::null();
        for index in 0..u32::MAX {
            let desc = unsafe { descriptor_fn(index) };
            if desc.is_null() {
                break;
            }
            let uri = unsafe { CStr::from_ptr((*desc).uri) };
            if uri.to_str() == Ok(spec.uri.as_str()) {
                descriptor = desc;
                break;
            }
        }
        if descriptor.is_null() {
            unsafe { libc::dlclose(lib) };
            return Err(Error::plugin(format!(
                "{}: descriptor for {} not found",
                spec.binary_path, spec.uri
            )));
        }

        // ── Feature set ──

        let mut urid_map = Box::new(urid.as_lv2_urid_map());
        let mut urid_unmap = Box::new(urid.as_lv2_urid_unmap());

        let (prod, work_rx) = RingBuffer::new(SCHEDULE_RING_SIZE);
        let sched_ctx = Box::into_raw(Box::new(ScheduleCtx {
            prod: std::cell::UnsafeCell::new(prod),
        }));
        let schedule = Box::new(LV2_Worker_Schedule {
            handle: sched_ctx as LV2_Worker_Schedule_Handle,
            schedule_work: schedule_work_callback,
        });

        let idisp_flag = Box::into_raw(Box::new(AtomicBool::new(false)));
        let idisp = Box::new(LV2_Inline_Display {
            handle: idisp_flag as *mut c_void,
            queue_draw: queue_draw_callback,
        });

        let option_values = Box::new(OptionValues {
            sample_rate: sample_rate as f32,
            block_length: max_block as i32,
            seq_size: seq_size as i32,
        });
        let atom_int = urid.map("http://lv2plug.in/ns/ext/atom#Int");
        let atom_float = urid.map("http://lv2plug.in/ns/ext/atom#Float");
        let options = Box::new([
            LV2_Options_Option {
                context: 0,
                subject: 0,
                key: urid.map("http://lv2plug.in/ns/ext/parameters#sampleRate"),
                size: 4,
                type_: atom_float,
                value: &option_values.sample_rate as *const f32 as *const c_void,
            },
            LV2_Options_Option {
                context: 0,
                subject: 0,
                key: urid.map("http://lv2plug.in/ns/ext/buf-size#minBlockLength"),
                size: 4,
                type_: atom_int,
                value: &option_values.block_length as *const i32 as *const c_void,
            },
            LV2_Options_Option {
                context: 0,
                subject: 0,
                key: urid.map("http://lv2plug.in/ns/ext/buf-size#maxBlockLength"),
                size: 4,
                type_: atom_int,
                value: &option_values.block_length as *const i32 as *const c_void,
            },
            LV2_Options_Option {
                context: 0,
                subject: 0,
                key: urid.map("http://lv2plug.in/ns/ext/buf-size#sequenceSize"),
                size: 4,
                type_: atom_int,
                value: &option_values.seq_size as *const i32 as *const c_void,
            },
            // Terminator
            LV2_Options_Option {
                context: 0,
                subject: 0,
                key: 0,
                size: 0,
                type_: 0,
                value: std::ptr::null(),
            },
        ]);

        let features: Vec<Box<lv2_raw::core::LV2Feature>> = vec![
            Box::new(unsafe { UridMap::make_map_feature(&mut *urid_map as *mut _) }),
            Box::new(unsafe { UridMap::make_unmap_feature(&mut *urid_unmap as *mut _) }),
            Box::new(lv2_raw::core::LV2Feature {
                uri: LV2_WORKER_SCHEDULE_URI.as_ptr(),
                data: &*schedule as *const LV2_Worker_Schedule as *mut c_void,
            }),
            Box::new(lv2_raw::core::LV2Feature {
                uri: LV2_OPTIONS_URI.as_ptr(),
                data: options.as_ptr() as *mut c_void,
            }),
            Box::new(lv2_raw::core::LV2Feature {
                uri: LV2_INLINE_DISPLAY_URI.as_ptr(),
                data: &*idisp as *const LV2_Inline_Display as *mut c_void,
            }),
            Box::new(lv2_raw::core::LV2Feature {
                uri: LV2_STATE_THREAD_SAFE_RESTORE_URI.as_ptr(),
                data: std::ptr::null_mut(),
            }),
        ];
        let mut feature_ptrs: Vec<*const lv2_raw::core::LV2Feature> =
            features.iter().map(|f| &**f as *const _).collect();
        feature_ptrs.push(std::ptr::null());

        let bundle_path = Path::new(&spec.binary_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let c_bundle = CString::new(bundle_path).unwrap_or_default();

        let handle = unsafe {
            ((*descriptor).instantiate)(descriptor, sample_rate, c_bundle.as_ptr(), feature_ptrs.as_ptr())
        };
        if handle.is_null() {
            unsafe {
                drop(Box::from_raw(sched_ctx));
                drop(Box::from_raw(idisp_flag));
                libc::dlclose(lib);
            }
            return Err(Error::plugin(format!("{}: instantiate returned null", spec.uri)));
        }

        // ── Extension interfaces ──

        let ext = |uri: &CStr| -> *const c_void {
            match unsafe { (*descriptor).extension_data } {
                Some(f) => unsafe { f(uri.as_ptr()) },
                None => std::ptr::null(),
            }
        };
        let worker_iface = ext(LV2_WORKER_INTERFACE_URI) as *const LV2_Worker_Interface;
        let state_iface = ext(LV2_STATE_INTERFACE_URI) as *const LV2_State_Interface;
        let idisp_iface =
            ext(LV2_INLINE_DISPLAY_INTERFACE_URI) as *const LV2_Inline_Display_Interface;

        log::info!(
            "loaded {} from {} (worker: {}, state: {})",
            spec.uri,
            spec.binary_path,
            !worker_iface.is_null(),
            !state_iface.is_null()
        );

        Ok(DlPlugin {
            lib,
            descriptor,
            handle,
            active: false,
            _urid_map: urid_map,
            _urid_unmap: urid_unmap,
            _schedule: schedule,
            sched_ctx,
            _idisp: idisp,
            idisp_flag,
            _options: options,
            _option_values: option_values,
            _features: features,
            work_rx,
            worker_iface,
            state_iface,
            idisp_iface,
            plugin_uri: spec.uri.clone(),
        })
    }
}

impl PluginInstance for DlPlugin {
    fn connect_port(&mut self, index: u32, data: *mut c_void) {
        unsafe { ((*self.descriptor).connect_port)(self.handle, index, data) }
    }

    fn activate(&mut self) {
        if !self.active {
            if let Some(f) = unsafe { (*self.descriptor).activate } {
                unsafe { f(self.handle) };
            }
            self.active = true;
        }
    }

    fn run(&mut self, nframes: u32) {
        unsafe { ((*self.descriptor).run)(self.handle, nframes) }
    }

    fn deactivate(&mut self) {
        if self.active {
            if let Some(f) = unsafe { (*self.descriptor).deactivate } {
                unsafe { f(self.handle) };
            }
            self.active = false;
        }
    }

    fn take_work(&mut self, scratch: &mut Vec<u8>) -> bool {
        let Ok(chunk) = self.work_rx.read_chunk(4) else {
            return false;
        };
        let (a, b) = chunk.as_slices();
        let mut hdr = [0u8; 4];
        let n = a.len().min(4);
        hdr[..n].copy_from_slice(&a[..n]);
        hdr[n..].copy_from_slice(&b[..4 - n]);
        drop(chunk);
        let size = u32::from_ne_bytes(hdr) as usize;

        let Ok(chunk) = self.work_rx.read_chunk(4 + size) else {
            return false;
        };
        scratch.clear();
        let (a, b) = chunk.as_slices();
        scratch.extend_from_slice(&a[4.min(a.len())..]);
        if a.len() < 4 {
            scratch.extend_from_slice(&b[4 - a.len()..]);
        } else {
            scratch.extend_from_slice(b);
        }
        chunk.commit_all();
        true
    }

    fn deliver_response(&mut self, data: &[u8]) {
        if self.worker_iface.is_null() {
            return;
        }
        unsafe {
            ((*self.worker_iface).work_response)(
                self.handle,
                data.len() as u32,
                if data.is_empty() {
                    std::ptr::null()
                } else {
                    data.as_ptr() as *const c_void
                },
            );
        }
    }

    fn end_run(&mut self) {
        if self.worker_iface.is_null() {
            return;
        }
        if let Some(end_run) = unsafe { (*self.worker_iface).end_run } {
            unsafe { end_run(self.handle) };
        }
    }

    fn hooks(&self) -> PluginHooks {
        PluginHooks {
            worker: (!self.worker_iface.is_null()).then_some(WorkerHook {
                handle: self.handle,
                iface: self.worker_iface,
            }),
            state: (!self.state_iface.is_null()).then_some(StateHook {
                handle: self.handle,
                iface: self.state_iface,
            }),
            idisp: (!self.idisp_iface.is_null()).then_some(IdispHook {
                handle: self.handle,
                iface: self.idisp_iface,
                flag: self.idisp_flag,
            }),
        }
    }
}

impl Drop for DlPlugin {
    fn drop(&mut self) {
        unsafe {
            if self.active {
                if let Some(f) = (*self.descriptor).deactivate {
                    f(self.handle);
                }
            }
            ((*self.descriptor).cleanup)(self.handle);
            drop(Box::from_raw(self.sched_ctx));
            drop(Box::from_raw(self.idisp_flag));
            libc::dlclose(self.lib);
        }
    }
}

// ---------------------------------------------------------------------------
// Builtin system modules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// External inputs fan-in; the engine fills its output buffers.
    Source,
    /// External outputs fan-out; the engine reads its input buffers.
    Sink,
    /// Stereo audio through with a gain control.
    Stereo,
    /// Mono audio through with gain, plus an atom event through.
    MonoAtom,
}

impl BuiltinKind {
    pub fn from_uri(uri: &str) -> Option<Self> {
        if uri == db::source_uri() {
            Some(Self::Source)
        } else if uri == db::sink_uri() {
            Some(Self::Sink)
        } else if uri == db::stereo_uri() {
            Some(Self::Stereo)
        } else if uri == db::monoatom_uri() {
            Some(Self::MonoAtom)
        } else {
            None
        }
    }
}

/// Instance backing the builtin modules.  Speaks the same `connect_port`
/// contract as a loaded plugin so the engine does not special-case it.
pub struct BuiltinInstance {
    kind: BuiltinKind,
    conns: Vec<*mut c_void>,
}

unsafe impl Send for BuiltinInstance {}
unsafe impl Sync for BuiltinInstance {}

impl BuiltinInstance {
    pub fn new(kind: BuiltinKind, num_ports: usize) -> Self {
        BuiltinInstance {
            kind,
            conns: vec![std::ptr::null_mut(); num_ports],
        }
    }

    #[inline]
    unsafe fn audio(&self, idx: usize, nframes: u32) -> Option<&[f32]> {
        let ptr = *self.conns.get(idx)?;
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(ptr as *const f32, nframes as usize) })
    }

    #[inline]
    unsafe fn audio_mut(&self, idx: usize, nframes: u32) -> Option<&mut [f32]> {
        let ptr = *self.conns.get(idx)?;
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(ptr as *mut f32, nframes as usize) })
    }

    #[inline]
    unsafe fn control(&self, idx: usize) -> f32 {
        match self.conns.get(idx) {
            Some(&ptr) if !ptr.is_null() => unsafe { *(ptr as *const f32) },
            _ => 0.0,
        }
    }

    unsafe fn through(&self, from: usize, to: usize, gain: f32, nframes: u32) {
        unsafe {
            if let (Some(src), Some(dst)) = (self.audio(from, nframes), self.audio_mut(to, nframes))
            {
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    *d = s * gain;
                }
            }
        }
    }
}

impl PluginInstance for BuiltinInstance {
    fn connect_port(&mut self, index: u32, data: *mut c_void) {
        if let Some(slot) = self.conns.get_mut(index as usize) {
            *slot = data;
        }
    }

    fn run(&mut self, nframes: u32) {
        match self.kind {
            // The engine itself moves samples between the driver and the
            // source/sink port buffers.
            BuiltinKind::Source | BuiltinKind::Sink => {}
            BuiltinKind::Stereo => unsafe {
                let gain = self.control(4);
                self.through(0, 2, gain, nframes);
                self.through(1, 3, gain, nframes);
            },
            BuiltinKind::MonoAtom => unsafe {
                let gain = self.control(4);
                self.through(0, 1, gain, nframes);
                // Copy the input sequence verbatim to the output port.
                if let (Some(&src), Some(&dst)) = (self.conns.get(2), self.conns.get(3))
                    && !src.is_null()
                    && !dst.is_null()
                {
                    let hdr = std::slice::from_raw_parts(src as *const u8, 8);
                    let size = u32::from_ne_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
                    std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, 8 + size);
                }
            },
        }
    }
}

/// Instantiate for a plugin URI: builtin kinds directly, everything else
/// through the dynamic loader.
pub fn instantiate(
    spec: &PluginSpec,
    sample_rate: f64,
    max_block: u32,
    seq_size: u32,
    urid: &Arc<UridMap>,
) -> Result<Box<dyn PluginInstance>> {
    if let Some(kind) = BuiltinKind::from_uri(&spec.uri) {
        return Ok(Box::new(BuiltinInstance::new(kind, spec.num_ports())));
    }
    if !spec.supported {
        return Err(Error::plugin(format!(
            "{}: requires unsupported features {:?}",
            spec.uri, spec.required_features
        )));
    }
    Ok(Box::new(DlPlugin::load(
        spec,
        sample_rate,
        max_block,
        seq_size,
        urid,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::db::{builtin_spec, stereo_uri};

    #[test]
    fn stereo_builtin_applies_gain() {
        let spec = builtin_spec(&stereo_uri()).unwrap();
        let mut inst = BuiltinInstance::new(BuiltinKind::Stereo, spec.num_ports());

        let in1 = [1.0f32; 8];
        let in2 = [0.5f32; 8];
        let mut out1 = [0.0f32; 8];
        let mut out2 = [0.0f32; 8];
        let mut gain = 2.0f32;

        inst.connect_port(0, in1.as_ptr() as *mut c_void);
        inst.connect_port(1, in2.as_ptr() as *mut c_void);
        inst.connect_port(2, out1.as_mut_ptr() as *mut c_void);
        inst.connect_port(3, out2.as_mut_ptr() as *mut c_void);
        inst.connect_port(4, &mut gain as *mut f32 as *mut c_void);

        inst.run(8);
        assert!(out1.iter().all(|&s| s == 2.0));
        assert!(out2.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn source_sink_are_passive() {
        let mut src = BuiltinInstance::new(BuiltinKind::Source, 4);
        let mut buf = [0.25f32; 4];
        src.connect_port(0, buf.as_mut_ptr() as *mut c_void);
        src.run(4);
        assert!(buf.iter().all(|&s| s == 0.25));
    }
}
