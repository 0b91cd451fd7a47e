//! The request/response vocabulary spoken over the rings.
//!
//! Every frame is a typed object: the frame's type URID names the verb and
//! the body is a list of (key URID, type URID, size, bytes) properties.
//! Unknown verbs are skipped and counted, never an error - newer peers may
//! speak a larger vocabulary.
//!
//! A handful of RT-touched verbs use fixed compact layouts instead of the
//! property list so the RT thread can parse and emit them without any
//! allocation: port float/event writes, subscription installs, work blobs
//! and notifications.  The verb plus the ring it travels on decides the
//! layout (see [`compact`]).

use crate::atom::Value;
use crate::automation::{AutoKind, AutoSink, AutomationMapping};
use crate::error::{Error, Result};
use crate::regs::Regs;
use crate::urid::Urid;

// ---------------------------------------------------------------------------
// Property list encoding
// ---------------------------------------------------------------------------

/// Allocating property writer for worker/UI-side message construction.
pub struct PropWriter<'r> {
    regs: &'r Regs,
    buf: Vec<u8>,
}

impl<'r> PropWriter<'r> {
    pub fn new(regs: &'r Regs) -> Self {
        PropWriter {
            regs,
            buf: Vec::with_capacity(64),
        }
    }

    fn raw(&mut self, key: Urid, type_urid: Urid, body: &[u8]) {
        self.buf.extend_from_slice(&key.to_ne_bytes());
        self.buf.extend_from_slice(&type_urid.to_ne_bytes());
        self.buf.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        self.buf.extend_from_slice(body);
    }

    pub fn urid(mut self, key: Urid, v: Urid) -> Self {
        self.raw(key, self.regs.atom.urid, &v.to_ne_bytes());
        self
    }

    pub fn float(mut self, key: Urid, v: f32) -> Self {
        self.raw(key, self.regs.atom.float, &v.to_ne_bytes());
        self
    }

    pub fn double(mut self, key: Urid, v: f64) -> Self {
        self.raw(key, self.regs.atom.double, &v.to_ne_bytes());
        self
    }

    pub fn int(mut self, key: Urid, v: i32) -> Self {
        self.raw(key, self.regs.atom.int, &v.to_ne_bytes());
        self
    }

    pub fn bool_(mut self, key: Urid, v: bool) -> Self {
        self.raw(key, self.regs.atom.bool_, &i32::from(v).to_ne_bytes());
        self
    }

    pub fn string(mut self, key: Urid, v: &str) -> Self {
        self.raw(key, self.regs.atom.string, v.as_bytes());
        self
    }

    pub fn value(mut self, key: Urid, v: &Value) -> Self {
        let ty = v.type_urid(&self.regs.atom);
        let body = v.to_body(&self.regs.atom);
        self.raw(key, ty, &body);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Zero-copy property reader.
pub struct PropReader<'a> {
    buf: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct Prop<'a> {
    pub key: Urid,
    pub type_urid: Urid,
    pub body: &'a [u8],
}

impl<'a> PropReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        PropReader { buf }
    }

    pub fn iter(&self) -> impl Iterator<Item = Prop<'a>> + 'a {
        let buf = self.buf;
        let mut off = 0usize;
        std::iter::from_fn(move || {
            if off + 12 > buf.len() {
                return None;
            }
            let rd = |o: usize| u32::from_ne_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
            let key = rd(off);
            let type_urid = rd(off + 4);
            let size = rd(off + 8) as usize;
            if off + 12 + size > buf.len() {
                return None;
            }
            let body = &buf[off + 12..off + 12 + size];
            off += 12 + size;
            Some(Prop {
                key,
                type_urid,
                body,
            })
        })
    }

    pub fn get(&self, key: Urid) -> Option<Prop<'a>> {
        self.iter().find(|p| p.key == key)
    }

    pub fn urid(&self, key: Urid) -> Option<Urid> {
        self.get(key)?.body.get(..4).map(le4)
    }

    pub fn f32(&self, key: Urid) -> Option<f32> {
        self.get(key)?.body.get(..4).map(|b| f32::from_bits(le4(b)))
    }

    pub fn f64(&self, key: Urid) -> Option<f64> {
        let b = self.get(key)?.body.get(..8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Some(f64::from_ne_bytes(arr))
    }

    pub fn i32(&self, key: Urid) -> Option<i32> {
        self.get(key)?.body.get(..4).map(|b| le4(b) as i32)
    }

    pub fn bool_(&self, key: Urid) -> Option<bool> {
        self.i32(key).map(|v| v != 0)
    }

    pub fn str(&self, key: Urid) -> Option<&'a str> {
        std::str::from_utf8(self.get(key)?.body).ok()
    }

    pub fn value(&self, key: Urid, regs: &Regs) -> Option<Value> {
        let p = self.get(key)?;
        Value::from_body(p.type_urid, p.body, &regs.atom)
    }
}

#[inline]
fn le4(b: &[u8]) -> u32 {
    u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
}

// ---------------------------------------------------------------------------
// Compact RT layouts
// ---------------------------------------------------------------------------

pub mod compact {
    use crate::urid::Urid;

    /// `float_protocol`: (module urn, port index, value).
    pub fn port_float(urn: Urid, index: u32, value: f32) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[0..4].copy_from_slice(&urn.to_ne_bytes());
        b[4..8].copy_from_slice(&index.to_ne_bytes());
        b[8..12].copy_from_slice(&value.to_ne_bytes());
        b
    }

    pub fn parse_port_float(body: &[u8]) -> Option<(Urid, u32, f32)> {
        if body.len() < 12 {
            return None;
        }
        Some((
            u32::from_ne_bytes([body[0], body[1], body[2], body[3]]),
            u32::from_ne_bytes([body[4], body[5], body[6], body[7]]),
            f32::from_ne_bytes([body[8], body[9], body[10], body[11]]),
        ))
    }

    /// `peak_protocol`: (module urn, port index, period size, |max| peak).
    pub fn port_peak(urn: Urid, index: u32, period: u32, peak: f32) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&urn.to_ne_bytes());
        b[4..8].copy_from_slice(&index.to_ne_bytes());
        b[8..12].copy_from_slice(&period.to_ne_bytes());
        b[12..16].copy_from_slice(&peak.to_ne_bytes());
        b
    }

    pub fn parse_port_peak(body: &[u8]) -> Option<(Urid, u32, u32, f32)> {
        if body.len() < 16 {
            return None;
        }
        Some((
            u32::from_ne_bytes([body[0], body[1], body[2], body[3]]),
            u32::from_ne_bytes([body[4], body[5], body[6], body[7]]),
            u32::from_ne_bytes([body[8], body[9], body[10], body[11]]),
            f32::from_ne_bytes([body[12], body[13], body[14], body[15]]),
        ))
    }

    /// `event_transfer` / `atom_transfer`: (urn, index) header; the atom
    /// bytes follow as the remainder of the frame.
    pub fn port_event_header(urn: Urid, index: u32) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&urn.to_ne_bytes());
        b[4..8].copy_from_slice(&index.to_ne_bytes());
        b
    }

    pub fn parse_port_event(body: &[u8]) -> Option<(Urid, u32, &[u8])> {
        if body.len() < 8 {
            return None;
        }
        Some((
            u32::from_ne_bytes([body[0], body[1], body[2], body[3]]),
            u32::from_ne_bytes([body[4], body[5], body[6], body[7]]),
            &body[8..],
        ))
    }

    /// Worker -> RT `subscriptionList`: (urn, index, protocol, add flag).
    pub fn sub_install(urn: Urid, index: u32, protocol: Urid, add: bool) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&urn.to_ne_bytes());
        b[4..8].copy_from_slice(&index.to_ne_bytes());
        b[8..12].copy_from_slice(&protocol.to_ne_bytes());
        b[12..16].copy_from_slice(&u32::from(add).to_ne_bytes());
        b
    }

    pub fn parse_sub_install(body: &[u8]) -> Option<(Urid, u32, Urid, bool)> {
        if body.len() < 16 {
            return None;
        }
        Some((
            u32::from_ne_bytes([body[0], body[1], body[2], body[3]]),
            u32::from_ne_bytes([body[4], body[5], body[6], body[7]]),
            u32::from_ne_bytes([body[8], body[9], body[10], body[11]]),
            u32::from_ne_bytes([body[12], body[13], body[14], body[15]]) != 0,
        ))
    }

    /// `payload` (both directions RT ↔ worker): (urn) header + work blob.
    pub fn work_header(urn: Urid) -> [u8; 4] {
        urn.to_ne_bytes()
    }

    pub fn parse_work(body: &[u8]) -> Option<(Urid, &[u8])> {
        if body.len() < 4 {
            return None;
        }
        Some((
            u32::from_ne_bytes([body[0], body[1], body[2], body[3]]),
            &body[4..],
        ))
    }

    /// RT -> worker `learning` report: a learn completed on slot `id`.
    pub fn learn_header(id: u32, kind: u32, channel: i32, controller: i32) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&id.to_ne_bytes());
        b[4..8].copy_from_slice(&kind.to_ne_bytes());
        b[8..12].copy_from_slice(&channel.to_ne_bytes());
        b[12..16].copy_from_slice(&controller.to_ne_bytes());
        b
    }

    pub fn parse_learn(body: &[u8]) -> Option<(u32, u32, i32, i32, &[u8])> {
        if body.len() < 16 {
            return None;
        }
        Some((
            u32::from_ne_bytes([body[0], body[1], body[2], body[3]]),
            u32::from_ne_bytes([body[4], body[5], body[6], body[7]]),
            i32::from_ne_bytes([body[8], body[9], body[10], body[11]]),
            i32::from_ne_bytes([body[12], body[13], body[14], body[15]]),
            &body[16..],
        ))
    }
}

// ---------------------------------------------------------------------------
// Typed messages (property-list verbs)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    // Modules
    ModuleAdd { plugin_uri: String },
    ModuleAdded { urn: Urid, urn_uri: String, plugin_uri: String },
    ModuleDel { urn: Urid },
    ModuleDeleted { urn: Urid },
    ModuleMove { urn: Urid, x: f32, y: f32 },
    ModuleVisible { urn: Urid, ui_urn: Urid, visible: bool },
    ModuleDisabled { urn: Urid, disabled: bool },
    ModuleAlias { urn: Urid, alias: String },
    ModulePresetLoad { urn: Urid, preset_uri: String },
    ModulePresetSave { urn: Urid, label: String },
    ModuleProfiling { urn: Urid, min: f32, avg: f32, max: f32 },
    ModuleListGet,
    ModuleSupportedGet,
    ModuleSupported { uri: String, name: String },

    // Connections / matrix nodes
    ConnAdd {
        source_urn: Urid,
        source_symbol: String,
        sink_urn: Urid,
        sink_symbol: String,
        gain: f32,
    },
    ConnRemove {
        source_urn: Urid,
        source_symbol: String,
        sink_urn: Urid,
        sink_symbol: String,
    },
    NodeMove { source_urn: Urid, sink_urn: Urid, x: f32, y: f32 },
    NodeFeedback { source_urn: Urid, sink_urn: Urid, feedback: bool },

    // Subscriptions
    SubAdd { urn: Urid, symbol: String, protocol: Urid },
    SubRemove { urn: Urid, symbol: String, protocol: Urid },

    // Automation
    AutoAdd(AutomationMapping),
    AutoRemove { sink: AutoSink },

    // Parameters
    PatchSet { urn: Urid, property: Urid, value: Value },
    PatchGet { urn: Urid, property: Urid },

    // Session
    BundleLoad { path: String },
    BundleSave { path: String },
    PathGet,
    PathIs { path: String },
    Quit,
    CpusAvailable { count: u32 },
    CpusUsed { count: u32 },
    PeriodSize { frames: u32 },
    SampleRate { rate: u32 },
    GridCols { count: i32 },
    GridRows { count: i32 },
    PaneLeft { fraction: f32 },
    DspProfiling { min: f32, avg: f32, max: f32 },

    // Responses
    Ack { in_reply_to: Urid },
    ErrorReply { in_reply_to: Urid, message: String },
}

impl Msg {
    /// The verb URID this message travels under.
    pub fn verb(&self, regs: &Regs) -> Urid {
        let s = &regs.synthpod;
        match self {
            Msg::ModuleAdd { .. } | Msg::ModuleAdded { .. } => s.module_add,
            Msg::ModuleDel { .. } | Msg::ModuleDeleted { .. } => s.module_del,
            Msg::ModuleMove { .. } => s.module_move,
            Msg::ModuleVisible { .. } => s.module_visible,
            Msg::ModuleDisabled { .. } => s.module_disabled,
            Msg::ModuleAlias { .. } => s.module_alias,
            Msg::ModulePresetLoad { .. } => s.module_preset_load,
            Msg::ModulePresetSave { .. } => s.module_preset_save,
            Msg::ModuleProfiling { .. } => s.module_profiling,
            Msg::ModuleListGet => s.module_list,
            Msg::ModuleSupportedGet | Msg::ModuleSupported { .. } => s.module_supported,
            Msg::ConnAdd { .. } | Msg::ConnRemove { .. } => s.connection_list,
            Msg::NodeMove { .. } | Msg::NodeFeedback { .. } => s.node_list,
            Msg::SubAdd { .. } | Msg::SubRemove { .. } => s.subscription_list,
            Msg::AutoAdd(_) | Msg::AutoRemove { .. } => s.automation_list,
            Msg::PatchSet { .. } => regs.patch.set,
            Msg::PatchGet { .. } => regs.patch.get,
            Msg::BundleLoad { .. } => s.bundle_load,
            Msg::BundleSave { .. } => s.bundle_save,
            Msg::PathGet | Msg::PathIs { .. } => s.path_get,
            Msg::Quit => s.quit,
            Msg::CpusAvailable { .. } => s.cpus_available,
            Msg::CpusUsed { .. } => s.cpus_used,
            Msg::PeriodSize { .. } => s.period_size,
            Msg::SampleRate { .. } => s.sample_rate,
            Msg::GridCols { .. } => s.grid_cols,
            Msg::GridRows { .. } => s.grid_rows,
            Msg::PaneLeft { .. } => s.pane_left,
            Msg::DspProfiling { .. } => s.dsp_profiling,
            Msg::Ack { .. } => regs.patch.ack,
            Msg::ErrorReply { .. } => regs.patch.error,
        }
    }

    /// Encode into (verb, body) ready for `RingTx::send`.
    pub fn encode(&self, regs: &Regs) -> (Urid, Vec<u8>) {
        let s = &regs.synthpod;
        let p = &regs.patch;
        let w = PropWriter::new(regs);
        let body = match self {
            Msg::ModuleAdd { plugin_uri } => w.string(s.plugin, plugin_uri).finish(),
            Msg::ModuleAdded {
                urn,
                urn_uri,
                plugin_uri,
            } => w
                .urid(p.subject, *urn)
                .string(p.body, urn_uri)
                .string(s.plugin, plugin_uri)
                .finish(),
            Msg::ModuleDel { urn } => w.urid(p.subject, *urn).finish(),
            Msg::ModuleDeleted { urn } => w.urid(p.subject, *urn).bool_(p.ack, true).finish(),
            Msg::ModuleMove { urn, x, y } => w
                .urid(p.subject, *urn)
                .float(s.module_position_x, *x)
                .float(s.module_position_y, *y)
                .finish(),
            Msg::ModuleVisible {
                urn,
                ui_urn,
                visible,
            } => w
                .urid(p.subject, *urn)
                .urid(s.module_ui, *ui_urn)
                .bool_(p.value, *visible)
                .finish(),
            Msg::ModuleDisabled { urn, disabled } => {
                w.urid(p.subject, *urn).bool_(p.value, *disabled).finish()
            }
            Msg::ModuleAlias { urn, alias } => {
                w.urid(p.subject, *urn).string(p.value, alias).finish()
            }
            Msg::ModulePresetLoad { urn, preset_uri } => {
                w.urid(p.subject, *urn).string(p.value, preset_uri).finish()
            }
            Msg::ModulePresetSave { urn, label } => {
                w.urid(p.subject, *urn).string(p.value, label).finish()
            }
            Msg::ModuleProfiling { urn, min, avg, max } => w
                .urid(p.subject, *urn)
                .float(s.source_min, *min)
                .float(p.value, *avg)
                .float(s.source_max, *max)
                .finish(),
            Msg::ModuleListGet | Msg::ModuleSupportedGet | Msg::PathGet | Msg::Quit => w.finish(),
            Msg::ModuleSupported { uri, name } => {
                w.string(s.plugin, uri).string(p.value, name).finish()
            }
            Msg::ConnAdd {
                source_urn,
                source_symbol,
                sink_urn,
                sink_symbol,
                gain,
            } => w
                .bool_(p.add, true)
                .urid(s.source_module, *source_urn)
                .string(s.source_symbol, source_symbol)
                .urid(s.sink_module, *sink_urn)
                .string(s.sink_symbol, sink_symbol)
                .float(s.gain, *gain)
                .finish(),
            Msg::ConnRemove {
                source_urn,
                source_symbol,
                sink_urn,
                sink_symbol,
            } => w
                .bool_(p.remove, true)
                .urid(s.source_module, *source_urn)
                .string(s.source_symbol, source_symbol)
                .urid(s.sink_module, *sink_urn)
                .string(s.sink_symbol, sink_symbol)
                .finish(),
            Msg::NodeMove {
                source_urn,
                sink_urn,
                x,
                y,
            } => w
                .urid(s.source_module, *source_urn)
                .urid(s.sink_module, *sink_urn)
                .float(s.node_position_x, *x)
                .float(s.node_position_y, *y)
                .finish(),
            Msg::NodeFeedback {
                source_urn,
                sink_urn,
                feedback,
            } => w
                .urid(s.source_module, *source_urn)
                .urid(s.sink_module, *sink_urn)
                .bool_(s.feedback, *feedback)
                .finish(),
            Msg::SubAdd {
                urn,
                symbol,
                protocol,
            } => w
                .bool_(p.add, true)
                .urid(s.sink_module, *urn)
                .string(s.sink_symbol, symbol)
                .urid(p.property, *protocol)
                .finish(),
            Msg::SubRemove {
                urn,
                symbol,
                protocol,
            } => w
                .bool_(p.remove, true)
                .urid(s.sink_module, *urn)
                .string(s.sink_symbol, symbol)
                .urid(p.property, *protocol)
                .finish(),
            Msg::AutoAdd(m) => {
                let kind = match m.kind {
                    AutoKind::Midi => s.midi_automation,
                    AutoKind::Osc => s.osc_automation,
                };
                let mut w = w
                    .bool_(p.add, true)
                    .urid(regs.rdf_type, kind)
                    .urid(s.sink_module, m.sink.urn())
                    .double(s.source_min, m.source_range.0)
                    .double(s.source_max, m.source_range.1)
                    .double(s.sink_min, m.sink_range.0)
                    .double(s.sink_max, m.sink_range.1)
                    .bool_(s.source_enabled, m.src_enabled)
                    .bool_(s.sink_enabled, m.snk_enabled)
                    .bool_(s.learning, m.learning)
                    .int(s.midi_channel, m.midi_channel)
                    .int(s.midi_controller, m.midi_controller)
                    .string(s.osc_path, &m.osc_path);
                w = match &m.sink {
                    AutoSink::Port { symbol, .. } => w.string(s.sink_symbol, symbol),
                    AutoSink::Param {
                        property, range, ..
                    } => w.urid(p.property, *property).urid(regs.rdfs_range, *range),
                };
                w.finish()
            }
            Msg::AutoRemove { sink } => {
                let mut w = w.bool_(p.remove, true).urid(s.sink_module, sink.urn());
                w = match sink {
                    AutoSink::Port { symbol, .. } => w.string(s.sink_symbol, symbol),
                    AutoSink::Param {
                        property, range, ..
                    } => w.urid(p.property, *property).urid(regs.rdfs_range, *range),
                };
                w.finish()
            }
            Msg::PatchSet {
                urn,
                property,
                value,
            } => w
                .urid(p.subject, *urn)
                .urid(p.property, *property)
                .value(p.value, value)
                .finish(),
            Msg::PatchGet { urn, property } => w
                .urid(p.subject, *urn)
                .urid(p.property, *property)
                .finish(),
            Msg::BundleLoad { path } | Msg::BundleSave { path } | Msg::PathIs { path } => {
                w.string(p.value, path).finish()
            }
            Msg::CpusAvailable { count } => w.int(p.value, *count as i32).finish(),
            Msg::CpusUsed { count } => w.int(p.value, *count as i32).finish(),
            Msg::PeriodSize { frames } => w.int(p.value, *frames as i32).finish(),
            Msg::SampleRate { rate } => w.int(p.value, *rate as i32).finish(),
            Msg::GridCols { count } => w.int(p.value, *count).finish(),
            Msg::GridRows { count } => w.int(p.value, *count).finish(),
            Msg::PaneLeft { fraction } => w.float(p.value, *fraction).finish(),
            Msg::DspProfiling { min, avg, max } => w
                .float(s.source_min, *min)
                .float(p.value, *avg)
                .float(s.source_max, *max)
                .finish(),
            Msg::Ack { in_reply_to } => w.urid(p.subject, *in_reply_to).finish(),
            Msg::ErrorReply {
                in_reply_to,
                message,
            } => w
                .urid(p.subject, *in_reply_to)
                .string(p.value, message)
                .finish(),
        };
        (self.verb(regs), body)
    }

    /// Decode a property-list frame.  `Ok(None)` means the verb is unknown
    /// (skipped, forward compatibility); malformed bodies of known verbs
    /// are protocol errors.
    pub fn decode(verb: Urid, body: &[u8], regs: &Regs) -> Result<Option<Msg>> {
        let s = &regs.synthpod;
        let p = &regs.patch;
        let r = PropReader::new(body);
        let missing = || Error::protocol(format!("missing property on verb {verb}"));

        let msg = if verb == s.module_add {
            match r.urid(p.subject) {
                Some(urn) => Msg::ModuleAdded {
                    urn,
                    urn_uri: r.str(p.body).ok_or_else(missing)?.to_string(),
                    plugin_uri: r.str(s.plugin).ok_or_else(missing)?.to_string(),
                },
                None => Msg::ModuleAdd {
                    plugin_uri: r.str(s.plugin).ok_or_else(missing)?.to_string(),
                },
            }
        } else if verb == s.module_del {
            let urn = r.urid(p.subject).ok_or_else(missing)?;
            if r.bool_(p.ack).unwrap_or(false) {
                Msg::ModuleDeleted { urn }
            } else {
                Msg::ModuleDel { urn }
            }
        } else if verb == s.module_move {
            Msg::ModuleMove {
                urn: r.urid(p.subject).ok_or_else(missing)?,
                x: r.f32(s.module_position_x).ok_or_else(missing)?,
                y: r.f32(s.module_position_y).ok_or_else(missing)?,
            }
        } else if verb == s.module_visible {
            Msg::ModuleVisible {
                urn: r.urid(p.subject).ok_or_else(missing)?,
                ui_urn: r.urid(s.module_ui).unwrap_or(0),
                visible: r.bool_(p.value).unwrap_or(true),
            }
        } else if verb == s.module_disabled {
            Msg::ModuleDisabled {
                urn: r.urid(p.subject).ok_or_else(missing)?,
                disabled: r.bool_(p.value).unwrap_or(false),
            }
        } else if verb == s.module_alias {
            Msg::ModuleAlias {
                urn: r.urid(p.subject).ok_or_else(missing)?,
                alias: r.str(p.value).unwrap_or_default().to_string(),
            }
        } else if verb == s.module_preset_load {
            Msg::ModulePresetLoad {
                urn: r.urid(p.subject).ok_or_else(missing)?,
                preset_uri: r.str(p.value).ok_or_else(missing)?.to_string(),
            }
        } else if verb == s.module_preset_save {
            Msg::ModulePresetSave {
                urn: r.urid(p.subject).ok_or_else(missing)?,
                label: r.str(p.value).ok_or_else(missing)?.to_string(),
            }
        } else if verb == s.module_profiling {
            Msg::ModuleProfiling {
                urn: r.urid(p.subject).ok_or_else(missing)?,
                min: r.f32(s.source_min).unwrap_or(0.0),
                avg: r.f32(p.value).unwrap_or(0.0),
                max: r.f32(s.source_max).unwrap_or(0.0),
            }
        } else if verb == s.module_list {
            Msg::ModuleListGet
        } else if verb == s.module_supported {
            match r.str(s.plugin) {
                Some(uri) => Msg::ModuleSupported {
                    uri: uri.to_string(),
                    name: r.str(p.value).unwrap_or_default().to_string(),
                },
                None => Msg::ModuleSupportedGet,
            }
        } else if verb == s.connection_list {
            let source_urn = r.urid(s.source_module).ok_or_else(missing)?;
            let sink_urn = r.urid(s.sink_module).ok_or_else(missing)?;
            let source_symbol = r.str(s.source_symbol).ok_or_else(missing)?.to_string();
            let sink_symbol = r.str(s.sink_symbol).ok_or_else(missing)?.to_string();
            if r.bool_(p.remove).unwrap_or(false) {
                Msg::ConnRemove {
                    source_urn,
                    source_symbol,
                    sink_urn,
                    sink_symbol,
                }
            } else {
                Msg::ConnAdd {
                    source_urn,
                    source_symbol,
                    sink_urn,
                    sink_symbol,
                    gain: r.f32(s.gain).unwrap_or(1.0),
                }
            }
        } else if verb == s.node_list {
            let source_urn = r.urid(s.source_module).ok_or_else(missing)?;
            let sink_urn = r.urid(s.sink_module).ok_or_else(missing)?;
            if let Some(feedback) = r.bool_(s.feedback) {
                Msg::NodeFeedback {
                    source_urn,
                    sink_urn,
                    feedback,
                }
            } else {
                Msg::NodeMove {
                    source_urn,
                    sink_urn,
                    x: r.f32(s.node_position_x).unwrap_or(0.0),
                    y: r.f32(s.node_position_y).unwrap_or(0.0),
                }
            }
        } else if verb == s.subscription_list {
            let urn = r.urid(s.sink_module).ok_or_else(missing)?;
            let symbol = r.str(s.sink_symbol).ok_or_else(missing)?.to_string();
            let protocol = r.urid(p.property).unwrap_or(0);
            if r.bool_(p.remove).unwrap_or(false) {
                Msg::SubRemove {
                    urn,
                    symbol,
                    protocol,
                }
            } else {
                Msg::SubAdd {
                    urn,
                    symbol,
                    protocol,
                }
            }
        } else if verb == s.automation_list {
            let urn = r.urid(s.sink_module).ok_or_else(missing)?;
            let sink = if let Some(property) = r.urid(p.property) {
                AutoSink::Param {
                    urn,
                    property,
                    range: r.urid(regs.rdfs_range).unwrap_or(regs.atom.float),
                }
            } else {
                AutoSink::Port {
                    urn,
                    symbol: r.str(s.sink_symbol).ok_or_else(missing)?.to_string(),
                }
            };
            if r.bool_(p.remove).unwrap_or(false) {
                Msg::AutoRemove { sink }
            } else {
                let kind = if r.urid(regs.rdf_type) == Some(s.osc_automation) {
                    AutoKind::Osc
                } else {
                    AutoKind::Midi
                };
                Msg::AutoAdd(AutomationMapping {
                    kind,
                    sink,
                    source_range: (
                        r.f64(s.source_min).unwrap_or(0.0),
                        r.f64(s.source_max).unwrap_or(127.0),
                    ),
                    sink_range: (
                        r.f64(s.sink_min).unwrap_or(0.0),
                        r.f64(s.sink_max).unwrap_or(1.0),
                    ),
                    src_enabled: r.bool_(s.source_enabled).unwrap_or(false),
                    snk_enabled: r.bool_(s.sink_enabled).unwrap_or(true),
                    learning: r.bool_(s.learning).unwrap_or(false),
                    midi_channel: r.i32(s.midi_channel).unwrap_or(-1),
                    midi_controller: r.i32(s.midi_controller).unwrap_or(-1),
                    osc_path: r.str(s.osc_path).unwrap_or_default().to_string(),
                })
            }
        } else if verb == p.set {
            Msg::PatchSet {
                urn: r.urid(p.subject).ok_or_else(missing)?,
                property: r.urid(p.property).ok_or_else(missing)?,
                value: r.value(p.value, regs).ok_or_else(missing)?,
            }
        } else if verb == p.get {
            Msg::PatchGet {
                urn: r.urid(p.subject).ok_or_else(missing)?,
                property: r.urid(p.property).ok_or_else(missing)?,
            }
        } else if verb == s.bundle_load {
            Msg::BundleLoad {
                path: r.str(p.value).ok_or_else(missing)?.to_string(),
            }
        } else if verb == s.bundle_save {
            Msg::BundleSave {
                path: r.str(p.value).ok_or_else(missing)?.to_string(),
            }
        } else if verb == s.path_get {
            match r.str(p.value) {
                Some(path) => Msg::PathIs {
                    path: path.to_string(),
                },
                None => Msg::PathGet,
            }
        } else if verb == s.quit {
            Msg::Quit
        } else if verb == s.cpus_available {
            Msg::CpusAvailable {
                count: r.i32(p.value).unwrap_or(1).max(1) as u32,
            }
        } else if verb == s.cpus_used {
            Msg::CpusUsed {
                count: r.i32(p.value).unwrap_or(1).max(1) as u32,
            }
        } else if verb == s.period_size {
            Msg::PeriodSize {
                frames: r.i32(p.value).unwrap_or(0).max(0) as u32,
            }
        } else if verb == s.sample_rate {
            Msg::SampleRate {
                rate: r.i32(p.value).unwrap_or(0).max(0) as u32,
            }
        } else if verb == s.grid_cols {
            Msg::GridCols {
                count: r.i32(p.value).unwrap_or(0),
            }
        } else if verb == s.grid_rows {
            Msg::GridRows {
                count: r.i32(p.value).unwrap_or(0),
            }
        } else if verb == s.pane_left {
            Msg::PaneLeft {
                fraction: r.f32(p.value).unwrap_or(0.0),
            }
        } else if verb == s.dsp_profiling {
            Msg::DspProfiling {
                min: r.f32(s.source_min).unwrap_or(0.0),
                avg: r.f32(p.value).unwrap_or(0.0),
                max: r.f32(s.source_max).unwrap_or(0.0),
            }
        } else if verb == p.ack {
            Msg::Ack {
                in_reply_to: r.urid(p.subject).unwrap_or(0),
            }
        } else if verb == p.error {
            Msg::ErrorReply {
                in_reply_to: r.urid(p.subject).unwrap_or(0),
                message: r.str(p.value).unwrap_or_default().to_string(),
            }
        } else {
            return Ok(None);
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urid::UridMap;

    fn roundtrip(msg: Msg) {
        let urid = UridMap::new();
        let regs = Regs::new(&urid);
        let (verb, body) = msg.encode(&regs);
        let decoded = Msg::decode(verb, &body, &regs).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn verbs_roundtrip() {
        roundtrip(Msg::ModuleAdd {
            plugin_uri: "http://example.org/amp".into(),
        });
        roundtrip(Msg::ModuleAdded {
            urn: 99,
            urn_uri: "urn:uuid:1234".into(),
            plugin_uri: "http://example.org/amp".into(),
        });
        roundtrip(Msg::ModuleDel { urn: 7 });
        roundtrip(Msg::ConnAdd {
            source_urn: 1,
            source_symbol: "audio_out_1".into(),
            sink_urn: 2,
            sink_symbol: "audio_in_1".into(),
            gain: 0.5,
        });
        roundtrip(Msg::ConnRemove {
            source_urn: 1,
            source_symbol: "audio_out_1".into(),
            sink_urn: 2,
            sink_symbol: "audio_in_1".into(),
        });
        roundtrip(Msg::SubAdd {
            urn: 2,
            symbol: "audio_in_1".into(),
            protocol: 42,
        });
        roundtrip(Msg::PatchSet {
            urn: 3,
            property: 17,
            value: Value::Float(0.25),
        });
        roundtrip(Msg::BundleSave {
            path: "/tmp/session.synthpod".into(),
        });
        roundtrip(Msg::NodeFeedback {
            source_urn: 4,
            sink_urn: 5,
            feedback: true,
        });
        roundtrip(Msg::ErrorReply {
            in_reply_to: 9,
            message: "cycle".into(),
        });
    }

    #[test]
    fn automation_roundtrip() {
        use crate::automation::{AutoSink, AutomationMapping};
        let mut m = AutomationMapping::midi(
            AutoSink::Port {
                urn: 11,
                symbol: "gain".into(),
            },
            3,
            74,
        );
        m.learning = true;
        roundtrip(Msg::AutoAdd(m));

        roundtrip(Msg::AutoRemove {
            sink: AutoSink::Port {
                urn: 11,
                symbol: "gain".into(),
            },
        });
    }

    #[test]
    fn unknown_verbs_are_skipped() {
        let urid = UridMap::new();
        let regs = Regs::new(&urid);
        let exotic = urid.map("http://example.org/future#verb");
        assert!(Msg::decode(exotic, &[], &regs).unwrap().is_none());
    }

    #[test]
    fn malformed_known_verb_is_a_protocol_error() {
        let urid = UridMap::new();
        let regs = Regs::new(&urid);
        let err = Msg::decode(regs.synthpod.module_del, &[], &regs).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn compact_layouts_roundtrip() {
        let b = compact::port_float(5, 2, 0.75);
        assert_eq!(compact::parse_port_float(&b), Some((5, 2, 0.75)));

        let b = compact::port_peak(5, 2, 512, 0.9);
        assert_eq!(compact::parse_port_peak(&b), Some((5, 2, 512, 0.9)));

        let b = compact::sub_install(5, 2, 77, true);
        assert_eq!(compact::parse_sub_install(&b), Some((5, 2, 77, true)));

        let mut msg = compact::work_header(5).to_vec();
        msg.extend_from_slice(b"blob");
        let (urn, blob) = compact::parse_work(&msg).unwrap();
        assert_eq!(urn, 5);
        assert_eq!(blob, b"blob");
    }
}
