//! The non-realtime worker thread.
//!
//! Owns the authoritative session [`Graph`], the plugin database handle,
//! the preset store and the garbage collector for retired compiled graphs.
//! Services every request the RT thread bounces over: module lifecycle,
//! connection edits, plugin work, state save/restore, preset maintenance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use basedrop::{Collector, Shared, SharedCell};

use super::compile::compile;
use super::rt::{DspGraph, RtCounters};
use crate::atom::Value;
use crate::automation::{AutoSink, AutomationMapping};
use crate::error::{Error, Result};
use crate::graph::module::{Module, ProfileSlot, fresh_urn_uri};
use crate::graph::{AudioSettings, ConnectOutcome, Graph};
use crate::plugin::db::PluginDb;
use crate::plugin::types::{PortDirection, PortType};
use crate::protocol::{Msg, compact};
use crate::regs::Regs;
use crate::ring::{RingRx, RingTx};
use crate::state::bundle::{LoadedBundle, load_bundle, save_bundle};
use crate::state::preset::PresetStore;
use crate::urid::{Urid, UridMap};

/// How often the housekeeping steps run, in loop iterations (the loop
/// sleeps ~1 ms when idle).
const COLLECT_EVERY: u64 = 16;
const PROFILE_EVERY: u64 = 128;
const IDISP_EVERY: u64 = 8;

pub(crate) struct WorkerCtx {
    pub graph: Graph,
    pub db: Arc<dyn PluginDb>,
    pub urid: Arc<UridMap>,
    pub regs: Arc<Regs>,
    pub coll: Collector,
    pub cell: Arc<SharedCell<DspGraph>>,
    pub rx: RingRx,
    pub tx: RingTx,
    pub presets: PresetStore,
    pub shutdown: Arc<AtomicBool>,
    pub rt_profile: Arc<ProfileSlot>,
    pub rt_counters: Arc<RtCounters>,
    pub bundle_path: Option<PathBuf>,
    pub generation: u64,
}

pub(crate) fn run(mut ctx: WorkerCtx) {
    let mut scratch: Vec<u8> = Vec::with_capacity(64 * 1024);
    let mut iter = 0u64;

    while !ctx.shutdown.load(Ordering::Acquire) {
        let mut busy = false;
        loop {
            let Some(header) = ctx.rx.recv(&mut scratch) else {
                break;
            };
            busy = true;
            handle_frame(&mut ctx, header.type_urid, &scratch);
        }

        iter += 1;
        if iter % COLLECT_EVERY == 0 {
            ctx.coll.collect();
        }
        if iter % PROFILE_EVERY == 0 {
            emit_profiling(&mut ctx);
        }
        if iter % IDISP_EVERY == 0 {
            service_inline_displays(&mut ctx);
        }
        if !busy {
            std::thread::park_timeout(Duration::from_millis(1));
        }
    }

    // Final sweep so plugin instances clean up off the RT thread.
    ctx.coll.collect();
    log::info!("worker thread exits");
}

// ---------------------------------------------------------------------------
// Frame dispatch
// ---------------------------------------------------------------------------

fn handle_frame(ctx: &mut WorkerCtx, verb: Urid, body: &[u8]) {
    let payload = ctx.regs.synthpod.payload;
    let learning = ctx.regs.synthpod.learning;
    if verb == payload {
        handle_plugin_work(ctx, body);
        return;
    }
    if verb == learning {
        handle_learn_report(ctx, body);
        return;
    }
    if verb == ctx.regs.protocol.float_protocol {
        // Mirrored UI port write: keep the model cache current.
        if let Some((urn, index, value)) = compact::parse_port_float(body)
            && let Ok(module) = ctx.graph.module_mut(urn)
        {
            module.set_port_value(index, value);
        }
        return;
    }
    if verb == ctx.regs.patch.put || verb == ctx.regs.patch.patch {
        // Whole-object patches are opaque to the engine; rebuild the atom
        // object and route it into the module's patch port untouched.
        if let Err(err) = route_patch_raw(ctx, verb, body) {
            log::warn!("patch routing failed: {err}");
            reply(ctx, &Msg::ErrorReply {
                in_reply_to: verb,
                message: err.to_string(),
            });
        }
        return;
    }

    match Msg::decode(verb, body, &ctx.regs) {
        Ok(Some(msg)) => {
            if let Err(err) = handle_msg(ctx, msg) {
                log::warn!("request failed: {err}");
                reply(ctx, &Msg::ErrorReply {
                    in_reply_to: verb,
                    message: err.to_string(),
                });
            }
        }
        Ok(None) => {
            log::debug!("skipping unknown verb {verb}");
        }
        Err(err) => {
            log::warn!("malformed message on verb {verb}: {err}");
            reply(ctx, &Msg::ErrorReply {
                in_reply_to: verb,
                message: err.to_string(),
            });
        }
    }
}

fn reply(ctx: &mut WorkerCtx, msg: &Msg) {
    let (verb, body) = msg.encode(&ctx.regs);
    if !ctx.tx.send(verb, &body) {
        log::warn!("worker->rt ring full, reply dropped");
    }
}

/// Recompile the model and swap the compiled graph in.
fn swap(ctx: &mut WorkerCtx) -> Result<()> {
    ctx.generation += 1;
    let compiled = compile(
        &ctx.graph,
        &ctx.regs,
        ctx.graph.settings.period_size,
        ctx.generation,
    )?;
    ctx.cell.set(Shared::new(&ctx.coll.handle(), compiled));
    Ok(())
}

// ---------------------------------------------------------------------------
// Plugin work and learn reports
// ---------------------------------------------------------------------------

fn handle_plugin_work(ctx: &mut WorkerCtx, body: &[u8]) {
    let Some((urn, blob)) = compact::parse_work(body) else {
        return;
    };
    let Ok(module) = ctx.graph.module(urn) else {
        log::debug!("work request for vanished module {urn}");
        return;
    };
    let Some(hook) = module.hooks.worker else {
        return;
    };
    let mut responses = Vec::new();
    hook.work(blob, &mut responses);
    for resp in responses {
        let ok = ctx.tx.send_parts(
            ctx.regs.synthpod.payload,
            &[&compact::work_header(urn), &resp],
        );
        if !ok {
            log::warn!("work response dropped for module {urn}");
        }
    }
}

fn handle_learn_report(ctx: &mut WorkerCtx, body: &[u8]) {
    let Some((id, kind, channel, controller, path)) = compact::parse_learn(body) else {
        return;
    };
    let Some(mapping) = ctx.graph.automations.get_mut(id as usize) else {
        return;
    };
    mapping.learning = false;
    match kind {
        0 => {
            mapping.midi_channel = channel;
            mapping.midi_controller = controller;
        }
        _ => {
            mapping.osc_path = String::from_utf8_lossy(path).into_owned();
        }
    }
    let echo = Msg::AutoAdd(mapping.clone());
    reply(ctx, &echo);
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

fn handle_msg(ctx: &mut WorkerCtx, msg: Msg) -> Result<()> {
    match msg {
        // ── Modules ──
        Msg::ModuleAdd { plugin_uri } => {
            let urn_uri = fresh_urn_uri();
            let module = instantiate_module(ctx, urn_uri, &plugin_uri, true)?;
            let echo = Msg::ModuleAdded {
                urn: module.urn,
                urn_uri: module.urn_uri.clone(),
                plugin_uri,
            };
            let urn = module.urn;
            ctx.graph.insert_module(module);
            if let Err(err) = swap(ctx) {
                ctx.graph.remove_module(urn)?;
                return Err(err);
            }
            reply(ctx, &echo);
            Ok(())
        }
        Msg::ModuleDel { urn } => {
            ctx.graph.remove_module(urn)?;
            // The instance is destroyed once the retired graph drops its
            // reference; the collector sweep runs it off-RT.
            swap(ctx)?;
            reply(ctx, &Msg::ModuleDeleted { urn });
            Ok(())
        }
        Msg::ModuleMove { urn, x, y } => {
            ctx.graph.module_mut(urn)?.position = (x, y);
            reply(ctx, &Msg::ModuleMove { urn, x, y });
            Ok(())
        }
        Msg::ModuleVisible {
            urn,
            ui_urn,
            visible,
        } => {
            ctx.graph.module_mut(urn)?.ui_urn = if visible { ui_urn } else { 0 };
            reply(ctx, &Msg::ModuleVisible {
                urn,
                ui_urn,
                visible,
            });
            Ok(())
        }
        Msg::ModuleDisabled { urn, disabled } => {
            let module = ctx.graph.module_mut(urn)?;
            module.enabled = !disabled;
            module.rt.enabled.store(!disabled, Ordering::Release);
            reply(ctx, &Msg::ModuleDisabled { urn, disabled });
            Ok(())
        }
        Msg::ModuleAlias { urn, alias } => {
            let module = ctx.graph.module_mut(urn)?;
            module.alias = if alias.is_empty() { None } else { Some(alias.clone()) };
            reply(ctx, &Msg::ModuleAlias { urn, alias });
            Ok(())
        }
        Msg::ModulePresetLoad { urn, preset_uri } => {
            apply_preset(ctx, urn, &preset_uri)?;
            reply(ctx, &Msg::ModulePresetLoad { urn, preset_uri });
            Ok(())
        }
        Msg::ModulePresetSave { urn, label } => {
            save_preset(ctx, urn, &label)?;
            reply(ctx, &Msg::ModulePresetSave { urn, label });
            Ok(())
        }
        Msg::ModuleProfiling { urn, .. } => {
            let settings = ctx.graph.settings;
            let module = ctx.graph.module_mut(urn)?;
            let (min, avg, max) = module.profile_sample();
            reply(ctx, &Msg::ModuleProfiling {
                urn,
                min: period_load_pct(&settings, min),
                avg: period_load_pct(&settings, avg),
                max: period_load_pct(&settings, max),
            });
            Ok(())
        }
        Msg::ModuleListGet => {
            let mut echoes = Vec::new();
            for module in ctx.graph.modules.values() {
                echoes.push(Msg::ModuleAdded {
                    urn: module.urn,
                    urn_uri: module.urn_uri.clone(),
                    plugin_uri: module.spec.uri.clone(),
                });
            }
            for echo in echoes {
                reply(ctx, &echo);
            }
            Ok(())
        }
        Msg::ModuleSupportedGet => {
            for (uri, name) in ctx.db.list() {
                reply(ctx, &Msg::ModuleSupported { uri, name });
            }
            Ok(())
        }
        Msg::ModuleAdded { .. } | Msg::ModuleDeleted { .. } | Msg::ModuleSupported { .. } => {
            Ok(()) // echoes are engine->UI only
        }

        // ── Connections ──
        Msg::ConnAdd {
            source_urn,
            source_symbol,
            sink_urn,
            sink_symbol,
            gain,
        } => {
            let outcome = ctx.graph.connect(
                source_urn,
                &source_symbol,
                sink_urn,
                &sink_symbol,
                gain,
            )?;
            if let Err(err) = swap(ctx) {
                // Roll the mutation back; the previous plan stays in force.
                if outcome == ConnectOutcome::Created {
                    ctx.graph
                        .disconnect(source_urn, &source_symbol, sink_urn, &sink_symbol)?;
                }
                return Err(err);
            }
            reply(ctx, &Msg::ConnAdd {
                source_urn,
                source_symbol,
                sink_urn,
                sink_symbol,
                gain,
            });
            Ok(())
        }
        Msg::ConnRemove {
            source_urn,
            source_symbol,
            sink_urn,
            sink_symbol,
        } => {
            let removed =
                ctx.graph
                    .disconnect(source_urn, &source_symbol, sink_urn, &sink_symbol)?;
            if removed {
                swap(ctx)?;
            }
            reply(ctx, &Msg::ConnRemove {
                source_urn,
                source_symbol,
                sink_urn,
                sink_symbol,
            });
            Ok(())
        }
        Msg::NodeMove {
            source_urn,
            sink_urn,
            x,
            y,
        } => {
            ctx.graph.set_node_position(source_urn, sink_urn, x, y);
            reply(ctx, &Msg::NodeMove {
                source_urn,
                sink_urn,
                x,
                y,
            });
            Ok(())
        }
        Msg::NodeFeedback {
            source_urn,
            sink_urn,
            feedback,
        } => {
            ctx.graph.set_feedback(source_urn, sink_urn, feedback)?;
            if let Err(err) = swap(ctx) {
                ctx.graph.set_feedback(source_urn, sink_urn, !feedback)?;
                return Err(err);
            }
            reply(ctx, &Msg::NodeFeedback {
                source_urn,
                sink_urn,
                feedback,
            });
            Ok(())
        }

        // ── Subscriptions ──
        Msg::SubAdd {
            urn,
            symbol,
            protocol,
        } => {
            let port = ctx.graph.port_by_symbol(urn, &symbol)?;
            let install = compact::sub_install(urn, port.index, protocol, true);
            if !ctx.tx.send(ctx.regs.synthpod.subscription_list, &install) {
                return Err(Error::resource("worker->rt ring full"));
            }
            reply(ctx, &Msg::SubAdd {
                urn,
                symbol,
                protocol,
            });
            Ok(())
        }
        Msg::SubRemove {
            urn,
            symbol,
            protocol,
        } => {
            let port = ctx.graph.port_by_symbol(urn, &symbol)?;
            let install = compact::sub_install(urn, port.index, protocol, false);
            if !ctx.tx.send(ctx.regs.synthpod.subscription_list, &install) {
                return Err(Error::resource("worker->rt ring full"));
            }
            reply(ctx, &Msg::SubRemove {
                urn,
                symbol,
                protocol,
            });
            Ok(())
        }

        // ── Automation ──
        Msg::AutoAdd(mapping) => {
            ctx.graph.add_automation(mapping.clone())?;
            swap(ctx)?;
            reply(ctx, &Msg::AutoAdd(mapping));
            Ok(())
        }
        Msg::AutoRemove { sink } => {
            if ctx.graph.remove_automation(&sink) {
                swap(ctx)?;
            }
            reply(ctx, &Msg::AutoRemove { sink });
            Ok(())
        }

        // ── Parameters ──
        Msg::PatchSet {
            urn,
            property,
            value,
        } => {
            patch_set(ctx, urn, property, value.clone())?;
            reply(ctx, &Msg::PatchSet {
                urn,
                property,
                value,
            });
            Ok(())
        }
        Msg::PatchGet { urn, property } => {
            let module = ctx.graph.module(urn)?;
            let value = module
                .param(property)
                .map(|p| p.value.clone())
                .ok_or_else(|| Error::lookup("unknown parameter"))?;
            reply(ctx, &Msg::PatchSet {
                urn,
                property,
                value,
            });
            Ok(())
        }

        // ── Session ──
        Msg::BundleLoad { path } => {
            let loaded = load_bundle(std::path::Path::new(&path))?;
            install_bundle(ctx, loaded)?;
            ctx.bundle_path = Some(PathBuf::from(&path));
            announce_session(ctx);
            reply(ctx, &Msg::Ack {
                in_reply_to: ctx.regs.synthpod.bundle_load,
            });
            Ok(())
        }
        Msg::BundleSave { path } => {
            let states = collect_plugin_states(ctx);
            save_bundle(
                std::path::Path::new(&path),
                &ctx.graph,
                &ctx.urid,
                &states,
            )?;
            ctx.bundle_path = Some(PathBuf::from(&path));
            reply(ctx, &Msg::Ack {
                in_reply_to: ctx.regs.synthpod.bundle_save,
            });
            Ok(())
        }
        Msg::PathGet => {
            let path = ctx
                .bundle_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            reply(ctx, &Msg::PathIs { path });
            Ok(())
        }
        Msg::Quit => {
            ctx.shutdown.store(true, Ordering::Release);
            Ok(())
        }
        Msg::CpusUsed { count } => {
            ctx.graph.settings.cpus_used =
                count.min(ctx.graph.settings.cpus_available).max(1);
            swap(ctx)?;
            reply(ctx, &Msg::CpusUsed {
                count: ctx.graph.settings.cpus_used,
            });
            Ok(())
        }
        Msg::CpusAvailable { .. } => {
            reply(ctx, &Msg::CpusAvailable {
                count: ctx.graph.settings.cpus_available,
            });
            Ok(())
        }
        Msg::PeriodSize { .. } => {
            reply(ctx, &Msg::PeriodSize {
                frames: ctx.graph.settings.period_size,
            });
            Ok(())
        }
        Msg::SampleRate { .. } => {
            reply(ctx, &Msg::SampleRate {
                rate: ctx.graph.settings.sample_rate,
            });
            Ok(())
        }
        Msg::GridCols { count } => {
            ctx.graph.flags.grid_cols = count;
            reply(ctx, &Msg::GridCols { count });
            Ok(())
        }
        Msg::GridRows { count } => {
            ctx.graph.flags.grid_rows = count;
            reply(ctx, &Msg::GridRows { count });
            Ok(())
        }
        Msg::PaneLeft { fraction } => {
            ctx.graph.flags.pane_left = fraction;
            reply(ctx, &Msg::PaneLeft { fraction });
            Ok(())
        }
        Msg::PathIs { .. }
        | Msg::DspProfiling { .. }
        | Msg::Ack { .. }
        | Msg::ErrorReply { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Module helpers
// ---------------------------------------------------------------------------

/// Instantiate a module, retrying once on transient resource errors.
fn instantiate_module(
    ctx: &mut WorkerCtx,
    urn_uri: String,
    plugin_uri: &str,
    retry: bool,
) -> Result<Module> {
    let spec = ctx
        .db
        .describe(plugin_uri)
        .ok_or_else(|| Error::lookup(format!("unknown plugin {plugin_uri}")))?;
    if !spec.supported {
        return Err(Error::plugin(format!(
            "{plugin_uri} requires features the engine does not provide"
        )));
    }
    let settings = ctx.graph.settings;
    let result = Module::new(
        urn_uri.clone(),
        spec.clone(),
        settings.sample_rate as f64,
        settings.period_size,
        crate::graph::port::DEFAULT_ATOM_CAPACITY as u32,
        &ctx.urid,
        &ctx.regs,
        &ctx.coll.handle(),
    );
    let mut module = match result {
        Ok(m) => m,
        Err(err) if retry && err.is_transient() => {
            log::warn!("retrying plugin load for {plugin_uri}: {err}");
            return instantiate_module(ctx, urn_uri, plugin_uri, false);
        }
        Err(err) => return Err(err),
    };
    module.presets = ctx.presets.list(plugin_uri);
    Ok(module)
}

fn apply_preset(ctx: &mut WorkerCtx, urn: Urid, preset_uri: &str) -> Result<()> {
    let data = ctx.presets.load(preset_uri, &ctx.urid)?;
    let module = ctx.graph.module_mut(urn)?;
    if data.plugin_uri != module.spec.uri {
        return Err(Error::constraint(format!(
            "preset is for {}, module hosts {}",
            data.plugin_uri, module.spec.uri
        )));
    }

    // Port values: model cache plus live writes through the RT thread.
    let mut writes = Vec::new();
    for (symbol, value) in &data.port_values {
        if let Some(port) = module.spec.port_by_symbol(symbol) {
            let index = port.index;
            if let Some(applied) = module.set_port_value(index, *value) {
                writes.push((index, applied));
            }
        }
    }
    for (index, value) in writes {
        let frame = compact::port_float(urn, index, value);
        if !ctx.tx.send(ctx.regs.protocol.float_protocol, &frame) {
            return Err(Error::resource("worker->rt ring full"));
        }
    }

    // Opaque plugin state, all-or-nothing: a module that fails to restore
    // is torn down rather than left half-initialised.
    let module = ctx.graph.module(urn)?;
    if !data.state.is_empty()
        && let Some(hook) = module.hooks.state
        && !hook.restore(&data.state)
    {
        ctx.graph.remove_module(urn)?;
        swap(ctx)?;
        reply(ctx, &Msg::ModuleDeleted { urn });
        return Err(Error::plugin("state restore failed, module removed"));
    }
    Ok(())
}

fn save_preset(ctx: &mut WorkerCtx, urn: Urid, label: &str) -> Result<()> {
    let module = ctx.graph.module(urn)?;
    let mut port_values = Vec::new();
    for port in &module.spec.ports {
        if port.ty == PortType::Control
            && port.direction == PortDirection::Input
            && let Some(v) = module.get_port_value(port.index)
        {
            port_values.push((port.symbol.clone(), v));
        }
    }
    let state = module
        .hooks
        .state
        .map(|hook| hook.save())
        .unwrap_or_default();
    let plugin_uri = module.spec.uri.clone();
    ctx.presets
        .save(&plugin_uri, label, &port_values, &state, &ctx.urid)?;
    let presets = ctx.presets.list(&plugin_uri);
    ctx.graph.module_mut(urn)?.presets = presets;
    Ok(())
}

fn patch_set(ctx: &mut WorkerCtx, urn: Urid, property: Urid, value: Value) -> Result<()> {
    let regs = ctx.regs.clone();
    let module = ctx.graph.module_mut(urn)?;

    // Cache the value; unknown properties on modules that declare params
    // are protocol errors, otherwise the write is forwarded untyped.
    if let Some(param) = module.param_mut(property) {
        if param.spec.is_readonly {
            return Err(Error::constraint("parameter is read-only"));
        }
        param.value = value.clone();
    } else if !module.spec.params.is_empty() {
        return Err(Error::protocol("unknown property on write"));
    }

    // Route a patch:Set object into the module's patch-capable port.
    let Some(port_index) = patch_port_index(module) else {
        return Ok(()); // no patch port; the cached value is all there is
    };

    let obj = crate::atom::ObjWriter::new(regs.atom.object, regs.patch.set)
        .property(
            regs.patch.property,
            regs.atom.urid,
            &property.to_ne_bytes(),
        )
        .value(regs.patch.value, &value, &regs.atom)
        .finish();
    let ok = ctx.tx.send_parts(
        regs.protocol.event_transfer,
        &[&compact::port_event_header(urn, port_index), &obj],
    );
    if !ok {
        return Err(Error::resource("worker->rt ring full"));
    }
    Ok(())
}

/// First patch-capable event input of a module's spec.
fn patch_port_index(module: &Module) -> Option<u32> {
    module
        .spec
        .ports
        .iter()
        .find(|p| {
            p.ty == PortType::Atom
                && p.direction == PortDirection::Input
                && p.atom_kinds
                    .intersects(crate::plugin::types::AtomKinds::PATCH)
        })
        .map(|p| p.index)
}

/// Rebuild a patch:Put / patch:Patch request as an atom object and inject
/// it into the target module's patch port.
fn route_patch_raw(ctx: &mut WorkerCtx, verb: Urid, body: &[u8]) -> Result<()> {
    let regs = ctx.regs.clone();
    let r = crate::protocol::PropReader::new(body);
    let urn = r
        .urid(regs.patch.subject)
        .ok_or_else(|| Error::protocol("patch without subject"))?;
    let module = ctx.graph.module(urn)?;
    let Some(port_index) = patch_port_index(module) else {
        return Err(Error::lookup("module has no patch-capable port"));
    };

    let mut obj = crate::atom::ObjWriter::new(regs.atom.object, verb);
    for prop in r.iter() {
        if prop.key != regs.patch.subject {
            obj = obj.property(prop.key, prop.type_urid, prop.body);
        }
    }
    let obj = obj.finish();
    let ok = ctx.tx.send_parts(
        regs.protocol.event_transfer,
        &[&compact::port_event_header(urn, port_index), &obj],
    );
    if !ok {
        return Err(Error::resource("worker->rt ring full"));
    }
    reply(ctx, &Msg::Ack { in_reply_to: verb });
    Ok(())
}

// ---------------------------------------------------------------------------
// Session install
// ---------------------------------------------------------------------------

fn collect_plugin_states(ctx: &WorkerCtx) -> HashMap<Urid, Vec<crate::plugin::host::StateProp>> {
    let mut states = HashMap::new();
    for module in ctx.graph.modules.values() {
        if let Some(hook) = module.hooks.state {
            states.insert(module.urn, hook.save());
        }
    }
    states
}

/// Build a fresh graph from a loaded bundle and hand it over atomically.
/// Modules are instantiated in declaration order; per-port values and
/// plugin state apply before the swap, while RT cannot yet see them.
pub(crate) fn install_bundle(ctx: &mut WorkerCtx, loaded: LoadedBundle) -> Result<()> {
    let mut settings = ctx.graph.settings;
    settings.cpus_used = loaded.settings.cpus_used.min(settings.cpus_available);
    let mut graph = Graph::new(settings);
    graph.canvas = loaded.canvas;
    graph.flags = loaded.flags;

    for lm in &loaded.modules {
        let mut module = instantiate_module(ctx, lm.urn_uri.clone(), &lm.plugin_uri, true)?;
        module.position = lm.position;
        module.alias = lm.alias.clone();
        module.enabled = !lm.disabled;
        module.rt.enabled.store(!lm.disabled, Ordering::Release);
        if let Some(ui) = &lm.ui_uri {
            module.ui_urn = ctx.urid.map(ui);
        }

        // Control values straight into the not-yet-visible buffers.
        {
            let mut dsp = module.rt.dsp.borrow_mut();
            for (symbol, value) in &lm.port_values {
                if let Some(port) = module.spec.port_by_symbol(symbol) {
                    dsp.set_control(port.index, *value);
                }
            }
        }
        for (symbol, value) in &lm.port_values {
            let index = module.spec.port_by_symbol(symbol).map(|p| p.index);
            if let Some(index) = index {
                module.set_port_value(index, *value);
            }
        }

        // Plugin state, strict all-or-nothing per module.
        if !lm.state.is_empty() {
            let props: Vec<_> = lm
                .state
                .iter()
                .map(|(key, ty, flags, value)| crate::plugin::host::StateProp {
                    key: ctx.urid.map(key),
                    type_urid: ctx.urid.map(ty),
                    flags: *flags,
                    value: value.clone(),
                })
                .collect();
            match module.hooks.state {
                Some(hook) if !hook.restore(&props) => {
                    return Err(Error::plugin(format!(
                        "state restore failed for {}",
                        lm.plugin_uri
                    )));
                }
                _ => {}
            }
        }

        if module.is_system_source() {
            graph.source_urn = module.urn;
        } else if module.is_system_sink() {
            graph.sink_urn = module.urn;
        }
        graph.insert_module(module);
    }

    if graph.source_urn == 0 || graph.sink_urn == 0 {
        return Err(Error::constraint(
            "bundle lacks the system source/sink modules",
        ));
    }

    for conn in &loaded.conns {
        let source_urn = ctx.urid.map(&conn.source_urn_uri);
        let sink_urn = ctx.urid.map(&conn.sink_urn_uri);
        graph.connect(
            source_urn,
            &conn.source_symbol,
            sink_urn,
            &conn.sink_symbol,
            conn.gain,
        )?;
    }
    for node in &loaded.nodes {
        let source_urn = ctx.urid.map(&node.source_urn_uri);
        let sink_urn = ctx.urid.map(&node.sink_urn_uri);
        graph.set_node_position(source_urn, sink_urn, node.position.0, node.position.1);
        if node.feedback {
            graph.set_feedback(source_urn, sink_urn, true)?;
        }
    }
    for auto in &loaded.automations {
        let urn = ctx.urid.map(&auto.sink_urn_uri);
        let sink = match (&auto.sink_symbol, &auto.sink_property_uri) {
            (Some(symbol), _) => AutoSink::Port {
                urn,
                symbol: symbol.clone(),
            },
            (None, Some(prop)) => AutoSink::Param {
                urn,
                property: ctx.urid.map(prop),
                range: auto
                    .sink_range_uri
                    .as_ref()
                    .map(|r| ctx.urid.map(r))
                    .unwrap_or(ctx.regs.atom.float),
            },
            (None, None) => continue,
        };
        graph.add_automation(AutomationMapping {
            kind: auto.kind,
            sink,
            source_range: auto.source_range,
            sink_range: auto.sink_range,
            src_enabled: auto.src_enabled,
            snk_enabled: auto.snk_enabled,
            learning: false,
            midi_channel: auto.midi_channel,
            midi_controller: auto.midi_controller,
            osc_path: auto.osc_path.clone(),
        })?;
    }

    // Swap the whole session in one handover; the old graph (and its
    // modules) retire through the collector.
    let old = std::mem::replace(&mut ctx.graph, graph);
    if let Err(err) = swap(ctx) {
        ctx.graph = old;
        return Err(err);
    }
    drop(old);
    Ok(())
}

/// After a bundle load, replay the session to the UI as echoes.
fn announce_session(ctx: &mut WorkerCtx) {
    let mut echoes: Vec<Msg> = Vec::new();
    for module in ctx.graph.modules.values() {
        echoes.push(Msg::ModuleAdded {
            urn: module.urn,
            urn_uri: module.urn_uri.clone(),
            plugin_uri: module.spec.uri.clone(),
        });
        echoes.push(Msg::ModuleMove {
            urn: module.urn,
            x: module.position.0,
            y: module.position.1,
        });
    }
    for mc in &ctx.graph.mod_conns {
        let (Ok(src), Ok(snk)) = (ctx.graph.module(mc.source_urn), ctx.graph.module(mc.sink_urn))
        else {
            continue;
        };
        for c in &mc.conns {
            let (Some(sp), Some(kp)) = (
                src.spec.port_by_index(c.source.index),
                snk.spec.port_by_index(c.sink.index),
            ) else {
                continue;
            };
            echoes.push(Msg::ConnAdd {
                source_urn: mc.source_urn,
                source_symbol: sp.symbol.clone(),
                sink_urn: mc.sink_urn,
                sink_symbol: kp.symbol.clone(),
                gain: c.gain,
            });
        }
    }
    for mapping in &ctx.graph.automations {
        echoes.push(Msg::AutoAdd(mapping.clone()));
    }
    for echo in echoes {
        reply(ctx, &echo);
    }
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

/// One timing value as percent of the period budget; every profiling
/// message on the wire uses this unit.
fn period_load_pct(settings: &AudioSettings, ns: u64) -> f32 {
    let budget_ns =
        (settings.period_size as f64 / settings.sample_rate.max(1) as f64) * 1_000_000_000.0;
    (ns as f64 / budget_ns * 100.0) as f32
}

fn emit_profiling(ctx: &mut WorkerCtx) {
    let settings = ctx.graph.settings;
    let pct = |ns: u64| period_load_pct(&settings, ns);

    let urns: Vec<Urid> = ctx.graph.modules.keys().copied().collect();
    for urn in urns {
        let Ok(module) = ctx.graph.module_mut(urn) else {
            continue;
        };
        let (min, avg, max) = module.profile_sample();
        if avg == 0 {
            continue;
        }
        reply(ctx, &Msg::ModuleProfiling {
            urn,
            min: pct(min),
            avg: pct(avg),
            max: pct(max),
        });
    }

    let (min, avg, max) = ctx.rt_profile.snapshot();
    if avg > 0 {
        reply(ctx, &Msg::DspProfiling {
            min: pct(min),
            avg: pct(avg),
            max: pct(max),
        });
    }
    let drops = ctx.rt_counters.ring_full.load(Ordering::Relaxed);
    if drops > 0 {
        log::debug!("rt rings dropped {drops} messages so far");
    }
}

fn service_inline_displays(ctx: &mut WorkerCtx) {
    let urns: Vec<Urid> = ctx.graph.modules.keys().copied().collect();
    for urn in urns {
        let Ok(module) = ctx.graph.module_mut(urn) else {
            continue;
        };
        let Some(hook) = module.hooks.idisp else {
            continue;
        };
        if !hook.take_queued() {
            continue;
        }
        if let Some(surface) = hook.render(256, 64) {
            module.display = Some(surface);
        }
    }
}
