//! Session bundles.
//!
//! Layout of `<name>.synthpod/`:
//! ```text
//! manifest.ttl          bundle declaration
//! state.ttl             graph: modules, port values, connections,
//!                       matrix nodes, automation, UI flags, audio settings
//! <uuid>.ttl            one per module with opaque plugin state
//! ```
//!
//! Saving writes into a temp sibling directory first and renames it over
//! the target, so a crashed save never corrupts an existing session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::turtle::{self, Obj, Term, Writer};
use super::{PARAM, PATCH, PSET, RDFS, XSD, from_hex, spod, to_hex, xsd};
use crate::automation::AutoKind;
use crate::error::{Error, Result};
use crate::graph::{AudioSettings, Graph, UiFlags};
use crate::plugin::host::StateProp;
use crate::urid::{Urid, UridMap};

// ---------------------------------------------------------------------------
// Loaded representation (URIs, not URIDs - resolved at install time)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct LoadedModule {
    pub urn_uri: String,
    pub plugin_uri: String,
    pub position: (f32, f32),
    pub alias: Option<String>,
    pub disabled: bool,
    pub ui_uri: Option<String>,
    pub port_values: Vec<(String, f32)>,
    /// (key URI, type URI, flags, value bytes)
    pub state: Vec<(String, String, u32, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub struct LoadedConn {
    pub source_urn_uri: String,
    pub source_symbol: String,
    pub sink_urn_uri: String,
    pub sink_symbol: String,
    pub gain: f32,
}

#[derive(Debug, Clone)]
pub struct LoadedNode {
    pub source_urn_uri: String,
    pub sink_urn_uri: String,
    pub position: (f32, f32),
    pub feedback: bool,
}

#[derive(Debug, Clone)]
pub struct LoadedAutomation {
    pub kind: AutoKind,
    pub sink_urn_uri: String,
    pub sink_symbol: Option<String>,
    pub sink_property_uri: Option<String>,
    pub sink_range_uri: Option<String>,
    pub source_range: (f64, f64),
    pub sink_range: (f64, f64),
    pub src_enabled: bool,
    pub snk_enabled: bool,
    pub midi_channel: i32,
    pub midi_controller: i32,
    pub osc_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadedBundle {
    /// Modules in declaration order.
    pub modules: Vec<LoadedModule>,
    pub conns: Vec<LoadedConn>,
    pub nodes: Vec<LoadedNode>,
    pub automations: Vec<LoadedAutomation>,
    pub canvas: (f32, f32),
    pub flags: UiFlags,
    pub settings: AudioSettings,
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

fn state_file_name(urn_uri: &str) -> String {
    let tail = urn_uri.rsplit(':').next().unwrap_or(urn_uri);
    format!("{tail}.ttl")
}

/// Serialise the whole session into `path` (a `.synthpod` directory).
/// `states` carries each module's plugin state as emitted on the worker.
pub fn save_bundle(
    path: &Path,
    graph: &Graph,
    urid: &Arc<UridMap>,
    states: &HashMap<Urid, Vec<StateProp>>,
) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session.synthpod".into())
    ));
    if tmp.exists() {
        std::fs::remove_dir_all(&tmp)?;
    }
    std::fs::create_dir_all(&tmp)?;

    write_manifest(&tmp)?;
    write_state_ttl(&tmp, graph, urid)?;
    for module in graph.modules.values() {
        let state = states.get(&module.urn).map(Vec::as_slice).unwrap_or(&[]);
        write_module_state(&tmp, &module.urn_uri, state, urid)?;
    }

    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    std::fs::rename(&tmp, path)?;
    log::info!("session saved to {}", path.display());
    Ok(())
}

fn write_manifest(dir: &Path) -> Result<()> {
    let mut w = Writer::new().prefix("spod", super::SPOD).prefix("rdfs", RDFS);
    w.subject(&Term::iri("state.ttl"))
        .type_(&spod("graph"))
        .prop(&format!("{RDFS}seeAlso"), Obj::iri("state.ttl"))
        .end();
    std::fs::write(dir.join("manifest.ttl"), w.finish())?;
    Ok(())
}

fn write_state_ttl(dir: &Path, graph: &Graph, urid: &Arc<UridMap>) -> Result<()> {
    let mut w = Writer::new()
        .prefix("spod", super::SPOD)
        .prefix("lv2", super::LV2)
        .prefix("pset", PSET)
        .prefix("param", PARAM)
        .prefix("patch", PATCH)
        .prefix("rdfs", RDFS)
        .prefix("xsd", XSD);

    // The bundle subject.
    {
        let mut root = w.subject(&Term::iri("")).type_(&spod("graph"));
        let mut urns: Vec<_> = graph.modules.keys().copied().collect();
        urns.sort_unstable();
        for urn in &urns {
            let module = &graph.modules[urn];
            root = root.prop(&spod("moduleList"), Obj::iri(module.urn_uri.clone()));
        }

        for mc in &graph.mod_conns {
            let (Some(src), Some(snk)) = (
                graph.modules.get(&mc.source_urn),
                graph.modules.get(&mc.sink_urn),
            ) else {
                continue;
            };
            for c in &mc.conns {
                let (Some(src_port), Some(snk_port)) = (
                    src.spec.port_by_index(c.source.index),
                    snk.spec.port_by_index(c.sink.index),
                ) else {
                    continue;
                };
                root = root.prop(
                    &spod("connectionList"),
                    Obj::node(vec![
                        (spod("sourceModule"), Obj::iri(src.urn_uri.clone())),
                        (spod("sourceSymbol"), Obj::plain(src_port.symbol.clone())),
                        (spod("sinkModule"), Obj::iri(snk.urn_uri.clone())),
                        (spod("sinkSymbol"), Obj::plain(snk_port.symbol.clone())),
                        (
                            format!("{PARAM}gain"),
                            Obj::typed(format!("{}", c.gain), xsd("float")),
                        ),
                    ]),
                );
            }
            root = root.prop(
                &spod("nodeList"),
                Obj::node(vec![
                    (spod("sourceModule"), Obj::iri(src.urn_uri.clone())),
                    (spod("sinkModule"), Obj::iri(snk.urn_uri.clone())),
                    (
                        spod("nodePositionX"),
                        Obj::typed(format!("{}", mc.position.0), xsd("float")),
                    ),
                    (
                        spod("nodePositionY"),
                        Obj::typed(format!("{}", mc.position.1), xsd("float")),
                    ),
                    (
                        spod("feedback"),
                        Obj::typed(format!("{}", mc.feedback), xsd("boolean")),
                    ),
                ]),
            );
        }

        for auto in &graph.automations {
            let Some(sink_mod) = graph.modules.get(&auto.sink.urn()) else {
                continue;
            };
            let type_iri = match auto.kind {
                AutoKind::Midi => spod("MIDIAutomation"),
                AutoKind::Osc => spod("OSCAutomation"),
            };
            let mut props = vec![
                (
                    "http://www.w3.org/1999/02/22-rdf-syntax-ns#type".to_string(),
                    Obj::iri(type_iri),
                ),
                (spod("sinkModule"), Obj::iri(sink_mod.urn_uri.clone())),
                (
                    spod("sourceMinimum"),
                    Obj::typed(format!("{}", auto.source_range.0), xsd("double")),
                ),
                (
                    spod("sourceMaximum"),
                    Obj::typed(format!("{}", auto.source_range.1), xsd("double")),
                ),
                (
                    spod("sinkMinimum"),
                    Obj::typed(format!("{}", auto.sink_range.0), xsd("double")),
                ),
                (
                    spod("sinkMaximum"),
                    Obj::typed(format!("{}", auto.sink_range.1), xsd("double")),
                ),
                (
                    spod("sourceEnabled"),
                    Obj::typed(format!("{}", auto.src_enabled), xsd("boolean")),
                ),
                (
                    spod("sinkEnabled"),
                    Obj::typed(format!("{}", auto.snk_enabled), xsd("boolean")),
                ),
            ];
            match &auto.sink {
                crate::automation::AutoSink::Port { symbol, .. } => {
                    props.push((spod("sinkSymbol"), Obj::plain(symbol.clone())));
                }
                crate::automation::AutoSink::Param {
                    property, range, ..
                } => {
                    if let Some(iri) = urid.unmap(*property) {
                        props.push((format!("{PATCH}property"), Obj::iri(iri)));
                    }
                    if let Some(iri) = urid.unmap(*range) {
                        props.push((format!("{RDFS}range"), Obj::iri(iri)));
                    }
                }
            }
            match auto.kind {
                AutoKind::Midi => {
                    props.push((
                        spod("midiChannel"),
                        Obj::typed(format!("{}", auto.midi_channel), xsd("int")),
                    ));
                    props.push((
                        spod("midiController"),
                        Obj::typed(format!("{}", auto.midi_controller), xsd("int")),
                    ));
                }
                AutoKind::Osc => {
                    props.push((spod("OSCPath"), Obj::plain(auto.osc_path.clone())));
                }
            }
            root = root.prop(&spod("automationList"), Obj::node(props));
        }

        // Canvas, UI flags, audio settings.
        root = root
            .prop(
                &spod("canvasPositionX"),
                Obj::typed(format!("{}", graph.canvas.0), xsd("float")),
            )
            .prop(
                &spod("canvasPositionY"),
                Obj::typed(format!("{}", graph.canvas.1), xsd("float")),
            )
            .prop(
                &spod("sidebarVisible"),
                Obj::typed(format!("{}", graph.flags.sidebar_visible), xsd("boolean")),
            )
            .prop(
                &spod("bottombarVisible"),
                Obj::typed(
                    format!("{}", graph.flags.bottombar_visible),
                    xsd("boolean"),
                ),
            )
            .prop(
                &spod("gridCols"),
                Obj::typed(format!("{}", graph.flags.grid_cols), xsd("int")),
            )
            .prop(
                &spod("gridRows"),
                Obj::typed(format!("{}", graph.flags.grid_rows), xsd("int")),
            )
            .prop(
                &spod("paneLeft"),
                Obj::typed(format!("{}", graph.flags.pane_left), xsd("float")),
            )
            .prop(
                &spod("sampleRate"),
                Obj::typed(format!("{}", graph.settings.sample_rate), xsd("int")),
            )
            .prop(
                &spod("periodSize"),
                Obj::typed(format!("{}", graph.settings.period_size), xsd("int")),
            )
            .prop(
                &spod("numPeriods"),
                Obj::typed(format!("{}", graph.settings.num_periods), xsd("int")),
            )
            .prop(
                &spod("CPUsUsed"),
                Obj::typed(format!("{}", graph.settings.cpus_used), xsd("int")),
            );
        root.end();
    }

    // One subject per module.
    let mut urns: Vec<_> = graph.modules.keys().copied().collect();
    urns.sort_unstable();
    for urn in urns {
        let module = &graph.modules[&urn];
        let mut subj = w
            .subject(&Term::iri(module.urn_uri.clone()))
            .prop(&spod("plugin"), Obj::iri(module.spec.uri.clone()))
            .prop(
                &spod("modulePositionX"),
                Obj::typed(format!("{}", module.position.0), xsd("float")),
            )
            .prop(
                &spod("modulePositionY"),
                Obj::typed(format!("{}", module.position.1), xsd("float")),
            )
            .prop(
                &spod("moduleDisabled"),
                Obj::typed(format!("{}", !module.enabled), xsd("boolean")),
            );
        if let Some(alias) = &module.alias {
            subj = subj.prop(&spod("moduleAlias"), Obj::plain(alias.clone()));
        }
        if module.ui_urn != 0
            && let Some(ui_uri) = urid.unmap(module.ui_urn)
        {
            subj = subj.prop(&spod("moduleUI"), Obj::iri(ui_uri));
        }
        // Non-default control values only.
        for port in &module.spec.ports {
            let Some(value) = module.control_values.get(&port.index).copied() else {
                continue;
            };
            if value == port.default {
                continue;
            }
            subj = subj.prop(
                &format!("{}port", super::LV2),
                Obj::node(vec![
                    (format!("{}symbol", super::LV2), Obj::plain(port.symbol.clone())),
                    (
                        format!("{PSET}value"),
                        Obj::typed(format!("{value}"), xsd("float")),
                    ),
                ]),
            );
        }
        subj.end();
    }

    std::fs::write(dir.join("state.ttl"), w.finish())?;
    Ok(())
}

fn write_module_state(
    dir: &Path,
    urn_uri: &str,
    state: &[StateProp],
    urid: &Arc<UridMap>,
) -> Result<()> {
    let mut w = Writer::new().prefix("spod", super::SPOD).prefix("xsd", XSD);
    let mut subj = w.subject(&Term::iri(urn_uri.to_string()));
    let mut any = false;
    for prop in state {
        let Some(key_uri) = urid.unmap(prop.key) else {
            continue;
        };
        let type_uri = urid.unmap(prop.type_urid).unwrap_or_default();
        subj = subj.prop(
            &spod("stateProperty"),
            Obj::node(vec![
                (spod("stateKey"), Obj::iri(key_uri)),
                (spod("stateType"), Obj::iri(type_uri)),
                (
                    spod("stateFlags"),
                    Obj::typed(format!("{}", prop.flags), xsd("int")),
                ),
                (
                    spod("stateValue"),
                    Obj::typed(to_hex(&prop.value), xsd("hexBinary")),
                ),
            ]),
        );
        any = true;
    }
    if any {
        subj.end();
        std::fs::write(dir.join(state_file_name(urn_uri)), w.finish())?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read a bundle directory back into its loaded representation.
pub fn load_bundle(path: &Path) -> Result<LoadedBundle> {
    if !path.join("manifest.ttl").is_file() {
        return Err(Error::resource(format!(
            "{}: not a session bundle (no manifest.ttl)",
            path.display()
        )));
    }
    let text = std::fs::read_to_string(path.join("state.ttl"))
        .map_err(|e| Error::resource(format!("{}: {e}", path.display())))?;
    let doc = turtle::parse(&text)?;
    let root = Term::iri("");

    let mut out = LoadedBundle::default();

    for urn_term in doc.objects(&root, &spod("moduleList")) {
        let Some(urn_uri) = urn_term.as_iri() else {
            continue;
        };
        let subject = Term::iri(urn_uri);
        let mut module = LoadedModule {
            urn_uri: urn_uri.to_string(),
            plugin_uri: doc
                .object(&subject, &spod("plugin"))
                .and_then(|t| t.as_iri())
                .ok_or_else(|| Error::protocol(format!("module {urn_uri} without spod:plugin")))?
                .to_string(),
            position: (
                doc.object(&subject, &spod("modulePositionX"))
                    .and_then(|t| t.as_f32())
                    .unwrap_or(0.0),
                doc.object(&subject, &spod("modulePositionY"))
                    .and_then(|t| t.as_f32())
                    .unwrap_or(0.0),
            ),
            alias: doc
                .object(&subject, &spod("moduleAlias"))
                .and_then(|t| t.as_str())
                .map(String::from),
            disabled: doc
                .object(&subject, &spod("moduleDisabled"))
                .and_then(|t| t.as_bool())
                .unwrap_or(false),
            ui_uri: doc
                .object(&subject, &spod("moduleUI"))
                .and_then(|t| t.as_iri())
                .map(String::from),
            ..Default::default()
        };

        for port in doc.objects(&subject, &format!("{}port", super::LV2)) {
            let symbol = doc
                .object(port, &format!("{}symbol", super::LV2))
                .and_then(|t| t.as_str());
            let value = doc
                .object(port, &format!("{PSET}value"))
                .and_then(|t| t.as_f32());
            if let (Some(symbol), Some(value)) = (symbol, value) {
                module.port_values.push((symbol.to_string(), value));
            }
        }

        // Per-module plugin state file, if present.
        let state_path = path.join(state_file_name(urn_uri));
        if state_path.is_file() {
            let state_text = std::fs::read_to_string(&state_path)?;
            let state_doc = turtle::parse(&state_text)?;
            for node in state_doc.objects(&subject, &spod("stateProperty")) {
                let key = state_doc
                    .object(node, &spod("stateKey"))
                    .and_then(|t| t.as_iri());
                let type_uri = state_doc
                    .object(node, &spod("stateType"))
                    .and_then(|t| t.as_iri())
                    .unwrap_or_default();
                let flags = state_doc
                    .object(node, &spod("stateFlags"))
                    .and_then(|t| t.as_i32())
                    .unwrap_or(0) as u32;
                let value = state_doc
                    .object(node, &spod("stateValue"))
                    .and_then(|t| t.as_str())
                    .and_then(from_hex);
                if let (Some(key), Some(value)) = (key, value) {
                    module
                        .state
                        .push((key.to_string(), type_uri.to_string(), flags, value));
                }
            }
        }

        out.modules.push(module);
    }

    for node in doc.objects(&root, &spod("connectionList")) {
        let get_iri = |p: &str| doc.object(node, p).and_then(|t| t.as_iri());
        let get_str = |p: &str| doc.object(node, p).and_then(|t| t.as_str());
        let (Some(sm), Some(ss), Some(km), Some(ks)) = (
            get_iri(&spod("sourceModule")),
            get_str(&spod("sourceSymbol")),
            get_iri(&spod("sinkModule")),
            get_str(&spod("sinkSymbol")),
        ) else {
            continue;
        };
        out.conns.push(LoadedConn {
            source_urn_uri: sm.to_string(),
            source_symbol: ss.to_string(),
            sink_urn_uri: km.to_string(),
            sink_symbol: ks.to_string(),
            gain: doc
                .object(node, &format!("{PARAM}gain"))
                .and_then(|t| t.as_f32())
                .unwrap_or(1.0),
        });
    }

    for node in doc.objects(&root, &spod("nodeList")) {
        let get_iri = |p: &str| doc.object(node, p).and_then(|t| t.as_iri());
        let (Some(sm), Some(km)) = (get_iri(&spod("sourceModule")), get_iri(&spod("sinkModule")))
        else {
            continue;
        };
        out.nodes.push(LoadedNode {
            source_urn_uri: sm.to_string(),
            sink_urn_uri: km.to_string(),
            position: (
                doc.object(node, &spod("nodePositionX"))
                    .and_then(|t| t.as_f32())
                    .unwrap_or(0.0),
                doc.object(node, &spod("nodePositionY"))
                    .and_then(|t| t.as_f32())
                    .unwrap_or(0.0),
            ),
            feedback: doc
                .object(node, &spod("feedback"))
                .and_then(|t| t.as_bool())
                .unwrap_or(false),
        });
    }

    for node in doc.objects(&root, &spod("automationList")) {
        let kind = match doc
            .object(node, "http://www.w3.org/1999/02/22-rdf-syntax-ns#type")
            .and_then(|t| t.as_iri())
        {
            Some(t) if t == spod("OSCAutomation") => AutoKind::Osc,
            _ => AutoKind::Midi,
        };
        let Some(sink_urn_uri) = doc
            .object(node, &spod("sinkModule"))
            .and_then(|t| t.as_iri())
        else {
            continue;
        };
        out.automations.push(LoadedAutomation {
            kind,
            sink_urn_uri: sink_urn_uri.to_string(),
            sink_symbol: doc
                .object(node, &spod("sinkSymbol"))
                .and_then(|t| t.as_str())
                .map(String::from),
            sink_property_uri: doc
                .object(node, &format!("{PATCH}property"))
                .and_then(|t| t.as_iri())
                .map(String::from),
            sink_range_uri: doc
                .object(node, &format!("{RDFS}range"))
                .and_then(|t| t.as_iri())
                .map(String::from),
            source_range: (
                doc.object(node, &spod("sourceMinimum"))
                    .and_then(|t| t.as_f64())
                    .unwrap_or(0.0),
                doc.object(node, &spod("sourceMaximum"))
                    .and_then(|t| t.as_f64())
                    .unwrap_or(127.0),
            ),
            sink_range: (
                doc.object(node, &spod("sinkMinimum"))
                    .and_then(|t| t.as_f64())
                    .unwrap_or(0.0),
                doc.object(node, &spod("sinkMaximum"))
                    .and_then(|t| t.as_f64())
                    .unwrap_or(1.0),
            ),
            src_enabled: doc
                .object(node, &spod("sourceEnabled"))
                .and_then(|t| t.as_bool())
                .unwrap_or(false),
            snk_enabled: doc
                .object(node, &spod("sinkEnabled"))
                .and_then(|t| t.as_bool())
                .unwrap_or(true),
            midi_channel: doc
                .object(node, &spod("midiChannel"))
                .and_then(|t| t.as_i32())
                .unwrap_or(-1),
            midi_controller: doc
                .object(node, &spod("midiController"))
                .and_then(|t| t.as_i32())
                .unwrap_or(-1),
            osc_path: doc
                .object(node, &spod("OSCPath"))
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
        });
    }

    out.canvas = (
        doc.object(&root, &spod("canvasPositionX"))
            .and_then(|t| t.as_f32())
            .unwrap_or(0.0),
        doc.object(&root, &spod("canvasPositionY"))
            .and_then(|t| t.as_f32())
            .unwrap_or(0.0),
    );
    let defaults = UiFlags::default();
    out.flags = UiFlags {
        sidebar_visible: doc
            .object(&root, &spod("sidebarVisible"))
            .and_then(|t| t.as_bool())
            .unwrap_or(defaults.sidebar_visible),
        bottombar_visible: doc
            .object(&root, &spod("bottombarVisible"))
            .and_then(|t| t.as_bool())
            .unwrap_or(defaults.bottombar_visible),
        grid_cols: doc
            .object(&root, &spod("gridCols"))
            .and_then(|t| t.as_i32())
            .unwrap_or(defaults.grid_cols),
        grid_rows: doc
            .object(&root, &spod("gridRows"))
            .and_then(|t| t.as_i32())
            .unwrap_or(defaults.grid_rows),
        pane_left: doc
            .object(&root, &spod("paneLeft"))
            .and_then(|t| t.as_f32())
            .unwrap_or(defaults.pane_left),
    };
    let sd = AudioSettings::default();
    out.settings = AudioSettings {
        sample_rate: doc
            .object(&root, &spod("sampleRate"))
            .and_then(|t| t.as_i32())
            .map(|v| v.max(1) as u32)
            .unwrap_or(sd.sample_rate),
        period_size: doc
            .object(&root, &spod("periodSize"))
            .and_then(|t| t.as_i32())
            .map(|v| v.max(1) as u32)
            .unwrap_or(sd.period_size),
        num_periods: doc
            .object(&root, &spod("numPeriods"))
            .and_then(|t| t.as_i32())
            .map(|v| v.max(1) as u32)
            .unwrap_or(sd.num_periods),
        cpus_used: doc
            .object(&root, &spod("CPUsUsed"))
            .and_then(|t| t.as_i32())
            .map(|v| v.max(1) as u32)
            .unwrap_or(sd.cpus_used),
        cpus_available: sd.cpus_available,
    };

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{AutoSink, AutomationMapping};
    use crate::graph::tests::fixture;
    use crate::plugin::db::stereo_uri;

    #[test]
    fn session_roundtrip() {
        let mut fx = fixture();
        let (src, snk) = (fx.graph.source_urn, fx.graph.sink_urn);
        let st = *fx
            .graph
            .modules
            .iter()
            .find(|(_, m)| m.spec.uri == stereo_uri())
            .unwrap()
            .0;

        fx.graph
            .connect(src, "audio_out_1", st, "audio_in_1", 0.5)
            .unwrap();
        fx.graph
            .connect(st, "audio_out_1", snk, "audio_in_1", 1.0)
            .unwrap();
        fx.graph.set_feedback(st, snk, false).unwrap();
        fx.graph.set_node_position(src, st, 3.0, 4.0);
        fx.graph.module_mut(st).unwrap().set_port_value(4, 0.25);
        fx.graph.module_mut(st).unwrap().alias = Some("amp".into());
        fx.graph
            .add_automation(AutomationMapping::midi(
                AutoSink::Port {
                    urn: st,
                    symbol: "gain".into(),
                },
                3,
                74,
            ))
            .unwrap();
        fx.graph.settings.sample_rate = 44100;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("test.synthpod");
        let mut states = HashMap::new();
        states.insert(
            st,
            vec![StateProp {
                key: fx.urid.map("http://example.org/k"),
                type_urid: fx.urid.map("http://lv2plug.in/ns/ext/atom#Chunk"),
                flags: 3,
                value: vec![9, 8, 7],
            }],
        );
        save_bundle(&path, &fx.graph, &fx.urid, &states).unwrap();

        let loaded = load_bundle(&path).unwrap();
        assert_eq!(loaded.modules.len(), 3);
        assert_eq!(loaded.conns.len(), 2);
        assert_eq!(loaded.settings.sample_rate, 44100);

        let st_uri = &fx.graph.module(st).unwrap().urn_uri;
        let lm = loaded
            .modules
            .iter()
            .find(|m| &m.urn_uri == st_uri)
            .unwrap();
        assert_eq!(lm.plugin_uri, stereo_uri());
        assert_eq!(lm.alias.as_deref(), Some("amp"));
        assert!(lm.port_values.contains(&("gain".to_string(), 0.25)));
        assert_eq!(lm.state.len(), 1);
        assert_eq!(lm.state[0].3, vec![9, 8, 7]);

        assert_eq!(loaded.automations.len(), 1);
        let auto = &loaded.automations[0];
        assert_eq!(auto.kind, AutoKind::Midi);
        assert_eq!(auto.midi_channel, 3);
        assert_eq!(auto.midi_controller, 74);
        assert_eq!(auto.sink_symbol.as_deref(), Some("gain"));

        // Saving over an existing bundle replaces it atomically.
        save_bundle(&path, &fx.graph, &fx.urid, &states).unwrap();
        assert!(load_bundle(&path).is_ok());
    }

    #[test]
    fn missing_manifest_is_a_bundle_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_bundle(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }
}
