//! Graph compilation: lowering the worker-owned model into the compiled
//! [`DspGraph`] the RT thread walks.
//!
//! Runs on the worker after every mutation.  A failed compile (cycle,
//! dangling reference) leaves the previous compiled graph in force.

use std::collections::HashMap;

use atomic_refcell::AtomicRefCell;

use super::rt::{
    ATOM_MERGE_MAX, Binding, DspGraph, FeedbackTask, MixSource, MixTask, ModuleEntry, RtBarrier,
};
use crate::automation::{AutoSink, AutoSlot, AutomationMapping, OSC_PATH_MAX, SlotSink};
use crate::error::{Error, Result};
use crate::graph::port::PortBuf;
use crate::graph::{Graph, PortRef};
use crate::plugin::types::{PortDirection, PortType};
use crate::regs::Regs;
use crate::urid::Urid;

/// One incident edge on a sink port, annotated with its feedback flag.
struct Incident {
    source: PortRef,
    gain: f32,
    feedback: bool,
}

pub fn compile(graph: &Graph, regs: &Regs, nframes: u32, generation: u64) -> Result<DspGraph> {
    let plan = graph.schedule()?;

    let mut urns: Vec<Urid> = graph.modules.keys().copied().collect();
    urns.sort_unstable();
    let index: HashMap<Urid, usize> = urns.iter().enumerate().map(|(i, &u)| (u, i)).collect();
    let topo_pos: HashMap<Urid, usize> = plan
        .order
        .iter()
        .enumerate()
        .map(|(i, &u)| (u, i))
        .collect();

    // Gather incident edges per sink port, ordered by scheduler position of
    // the source (the Control last-writer tie-break, and a deterministic
    // summation order for Audio).
    let mut incidents: HashMap<PortRef, Vec<Incident>> = HashMap::new();
    for mc in &graph.mod_conns {
        for c in &mc.conns {
            incidents.entry(c.sink).or_default().push(Incident {
                source: c.source,
                gain: c.gain,
                feedback: mc.feedback,
            });
        }
    }
    for list in incidents.values_mut() {
        list.sort_by_key(|inc| topo_pos.get(&inc.source.urn).copied().unwrap_or(usize::MAX));
    }

    let mut feedbacks: Vec<FeedbackTask> = Vec::new();
    let mut feedback_index: HashMap<PortRef, usize> = HashMap::new();

    let mut modules = Vec::with_capacity(urns.len());
    for &urn in &urns {
        let module = graph.module(urn)?;
        let mut borrows = Vec::new();
        let mut mixes = Vec::new();

        for port in &module.spec.ports {
            if port.direction != PortDirection::Input {
                continue;
            }
            let sink_ref = PortRef {
                urn,
                index: port.index,
            };
            let Some(list) = incidents.get(&sink_ref) else {
                continue;
            };
            if list.is_empty() {
                continue;
            }
            if list.len() > ATOM_MERGE_MAX && port.ty == PortType::Atom {
                return Err(Error::constraint(format!(
                    "more than {ATOM_MERGE_MAX} event streams into one port"
                )));
            }

            // Resolve feedback holds first so indices are stable.
            let mut sources = Vec::with_capacity(list.len());
            for inc in list {
                let feedback = if inc.feedback {
                    let fb_idx = match feedback_index.get(&inc.source) {
                        Some(&i) => i,
                        None => {
                            let src_module = *index
                                .get(&inc.source.urn)
                                .ok_or_else(|| Error::lookup("dangling feedback source"))?;
                            let src_spec = graph
                                .port_by_index(inc.source.urn, inc.source.index)?
                                .clone();
                            let buf = PortBuf::new(
                                src_spec.ty,
                                nframes,
                                src_spec.atom_capacity,
                                0.0,
                            );
                            feedbacks.push(FeedbackTask {
                                src_module,
                                src_port: inc.source.index,
                                buf: AtomicRefCell::new(buf),
                            });
                            feedback_index.insert(inc.source, feedbacks.len() - 1);
                            feedbacks.len() - 1
                        }
                    };
                    Some(fb_idx)
                } else {
                    None
                };
                sources.push(MixSource {
                    module: *index
                        .get(&inc.source.urn)
                        .ok_or_else(|| Error::lookup("dangling connection source"))?,
                    port: inc.source.index,
                    gain: inc.gain,
                    feedback,
                });
            }

            // Mixer elision: a lone edge with no audible gain feeds the
            // consumer straight from the producer's buffer.  The system
            // sink always mixes into its own buffers - the driver boundary
            // reads them directly.
            let gain_neutral =
                !port.ty.is_sample_stream() || (sources[0].gain - 1.0).abs() <= f32::EPSILON;
            if sources.len() == 1 && gain_neutral && urn != graph.sink_urn {
                let src = sources[0];
                let binding = match src.feedback {
                    Some(feedback) => Binding::BorrowFeedback { feedback },
                    None => Binding::Borrow {
                        src_module: src.module,
                        src_port: src.port,
                    },
                };
                borrows.push((port.index, binding));
            } else {
                mixes.push(MixTask {
                    sink_port: port.index,
                    ty: port.ty,
                    sources,
                });
            }
        }

        modules.push(ModuleEntry {
            rt: module.rt.clone(),
            borrows,
            mixes,
        });
    }

    let barriers = plan
        .barriers
        .iter()
        .map(|b| RtBarrier {
            slots: b
                .slots
                .iter()
                .map(|slot| slot.iter().map(|u| index[u]).collect())
                .collect(),
        })
        .collect();

    let autos = graph
        .automations
        .iter()
        .enumerate()
        .filter_map(|(i, m)| lower_automation(i as u32, m, graph, &index))
        .collect();

    let source_idx = *index
        .get(&graph.source_urn)
        .ok_or_else(|| Error::lookup("graph has no system source"))?;
    let sink_idx = *index
        .get(&graph.sink_urn)
        .ok_or_else(|| Error::lookup("graph has no system sink"))?;

    let event_port = |urn: Urid, dir: PortDirection| -> u32 {
        graph
            .module(urn)
            .ok()
            .and_then(|m| {
                m.spec
                    .ports
                    .iter()
                    .find(|p| p.ty == PortType::Atom && p.direction == dir)
                    .map(|p| p.index)
            })
            .unwrap_or(u32::MAX)
    };

    Ok(DspGraph {
        urns,
        modules,
        barriers,
        feedbacks,
        autos: AtomicRefCell::new(autos),
        source_idx,
        sink_idx,
        source_event_port: event_port(graph.source_urn, PortDirection::Output),
        sink_event_port: event_port(graph.sink_urn, PortDirection::Input),
        cpus_used: graph.settings.cpus_used,
        generation,
    })
}

fn lower_automation(
    id: u32,
    mapping: &AutomationMapping,
    graph: &Graph,
    index: &HashMap<Urid, usize>,
) -> Option<AutoSlot> {
    let urn = mapping.sink.urn();
    let module_idx = *index.get(&urn)?;
    let module = graph.module(urn).ok()?;

    let (sink, clip) = match &mapping.sink {
        AutoSink::Port { symbol, .. } => {
            let port = module.spec.port_by_symbol(symbol)?;
            if port.ty != PortType::Control || port.direction != PortDirection::Input {
                return None;
            }
            (
                SlotSink::Port {
                    module: module_idx,
                    port: port.index,
                },
                (port.min, port.max),
            )
        }
        AutoSink::Param {
            property, range, ..
        } => {
            // Patch messages land in the first patch-capable event input.
            let port = module.spec.ports.iter().find(|p| {
                p.ty == PortType::Atom
                    && p.direction == PortDirection::Input
                    && p.atom_kinds.intersects(crate::plugin::types::AtomKinds::PATCH)
            })?;
            let clip = match module.param(*property) {
                Some(ps) => (
                    ps.spec.min.as_ref().and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
                    ps.spec.max.as_ref().and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
                ),
                None => (0.0, 0.0),
            };
            (
                SlotSink::Param {
                    module: module_idx,
                    port: port.index,
                    property: *property,
                    range: *range,
                },
                clip,
            )
        }
    };

    let mut slot = AutoSlot {
        id,
        kind: mapping.kind,
        sink,
        a: mapping.source_range.0,
        b: mapping.source_range.1,
        c: mapping.sink_range.0,
        d: mapping.sink_range.1,
        clip,
        src_enabled: mapping.src_enabled,
        snk_enabled: mapping.snk_enabled,
        learning: mapping.learning,
        channel: mapping.midi_channel,
        controller: mapping.midi_controller,
        path: [0; OSC_PATH_MAX],
        path_len: 0,
        upstream_last: f32::NAN,
    };
    slot.set_path(mapping.osc_path.as_bytes());
    Some(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::fixture;
    use crate::plugin::db::stereo_uri;
    use crate::regs::Regs;

    #[test]
    fn compile_builds_borrows_and_mixers() {
        let mut fx = fixture();
        let regs = Regs::new(&fx.urid);
        let (src, snk) = (fx.graph.source_urn, fx.graph.sink_urn);
        let st = *fx
            .graph
            .modules
            .iter()
            .find(|(_, m)| m.spec.uri == stereo_uri())
            .unwrap()
            .0;

        // Unity single edge: elided.  Two edges into one port: mixer.
        fx.graph
            .connect(src, "audio_out_1", st, "audio_in_1", 1.0)
            .unwrap();
        fx.graph
            .connect(src, "audio_out_1", snk, "audio_in_1", 0.5)
            .unwrap();
        fx.graph
            .connect(st, "audio_out_1", snk, "audio_in_1", 0.25)
            .unwrap();

        let dsp = compile(&fx.graph, &regs, 256, 1).unwrap();
        assert_eq!(dsp.modules.len(), 3);
        assert!(dsp.feedbacks.is_empty());

        let st_idx = dsp.module_index(st).unwrap();
        let snk_idx = dsp.module_index(snk).unwrap();
        assert_eq!(dsp.sink_idx, snk_idx);
        assert_eq!(dsp.modules[st_idx].borrows.len(), 1);
        assert!(dsp.modules[st_idx].mixes.is_empty());
        let sink_mixes = &dsp.modules[snk_idx].mixes;
        assert_eq!(sink_mixes.len(), 1);
        assert_eq!(sink_mixes[0].sources.len(), 2);
    }

    #[test]
    fn feedback_edge_gets_a_holding_buffer() {
        let mut fx = fixture();
        let regs = Regs::new(&fx.urid);
        let st = *fx
            .graph
            .modules
            .iter()
            .find(|(_, m)| m.spec.uri == stereo_uri())
            .unwrap()
            .0;

        fx.graph
            .connect(st, "audio_out_2", st, "audio_in_2", 1.0)
            .unwrap();
        fx.graph.set_feedback(st, st, true).unwrap();

        let dsp = compile(&fx.graph, &regs, 256, 1).unwrap();
        assert_eq!(dsp.feedbacks.len(), 1);
        let st_idx = dsp.module_index(st).unwrap();
        assert!(matches!(
            dsp.modules[st_idx].borrows[0].1,
            Binding::BorrowFeedback { feedback: 0 }
        ));
    }

    #[test]
    fn cyclic_graph_refuses_to_compile() {
        let mut fx = fixture();
        let regs = Regs::new(&fx.urid);
        let st = *fx
            .graph
            .modules
            .iter()
            .find(|(_, m)| m.spec.uri == stereo_uri())
            .unwrap()
            .0;
        fx.graph
            .connect(st, "audio_out_2", st, "audio_in_2", 1.0)
            .unwrap();
        assert!(compile(&fx.graph, &regs, 256, 1).is_err());
    }
}
