//! The session graph: modules keyed by URN, module connections, automation
//! mappings and the audio/UI settings snapshot.
//!
//! This is the authoritative model, owned by the worker thread.  The RT
//! thread only ever sees compiled snapshots derived from it.

pub mod conn;
pub mod module;
pub mod port;
pub mod scheduler;

use std::collections::HashMap;

pub use conn::{ModConn, PortConn, PortRef};
pub use module::{Module, ModuleDsp, ProfileSlot, RtModule, RtPort};
pub use port::PortBuf;
pub use scheduler::{Barrier, Plan};

use crate::automation::AutomationMapping;
use crate::error::{Error, Result};
use crate::plugin::types::{PortDirection, PortSpec};
use crate::urid::Urid;

/// Audio driver settings snapshot carried in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub period_size: u32,
    pub num_periods: u32,
    pub cpus_used: u32,
    pub cpus_available: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        AudioSettings {
            sample_rate: 48000,
            period_size: 512,
            num_periods: 2,
            cpus_used: 1,
            cpus_available: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }
}

/// UI layout flags persisted with the session but never interpreted by the
/// engine.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UiFlags {
    pub sidebar_visible: bool,
    pub bottombar_visible: bool,
    pub grid_cols: i32,
    pub grid_rows: i32,
    pub pane_left: f32,
}

impl Default for UiFlags {
    fn default() -> Self {
        UiFlags {
            sidebar_visible: true,
            bottombar_visible: true,
            grid_cols: 3,
            grid_rows: 2,
            pane_left: 0.2,
        }
    }
}

/// Outcome of a connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Created,
    GainUpdated,
}

pub struct Graph {
    pub modules: HashMap<Urid, Module>,
    pub mod_conns: Vec<ModConn>,
    pub automations: Vec<AutomationMapping>,
    pub canvas: (f32, f32),
    pub flags: UiFlags,
    pub settings: AudioSettings,
    /// The two system modules; set at engine init, never removed.
    pub source_urn: Urid,
    pub sink_urn: Urid,
}

impl Graph {
    pub fn new(settings: AudioSettings) -> Self {
        Graph {
            modules: HashMap::new(),
            mod_conns: Vec::new(),
            automations: Vec::new(),
            canvas: (0.0, 0.0),
            flags: UiFlags::default(),
            settings,
            source_urn: 0,
            sink_urn: 0,
        }
    }

    // ── Modules ──

    pub fn insert_module(&mut self, module: Module) {
        self.modules.insert(module.urn, module);
    }

    pub fn module(&self, urn: Urid) -> Result<&Module> {
        self.modules
            .get(&urn)
            .ok_or_else(|| Error::lookup(format!("unknown module urn {urn}")))
    }

    pub fn module_mut(&mut self, urn: Urid) -> Result<&mut Module> {
        self.modules
            .get_mut(&urn)
            .ok_or_else(|| Error::lookup(format!("unknown module urn {urn}")))
    }

    /// Remove a module and every incident connection and automation.
    /// The system source/sink cannot be deleted.
    pub fn remove_module(&mut self, urn: Urid) -> Result<Module> {
        if urn == self.source_urn || urn == self.sink_urn {
            return Err(Error::constraint("system source/sink cannot be removed"));
        }
        let module = self
            .modules
            .remove(&urn)
            .ok_or_else(|| Error::lookup(format!("unknown module urn {urn}")))?;
        self.mod_conns
            .retain(|mc| mc.source_urn != urn && mc.sink_urn != urn);
        self.automations.retain(|a| a.sink.urn() != urn);
        Ok(module)
    }

    // ── Port lookup ──

    pub fn port_by_symbol(&self, urn: Urid, symbol: &str) -> Result<&PortSpec> {
        self.module(urn)?.spec.port_by_symbol(symbol).ok_or_else(|| {
            Error::lookup(format!("module {urn} has no port with symbol '{symbol}'"))
        })
    }

    pub fn port_by_index(&self, urn: Urid, index: u32) -> Result<&PortSpec> {
        self.module(urn)?
            .spec
            .port_by_index(index)
            .ok_or_else(|| Error::lookup(format!("module {urn} has no port index {index}")))
    }

    // ── Connections ──

    /// Validate and apply a connection request (invariants 1–3).
    pub fn connect(
        &mut self,
        source_urn: Urid,
        source_symbol: &str,
        sink_urn: Urid,
        sink_symbol: &str,
        gain: f32,
    ) -> Result<ConnectOutcome> {
        let source = self.port_by_symbol(source_urn, source_symbol)?;
        let sink = self.port_by_symbol(sink_urn, sink_symbol)?;

        if source.direction != PortDirection::Output {
            return Err(Error::constraint(format!(
                "'{source_symbol}' is not an output port"
            )));
        }
        if sink.direction != PortDirection::Input {
            return Err(Error::constraint(format!(
                "'{sink_symbol}' is not an input port"
            )));
        }
        if !conn::types_compatible(source.ty, source.atom_kinds, sink.ty, sink.atom_kinds) {
            return Err(Error::constraint(format!(
                "port types of '{source_symbol}' and '{sink_symbol}' do not match"
            )));
        }

        let ty = source.ty;
        let src_ref = PortRef {
            urn: source_urn,
            index: source.index,
        };
        let snk_ref = PortRef {
            urn: sink_urn,
            index: sink.index,
        };

        let mc = match self
            .mod_conns
            .iter_mut()
            .find(|mc| mc.source_urn == source_urn && mc.sink_urn == sink_urn)
        {
            Some(mc) => mc,
            None => {
                self.mod_conns.push(ModConn::new(source_urn, sink_urn));
                self.mod_conns.last_mut().unwrap()
            }
        };

        if mc.upsert(src_ref, snk_ref, gain, ty) {
            Ok(ConnectOutcome::Created)
        } else {
            Ok(ConnectOutcome::GainUpdated)
        }
    }

    /// Remove one port edge; removing a non-existent edge is a no-op.
    /// Returns whether an edge was removed.
    pub fn disconnect(
        &mut self,
        source_urn: Urid,
        source_symbol: &str,
        sink_urn: Urid,
        sink_symbol: &str,
    ) -> Result<bool> {
        let source_index = self.port_by_symbol(source_urn, source_symbol)?.index;
        let sink_index = self.port_by_symbol(sink_urn, sink_symbol)?.index;

        let src_ref = PortRef {
            urn: source_urn,
            index: source_index,
        };
        let snk_ref = PortRef {
            urn: sink_urn,
            index: sink_index,
        };

        let mut removed = false;
        for mc in &mut self.mod_conns {
            if mc.source_urn == source_urn && mc.sink_urn == sink_urn {
                removed |= mc.remove(src_ref, snk_ref);
            }
        }
        self.mod_conns.retain(|mc| !mc.is_empty());
        Ok(removed)
    }

    /// Flag or unflag a module pair as a feedback edge.  Creates the patch
    /// matrix node if the pair has no edges yet, so a loop can be flagged
    /// before the cycle-closing connection is requested.
    pub fn set_feedback(&mut self, source_urn: Urid, sink_urn: Urid, feedback: bool) -> Result<()> {
        self.module(source_urn)?;
        self.module(sink_urn)?;
        let mc = match self
            .mod_conns
            .iter_mut()
            .position(|mc| mc.source_urn == source_urn && mc.sink_urn == sink_urn)
        {
            Some(i) => &mut self.mod_conns[i],
            None => {
                self.mod_conns.push(ModConn::new(source_urn, sink_urn));
                self.mod_conns.last_mut().unwrap()
            }
        };
        mc.feedback = feedback;
        Ok(())
    }

    pub fn set_node_position(&mut self, source_urn: Urid, sink_urn: Urid, x: f32, y: f32) {
        if let Some(mc) = self
            .mod_conns
            .iter_mut()
            .find(|mc| mc.source_urn == source_urn && mc.sink_urn == sink_urn)
        {
            mc.position = (x, y);
        }
    }

    /// All port edges incident to a sink port, in connection order.
    pub fn sources_of(&self, sink: PortRef) -> Vec<PortConn> {
        let mut out = Vec::new();
        for mc in &self.mod_conns {
            for c in &mc.conns {
                if c.sink == sink {
                    out.push(*c);
                }
            }
        }
        out
    }

    // ── Scheduling ──

    /// Dependency edges for the scheduler: every non-feedback ModConn with
    /// at least one port edge.
    pub fn dependency_edges(&self) -> Vec<(Urid, Urid)> {
        self.mod_conns
            .iter()
            .filter(|mc| !mc.feedback && !mc.is_empty())
            .map(|mc| (mc.source_urn, mc.sink_urn))
            .collect()
    }

    /// Compute the execution plan for the current topology.
    pub fn schedule(&self) -> Result<Plan> {
        let mut urns: Vec<Urid> = self.modules.keys().copied().collect();
        urns.sort_unstable();
        scheduler::schedule(&urns, &self.dependency_edges(), self.settings.cpus_used)
    }

    // ── Automation ──

    pub fn add_automation(&mut self, mapping: AutomationMapping) -> Result<u32> {
        // Validate the sink exists.
        match &mapping.sink {
            crate::automation::AutoSink::Port { urn, symbol } => {
                let port = self.port_by_symbol(*urn, symbol)?;
                if port.direction != PortDirection::Input {
                    return Err(Error::constraint("automation sink must be an input port"));
                }
            }
            crate::automation::AutoSink::Param { urn, property, .. } => {
                let module = self.module(*urn)?;
                if !module.spec.params.is_empty() && module.param(*property).is_none() {
                    return Err(Error::lookup("automation sink parameter not declared"));
                }
            }
        }
        // Replace an existing mapping for the same sink.
        self.automations.retain(|a| a.sink != mapping.sink);
        self.automations.push(mapping);
        Ok(self.automations.len() as u32 - 1)
    }

    pub fn remove_automation(&mut self, sink: &crate::automation::AutoSink) -> bool {
        let before = self.automations.len();
        self.automations.retain(|a| &a.sink != sink);
        self.automations.len() != before
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plugin::db::{builtin_spec, sink_uri, source_uri, stereo_uri};
    use crate::regs::Regs;
    use crate::urid::UridMap;
    use std::sync::Arc;

    pub(crate) struct Fixture {
        pub graph: Graph,
        pub urid: Arc<UridMap>,
        _coll: basedrop::Collector,
    }

    pub(crate) fn fixture() -> Fixture {
        let urid = UridMap::new();
        let regs = Regs::new(&urid);
        let coll = basedrop::Collector::new();
        let mut graph = Graph::new(AudioSettings::default());
        for uri in [source_uri(), sink_uri(), stereo_uri()] {
            let spec = builtin_spec(&uri).unwrap();
            let m = Module::new(
                module::fresh_urn_uri(),
                spec,
                48000.0,
                512,
                4096,
                &urid,
                &regs,
                &coll.handle(),
            )
            .unwrap();
            let urn = m.urn;
            graph.insert_module(m);
            if uri == source_uri() {
                graph.source_urn = urn;
            } else if uri == sink_uri() {
                graph.sink_urn = urn;
            }
        }
        Fixture {
            graph,
            urid,
            _coll: coll,
        }
    }

    fn stereo_urn(g: &Graph) -> Urid {
        *g.modules
            .iter()
            .find(|(_, m)| m.spec.uri == stereo_uri())
            .unwrap()
            .0
    }

    #[test]
    fn connect_validates_types_and_directions() {
        let mut fx = fixture();
        let (src, snk) = (fx.graph.source_urn, fx.graph.sink_urn);

        assert_eq!(
            fx.graph
                .connect(src, "audio_out_1", snk, "audio_in_1", 1.0)
                .unwrap(),
            ConnectOutcome::Created
        );
        // Idempotent add only updates the gain.
        assert_eq!(
            fx.graph
                .connect(src, "audio_out_1", snk, "audio_in_1", 0.5)
                .unwrap(),
            ConnectOutcome::GainUpdated
        );

        // Audio -> CV is refused.
        assert!(matches!(
            fx.graph.connect(src, "audio_out_1", snk, "cv_in_1", 1.0),
            Err(Error::Constraint(_))
        ));
        // Input used as source is refused.
        assert!(matches!(
            fx.graph.connect(snk, "audio_in_1", snk, "audio_in_2", 1.0),
            Err(Error::Constraint(_))
        ));
        // Unknown symbol is a lookup error.
        assert!(matches!(
            fx.graph.connect(src, "nope", snk, "audio_in_1", 1.0),
            Err(Error::Lookup(_))
        ));
    }

    #[test]
    fn remove_module_drops_incident_edges() {
        let mut fx = fixture();
        let (src, snk) = (fx.graph.source_urn, fx.graph.sink_urn);
        let st = stereo_urn(&fx.graph);

        fx.graph
            .connect(src, "audio_out_1", st, "audio_in_1", 1.0)
            .unwrap();
        fx.graph
            .connect(st, "audio_out_1", snk, "audio_in_1", 1.0)
            .unwrap();
        assert_eq!(fx.graph.mod_conns.len(), 2);

        fx.graph.remove_module(st).unwrap();
        assert!(fx.graph.mod_conns.is_empty());

        // System modules refuse deletion.
        assert!(matches!(
            fx.graph.remove_module(src),
            Err(Error::Constraint(_))
        ));
    }

    #[test]
    fn feedback_breaks_cycles_for_the_scheduler() {
        let mut fx = fixture();
        let (src, snk) = (fx.graph.source_urn, fx.graph.sink_urn);
        let st = stereo_urn(&fx.graph);

        fx.graph
            .connect(src, "audio_out_1", st, "audio_in_1", 1.0)
            .unwrap();
        fx.graph
            .connect(st, "audio_out_1", snk, "audio_in_1", 1.0)
            .unwrap();
        assert!(fx.graph.schedule().is_ok());

        // st -> st would be a self-cycle; sink->source style loop instead:
        fx.graph
            .connect(st, "audio_out_2", st, "audio_in_2", 1.0)
            .unwrap();
        assert!(fx.graph.schedule().is_err());

        fx.graph.set_feedback(st, st, true).unwrap();
        assert!(fx.graph.schedule().is_ok());
    }
}
