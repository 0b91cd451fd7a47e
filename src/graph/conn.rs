//! Connection tables: port-to-port edges with gain, aggregated per module
//! pair for the patch matrix.
//!
//! Edges reference modules by URN and ports by index, never by pointer -
//! removing a module only has to drop the entries whose either endpoint
//! matches.

use crate::plugin::types::{AtomKinds, PortType};
use crate::urid::Urid;

/// One endpoint: (module URN, port index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub urn: Urid,
    pub index: u32,
}

/// A directed port edge.  `gain` applies to Audio/CV only; it is accepted
/// and persisted for Atom/Control edges but the mixer ignores it there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortConn {
    pub source: PortRef,
    pub sink: PortRef,
    pub gain: f32,
}

/// All port edges sharing the same (source module, sink module), plus the
/// patch-matrix node state.
#[derive(Debug, Clone)]
pub struct ModConn {
    pub source_urn: Urid,
    pub sink_urn: Urid,
    pub conns: Vec<PortConn>,
    /// Union of the port types connected, for matrix display.
    pub types: Vec<PortType>,
    /// Canvas position of the matrix node.
    pub position: (f32, f32),
    /// When set, this edge may close a cycle; the sink sees the source's
    /// previous-period output.
    pub feedback: bool,
}

impl ModConn {
    pub fn new(source_urn: Urid, sink_urn: Urid) -> Self {
        ModConn {
            source_urn,
            sink_urn,
            conns: Vec::new(),
            types: Vec::new(),
            position: (0.0, 0.0),
            feedback: false,
        }
    }

    /// Insert or update one port edge.  Returns `true` when a new edge was
    /// created, `false` when only the gain changed (idempotent add).
    pub fn upsert(&mut self, source: PortRef, sink: PortRef, gain: f32, ty: PortType) -> bool {
        if let Some(existing) = self
            .conns
            .iter_mut()
            .find(|c| c.source == source && c.sink == sink)
        {
            existing.gain = gain;
            return false;
        }
        self.conns.push(PortConn { source, sink, gain });
        if !self.types.contains(&ty) {
            self.types.push(ty);
        }
        true
    }

    /// Remove one port edge; no-op when absent.  Returns whether an edge
    /// was removed.
    pub fn remove(&mut self, source: PortRef, sink: PortRef) -> bool {
        let before = self.conns.len();
        self.conns.retain(|c| !(c.source == source && c.sink == sink));
        self.conns.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn find(&self, source: PortRef, sink: PortRef) -> Option<&PortConn> {
        self.conns
            .iter()
            .find(|c| c.source == source && c.sink == sink)
    }
}

/// Port-compatibility check for invariant 2: equal types, and for Atom
/// ports a non-empty subtype intersection.
pub fn types_compatible(
    source_ty: PortType,
    source_kinds: AtomKinds,
    sink_ty: PortType,
    sink_kinds: AtomKinds,
) -> bool {
    if source_ty != sink_ty {
        return false;
    }
    source_ty != PortType::Atom || source_kinds.intersects(sink_kinds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pref(urn: Urid, index: u32) -> PortRef {
        PortRef { urn, index }
    }

    #[test]
    fn upsert_is_idempotent_on_gain() {
        let mut mc = ModConn::new(1, 2);
        assert!(mc.upsert(pref(1, 0), pref(2, 0), 1.0, PortType::Audio));
        assert!(!mc.upsert(pref(1, 0), pref(2, 0), 0.5, PortType::Audio));
        assert_eq!(mc.conns.len(), 1);
        assert_eq!(mc.find(pref(1, 0), pref(2, 0)).unwrap().gain, 0.5);

        assert!(mc.remove(pref(1, 0), pref(2, 0)));
        assert!(!mc.remove(pref(1, 0), pref(2, 0)));
        assert!(mc.is_empty());
    }

    #[test]
    fn compatibility_matrix() {
        use PortType::*;
        assert!(types_compatible(Audio, AtomKinds::NONE, Audio, AtomKinds::NONE));
        assert!(!types_compatible(Audio, AtomKinds::NONE, Cv, AtomKinds::NONE));
        assert!(!types_compatible(Control, AtomKinds::NONE, Audio, AtomKinds::NONE));
        assert!(types_compatible(Atom, AtomKinds::MIDI, Atom, AtomKinds::MIDI));
        assert!(!types_compatible(Atom, AtomKinds::MIDI, Atom, AtomKinds::OSC));
        // Undeclared subtype masks accept anything.
        assert!(types_compatible(Atom, AtomKinds::NONE, Atom, AtomKinds::PATCH));
    }
}
