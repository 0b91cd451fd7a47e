//! Plugin and port descriptor types shared across the engine.

use serde::{Deserialize, Serialize};

use crate::atom::Value;
use crate::urid::Urid;

// ---------------------------------------------------------------------------
// Port types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    /// `[f32; nframes]` sample stream per period.
    Audio,
    /// A single f32 sampled once per period.
    Control,
    /// Per-sample control signal, same shape as Audio.
    Cv,
    /// Typed event sequence (MIDI, OSC, time, patch, gestures).
    Atom,
}

impl PortType {
    pub fn is_sample_stream(self) -> bool {
        matches!(self, Self::Audio | Self::Cv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

/// Bitmask over the atom event classes a port accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtomKinds(pub u32);

impl AtomKinds {
    pub const MIDI: AtomKinds = AtomKinds(1 << 0);
    pub const OSC: AtomKinds = AtomKinds(1 << 1);
    pub const TIME: AtomKinds = AtomKinds(1 << 2);
    pub const PATCH: AtomKinds = AtomKinds(1 << 3);
    pub const XPRESS: AtomKinds = AtomKinds(1 << 4);
    pub const ALL: AtomKinds = AtomKinds(0x1f);
    pub const NONE: AtomKinds = AtomKinds(0);

    pub fn intersects(self, other: AtomKinds) -> bool {
        // A port declaring no subtype accepts everything.
        self.0 == 0 || other.0 == 0 || self.0 & other.0 != 0
    }

    pub fn contains(self, other: AtomKinds) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: AtomKinds) -> AtomKinds {
        AtomKinds(self.0 | other.0)
    }
}

// ---------------------------------------------------------------------------
// Control port metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalePoint {
    pub label: String,
    pub value: f32,
}

/// Flags on a control port, straight from the plugin's metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    pub integer: bool,
    pub toggled: bool,
    pub logarithmic: bool,
    pub enumeration: bool,
    pub bitmask: bool,
}

// ---------------------------------------------------------------------------
// Port spec (immutable description from the metadata database)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSpec {
    /// Zero-based index, matching the plugin's declared port index.
    pub index: u32,
    pub symbol: String,
    pub name: String,
    pub ty: PortType,
    pub direction: PortDirection,
    /// For Atom ports: accepted event classes.
    pub atom_kinds: AtomKinds,
    /// For Atom ports: requested sequence capacity in bytes (0 = default).
    pub atom_capacity: u32,
    /// For Control ports.
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub flags: ControlFlags,
    pub unit: Option<String>,
    pub scale_points: Vec<ScalePoint>,
}

impl PortSpec {
    pub fn control(index: u32, symbol: &str, name: &str, min: f32, max: f32, default: f32) -> Self {
        PortSpec {
            index,
            symbol: symbol.to_string(),
            name: name.to_string(),
            ty: PortType::Control,
            direction: PortDirection::Input,
            atom_kinds: AtomKinds::NONE,
            atom_capacity: 0,
            min,
            max,
            default,
            flags: ControlFlags::default(),
            unit: None,
            scale_points: Vec::new(),
        }
    }

    pub fn stream(
        index: u32,
        symbol: &str,
        name: &str,
        ty: PortType,
        direction: PortDirection,
    ) -> Self {
        PortSpec {
            index,
            symbol: symbol.to_string(),
            name: name.to_string(),
            ty,
            direction,
            atom_kinds: AtomKinds::NONE,
            atom_capacity: 0,
            min: 0.0,
            max: 0.0,
            default: 0.0,
            flags: ControlFlags::default(),
            unit: None,
            scale_points: Vec::new(),
        }
    }

    pub fn atom(
        index: u32,
        symbol: &str,
        name: &str,
        direction: PortDirection,
        kinds: AtomKinds,
    ) -> Self {
        PortSpec {
            index,
            symbol: symbol.to_string(),
            name: name.to_string(),
            ty: PortType::Atom,
            direction,
            atom_kinds: kinds,
            atom_capacity: 0,
            min: 0.0,
            max: 0.0,
            default: 0.0,
            flags: ControlFlags::default(),
            unit: None,
            scale_points: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin-declared parameters (patch properties, not ports)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Property URID.
    pub property: Urid,
    /// Range URID (atom:Bool, atom:Int, atom:Float, ...).
    pub range: Urid,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub label: Option<String>,
    pub comment: Option<String>,
    pub unit: Option<String>,
    pub scale_points: Vec<ScalePoint>,
    pub is_readonly: bool,
    pub is_bitmask: bool,
    pub is_logarithmic: bool,
}

// ---------------------------------------------------------------------------
// Plugin spec (catalog entry from the metadata database)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PluginSpec {
    pub uri: String,
    pub name: String,
    pub author: Option<String>,
    /// Filesystem path of the shared object, empty for builtins.
    pub binary_path: String,
    pub ports: Vec<PortSpec>,
    pub params: Vec<ParamSpec>,
    pub required_features: Vec<String>,
    /// Whether every required feature is one the engine provides.
    pub supported: bool,
}

impl PluginSpec {
    pub fn port_by_symbol(&self, symbol: &str) -> Option<&PortSpec> {
        self.ports.iter().find(|p| p.symbol == symbol)
    }

    pub fn port_by_index(&self, index: u32) -> Option<&PortSpec> {
        self.ports.iter().find(|p| p.index == index)
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }
}

/// A preset known for a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetInfo {
    pub uri: String,
    pub label: String,
    /// Bundle path holding the preset, empty for db-internal presets.
    pub bundle: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_kind_intersection() {
        assert!(AtomKinds::MIDI.intersects(AtomKinds::MIDI));
        assert!(!AtomKinds::MIDI.intersects(AtomKinds::OSC));
        // Unspecified accepts everything.
        assert!(AtomKinds::NONE.intersects(AtomKinds::OSC));
        assert!(AtomKinds::ALL.intersects(AtomKinds::PATCH));
        let both = AtomKinds::MIDI.union(AtomKinds::TIME);
        assert!(both.contains(AtomKinds::MIDI));
        assert!(!both.contains(AtomKinds::OSC));
    }
}
