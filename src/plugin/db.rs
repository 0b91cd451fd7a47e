//! Read-only plugin metadata queries.
//!
//! The discovery database itself is an external collaborator; the engine
//! only consumes [`PluginDb`].  Two implementations: the builtin system
//! modules (source, sink, stereo, monoatom), and `LilvDb` over an
//! `LV2_PATH`-driven lilv world.

use lilv::World;

use super::types::*;
use crate::regs::SYNTHPOD_PREFIX;

/// LV2 feature URIs the engine provides to plugins.  Plugins requiring only
/// these (or a subset) are considered supported.
pub const PROVIDED_FEATURES: &[&str] = &[
    "http://lv2plug.in/ns/ext/urid#map",
    "http://lv2plug.in/ns/ext/urid#unmap",
    "http://lv2plug.in/ns/ext/worker#schedule",
    "http://lv2plug.in/ns/ext/options#options",
    "http://lv2plug.in/ns/ext/buf-size#boundedBlockLength",
    "http://lv2plug.in/ns/ext/state#threadSafeRestore",
];

/// Catalog interface the engine consumes.
pub trait PluginDb: Send + Sync {
    /// Full descriptor for one plugin URI.
    fn describe(&self, uri: &str) -> Option<PluginSpec>;

    /// `(uri, name)` of every supported plugin (answers `moduleSupported`).
    fn list(&self) -> Vec<(String, String)>;
}

// ---------------------------------------------------------------------------
// Builtin system modules
// ---------------------------------------------------------------------------

pub fn source_uri() -> String {
    format!("{SYNTHPOD_PREFIX}source")
}

pub fn sink_uri() -> String {
    format!("{SYNTHPOD_PREFIX}sink")
}

pub fn stereo_uri() -> String {
    format!("{SYNTHPOD_PREFIX}stereo")
}

pub fn monoatom_uri() -> String {
    format!("{SYNTHPOD_PREFIX}monoatom")
}

/// Descriptor for a builtin module URI, if it is one.
pub fn builtin_spec(uri: &str) -> Option<PluginSpec> {
    use PortDirection::{Input, Output};
    use PortType::{Audio, Cv};

    let external = AtomKinds::MIDI.union(AtomKinds::OSC).union(AtomKinds::TIME);

    let ports = if uri == source_uri() {
        // External inputs fan into the graph as outputs of this module.
        vec![
            PortSpec::stream(0, "audio_out_1", "Audio Out 1", Audio, Output),
            PortSpec::stream(1, "audio_out_2", "Audio Out 2", Audio, Output),
            PortSpec::atom(2, "event_out", "Event Out", Output, external),
            PortSpec::stream(3, "cv_out_1", "CV Out 1", Cv, Output),
        ]
    } else if uri == sink_uri() {
        vec![
            PortSpec::stream(0, "audio_in_1", "Audio In 1", Audio, Input),
            PortSpec::stream(1, "audio_in_2", "Audio In 2", Audio, Input),
            PortSpec::atom(2, "event_in", "Event In", Input, external),
            PortSpec::stream(3, "cv_in_1", "CV In 1", Cv, Input),
        ]
    } else if uri == stereo_uri() {
        vec![
            PortSpec::stream(0, "audio_in_1", "Audio In 1", Audio, Input),
            PortSpec::stream(1, "audio_in_2", "Audio In 2", Audio, Input),
            PortSpec::stream(2, "audio_out_1", "Audio Out 1", Audio, Output),
            PortSpec::stream(3, "audio_out_2", "Audio Out 2", Audio, Output),
            PortSpec::control(4, "gain", "Gain", 0.0, 4.0, 1.0),
        ]
    } else if uri == monoatom_uri() {
        vec![
            PortSpec::stream(0, "audio_in_1", "Audio In 1", Audio, Input),
            PortSpec::stream(1, "audio_out_1", "Audio Out 1", Audio, Output),
            PortSpec::atom(2, "event_in", "Event In", Input, AtomKinds::NONE),
            PortSpec::atom(3, "event_out", "Event Out", Output, AtomKinds::NONE),
            PortSpec::control(4, "gain", "Gain", 0.0, 4.0, 1.0),
        ]
    } else {
        return None;
    };

    let name = uri.rsplit('#').next().unwrap_or(uri).to_string();
    Some(PluginSpec {
        uri: uri.to_string(),
        name,
        author: None,
        binary_path: String::new(),
        ports,
        params: Vec::new(),
        required_features: Vec::new(),
        supported: true,
    })
}

pub fn is_builtin(uri: &str) -> bool {
    uri.starts_with(SYNTHPOD_PREFIX)
}

// ---------------------------------------------------------------------------
// lilv-backed database
// ---------------------------------------------------------------------------

/// Metadata database over an installed LV2 world.  Construction scans the
/// `LV2_PATH`; queries afterwards are read-only.
pub struct LilvDb {
    world: World,
}

// The lilv World is only queried behind &self from the worker thread; the
// wrapped pointers are never handed out.
unsafe impl Send for LilvDb {}
unsafe impl Sync for LilvDb {}

impl LilvDb {
    pub fn new() -> Self {
        let world = World::with_load_all();
        let db = LilvDb { world };
        log::info!("plugin db: {} plugins discovered", db.list().len());
        db
    }

    fn describe_plugin(&self, plugin: &lilv::plugin::Plugin) -> Option<PluginSpec> {
        let world = &self.world;
        let input_class = world.new_uri("http://lv2plug.in/ns/lv2core#InputPort");
        let output_class = world.new_uri("http://lv2plug.in/ns/lv2core#OutputPort");
        let audio_class = world.new_uri("http://lv2plug.in/ns/lv2core#AudioPort");
        let control_class = world.new_uri("http://lv2plug.in/ns/lv2core#ControlPort");
        let cv_class = world.new_uri("http://lv2plug.in/ns/lv2core#CVPort");
        let atom_class = world.new_uri("http://lv2plug.in/ns/ext/atom#AtomPort");
        let midi_event = world.new_uri("http://lv2plug.in/ns/ext/midi#MidiEvent");
        let osc_event = world.new_uri("http://open-music-kontrollers.ch/lv2/osc#Event");
        let time_pos = world.new_uri("http://lv2plug.in/ns/ext/time#Position");
        let patch_msg = world.new_uri("http://lv2plug.in/ns/ext/patch#Message");
        let toggled = world.new_uri("http://lv2plug.in/ns/lv2core#toggled");
        let integer = world.new_uri("http://lv2plug.in/ns/lv2core#integer");
        let enumeration = world.new_uri("http://lv2plug.in/ns/lv2core#enumeration");
        let logarithmic = world.new_uri("http://lv2plug.in/ns/ext/port-props#logarithmic");

        let uri = plugin.uri().as_uri()?.to_string();
        let name = plugin.name().as_str()?.to_string();
        let author = plugin
            .author_name()
            .and_then(|n| n.as_str().map(String::from));

        let binary_path = plugin
            .library_uri()
            .and_then(|n| n.as_uri().map(String::from))
            .map(|u| u.strip_prefix("file://").unwrap_or(&u).to_string())
            .unwrap_or_default();

        let mut ports = Vec::new();
        let port_ranges = plugin.port_ranges_float();

        for (i, range) in port_ranges.iter().enumerate() {
            let port = match plugin.port_by_index(i) {
                Some(p) => p,
                None => continue,
            };

            let symbol = match port.symbol() {
                Some(s) => s.as_str().unwrap_or("").to_string(),
                None => format!("port_{}", i),
            };
            let pname = match port.name() {
                Some(n) => n.as_str().unwrap_or("").to_string(),
                None => symbol.clone(),
            };

            let direction = if port.is_a(&input_class) {
                PortDirection::Input
            } else if port.is_a(&output_class) {
                PortDirection::Output
            } else {
                continue;
            };

            let (ty, atom_kinds) = if port.is_a(&audio_class) {
                (PortType::Audio, AtomKinds::NONE)
            } else if port.is_a(&cv_class) {
                (PortType::Cv, AtomKinds::NONE)
            } else if port.is_a(&control_class) {
                (PortType::Control, AtomKinds::NONE)
            } else if port.is_a(&atom_class) {
                let mut kinds = AtomKinds::NONE;
                if port.supports_event(&midi_event) {
                    kinds = kinds.union(AtomKinds::MIDI);
                }
                if port.supports_event(&osc_event) {
                    kinds = kinds.union(AtomKinds::OSC);
                }
                if port.supports_event(&time_pos) {
                    kinds = kinds.union(AtomKinds::TIME);
                }
                if port.supports_event(&patch_msg) {
                    kinds = kinds.union(AtomKinds::PATCH);
                }
                (PortType::Atom, kinds)
            } else {
                continue; // Unknown port class
            };

            let flags = ControlFlags {
                integer: port.has_property(&integer),
                toggled: port.has_property(&toggled),
                logarithmic: port.has_property(&logarithmic),
                enumeration: port.has_property(&enumeration),
                bitmask: false,
            };

            ports.push(PortSpec {
                index: i as u32,
                symbol,
                name: pname,
                ty,
                direction,
                atom_kinds,
                atom_capacity: 0,
                min: range.min,
                max: range.max,
                default: range.default,
                flags,
                unit: None,
                scale_points: Vec::new(),
            });
        }

        let required_features: Vec<String> = plugin
            .required_features()
            .iter()
            .filter_map(|n| n.as_uri().map(String::from))
            .collect();

        let supported = required_features
            .iter()
            .all(|req| PROVIDED_FEATURES.iter().any(|p| p == req));

        Some(PluginSpec {
            uri,
            name,
            author,
            binary_path,
            ports,
            params: Vec::new(),
            required_features,
            supported,
        })
    }
}

impl Default for LilvDb {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginDb for LilvDb {
    fn describe(&self, uri: &str) -> Option<PluginSpec> {
        if let Some(spec) = builtin_spec(uri) {
            return Some(spec);
        }
        for plugin in self.world.plugins().iter() {
            if !plugin.verify() {
                continue;
            }
            if plugin.uri().as_uri() == Some(uri) {
                return self.describe_plugin(&plugin);
            }
        }
        None
    }

    fn list(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = [source_uri(), sink_uri(), stereo_uri(), monoatom_uri()]
            .into_iter()
            .map(|u| {
                let name = u.rsplit('#').next().unwrap_or("").to_string();
                (u, name)
            })
            .collect();

        for plugin in self.world.plugins().iter() {
            if !plugin.verify() {
                continue;
            }
            let Some(uri) = plugin.uri().as_uri().map(String::from) else {
                continue;
            };
            let Some(name) = plugin.name().as_str().map(String::from) else {
                continue;
            };
            out.push((uri, name));
        }
        out.sort_by(|a, b| a.1.to_lowercase().cmp(&b.1.to_lowercase()));
        out
    }
}

/// Database serving only the builtin modules; used headless and in tests.
#[derive(Default)]
pub struct BuiltinDb;

impl PluginDb for BuiltinDb {
    fn describe(&self, uri: &str) -> Option<PluginSpec> {
        builtin_spec(uri)
    }

    fn list(&self) -> Vec<(String, String)> {
        [source_uri(), sink_uri(), stereo_uri(), monoatom_uri()]
            .into_iter()
            .map(|u| {
                let name = u.rsplit('#').next().unwrap_or("").to_string();
                (u, name)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_have_expected_signatures() {
        let source = builtin_spec(&source_uri()).unwrap();
        assert_eq!(source.ports.len(), 4);
        assert!(source
            .ports
            .iter()
            .all(|p| p.direction == PortDirection::Output));

        let sink = builtin_spec(&sink_uri()).unwrap();
        assert!(sink.ports.iter().all(|p| p.direction == PortDirection::Input));

        let stereo = builtin_spec(&stereo_uri()).unwrap();
        assert_eq!(stereo.port_by_symbol("gain").unwrap().default, 1.0);
        assert!(builtin_spec("http://example.org/nope").is_none());
    }

    #[test]
    fn builtin_db_lists_four_modules() {
        let db = BuiltinDb;
        assert_eq!(db.list().len(), 4);
        assert!(db.describe(&monoatom_uri()).is_some());
    }
}
