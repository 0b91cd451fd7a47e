//! Interned URI vocabulary.
//!
//! Every URI the engine uses on the wire or in bundles is mapped once at
//! startup into this struct; afterwards all comparisons are plain `u32`
//! compares and no thread ever touches the map on a hot path.

use std::sync::Arc;

use crate::urid::{Urid, UridMap};

pub const SYNTHPOD_PREFIX: &str = "http://open-music-kontrollers.ch/lv2/synthpod#";
pub const LV2_CORE_PREFIX: &str = "http://lv2plug.in/ns/lv2core#";
pub const ATOM_PREFIX: &str = "http://lv2plug.in/ns/ext/atom#";
pub const MIDI_PREFIX: &str = "http://lv2plug.in/ns/ext/midi#";
pub const TIME_PREFIX: &str = "http://lv2plug.in/ns/ext/time#";
pub const PATCH_PREFIX: &str = "http://lv2plug.in/ns/ext/patch#";
pub const PARAM_PREFIX: &str = "http://lv2plug.in/ns/ext/parameters#";
pub const UNITS_PREFIX: &str = "http://lv2plug.in/ns/extensions/units#";
pub const STATE_PREFIX: &str = "http://lv2plug.in/ns/ext/state#";
pub const WORKER_PREFIX: &str = "http://lv2plug.in/ns/ext/worker#";
pub const PORT_PROPS_PREFIX: &str = "http://lv2plug.in/ns/ext/port-props#";
pub const XSD_PREFIX: &str = "http://www.w3.org/2001/XMLSchema#";
pub const RDF_PREFIX: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
pub const OSC_PREFIX: &str = "http://open-music-kontrollers.ch/lv2/osc#";
pub const XPRESS_PREFIX: &str = "http://open-music-kontrollers.ch/lv2/xpress#";

/// Port-class and direction URIs.
pub struct PortRegs {
    pub input: Urid,
    pub output: Urid,
    pub control: Urid,
    pub audio: Urid,
    pub cv: Urid,
    pub atom_port: Urid,
    pub symbol: Urid,
    pub index: Urid,
    pub minimum: Urid,
    pub maximum: Urid,
    pub default: Urid,
    pub toggled: Urid,
    pub integer: Urid,
    pub enumeration: Urid,
}

/// atom: vocabulary used by buffers and the wire format.
pub struct AtomRegs {
    pub sequence: Urid,
    pub object: Urid,
    pub bool_: Urid,
    pub int: Urid,
    pub long: Urid,
    pub float: Urid,
    pub double: Urid,
    pub string: Urid,
    pub path: Urid,
    pub uri: Urid,
    pub urid: Urid,
    pub chunk: Urid,
    pub tuple: Urid,
    pub event_transfer: Urid,
    pub atom_transfer: Urid,
}

/// patch: verbs and properties.
pub struct PatchRegs {
    pub set: Urid,
    pub get: Urid,
    pub put: Urid,
    pub patch: Urid,
    pub error: Urid,
    pub ack: Urid,
    pub add: Urid,
    pub remove: Urid,
    pub subject: Urid,
    pub property: Urid,
    pub value: Urid,
    pub body: Urid,
    pub writable: Urid,
    pub readable: Urid,
    pub sequence_number: Urid,
}

/// midi: event vocabulary.
pub struct MidiRegs {
    pub midi_event: Urid,
    pub controller: Urid,
    pub channel: Urid,
    pub controller_number: Urid,
}

/// Engine vocabulary (`spod:` prefix).
pub struct SynthpodRegs {
    pub payload: Urid,
    pub graph: Urid,
    pub source: Urid,
    pub sink: Urid,
    pub stereo: Urid,
    pub monoatom: Urid,

    pub module_list: Urid,
    pub module_supported: Urid,
    pub module_add: Urid,
    pub module_del: Urid,
    pub module_move: Urid,
    pub module_preset_load: Urid,
    pub module_preset_save: Urid,
    pub module_visible: Urid,
    pub module_disabled: Urid,
    pub module_profiling: Urid,
    pub module_alias: Urid,
    pub module_ui: Urid,
    pub module_position_x: Urid,
    pub module_position_y: Urid,
    pub node_position_x: Urid,
    pub node_position_y: Urid,

    pub bundle_load: Urid,
    pub bundle_save: Urid,
    pub path_get: Urid,
    pub quit: Urid,
    pub dsp_profiling: Urid,
    pub cpus_available: Urid,
    pub cpus_used: Urid,
    pub period_size: Urid,
    pub num_periods: Urid,
    pub sample_rate: Urid,
    pub grid_cols: Urid,
    pub grid_rows: Urid,
    pub pane_left: Urid,

    pub connection_list: Urid,
    pub node_list: Urid,
    pub subscription_list: Urid,
    pub notification_list: Urid,
    pub automation_list: Urid,

    pub source_module: Urid,
    pub source_symbol: Urid,
    pub sink_module: Urid,
    pub sink_symbol: Urid,
    pub source_min: Urid,
    pub source_max: Urid,
    pub sink_min: Urid,
    pub sink_max: Urid,

    pub midi_automation: Urid,
    pub osc_automation: Urid,
    pub midi_channel: Urid,
    pub midi_controller: Urid,
    pub osc_path: Urid,
    pub source_enabled: Urid,
    pub sink_enabled: Urid,
    pub learning: Urid,

    pub plugin: Urid,
    pub gain: Urid,
    pub feedback: Urid,
    pub peak: Urid,
    pub state_prop: Urid,
    pub state_key: Urid,
    pub state_type: Urid,
    pub state_value: Urid,
}

/// Wire protocols for port notifications (mirrors the original's
/// `port_protocol_t`).
pub struct ProtocolRegs {
    pub float_protocol: Urid,
    pub peak_protocol: Urid,
    pub atom_transfer: Urid,
    pub event_transfer: Urid,
}

pub struct Regs {
    pub port: PortRegs,
    pub atom: AtomRegs,
    pub patch: PatchRegs,
    pub midi: MidiRegs,
    pub synthpod: SynthpodRegs,
    pub protocol: ProtocolRegs,
    pub osc_event: Urid,
    pub time_position: Urid,
    pub xpress_message: Urid,
    pub units_unit: Urid,
    pub units_symbol: Urid,
    pub core_name: Urid,
    pub rdf_type: Urid,
    pub rdfs_range: Urid,
}

impl Regs {
    pub fn new(map: &Arc<UridMap>) -> Self {
        let spod = |s: &str| map.map(&format!("{SYNTHPOD_PREFIX}{s}"));
        let lv2 = |s: &str| map.map(&format!("{LV2_CORE_PREFIX}{s}"));
        let atom = |s: &str| map.map(&format!("{ATOM_PREFIX}{s}"));
        let patch = |s: &str| map.map(&format!("{PATCH_PREFIX}{s}"));
        let midi = |s: &str| map.map(&format!("{MIDI_PREFIX}{s}"));
        let units = |s: &str| map.map(&format!("{UNITS_PREFIX}{s}"));

        Regs {
            port: PortRegs {
                input: lv2("InputPort"),
                output: lv2("OutputPort"),
                control: lv2("ControlPort"),
                audio: lv2("AudioPort"),
                cv: lv2("CVPort"),
                atom_port: atom("AtomPort"),
                symbol: lv2("symbol"),
                index: lv2("index"),
                minimum: lv2("minimum"),
                maximum: lv2("maximum"),
                default: lv2("default"),
                toggled: lv2("toggled"),
                integer: lv2("integer"),
                enumeration: lv2("enumeration"),
            },
            atom: AtomRegs {
                sequence: atom("Sequence"),
                object: atom("Object"),
                bool_: atom("Bool"),
                int: atom("Int"),
                long: atom("Long"),
                float: atom("Float"),
                double: atom("Double"),
                string: atom("String"),
                path: atom("Path"),
                uri: atom("URI"),
                urid: atom("URID"),
                chunk: atom("Chunk"),
                tuple: atom("Tuple"),
                event_transfer: atom("eventTransfer"),
                atom_transfer: atom("atomTransfer"),
            },
            patch: PatchRegs {
                set: patch("Set"),
                get: patch("Get"),
                put: patch("Put"),
                patch: patch("Patch"),
                error: patch("Error"),
                ack: patch("Ack"),
                add: patch("add"),
                remove: patch("remove"),
                subject: patch("subject"),
                property: patch("property"),
                value: patch("value"),
                body: patch("body"),
                writable: patch("writable"),
                readable: patch("readable"),
                sequence_number: patch("sequenceNumber"),
            },
            midi: MidiRegs {
                midi_event: midi("MidiEvent"),
                controller: midi("Controller"),
                channel: midi("channel"),
                controller_number: midi("controllerNumber"),
            },
            synthpod: SynthpodRegs {
                payload: spod("payload"),
                graph: spod("graph"),
                source: spod("source"),
                sink: spod("sink"),
                stereo: spod("stereo"),
                monoatom: spod("monoatom"),

                module_list: spod("moduleList"),
                module_supported: spod("moduleSupported"),
                module_add: spod("moduleAdd"),
                module_del: spod("moduleDel"),
                module_move: spod("moduleMove"),
                module_preset_load: spod("modulePresetLoad"),
                module_preset_save: spod("modulePresetSave"),
                module_visible: spod("moduleVisible"),
                module_disabled: spod("moduleDisabled"),
                module_profiling: spod("moduleProfiling"),
                module_alias: spod("moduleAlias"),
                module_ui: spod("moduleUI"),
                module_position_x: spod("modulePositionX"),
                module_position_y: spod("modulePositionY"),
                node_position_x: spod("nodePositionX"),
                node_position_y: spod("nodePositionY"),

                bundle_load: spod("bundleLoad"),
                bundle_save: spod("bundleSave"),
                path_get: spod("pathGet"),
                quit: spod("quit"),
                dsp_profiling: spod("DSPProfiling"),
                cpus_available: spod("CPUsAvailable"),
                cpus_used: spod("CPUsUsed"),
                period_size: spod("periodSize"),
                num_periods: spod("numPeriods"),
                sample_rate: spod("sampleRate"),
                grid_cols: spod("gridCols"),
                grid_rows: spod("gridRows"),
                pane_left: spod("paneLeft"),

                connection_list: spod("connectionList"),
                node_list: spod("nodeList"),
                subscription_list: spod("subscriptionList"),
                notification_list: spod("notificationList"),
                automation_list: spod("automationList"),

                source_module: spod("sourceModule"),
                source_symbol: spod("sourceSymbol"),
                sink_module: spod("sinkModule"),
                sink_symbol: spod("sinkSymbol"),
                source_min: spod("sourceMinimum"),
                source_max: spod("sourceMaximum"),
                sink_min: spod("sinkMinimum"),
                sink_max: spod("sinkMaximum"),

                midi_automation: spod("MIDIAutomation"),
                osc_automation: spod("OSCAutomation"),
                midi_channel: spod("midiChannel"),
                midi_controller: spod("midiController"),
                osc_path: spod("OSCPath"),
                source_enabled: spod("sourceEnabled"),
                sink_enabled: spod("sinkEnabled"),
                learning: spod("learning"),

                plugin: spod("plugin"),
                gain: map.map(&format!("{PARAM_PREFIX}gain")),
                feedback: spod("feedback"),
                peak: spod("peak"),
                state_prop: spod("stateProperty"),
                state_key: spod("stateKey"),
                state_type: spod("stateType"),
                state_value: spod("stateValue"),
            },
            protocol: ProtocolRegs {
                float_protocol: map.map("http://lv2plug.in/ns/ext/port-monitor#floatProtocol"),
                peak_protocol: map.map("http://lv2plug.in/ns/ext/port-monitor#peakProtocol"),
                atom_transfer: atom("atomTransfer"),
                event_transfer: atom("eventTransfer"),
            },
            osc_event: map.map(&format!("{OSC_PREFIX}Event")),
            time_position: map.map(&format!("{TIME_PREFIX}Position")),
            xpress_message: map.map(&format!("{XPRESS_PREFIX}Message")),
            units_unit: units("unit"),
            units_symbol: units("symbol"),
            core_name: map.map("http://usefulinc.com/ns/doap#name"),
            rdf_type: map.map(&format!("{RDF_PREFIX}type")),
            rdfs_range: map.map("http://www.w3.org/2000/01/rdf-schema#range"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_is_distinct() {
        let map = UridMap::new();
        let regs = Regs::new(&map);
        // Spot-check a few identities; all URIDs must be nonzero and unique.
        assert_ne!(regs.port.audio, 0);
        assert_ne!(regs.port.audio, regs.port.cv);
        assert_ne!(regs.synthpod.module_add, regs.synthpod.module_del);
        assert_eq!(
            map.unmap(regs.synthpod.connection_list).as_deref(),
            Some("http://open-music-kontrollers.ch/lv2/synthpod#connectionList")
        );
    }
}
