//! End-to-end engine scenarios, driven through the public API the way an
//! audio driver plus a controller would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use synthpod::automation::{AutoSink, AutomationMapping};
use synthpod::engine::{Engine, UiEvent};
use synthpod::graph::AudioSettings;
use synthpod::plugin::db::{BuiltinDb, sink_uri, source_uri, stereo_uri};
use synthpod::protocol::Msg;
use synthpod::state::preset::PresetStore;
use synthpod::urid::Urid;
use synthpod::{DspState, UiHandle, atom};

const NFRAMES: u32 = 512;
const RATE: u32 = 48000;

struct Rig {
    _engine: Engine,
    dsp: DspState,
    ui: UiHandle,
    source_urn: Urid,
    sink_urn: Urid,
    _tmp: tempfile::TempDir,
}

fn settings() -> AudioSettings {
    AudioSettings {
        sample_rate: RATE,
        period_size: NFRAMES,
        num_periods: 2,
        cpus_used: 1,
        cpus_available: 4,
    }
}

fn rig() -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let mut engine = Engine::with_preset_store(
        settings(),
        Arc::new(BuiltinDb),
        PresetStore::with_root(tmp.path()),
    )
    .unwrap();
    let mut dsp = engine.take_dsp().unwrap();
    let mut ui = engine.take_ui().unwrap();

    // Discover the system module URNs through the protocol.
    ui.send(&Msg::ModuleListGet);
    let mut source_urn = 0;
    let mut sink_urn = 0;
    pump_until(&mut dsp, &mut ui, |ev| {
        if let UiEvent::Msg(Msg::ModuleAdded {
            urn, plugin_uri, ..
        }) = ev
        {
            if *plugin_uri == source_uri() {
                source_urn = *urn;
            } else if *plugin_uri == sink_uri() {
                sink_urn = *urn;
            }
        }
        source_urn != 0 && sink_urn != 0
    });

    Rig {
        _engine: engine,
        dsp,
        ui,
        source_urn,
        sink_urn,
        _tmp: tmp,
    }
}

/// Run silent periods until `done` returns true for some event.
fn pump_until(dsp: &mut DspState, ui: &mut UiHandle, mut done: impl FnMut(&UiEvent) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let silence = vec![0.0f32; NFRAMES as usize];
    let mut out_l = vec![0.0f32; NFRAMES as usize];
    let mut out_r = vec![0.0f32; NFRAMES as usize];
    let mut midi_out = vec![0u8; 1024];
    while Instant::now() < deadline {
        {
            let inputs: [&[f32]; 2] = [&silence, &silence];
            let mut outs: [&mut [f32]; 2] = [&mut out_l, &mut out_r];
            dsp.process(NFRAMES, &inputs, &mut outs, &[], &mut midi_out);
        }
        for ev in ui.poll() {
            if done(&ev) {
                return;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for engine event");
}

/// One period with explicit inputs; returns the two output channels.
fn run_period(
    dsp: &mut DspState,
    in_l: &[f32],
    in_r: &[f32],
    midi_in: &[u8],
) -> (Vec<f32>, Vec<f32>) {
    let mut out_l = vec![0.0f32; NFRAMES as usize];
    let mut out_r = vec![0.0f32; NFRAMES as usize];
    let mut midi_out = vec![0u8; 1024];
    {
        let inputs: [&[f32]; 2] = [in_l, in_r];
        let mut outs: [&mut [f32]; 2] = [&mut out_l, &mut out_r];
        dsp.process(NFRAMES, &inputs, &mut outs, midi_in, &mut midi_out);
    }
    (out_l, out_r)
}

fn connect(rig: &mut Rig, src: Urid, src_sym: &str, snk: Urid, snk_sym: &str, gain: f32) {
    rig.ui.send(&Msg::ConnAdd {
        source_urn: src,
        source_symbol: src_sym.to_string(),
        sink_urn: snk,
        sink_symbol: snk_sym.to_string(),
        gain,
    });
    let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
    pump_until(dsp, ui, |ev| {
        matches!(ev, UiEvent::Msg(Msg::ConnAdd { source_urn, .. }) if *source_urn == src)
    });
}

fn add_module(rig: &mut Rig, plugin_uri: &str) -> Urid {
    rig.ui.send(&Msg::ModuleAdd {
        plugin_uri: plugin_uri.to_string(),
    });
    let mut urn = 0;
    let uri = plugin_uri.to_string();
    let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
    pump_until(dsp, ui, |ev| {
        if let UiEvent::Msg(Msg::ModuleAdded {
            urn: u, plugin_uri, ..
        }) = ev
            && *plugin_uri == uri
        {
            urn = *u;
            return true;
        }
        false
    });
    urn
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn empty_graph_renders_silence() {
    let mut rig = rig();
    let input = vec![0.0f32; NFRAMES as usize];
    let (out_l, out_r) = run_period(&mut rig.dsp, &input, &input, &[]);
    assert!(out_l.iter().all(|&s| s == 0.0));
    assert!(out_r.iter().all(|&s| s == 0.0));
}

#[test]
fn passthrough_is_bit_exact() {
    let mut rig = rig();
    let (src, snk) = (rig.source_urn, rig.sink_urn);
    connect(&mut rig, src, "audio_out_1", snk, "audio_in_1", 1.0);

    // 4096 samples of a 440 Hz sine at amplitude 0.5.
    let total = 4096usize;
    let sine: Vec<f32> = (0..total)
        .map(|i| {
            0.5 * (2.0 * std::f64::consts::PI * 440.0 * i as f64 / RATE as f64).sin() as f32
        })
        .collect();
    let silence = vec![0.0f32; NFRAMES as usize];

    for chunk in sine.chunks(NFRAMES as usize) {
        let (out_l, _) = run_period(&mut rig.dsp, chunk, &silence, &[]);
        for (o, i) in out_l.iter().zip(chunk.iter()) {
            assert_eq!(o.to_bits(), i.to_bits());
        }
    }
}

#[test]
fn gain_mix_sums_with_gains() {
    let mut rig = rig();
    let (src, snk) = (rig.source_urn, rig.sink_urn);
    // Two producers into the same sink port with gains 0.5 and 0.25.
    connect(&mut rig, src, "audio_out_1", snk, "audio_in_1", 0.5);
    connect(&mut rig, src, "audio_out_2", snk, "audio_in_1", 0.25);

    let ones = vec![1.0f32; NFRAMES as usize];
    let (out_l, _) = run_period(&mut rig.dsp, &ones, &ones, &[]);
    for &s in &out_l {
        assert_eq!(s, 0.75);
    }
}

#[test]
fn feedback_consumer_sees_previous_period() {
    let mut rig = rig();
    let (src, snk) = (rig.source_urn, rig.sink_urn);
    let a = add_module(&mut rig, &stereo_uri());
    let b = add_module(&mut rig, &stereo_uri());

    // source -> A (plain), A -> B (plain), B -> A flagged as feedback
    // before the loop-closing edge, B -> sink to observe.
    connect(&mut rig, src, "audio_out_1", a, "audio_in_1", 1.0);
    connect(&mut rig, a, "audio_out_1", b, "audio_in_1", 1.0);
    rig.ui.send(&Msg::NodeFeedback {
        source_urn: b,
        sink_urn: a,
        feedback: true,
    });
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            matches!(ev, UiEvent::Msg(Msg::NodeFeedback { feedback: true, .. }))
        });
    }
    connect(&mut rig, b, "audio_out_1", a, "audio_in_1", 1.0);
    connect(&mut rig, b, "audio_out_1", snk, "audio_in_1", 1.0);

    // With constant 1.0 input: out(n) = 1 + out(n-1), starting at 1.
    let ones = vec![1.0f32; NFRAMES as usize];
    let silence = vec![0.0f32; NFRAMES as usize];
    let mut expected = 1.0f32;
    for _ in 0..4 {
        let (out_l, _) = run_period(&mut rig.dsp, &ones, &silence, &[]);
        assert_eq!(out_l[0], expected);
        assert_eq!(out_l[NFRAMES as usize - 1], expected);
        expected += 1.0;
    }
}

#[test]
fn session_roundtrip_restores_port_values() {
    let tmp = tempfile::tempdir().unwrap();
    let bundle = tmp.path().join("session.synthpod");

    let gain_port_index;
    {
        let mut rig = rig();
        let st = add_module(&mut rig, &stereo_uri());
        gain_port_index = 4u32;
        rig.ui.write_port_float(st, gain_port_index, 0.25);
        rig.ui.send(&Msg::BundleSave {
            path: bundle.display().to_string(),
        });
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            matches!(ev, UiEvent::Msg(Msg::Ack { .. }))
        });
    }

    // Fresh engine, load, and read the port back via a subscription.
    let mut rig = rig();
    rig.ui.send(&Msg::BundleLoad {
        path: bundle.display().to_string(),
    });
    let mut st = 0;
    {
        let stereo = stereo_uri();
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            if let UiEvent::Msg(Msg::ModuleAdded {
                urn, plugin_uri, ..
            }) = ev
                && *plugin_uri == stereo
            {
                st = *urn;
            }
            matches!(ev, UiEvent::Msg(Msg::Ack { .. }))
        });
    }
    assert_ne!(st, 0);

    let regs = rig.ui.regs.clone();
    rig.ui.send(&Msg::SubAdd {
        urn: st,
        symbol: "gain".to_string(),
        protocol: regs.protocol.float_protocol,
    });
    let mut value = f32::NAN;
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            if let UiEvent::PortFloat {
                urn,
                index,
                value: v,
            } = ev
                && *urn == st
                && *index == gain_port_index
            {
                value = *v;
                return true;
            }
            false
        });
    }
    assert_eq!(value, 0.25);
}

#[test]
fn midi_learn_locks_and_writes() {
    let mut rig = rig();
    let st = add_module(&mut rig, &stereo_uri());

    let mut mapping = AutomationMapping::midi(
        AutoSink::Port {
            urn: st,
            symbol: "gain".to_string(),
        },
        -1,
        -1,
    );
    mapping.learning = true;
    mapping.source_range = (0.0, 127.0);
    mapping.sink_range = (0.0, 1.0);
    rig.ui.send(&Msg::AutoAdd(mapping));
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            matches!(ev, UiEvent::Msg(Msg::AutoAdd(m)) if m.learning)
        });
    }

    // Inject CC ch=3 ctl=74 val=64 through the external event stream.
    let regs = rig.ui.regs.clone();
    let mut midi_in = vec![0u8; 256];
    atom::init_sequence(&mut midi_in, false, regs.atom.sequence);
    assert!(atom::sequence_append(
        &mut midi_in,
        0,
        regs.midi.midi_event,
        &[0xb3, 74, 64],
    ));

    let silence = vec![0.0f32; NFRAMES as usize];
    let _ = run_period(&mut rig.dsp, &silence, &silence, &midi_in);

    // The learn report comes back as an automationList echo locked to
    // (channel 3, controller 74).
    let mut locked = false;
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            if let UiEvent::Msg(Msg::AutoAdd(m)) = ev
                && !m.learning
                && m.midi_channel == 3
                && m.midi_controller == 74
            {
                locked = true;
            }
            locked
        });
    }

    // And the port took the remapped value 64/127.
    rig.ui.send(&Msg::SubAdd {
        urn: st,
        symbol: "gain".to_string(),
        protocol: regs.protocol.float_protocol,
    });
    let mut value = f32::NAN;
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            if let UiEvent::PortFloat { urn, index, value: v } = ev
                && *urn == st
                && *index == 4
            {
                value = *v;
                return true;
            }
            false
        });
    }
    approx::assert_relative_eq!(value, 64.0 / 127.0, max_relative = 1e-4);
}

#[test]
fn subscription_emits_once_per_period_then_stops() {
    let mut rig = rig();
    let snk = rig.sink_urn;
    let regs = rig.ui.regs.clone();

    rig.ui.send(&Msg::SubAdd {
        urn: snk,
        symbol: "audio_in_1".to_string(),
        protocol: regs.protocol.peak_protocol,
    });
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            matches!(ev, UiEvent::Msg(Msg::SubAdd { .. }))
        });
    }

    // Exactly one peak notification per period once installed.
    let silence = vec![0.0f32; NFRAMES as usize];
    let mut seen_any = 0usize;
    for _ in 0..4 {
        let _ = run_period(&mut rig.dsp, &silence, &silence, &[]);
        let peaks = rig
            .ui
            .poll()
            .into_iter()
            .filter(|ev| matches!(ev, UiEvent::PortPeak { urn, .. } if *urn == snk))
            .count();
        assert!(peaks <= 1);
        seen_any += peaks;
    }
    assert!(seen_any >= 3);

    rig.ui.send(&Msg::SubRemove {
        urn: snk,
        symbol: "audio_in_1".to_string(),
        protocol: regs.protocol.peak_protocol,
    });
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            matches!(ev, UiEvent::Msg(Msg::SubRemove { .. }))
        });
    }
    // Drain anything in flight, then confirm silence.
    let _ = rig.ui.poll();
    for _ in 0..3 {
        let _ = run_period(&mut rig.dsp, &silence, &silence, &[]);
    }
    let peaks = rig
        .ui
        .poll()
        .into_iter()
        .filter(|ev| matches!(ev, UiEvent::PortPeak { .. }))
        .count();
    assert_eq!(peaks, 0);
}

#[test]
fn preset_save_and_load_through_the_store() {
    let mut rig = rig();
    let st = add_module(&mut rig, &stereo_uri());

    rig.ui.write_port_float(st, 4, 2.5);
    rig.ui.send(&Msg::ModulePresetSave {
        urn: st,
        label: "loud".to_string(),
    });
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            matches!(ev, UiEvent::Msg(Msg::ModulePresetSave { .. }))
        });
    }

    let store = PresetStore::with_root(rig._tmp.path());
    let presets = store.list(&stereo_uri());
    assert_eq!(presets.len(), 1);
    assert_eq!(presets[0].label, "loud");

    // Reset the port, then apply the preset and observe the restore.
    rig.ui.write_port_float(st, 4, 1.0);
    rig.ui.send(&Msg::ModulePresetLoad {
        urn: st,
        preset_uri: presets[0].uri.clone(),
    });
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            matches!(ev, UiEvent::Msg(Msg::ModulePresetLoad { .. }))
        });
    }

    let regs = rig.ui.regs.clone();
    rig.ui.send(&Msg::SubAdd {
        urn: st,
        symbol: "gain".to_string(),
        protocol: regs.protocol.float_protocol,
    });
    let mut value = f32::NAN;
    {
        let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
        pump_until(dsp, ui, |ev| {
            if let UiEvent::PortFloat { urn, value: v, .. } = ev
                && *urn == st
            {
                value = *v;
                return true;
            }
            false
        });
    }
    assert_eq!(value, 2.5);
}

#[test]
fn type_mismatch_is_answered_with_an_error() {
    let mut rig = rig();
    let (src, snk) = (rig.source_urn, rig.sink_urn);
    rig.ui.send(&Msg::ConnAdd {
        source_urn: src,
        source_symbol: "audio_out_1".to_string(),
        sink_urn: snk,
        sink_symbol: "cv_in_1".to_string(),
        gain: 1.0,
    });
    let (dsp, ui) = (&mut rig.dsp, &mut rig.ui);
    pump_until(dsp, ui, |ev| {
        matches!(ev, UiEvent::Msg(Msg::ErrorReply { .. }))
    });
}

#[test]
fn deterministic_outputs_across_engines() {
    let total = NFRAMES as usize * 4;
    let noise: Vec<f32> = (0..total)
        .map(|i| ((i as f32 * 12.9898).sin() * 43758.547).fract())
        .collect();

    let render = || -> Vec<f32> {
        let mut rig = rig();
        let (src, snk) = (rig.source_urn, rig.sink_urn);
        let st = add_module(&mut rig, &stereo_uri());
        connect(&mut rig, src, "audio_out_1", st, "audio_in_1", 0.9);
        connect(&mut rig, st, "audio_out_1", snk, "audio_in_1", 0.7);

        let silence = vec![0.0f32; NFRAMES as usize];
        let mut out = Vec::with_capacity(total);
        for chunk in noise.chunks(NFRAMES as usize) {
            let (out_l, _) = run_period(&mut rig.dsp, chunk, &silence, &[]);
            out.extend_from_slice(&out_l);
        }
        out
    };

    let first = render();
    let second = render();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
