//! Property tests for the engine invariants.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use synthpod::automation::remap;
use synthpod::error::Error;
use synthpod::graph::module::{Module, fresh_urn_uri};
use synthpod::graph::scheduler::schedule;
use synthpod::graph::{AudioSettings, ConnectOutcome, Graph};
use synthpod::plugin::db::{builtin_spec, monoatom_uri, sink_uri, source_uri, stereo_uri};
use synthpod::regs::Regs;
use synthpod::ring;
use synthpod::urid::{Urid, UridMap};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    graph: Graph,
    urns: Vec<Urid>,
    _coll: basedrop::Collector,
}

/// A graph holding source, sink, stereo and monoatom modules.
fn fixture() -> Fixture {
    let urid = UridMap::new();
    let regs = Regs::new(&urid);
    let coll = basedrop::Collector::new();
    let mut graph = Graph::new(AudioSettings::default());
    let mut urns = Vec::new();
    for uri in [source_uri(), sink_uri(), stereo_uri(), monoatom_uri()] {
        let spec = builtin_spec(&uri).unwrap();
        let module = Module::new(
            fresh_urn_uri(),
            spec,
            48000.0,
            256,
            4096,
            &urid,
            &regs,
            &coll.handle(),
        )
        .unwrap();
        if module.is_system_source() {
            graph.source_urn = module.urn;
        } else if module.is_system_sink() {
            graph.sink_urn = module.urn;
        }
        urns.push(module.urn);
        graph.insert_module(module);
    }
    Fixture {
        graph,
        urns,
        _coll: coll,
    }
}

/// Reference cycle check: DFS reachability over the edge list.
fn has_cycle(n: usize, edges: &[(usize, usize)]) -> bool {
    let mut adj = vec![Vec::new(); n];
    for &(a, b) in edges {
        adj[a].push(b);
    }
    // 0 = unvisited, 1 = on stack, 2 = done
    let mut state = vec![0u8; n];
    fn visit(v: usize, adj: &[Vec<usize>], state: &mut [u8]) -> bool {
        state[v] = 1;
        for &w in &adj[v] {
            if state[w] == 1 || (state[w] == 0 && visit(w, adj, state)) {
                return true;
            }
        }
        state[v] = 2;
        false
    }
    (0..n).any(|v| state[v] == 0 && visit(v, &adj, &mut state))
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    /// Linear remap: formula within 1 ULP inside the range, clipping at
    /// the boundaries, degenerate ranges well-behaved.
    #[test]
    fn remap_matches_formula(
        a in -1000.0f64..1000.0,
        span_src in 0.001f64..2000.0,
        c in -1000.0f64..1000.0,
        span_dst in 0.001f64..2000.0,
        t in 0.0f64..1.0,
    ) {
        let b = a + span_src;
        let d = c + span_dst;
        let v = a + t * (b - a);

        let got = remap(v, (a, b), (c, d));
        let expected = c + (v - a) * (d - c) / (b - a);
        let tolerance = expected.abs().max(1.0) * f64::EPSILON * 2.0;
        prop_assert!((got - expected.clamp(c, d)).abs() <= tolerance,
            "remap({v}) = {got}, expected {expected}");

        // Clipping holds beyond the source range.
        prop_assert!(remap(b + 1.0, (a, b), (c, d)) <= d);
        prop_assert!(remap(a - 1.0, (a, b), (c, d)) >= c);
    }

    /// A connection request is accepted exactly when types match, the atom
    /// subtypes overlap and the directions are output -> input.
    #[test]
    fn connection_type_safety(
        src_mod in 0usize..4,
        src_port in 0usize..5,
        snk_mod in 0usize..4,
        snk_port in 0usize..5,
        gain in 0.0f32..2.0,
    ) {
        let mut fx = fixture();
        let source_urn = fx.urns[src_mod];
        let sink_urn = fx.urns[snk_mod];

        let source = fx.graph.module(source_urn).unwrap().spec.clone();
        let sink = fx.graph.module(sink_urn).unwrap().spec.clone();
        prop_assume!(src_port < source.ports.len() && snk_port < sink.ports.len());
        prop_assume!(source_urn != sink_urn);

        let sp = &source.ports[src_port];
        let kp = &sink.ports[snk_port];

        let legal = sp.direction == synthpod::plugin::PortDirection::Output
            && kp.direction == synthpod::plugin::PortDirection::Input
            && sp.ty == kp.ty
            && (sp.ty != synthpod::plugin::PortType::Atom
                || sp.atom_kinds.intersects(kp.atom_kinds));

        let result = fx.graph.connect(source_urn, &sp.symbol, sink_urn, &kp.symbol, gain);
        match result {
            Ok(_) => prop_assert!(legal, "accepted illegal {}/{}", sp.symbol, kp.symbol),
            Err(Error::Constraint(_)) => prop_assert!(!legal),
            Err(other) => prop_assert!(false, "unexpected error kind: {other}"),
        }
    }

    /// The scheduler finds an order exactly when the (non-feedback) edge
    /// set is acyclic, and the order respects every dependency.
    #[test]
    fn scheduler_iff_dag(
        n in 1usize..8,
        raw_edges in proptest::collection::vec((0usize..8, 0usize..8), 0..20),
    ) {
        let urns: Vec<Urid> = (1..=n as u32).map(|i| i * 10).collect();
        let edges: Vec<(usize, usize)> = raw_edges
            .into_iter()
            .filter(|&(a, b)| a < n && b < n)
            .collect();
        let dep_edges: Vec<(Urid, Urid)> =
            edges.iter().map(|&(a, b)| (urns[a], urns[b])).collect();

        match schedule(&urns, &dep_edges, 2) {
            Ok(plan) => {
                prop_assert!(!has_cycle(n, &edges));
                prop_assert_eq!(plan.order.len(), n);
                // Every dependency is honoured in the total order.
                let pos = |u: Urid| plan.order.iter().position(|&x| x == u).unwrap();
                for &(s, t) in &dep_edges {
                    prop_assert!(pos(s) < pos(t));
                }
                // The barrier partition covers each module exactly once.
                let mut seen = HashSet::new();
                for barrier in &plan.barriers {
                    for slot in &barrier.slots {
                        for &u in slot {
                            prop_assert!(seen.insert(u));
                        }
                    }
                }
                prop_assert_eq!(seen.len(), n);
            }
            Err(_) => prop_assert!(has_cycle(n, &edges)),
        }
    }

    /// Adding an existing edge only updates its gain; removing a missing
    /// edge is a no-op.
    #[test]
    fn connection_idempotence(g1 in 0.0f32..2.0, g2 in 0.0f32..2.0) {
        let mut fx = fixture();
        let (src, snk) = (fx.graph.source_urn, fx.graph.sink_urn);

        let first = fx.graph.connect(src, "audio_out_1", snk, "audio_in_1", g1).unwrap();
        prop_assert_eq!(first, ConnectOutcome::Created);
        let second = fx.graph.connect(src, "audio_out_1", snk, "audio_in_1", g2).unwrap();
        prop_assert_eq!(second, ConnectOutcome::GainUpdated);

        let edges: usize = fx.graph.mod_conns.iter().map(|mc| mc.conns.len()).sum();
        prop_assert_eq!(edges, 1);
        prop_assert_eq!(fx.graph.mod_conns[0].conns[0].gain, g2);

        // Removing an edge that is not there changes nothing.
        prop_assert!(!fx.graph.disconnect(src, "audio_out_2", snk, "audio_in_2").unwrap());
        let edges: usize = fx.graph.mod_conns.iter().map(|mc| mc.conns.len()).sum();
        prop_assert_eq!(edges, 1);
    }

    /// A failed reservation leaves the ring unchanged and delivery stays
    /// FIFO over the accepted messages.
    #[test]
    fn ring_drops_cleanly(
        messages in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..40), 1..30),
    ) {
        let (mut tx, mut rx) = ring::ring(128);
        let mut expected = Vec::new();
        let mut scratch = Vec::new();

        for (i, msg) in messages.iter().enumerate() {
            // Interleave sends and receives to move the wrap point around.
            if i % 3 == 2
                && let Some(h) = rx.recv(&mut scratch) {
                    let front: (u32, Vec<u8>) = expected.remove(0);
                    prop_assert_eq!(h.type_urid, front.0);
                    prop_assert_eq!(&scratch, &front.1);
                }
            if tx.send(i as u32 + 1, msg) {
                expected.push((i as u32 + 1, msg.clone()));
            }
        }
        while let Some(h) = rx.recv(&mut scratch) {
            let front: (u32, Vec<u8>) = expected.remove(0);
            prop_assert_eq!(h.type_urid, front.0);
            prop_assert_eq!(&scratch, &front.1);
        }
        prop_assert!(expected.is_empty());
    }

    /// Bundle round-trip: load(save(graph)) reproduces the modules, the
    /// port edges with their gains, and the automation mappings.
    #[test]
    fn bundle_roundtrip(
        gain in 0.01f32..2.0,
        value in 0.0f32..4.0,
        x in -100.0f32..100.0,
        channel in -1i32..16,
        controller in -1i32..128,
    ) {
        let mut fx = fixture();
        let (src, snk) = (fx.graph.source_urn, fx.graph.sink_urn);
        let st = *fx.graph.modules.iter()
            .find(|(_, m)| m.spec.uri == stereo_uri()).unwrap().0;

        fx.graph.connect(src, "audio_out_1", st, "audio_in_1", gain).unwrap();
        fx.graph.connect(st, "audio_out_1", snk, "audio_in_1", 1.0).unwrap();
        fx.graph.module_mut(st).unwrap().set_port_value(4, value);
        fx.graph.module_mut(st).unwrap().position = (x, -x);
        fx.graph.add_automation(synthpod::automation::AutomationMapping::midi(
            synthpod::automation::AutoSink::Port { urn: st, symbol: "gain".into() },
            channel,
            controller,
        )).unwrap();

        let urid = UridMap::new();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("prop.synthpod");
        synthpod::state::save_bundle(&path, &fx.graph, &urid, &Default::default()).unwrap();
        let loaded = synthpod::state::load_bundle(&path).unwrap();

        prop_assert_eq!(loaded.modules.len(), 4);
        prop_assert_eq!(loaded.conns.len(), 2);

        let st_uri = fx.graph.module(st).unwrap().urn_uri.clone();
        let conn = loaded.conns.iter()
            .find(|c| c.sink_symbol == "audio_in_1" && c.sink_urn_uri != st_uri)
            .unwrap();
        prop_assert_eq!(conn.gain, 1.0);
        let conn = loaded.conns.iter().find(|c| c.sink_urn_uri == st_uri).unwrap();
        prop_assert_eq!(conn.gain, gain);

        let lm = loaded.modules.iter().find(|m| m.urn_uri == st_uri).unwrap();
        prop_assert_eq!(lm.position.0, x);
        let default = builtin_spec(&stereo_uri()).unwrap().port_by_symbol("gain").unwrap().default;
        if value != default {
            prop_assert!(lm.port_values.contains(&("gain".to_string(), value)));
        }

        prop_assert_eq!(loaded.automations.len(), 1);
        prop_assert_eq!(loaded.automations[0].midi_channel, channel);
        prop_assert_eq!(loaded.automations[0].midi_controller, controller);
    }
}
