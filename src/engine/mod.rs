//! Engine assembly.
//!
//! [`Engine::new`] builds the session graph with its system source/sink,
//! compiles the initial DSP graph, wires the two ring pairs and spawns the
//! worker thread.  The audio driver takes the [`DspState`] and calls
//! `process` from its realtime thread; any controller (CLI, UI process,
//! test) talks through a [`UiHandle`].

pub mod compile;
pub mod pool;
pub mod rt;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use basedrop::{Collector, Shared, SharedCell};

pub use rt::{DspState, RtCounters};

use crate::error::{Error, Result};
use crate::graph::module::{Module, fresh_urn_uri};
use crate::graph::{AudioSettings, Graph};
use crate::plugin::db::{self, PluginDb};
use crate::protocol::{Msg, compact};
use crate::regs::Regs;
use crate::ring::{self, RingRx, RingTx};
use crate::state::preset::PresetStore;
use crate::urid::{Urid, UridMap};

/// Ring capacities in bytes.  Notifications carry whole atom sequences, so
/// the RT->UI ring is the widest.
const UI_TO_RT_RING: usize = 64 * 1024;
const RT_TO_UI_RING: usize = 256 * 1024;
const RT_TO_WORKER_RING: usize = 128 * 1024;
const WORKER_TO_RT_RING: usize = 128 * 1024;

pub struct Engine {
    dsp: Option<DspState>,
    ui: Option<UiHandle>,
    worker_thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    pub urid: Arc<UridMap>,
    pub regs: Arc<Regs>,
    pub settings: AudioSettings,
}

impl Engine {
    /// Construct an engine over the given plugin database.  The preset
    /// store defaults to the user data dir; tests inject their own root.
    pub fn new(settings: AudioSettings, plugin_db: Arc<dyn PluginDb>) -> Result<Engine> {
        Self::with_preset_store(settings, plugin_db, PresetStore::new())
    }

    pub fn with_preset_store(
        settings: AudioSettings,
        plugin_db: Arc<dyn PluginDb>,
        presets: PresetStore,
    ) -> Result<Engine> {
        let urid = UridMap::new();
        let regs = Arc::new(Regs::new(&urid));
        let coll = Collector::new();

        // The session always starts with the system source and sink.
        let mut graph = Graph::new(settings);
        for uri in [db::source_uri(), db::sink_uri()] {
            let spec = plugin_db
                .describe(&uri)
                .ok_or_else(|| Error::lookup(format!("database lacks builtin {uri}")))?;
            let module = Module::new(
                fresh_urn_uri(),
                spec,
                settings.sample_rate as f64,
                settings.period_size,
                crate::graph::port::DEFAULT_ATOM_CAPACITY as u32,
                &urid,
                &regs,
                &coll.handle(),
            )?;
            if module.is_system_source() {
                graph.source_urn = module.urn;
            } else {
                graph.sink_urn = module.urn;
            }
            graph.insert_module(module);
        }

        let compiled = compile::compile(&graph, &regs, settings.period_size, 0)?;
        let cell = Arc::new(SharedCell::new(Shared::new(&coll.handle(), compiled)));

        let (ui_tx, rt_ui_rx) = ring::ring(UI_TO_RT_RING);
        let (rt_ui_tx, ui_rx) = ring::ring(RT_TO_UI_RING);
        let (rt_wk_tx, wk_rx) = ring::ring(RT_TO_WORKER_RING);
        let (wk_tx, rt_wk_rx) = ring::ring(WORKER_TO_RT_RING);

        let pool = pool::DspPool::new(settings.cpus_used);
        let dsp = DspState::new(
            cell.clone(),
            rt_ui_rx,
            rt_ui_tx,
            rt_wk_rx,
            rt_wk_tx,
            regs.clone(),
            pool,
            settings.sample_rate,
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = worker::WorkerCtx {
            graph,
            db: plugin_db,
            urid: urid.clone(),
            regs: regs.clone(),
            coll,
            cell,
            rx: wk_rx,
            tx: wk_tx,
            presets,
            shutdown: shutdown.clone(),
            rt_profile: dsp.profile.clone(),
            rt_counters: dsp.counters.clone(),
            bundle_path: None,
            generation: 0,
        };
        let worker_thread = std::thread::Builder::new()
            .name("synthpod-worker".to_string())
            .spawn(move || worker::run(ctx))
            .map_err(|e| Error::resource(format!("spawning worker: {e}")))?;

        Ok(Engine {
            dsp: Some(dsp),
            ui: Some(UiHandle {
                tx: ui_tx,
                rx: ui_rx,
                regs: regs.clone(),
                urid: urid.clone(),
                scratch: Vec::with_capacity(64 * 1024),
            }),
            worker_thread: Some(worker_thread),
            shutdown,
            urid,
            regs,
            settings,
        })
    }

    /// Hand the DSP state to the audio driver; callable once.
    pub fn take_dsp(&mut self) -> Option<DspState> {
        self.dsp.take()
    }

    /// Hand out the controller side; callable once.
    pub fn take_ui(&mut self) -> Option<UiHandle> {
        self.ui.take()
    }

    /// Stop the worker and wait for it.  Drop the [`DspState`] first so
    /// plugin teardown happens off any audio thread.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(t) = self.worker_thread.take() {
            t.thread().unpark();
            let _ = t.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

// ---------------------------------------------------------------------------
// Controller handle
// ---------------------------------------------------------------------------

/// Something a controller received from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Msg(Msg),
    PortFloat {
        urn: Urid,
        index: u32,
        value: f32,
    },
    PortPeak {
        urn: Urid,
        index: u32,
        period: u32,
        peak: f32,
    },
    PortAtom {
        urn: Urid,
        index: u32,
        data: Vec<u8>,
    },
}

/// The controller's end of the UI↔RT ring pair.
pub struct UiHandle {
    tx: RingTx,
    rx: RingRx,
    pub regs: Arc<Regs>,
    pub urid: Arc<UridMap>,
    scratch: Vec<u8>,
}

impl UiHandle {
    /// Send a request; `false` means the ring was full and the message was
    /// dropped (never blocks).
    pub fn send(&mut self, msg: &Msg) -> bool {
        let (verb, body) = msg.encode(&self.regs);
        self.tx.send(verb, &body)
    }

    /// Direct control-port write, applied by RT at the period boundary.
    pub fn write_port_float(&mut self, urn: Urid, index: u32, value: f32) -> bool {
        self.tx.send(
            self.regs.protocol.float_protocol,
            &compact::port_float(urn, index, value),
        )
    }

    /// Direct atom-port write; `data` is a whole atom (header + body).
    pub fn write_port_event(&mut self, urn: Urid, index: u32, data: &[u8]) -> bool {
        self.tx.send_parts(
            self.regs.protocol.event_transfer,
            &[&compact::port_event_header(urn, index), data],
        )
    }

    /// Drain everything the engine sent since the last poll.
    pub fn poll(&mut self) -> Vec<UiEvent> {
        let mut events = Vec::new();
        loop {
            let Some(header) = self.rx.recv(&mut self.scratch) else {
                break;
            };
            let verb = header.type_urid;
            if verb == self.regs.protocol.float_protocol {
                if let Some((urn, index, value)) = compact::parse_port_float(&self.scratch) {
                    events.push(UiEvent::PortFloat { urn, index, value });
                }
            } else if verb == self.regs.protocol.peak_protocol {
                if let Some((urn, index, period, peak)) =
                    compact::parse_port_peak(&self.scratch)
                {
                    events.push(UiEvent::PortPeak {
                        urn,
                        index,
                        period,
                        peak,
                    });
                }
            } else if verb == self.regs.protocol.event_transfer {
                if let Some((urn, index, data)) = compact::parse_port_event(&self.scratch) {
                    events.push(UiEvent::PortAtom {
                        urn,
                        index,
                        data: data.to_vec(),
                    });
                }
            } else {
                match Msg::decode(verb, &self.scratch, &self.regs) {
                    Ok(Some(msg)) => events.push(UiEvent::Msg(msg)),
                    Ok(None) => log::debug!("ui: skipping unknown verb {verb}"),
                    Err(err) => log::warn!("ui: malformed frame: {err}"),
                }
            }
        }
        events
    }
}
