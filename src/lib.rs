//! Synthpod - a modular host for LV2-style audio and control plugins.
//!
//! The engine keeps a directed multigraph of plugin modules whose edges
//! carry audio, CV, control and typed event streams.  A realtime callback
//! ([`engine::DspState::process`]) walks the graph every period; a worker
//! thread owns plugin lifecycles and session state; controllers speak a
//! patch-based message protocol over lockless rings.
//!
//! ## Architecture
//!
//! - `urid` / `regs` - URI interning and the engine vocabulary
//! - `atom` - event sequences and tagged values
//! - `ring` - framed SPSC message rings between the threads
//! - `plugin` - metadata database, dlopen hosting, builtin modules
//! - `graph` - modules, ports, connections, the scheduler
//! - `engine` - realtime callback, worker thread, DSP helper pool
//! - `automation` - MIDI/OSC to parameter mappings
//! - `state` - session bundles and user presets
//! - `protocol` - the controller message vocabulary

pub mod atom;
pub mod automation;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod plugin;
pub mod protocol;
pub mod regs;
pub mod ring;
pub mod state;
pub mod urid;

pub use engine::{DspState, Engine, UiEvent, UiHandle};
pub use error::{Error, Result};
pub use graph::AudioSettings;
pub use protocol::Msg;
pub use urid::{Urid, UridMap};
