//! Plugin hosting layer.
//!
//! - `types` - port/param/plugin descriptor types
//! - `db` - read-only metadata database interface (lilv-backed + builtins)
//! - `ffi` - C ABI structures beyond what `lv2_raw` covers
//! - `host` - instance lifecycle: dlopen descriptor hosting and builtins

pub mod db;
pub mod ffi;
pub mod host;
pub mod types;

pub use db::{BuiltinDb, LilvDb, PluginDb};
pub use host::{BuiltinKind, PluginHooks, PluginInstance, StateProp};
pub use types::*;
