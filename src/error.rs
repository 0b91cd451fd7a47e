//! Engine error taxonomy.
//!
//! Errors raised on the worker or UI threads carry context and propagate
//! with `?`.  The realtime thread never constructs these - RT faults are
//! counted in lock-free counters and surfaced as `patch:Error` messages
//! with a reason URID instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown module URN, plugin URI, port symbol or preset.
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// Type mismatch on a connection, a cycle without a feedback hint,
    /// or a value outside its declared range.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Ring full, buffer allocation failure, or file I/O trouble.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Plugin load/instantiation failure or a missing required feature.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Malformed patch message or an unknown property on a write.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether a retry may succeed (worker retries plugin loads once on
    /// transient resource errors).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Resource(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
