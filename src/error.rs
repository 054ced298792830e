//! Error types for the stream-processing subsystems.
//!
//! Lifecycle violations are surfaced to the caller. Protocol errors stay
//! inside the mouse module and are logged where they occur.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the output buffer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The buffer manager was disposed
    #[error("output buffer has been disposed")]
    Disposed,
    /// Flush interval must be at least one millisecond
    #[error("invalid flush interval: {0}ms")]
    InvalidInterval(u64),
}

/// Errors raised by the detector registry
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    #[error("plugin registry has been disposed")]
    Disposed,
    #[error("plugin already registered: {0}")]
    AlreadyRegistered(String),
    #[error("plugin not found: {0}")]
    NotFound(String),
    #[error("plugin {id} depends on {dependency}, which is not active")]
    DependencyNotActive { id: String, dependency: String },
    #[error("plugin {id} timed out after {timeout:?} during {phase}")]
    Timeout {
        id: String,
        phase: &'static str,
        timeout: Duration,
    },
    #[error("plugin {id} failed to activate: {message}")]
    ActivationFailed { id: String, message: String },
    #[error("plugin {id} failed to deactivate: {message}")]
    DeactivationFailed { id: String, message: String },
    #[error("invalid confidence threshold {0}, expected a value in [0, 1]")]
    InvalidThreshold(f64),
}

/// Malformed terminal protocol input. Never crosses the mouse module boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid private mode parameter: {0:?}")]
    InvalidParameter(String),
    #[error("degenerate terminal geometry: {columns}x{rows}")]
    DegenerateGeometry { columns: u16, rows: u16 },
}

/// Errors surfaced by [`crate::host::TerminalHost`]
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
}
