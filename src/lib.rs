//! term-stream: terminal output streaming core.
//!
//! - [`buffer`]: per-terminal output batching with adaptive flush timing
//! - [`detector`] / [`registry`]: pattern-based agent detection plugins
//! - [`mouse`]: mouse-mode tracking and wheel-to-escape translation
//! - [`host`]: context object wiring the three together
//!
//! The remaining modules back the `term-stream` binary.

pub mod buffer;
pub mod config;
pub mod detector;
pub mod error;
pub mod host;
pub mod mouse;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod scheduler;
pub mod socket;

pub use buffer::{BufferConfig, BufferConfigPatch, BufferEvent, OutputBuffer};
pub use detector::{builtin_detectors, AgentSignature, DetectionResult, PatternDetector};
pub use error::{BufferError, HostError, PluginError};
pub use host::{AgentEvent, TerminalHost};
pub use mouse::{MouseTracker, WheelEvent, WheelOutcome};
pub use registry::{AgentPlugin, PluginConfig, PluginMetadata, PluginRegistry, PluginState};
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
