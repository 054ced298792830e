//! Protocol types for the control socket and the JSON event stream.
//!
//! Requests and responses are newline-delimited JSON objects tagged by
//! `type`. Events written to stderr with `--json-output` are tagged by
//! `event`, matching the buffer's own notifications.

use crate::host::{AgentEvent, AgentPresence};
use crate::mouse::WheelOutcome;
use crate::registry::{PluginConfig, PluginConfigPatch, PluginStatus};
use serde::{Deserialize, Serialize};

/// Message sent to the control socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Pointer wheel over the terminal, pixels relative to the terminal element
    Wheel {
        delta_y: f64,
        client_x: f64,
        client_y: f64,
    },
    /// Resize the PTY and the wheel geometry
    Resize {
        rows: u16,
        cols: u16,
        #[serde(default)]
        pixel_width: Option<u16>,
        #[serde(default)]
        pixel_height: Option<u16>,
    },
    /// Merge configuration into one detector plugin
    ConfigurePlugin {
        id: String,
        #[serde(default)]
        config: PluginConfigPatch,
    },
    /// Change the base flush interval
    SetFlushInterval { interval_ms: u64 },
    /// The agent on this terminal went away
    AgentDisconnected,
    /// Query current status
    Status,
    /// Graceful shutdown request
    Shutdown,
}

/// Response sent back through the control socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Wheel {
        outcome: WheelOutcome,
    },
    Resized {
        rows: u16,
        cols: u16,
    },
    PluginConfigured {
        id: String,
        config: PluginConfig,
    },
    FlushIntervalSet {
        interval_ms: u64,
    },
    AgentCleared {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
    },
    Status(StatusInfo),
    /// Shutdown acknowledged
    ShutdownAck,
    Error {
        message: String,
    },
}

/// Snapshot answered to a `status` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub terminal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentPresence>,
    /// Active mouse reporting modes
    pub mouse_modes: Vec<u16>,
    pub intercepting_wheel: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_interval_ms: Option<u64>,
    pub pending_chars: usize,
    pub flush_count: u64,
    pub plugins: Vec<PluginStatus>,
}

/// Events written to stderr as JSON lines
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum HostEvent {
    #[serde(rename = "agent.detected")]
    AgentDetected(AgentEvent),
    #[serde(rename = "agent.disconnected")]
    AgentDisconnected {
        terminal_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
    },
    #[serde(rename = "scroll.mode")]
    ScrollMode { terminal_id: String, native: bool },
    #[serde(rename = "terminal.exited")]
    TerminalExited {
        terminal_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
}
