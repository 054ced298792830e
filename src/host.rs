//! Terminal host context.
//!
//! Owns the three stream subsystems and wires them together: flushed
//! output is fed to the mouse-mode parser and to the detector registry,
//! and a positive detection switches the terminal to agent flush timing.
//! Subsystems never reach into each other; everything goes through here.

use crate::buffer::{BufferConfigPatch, BufferEvent, OutputBuffer};
use crate::error::HostError;
use crate::mouse::{MouseTracker, WheelEvent, WheelOutcome};
use crate::registry::PluginRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Emitted when an agent is first detected on a terminal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentEvent {
    pub terminal_id: String,
    pub agent_type: String,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// An agent known to be running on a terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPresence {
    pub agent_type: String,
    pub confidence: f64,
    pub detected_at_ms: u64,
}

pub struct TerminalHost {
    buffer: OutputBuffer,
    registry: Arc<PluginRegistry>,
    mouse: MouseTracker,
    agents: Mutex<HashMap<String, AgentPresence>>,
}

impl TerminalHost {
    pub fn new(buffer: OutputBuffer, registry: Arc<PluginRegistry>, mouse: MouseTracker) -> Self {
        Self {
            buffer,
            registry,
            mouse,
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffer(&self) -> &OutputBuffer {
        &self.buffer
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn mouse(&self) -> &MouseTracker {
        &self.mouse
    }

    /// Flush and overflow notifications from the output buffer
    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.buffer.subscribe()
    }

    pub fn open_terminal(
        &self,
        terminal_id: &str,
        patch: Option<BufferConfigPatch>,
    ) -> Result<(), HostError> {
        self.buffer.initialize_buffer(terminal_id, patch)?;
        Ok(())
    }

    /// Raw process output. Returns `false` when the write overflowed the buffer.
    pub fn write_output(&self, terminal_id: &str, data: &str) -> Result<bool, HostError> {
        Ok(self.buffer.write(terminal_id, data)?)
    }

    /// Run a flushed chunk through mouse-mode parsing and agent detection.
    ///
    /// Returns an event only on the transition from no agent to agent; later
    /// detections on the same terminal are ignored until the agent disconnects.
    pub fn process_flushed(
        &self,
        terminal_id: &str,
        data: &str,
    ) -> Result<Option<AgentEvent>, HostError> {
        self.mouse.process_output(terminal_id, data);

        if self.lock_agents().contains_key(terminal_id) {
            return Ok(None);
        }

        let Some(best) = self.registry.detect_all(terminal_id, data)?.into_iter().next() else {
            return Ok(None);
        };
        let agent_type = best.agent_type.clone().unwrap_or_default();

        {
            let mut agents = self.lock_agents();
            if agents.contains_key(terminal_id) {
                return Ok(None);
            }
            agents.insert(
                terminal_id.to_string(),
                AgentPresence {
                    agent_type: agent_type.clone(),
                    confidence: best.confidence,
                    detected_at_ms: now_ms(),
                },
            );
        }

        self.buffer.on_agent_detected(terminal_id)?;
        info!(
            "Detected agent {} on {} (confidence {:.2})",
            agent_type, terminal_id, best.confidence
        );
        Ok(Some(AgentEvent {
            terminal_id: terminal_id.to_string(),
            agent_type,
            confidence: best.confidence,
            metadata: best.metadata,
        }))
    }

    /// Forget the terminal's agent and return to the base flush interval
    pub fn agent_disconnected(&self, terminal_id: &str) -> Result<Option<AgentPresence>, HostError> {
        let presence = self.lock_agents().remove(terminal_id);
        self.buffer.on_agent_disconnected(terminal_id)?;
        if let Some(ref p) = presence {
            info!("Agent {} disconnected from {}", p.agent_type, terminal_id);
        }
        Ok(presence)
    }

    pub fn handle_wheel(&self, terminal_id: &str, event: WheelEvent) -> WheelOutcome {
        self.mouse.handle_wheel(terminal_id, event)
    }

    pub fn agent(&self, terminal_id: &str) -> Option<AgentPresence> {
        self.lock_agents().get(terminal_id).cloned()
    }

    /// Tear down one terminal. Returns output that was still pending.
    pub fn close_terminal(&self, terminal_id: &str) -> Result<String, HostError> {
        let remaining = self.buffer.dispose_buffer(terminal_id)?;
        self.mouse.dispose_terminal(terminal_id);
        self.lock_agents().remove(terminal_id);
        debug!("Closed terminal {}", terminal_id);
        Ok(remaining)
    }

    /// Dispose every subsystem. Safe to call more than once.
    pub fn dispose(&self) {
        self.buffer.dispose();
        self.mouse.dispose();
        self.registry.dispose();
        self.lock_agents().clear();
    }

    fn lock_agents(&self) -> MutexGuard<'_, HashMap<String, AgentPresence>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, AGENT_FLUSH_INTERVAL_MS, DEFAULT_FLUSH_INTERVAL_MS};
    use crate::detector::builtin_detectors;
    use crate::error::BufferError;
    use crate::mouse::{GeometrySource, GridGeometry, InputSink, ScrollSurface};
    use crate::scheduler::ManualScheduler;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        input: Mutex<Vec<Vec<u8>>>,
        native_scroll: Mutex<Vec<bool>>,
    }

    impl InputSink for Recorder {
        fn send_input(&self, _terminal_id: &str, data: &[u8]) {
            self.input.lock().unwrap().push(data.to_vec());
        }
    }

    impl GeometrySource for Recorder {
        fn geometry(&self, _terminal_id: &str) -> Option<GridGeometry> {
            Some(GridGeometry {
                columns: 80,
                rows: 24,
                pixel_width: 800.0,
                pixel_height: 480.0,
            })
        }
    }

    impl ScrollSurface for Recorder {
        fn set_native_scroll(&self, _terminal_id: &str, enabled: bool) {
            self.native_scroll.lock().unwrap().push(enabled);
        }
    }

    async fn host() -> (TerminalHost, Arc<ManualScheduler>, Arc<Recorder>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let recorder = Arc::new(Recorder::default());
        let registry = Arc::new(PluginRegistry::default());
        for detector in builtin_detectors().unwrap() {
            registry.register(Arc::new(detector)).unwrap();
        }
        registry.activate_all().await.unwrap();

        let host = TerminalHost::new(
            OutputBuffer::new(scheduler.clone(), BufferConfig::default()),
            registry,
            MouseTracker::new(recorder.clone(), recorder.clone(), recorder.clone()),
        );
        (host, scheduler, recorder)
    }

    #[tokio::test]
    async fn test_detection_switches_to_agent_interval() {
        let (host, scheduler, _) = host().await;
        let mut events = host.subscribe();
        host.open_terminal("t1", None).unwrap();
        host.write_output("t1", "Welcome to Claude Code!\r\n").unwrap();

        scheduler.tick();
        let BufferEvent::Flushed { terminal_id, data, .. } = events.recv().await.unwrap() else {
            panic!("expected a flush event");
        };

        let event = host.process_flushed(&terminal_id, &data).unwrap().unwrap();
        assert_eq!(event.agent_type, "claude");
        assert_eq!(
            scheduler.intervals(),
            vec![Duration::from_millis(AGENT_FLUSH_INTERVAL_MS)]
        );
        assert_eq!(host.agent("t1").unwrap().agent_type, "claude");

        // Only the first detection produces an event
        assert!(host.process_flushed("t1", &data).unwrap().is_none());

        let presence = host.agent_disconnected("t1").unwrap();
        assert!(presence.is_some());
        assert_eq!(
            scheduler.intervals(),
            vec![Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS)]
        );
        assert!(host.agent("t1").is_none());
    }

    #[tokio::test]
    async fn test_plain_output_detects_nothing() {
        let (host, _, _) = host().await;
        host.open_terminal("t1", None).unwrap();
        assert!(host.process_flushed("t1", "ls -la\r\ntotal 0\r\n").unwrap().is_none());
        assert!(host.agent("t1").is_none());
    }

    #[tokio::test]
    async fn test_flushed_output_drives_mouse_tracking() {
        let (host, _, recorder) = host().await;
        host.open_terminal("t1", None).unwrap();

        let wheel = WheelEvent {
            delta_y: 1.0,
            client_x: 15.0,
            client_y: 25.0,
        };
        assert_eq!(host.handle_wheel("t1", wheel), WheelOutcome::Native);

        host.process_flushed("t1", "\x1b[?1000h\x1b[?1006h").unwrap();
        assert_eq!(host.handle_wheel("t1", wheel), WheelOutcome::Intercepted);
        assert_eq!(
            recorder.input.lock().unwrap().as_slice(),
            &[b"\x1b[<65;2;2M".to_vec()]
        );

        host.close_terminal("t1").unwrap();
        assert_eq!(recorder.native_scroll.lock().unwrap().as_slice(), &[false, true]);
    }

    #[tokio::test]
    async fn test_close_returns_pending_output() {
        let (host, _, _) = host().await;
        host.write_output("t1", "partial").unwrap();
        assert_eq!(host.close_terminal("t1").unwrap(), "partial");
        assert_eq!(host.close_terminal("t1").unwrap(), "");
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (host, scheduler, _) = host().await;
        host.open_terminal("t1", None).unwrap();

        host.dispose();
        host.dispose();
        assert_eq!(scheduler.active_count(), 0);
        assert!(host.registry().is_disposed());
        assert!(matches!(
            host.write_output("t1", "late"),
            Err(HostError::Buffer(BufferError::Disposed))
        ));
    }
}
