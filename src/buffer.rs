//! Adaptive output buffering.
//!
//! Batches process output per terminal and flushes it:
//! - on a repeating timer (one per terminal)
//! - immediately when pending output reaches `max_buffer_size`
//! - on explicit `flush` / `flush_all` / disposal
//!
//! While an agent is active on a terminal and adaptive buffering is enabled,
//! the timer runs at the faster agent rate.

use crate::error::BufferError;
use crate::scheduler::{CancelHandle, Scheduler, Task};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Flush interval used when nothing else is configured
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 16;
/// Flush interval while an agent is active
pub const AGENT_FLUSH_INTERVAL_MS: u64 = 8;
/// Pending characters that force an immediate flush
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 8192;
/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-terminal buffer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Base flush interval in milliseconds
    pub flush_interval_ms: u64,
    /// Pending size (in characters) that triggers an overflow flush
    pub max_buffer_size: usize,
    /// Whether agent activity may change the flush interval
    pub adaptive_buffering: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            adaptive_buffering: true,
        }
    }
}

/// Partial buffer configuration, merged field by field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfigPatch {
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_buffer_size: Option<usize>,
    #[serde(default)]
    pub adaptive_buffering: Option<bool>,
}

impl BufferConfig {
    /// Shallow merge; fields absent from the patch keep their value
    pub fn merge(&mut self, patch: &BufferConfigPatch) {
        if let Some(ms) = patch.flush_interval_ms {
            self.flush_interval_ms = ms;
        }
        if let Some(size) = patch.max_buffer_size {
            self.max_buffer_size = size;
        }
        if let Some(adaptive) = patch.adaptive_buffering {
            self.adaptive_buffering = adaptive;
        }
    }
}

/// Notifications published by the buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum BufferEvent {
    #[serde(rename = "buffer.flushed")]
    Flushed {
        terminal_id: String,
        data: String,
        size: usize,
    },
    #[serde(rename = "buffer.overflow")]
    Overflow {
        terminal_id: String,
        size: usize,
        max_size: usize,
    },
}

/// Flush statistics for one terminal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub flush_count: u64,
    pub total_flush_time: Duration,
    pub last_flush_at: Option<SystemTime>,
}

struct TerminalBuffer {
    config: BufferConfig,
    pending: Vec<String>,
    /// Pending length in characters
    pending_len: usize,
    timer: Option<CancelHandle>,
    timer_interval_ms: u64,
    timer_generation: u64,
    stats: BufferStats,
    agent_active: bool,
}

impl TerminalBuffer {
    fn effective_interval_ms(&self) -> u64 {
        if self.agent_active && self.config.adaptive_buffering {
            AGENT_FLUSH_INTERVAL_MS
        } else {
            self.config.flush_interval_ms
        }
    }
}

#[derive(Default)]
struct Inner {
    disposed: bool,
    terminals: HashMap<String, TerminalBuffer>,
}

/// Output buffer manager for all terminals
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
    scheduler: Arc<dyn Scheduler>,
    defaults: BufferConfig,
    events: broadcast::Sender<BufferEvent>,
    generation: AtomicU64,
}

impl OutputBuffer {
    /// Create a buffer manager. `defaults` applies to terminals created implicitly.
    pub fn new(scheduler: Arc<dyn Scheduler>, defaults: BufferConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            scheduler,
            defaults,
            events,
            generation: AtomicU64::new(0),
        }
    }

    /// Subscribe to flush and overflow notifications
    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.events.subscribe()
    }

    /// Create the buffer for a terminal, or merge `patch` into an existing one.
    pub fn initialize_buffer(
        &self,
        terminal_id: &str,
        patch: Option<BufferConfigPatch>,
    ) -> Result<(), BufferError> {
        let patch = patch.unwrap_or_default();
        if patch.flush_interval_ms == Some(0) {
            return Err(BufferError::InvalidInterval(0));
        }

        let mut inner = self.lock()?;
        match inner.terminals.get_mut(terminal_id) {
            Some(buffer) => {
                buffer.config.merge(&patch);
                debug!("Merged buffer config for {}: {:?}", terminal_id, buffer.config);
                self.retime(buffer, terminal_id);
            }
            None => {
                let mut config = self.defaults;
                config.merge(&patch);
                let buffer = self.new_terminal(terminal_id, config);
                inner.terminals.insert(terminal_id.to_string(), buffer);
                info!(
                    "Initialized output buffer for {} (interval {}ms, max {})",
                    terminal_id, config.flush_interval_ms, config.max_buffer_size
                );
            }
        }
        Ok(())
    }

    /// Append output. Returns `false` if the write triggered an overflow flush.
    pub fn write(&self, terminal_id: &str, data: &str) -> Result<bool, BufferError> {
        let mut inner = self.lock()?;
        let buffer = inner
            .terminals
            .entry(terminal_id.to_string())
            .or_insert_with(|| self.new_terminal(terminal_id, self.defaults));

        if data.is_empty() {
            return Ok(true);
        }

        buffer.pending.push(data.to_string());
        buffer.pending_len += data.chars().count();

        if buffer.pending_len >= buffer.config.max_buffer_size {
            debug!(
                "Buffer overflow for {}: {} >= {}",
                terminal_id, buffer.pending_len, buffer.config.max_buffer_size
            );
            let _ = self.events.send(BufferEvent::Overflow {
                terminal_id: terminal_id.to_string(),
                size: buffer.pending_len,
                max_size: buffer.config.max_buffer_size,
            });
            flush_terminal(buffer, terminal_id, &self.events);
            return Ok(false);
        }

        Ok(true)
    }

    /// Drain pending output for one terminal. Empty or unknown terminals yield `""`.
    pub fn flush(&self, terminal_id: &str) -> Result<String, BufferError> {
        let mut inner = self.lock()?;
        Ok(match inner.terminals.get_mut(terminal_id) {
            Some(buffer) => flush_terminal(buffer, terminal_id, &self.events),
            None => String::new(),
        })
    }

    /// Flush every terminal; terminals with nothing pending are omitted
    pub fn flush_all(&self) -> Result<HashMap<String, String>, BufferError> {
        let mut inner = self.lock()?;
        let mut flushed = HashMap::new();
        for (terminal_id, buffer) in inner.terminals.iter_mut() {
            let data = flush_terminal(buffer, terminal_id, &self.events);
            if !data.is_empty() {
                flushed.insert(terminal_id.clone(), data);
            }
        }
        Ok(flushed)
    }

    /// Set the base flush interval and restart the timer.
    ///
    /// While an agent is active with adaptive buffering on, the agent rate
    /// stays in effect until it disconnects.
    pub fn set_flush_interval(&self, terminal_id: &str, interval_ms: u64) -> Result<(), BufferError> {
        if interval_ms == 0 {
            return Err(BufferError::InvalidInterval(interval_ms));
        }
        let mut inner = self.lock()?;
        let buffer = inner
            .terminals
            .entry(terminal_id.to_string())
            .or_insert_with(|| self.new_terminal(terminal_id, self.defaults));
        buffer.config.flush_interval_ms = interval_ms;
        self.start_timer(buffer, terminal_id);
        info!("Flush interval for {} set to {}ms", terminal_id, interval_ms);
        Ok(())
    }

    /// Interval the timer currently runs at, if the terminal exists
    pub fn flush_interval(&self, terminal_id: &str) -> Result<Option<u64>, BufferError> {
        let inner = self.lock()?;
        Ok(inner
            .terminals
            .get(terminal_id)
            .map(TerminalBuffer::effective_interval_ms))
    }

    pub fn enable_adaptive_buffering(&self, terminal_id: &str) -> Result<(), BufferError> {
        self.update_terminal(terminal_id, |buffer| buffer.config.adaptive_buffering = true)
    }

    pub fn disable_adaptive_buffering(&self, terminal_id: &str) -> Result<(), BufferError> {
        self.update_terminal(terminal_id, |buffer| buffer.config.adaptive_buffering = false)
    }

    /// Switch to the agent flush rate (when adaptive buffering is on)
    pub fn on_agent_detected(&self, terminal_id: &str) -> Result<(), BufferError> {
        self.update_terminal(terminal_id, |buffer| buffer.agent_active = true)
    }

    /// Return to the base flush rate
    pub fn on_agent_disconnected(&self, terminal_id: &str) -> Result<(), BufferError> {
        self.update_terminal(terminal_id, |buffer| buffer.agent_active = false)
    }

    pub fn stats(&self, terminal_id: &str) -> Result<Option<BufferStats>, BufferError> {
        let inner = self.lock()?;
        Ok(inner.terminals.get(terminal_id).map(|b| b.stats.clone()))
    }

    pub fn config(&self, terminal_id: &str) -> Result<Option<BufferConfig>, BufferError> {
        let inner = self.lock()?;
        Ok(inner.terminals.get(terminal_id).map(|b| b.config))
    }

    /// Characters waiting for the next flush
    pub fn pending_len(&self, terminal_id: &str) -> Result<usize, BufferError> {
        let inner = self.lock()?;
        Ok(inner.terminals.get(terminal_id).map_or(0, |b| b.pending_len))
    }

    pub fn terminal_ids(&self) -> Result<Vec<String>, BufferError> {
        let inner = self.lock()?;
        Ok(inner.terminals.keys().cloned().collect())
    }

    /// Flush remaining output, stop the timer and forget the terminal.
    ///
    /// Returns whatever was still pending. Unknown terminals are a no-op.
    pub fn dispose_buffer(&self, terminal_id: &str) -> Result<String, BufferError> {
        let mut inner = self.lock()?;
        let Some(mut buffer) = inner.terminals.remove(terminal_id) else {
            return Ok(String::new());
        };
        let remaining = flush_terminal(&mut buffer, terminal_id, &self.events);
        if let Some(handle) = buffer.timer.take() {
            self.scheduler.cancel(handle);
        }
        debug!("Disposed output buffer for {}", terminal_id);
        Ok(remaining)
    }

    /// Dispose every terminal. Later calls are no-ops; every other
    /// operation fails with [`BufferError::Disposed`] afterwards.
    pub fn dispose(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if inner.disposed {
            return;
        }
        inner.disposed = true;

        let count = inner.terminals.len();
        for (terminal_id, mut buffer) in inner.terminals.drain() {
            flush_terminal(&mut buffer, &terminal_id, &self.events);
            if let Some(handle) = buffer.timer.take() {
                self.scheduler.cancel(handle);
            }
        }
        info!("Output buffer disposed ({} terminals)", count);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disposed
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BufferError> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if inner.disposed {
            warn!("Output buffer used after dispose");
            return Err(BufferError::Disposed);
        }
        Ok(inner)
    }

    fn update_terminal(
        &self,
        terminal_id: &str,
        update: impl FnOnce(&mut TerminalBuffer),
    ) -> Result<(), BufferError> {
        let mut inner = self.lock()?;
        match inner.terminals.get_mut(terminal_id) {
            Some(buffer) => {
                update(buffer);
                self.retime(buffer, terminal_id);
            }
            None => debug!("Ignoring update for unknown terminal {}", terminal_id),
        }
        Ok(())
    }

    fn new_terminal(&self, terminal_id: &str, config: BufferConfig) -> TerminalBuffer {
        let mut buffer = TerminalBuffer {
            config,
            pending: Vec::new(),
            pending_len: 0,
            timer: None,
            timer_interval_ms: 0,
            timer_generation: 0,
            stats: BufferStats::default(),
            agent_active: false,
        };
        self.start_timer(&mut buffer, terminal_id);
        buffer
    }

    /// Restart the timer if the effective interval changed
    fn retime(&self, buffer: &mut TerminalBuffer, terminal_id: &str) {
        if buffer.timer.is_none() || buffer.timer_interval_ms != buffer.effective_interval_ms() {
            self.start_timer(buffer, terminal_id);
        }
    }

    fn start_timer(&self, buffer: &mut TerminalBuffer, terminal_id: &str) {
        if let Some(old) = buffer.timer.take() {
            self.scheduler.cancel(old);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let interval_ms = buffer.effective_interval_ms();
        let weak = Arc::downgrade(&self.inner);
        let events = self.events.clone();
        let id = terminal_id.to_string();
        let task: Task = Arc::new(move || on_timer(&weak, &events, &id, generation));

        buffer.timer_generation = generation;
        buffer.timer_interval_ms = interval_ms;
        buffer.timer = Some(
            self.scheduler
                .schedule_repeating(Duration::from_millis(interval_ms), task),
        );
        debug!("Flush timer for {} running every {}ms", terminal_id, interval_ms);
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Timer callback. Stale callbacks (terminal gone, timer replaced) do nothing.
fn on_timer(
    inner: &Weak<Mutex<Inner>>,
    events: &broadcast::Sender<BufferEvent>,
    terminal_id: &str,
    generation: u64,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
    if inner.disposed {
        return;
    }
    match inner.terminals.get_mut(terminal_id) {
        Some(buffer) if buffer.timer_generation == generation => {
            flush_terminal(buffer, terminal_id, events);
        }
        _ => {}
    }
}

fn flush_terminal(
    buffer: &mut TerminalBuffer,
    terminal_id: &str,
    events: &broadcast::Sender<BufferEvent>,
) -> String {
    if buffer.pending.is_empty() {
        return String::new();
    }

    let started = Instant::now();
    let data = buffer.pending.concat();
    let size = buffer.pending_len;
    buffer.pending.clear();
    buffer.pending_len = 0;

    buffer.stats.flush_count += 1;
    buffer.stats.total_flush_time += started.elapsed();
    buffer.stats.last_flush_at = Some(SystemTime::now());

    // No receivers is fine: the caller still gets the data back.
    let _ = events.send(BufferEvent::Flushed {
        terminal_id: terminal_id.to_string(),
        data: data.clone(),
        size,
    });
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ManualScheduler, TokioScheduler};
    use tokio::sync::broadcast::error::TryRecvError;

    fn manual() -> (Arc<ManualScheduler>, OutputBuffer) {
        let scheduler = Arc::new(ManualScheduler::new());
        let buffer = OutputBuffer::new(scheduler.clone(), BufferConfig::default());
        (scheduler, buffer)
    }

    fn patch(interval: u64, max: usize) -> Option<BufferConfigPatch> {
        Some(BufferConfigPatch {
            flush_interval_ms: Some(interval),
            max_buffer_size: Some(max),
            adaptive_buffering: None,
        })
    }

    #[test]
    fn test_timer_tick_flushes_pending() {
        let (scheduler, buffer) = manual();
        let mut rx = buffer.subscribe();
        buffer.initialize_buffer("t1", patch(16, 50)).unwrap();

        assert!(buffer.write("t1", "hello").unwrap());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        scheduler.tick();
        assert_eq!(
            rx.try_recv().unwrap(),
            BufferEvent::Flushed {
                terminal_id: "t1".to_string(),
                data: "hello".to_string(),
                size: 5,
            }
        );
    }

    #[test]
    fn test_overflow_emits_then_flushes() {
        let (_scheduler, buffer) = manual();
        let mut rx = buffer.subscribe();
        buffer.initialize_buffer("t1", patch(16, 50)).unwrap();

        let big = "x".repeat(60);
        assert!(!buffer.write("t1", &big).unwrap());

        assert_eq!(
            rx.try_recv().unwrap(),
            BufferEvent::Overflow {
                terminal_id: "t1".to_string(),
                size: 60,
                max_size: 50,
            }
        );
        match rx.try_recv().unwrap() {
            BufferEvent::Flushed { data, size, .. } => {
                assert_eq!(data, big);
                assert_eq!(size, 60);
            }
            other => panic!("expected flush, got {:?}", other),
        }
        assert_eq!(buffer.pending_len("t1").unwrap(), 0);
    }

    #[test]
    fn test_overflow_exactly_at_threshold() {
        let (_scheduler, buffer) = manual();
        buffer.initialize_buffer("t1", patch(16, 10)).unwrap();

        assert!(buffer.write("t1", "123456789").unwrap());
        assert!(!buffer.write("t1", "0").unwrap());
        assert!(buffer.write("t1", "a").unwrap());
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let (_scheduler, buffer) = manual();
        let mut rx = buffer.subscribe();
        buffer.initialize_buffer("t1", None).unwrap();

        assert_eq!(buffer.flush("t1").unwrap(), "");
        assert_eq!(buffer.stats("t1").unwrap().unwrap().flush_count, 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // Unknown terminal behaves the same
        assert_eq!(buffer.flush("nope").unwrap(), "");
    }

    #[test]
    fn test_no_loss_no_duplication() {
        let (scheduler, buffer) = manual();
        let mut rx = buffer.subscribe();
        buffer.initialize_buffer("t1", patch(16, 20)).unwrap();

        let inputs = ["ab", "cdefgh", "", "ijklmnopqrstuvw", "xyz", "0123456789", "é✓"];
        for (i, chunk) in inputs.iter().enumerate() {
            buffer.write("t1", chunk).unwrap();
            match i % 3 {
                0 => scheduler.tick(),
                1 => {
                    buffer.flush("t1").unwrap();
                }
                _ => {}
            }
        }
        scheduler.tick();

        // Timer, overflow and explicit flushes all publish events
        let mut collected = String::new();
        while let Ok(event) = rx.try_recv() {
            if let BufferEvent::Flushed { data, .. } = event {
                collected.push_str(&data);
            }
        }
        assert_eq!(collected, inputs.concat());
    }

    #[test]
    fn test_initialize_merges_existing_state() {
        let (scheduler, buffer) = manual();
        buffer.initialize_buffer("t1", patch(16, 50)).unwrap();
        buffer.write("t1", "kept").unwrap();

        buffer
            .initialize_buffer(
                "t1",
                Some(BufferConfigPatch {
                    flush_interval_ms: Some(32),
                    ..Default::default()
                }),
            )
            .unwrap();

        let config = buffer.config("t1").unwrap().unwrap();
        assert_eq!(config.flush_interval_ms, 32);
        assert_eq!(config.max_buffer_size, 50);
        assert_eq!(buffer.pending_len("t1").unwrap(), 4);
        assert_eq!(scheduler.intervals(), vec![Duration::from_millis(32)]);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let (_scheduler, buffer) = manual();
        assert_eq!(
            buffer.set_flush_interval("t1", 0),
            Err(BufferError::InvalidInterval(0))
        );
    }

    #[test]
    fn test_flush_all_omits_empty_terminals() {
        let (_scheduler, buffer) = manual();
        buffer.initialize_buffer("a", None).unwrap();
        buffer.initialize_buffer("b", None).unwrap();
        buffer.write("a", "output").unwrap();

        let flushed = buffer.flush_all().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed.get("a").map(String::as_str), Some("output"));
    }

    #[test]
    fn test_adaptive_interval_switch() {
        let (scheduler, buffer) = manual();
        buffer.initialize_buffer("t1", patch(16, 100)).unwrap();

        buffer.on_agent_detected("t1").unwrap();
        assert_eq!(buffer.flush_interval("t1").unwrap(), Some(AGENT_FLUSH_INTERVAL_MS));
        assert_eq!(
            scheduler.intervals(),
            vec![Duration::from_millis(AGENT_FLUSH_INTERVAL_MS)]
        );

        buffer.on_agent_disconnected("t1").unwrap();
        assert_eq!(buffer.flush_interval("t1").unwrap(), Some(16));
        assert_eq!(scheduler.active_count(), 1);
    }

    #[test]
    fn test_disabled_adaptive_ignores_activity() {
        let (_scheduler, buffer) = manual();
        buffer.initialize_buffer("t1", patch(16, 100)).unwrap();
        buffer.disable_adaptive_buffering("t1").unwrap();

        buffer.on_agent_detected("t1").unwrap();
        assert_eq!(buffer.flush_interval("t1").unwrap(), Some(16));

        buffer.enable_adaptive_buffering("t1").unwrap();
        assert_eq!(buffer.flush_interval("t1").unwrap(), Some(AGENT_FLUSH_INTERVAL_MS));
    }

    #[test]
    fn test_dispose_buffer_flushes_and_cancels() {
        let (scheduler, buffer) = manual();
        let mut rx = buffer.subscribe();
        buffer.initialize_buffer("t1", None).unwrap();
        buffer.write("t1", "bye").unwrap();

        assert_eq!(buffer.dispose_buffer("t1").unwrap(), "bye");
        assert!(matches!(rx.try_recv(), Ok(BufferEvent::Flushed { .. })));
        assert_eq!(scheduler.active_count(), 0);

        assert_eq!(buffer.dispose_buffer("t1").unwrap(), "");
    }

    #[test]
    fn test_dispose_is_idempotent_and_loud_afterwards() {
        let (scheduler, buffer) = manual();
        buffer.initialize_buffer("t1", None).unwrap();
        buffer.write("t2", "x").unwrap();

        buffer.dispose();
        buffer.dispose();
        assert!(buffer.is_disposed());
        assert_eq!(scheduler.active_count(), 0);

        assert_eq!(buffer.write("t1", "late"), Err(BufferError::Disposed));
        assert_eq!(buffer.flush("t1"), Err(BufferError::Disposed));
        assert_eq!(buffer.initialize_buffer("t3", None), Err(BufferError::Disposed));
        assert_eq!(buffer.dispose_buffer("t1"), Err(BufferError::Disposed));

        // Ticking after dispose must not panic or emit anything
        scheduler.tick();
    }

    /// Forwards to a manual scheduler but keeps every task it was handed,
    /// so replaced or cancelled callbacks can still be fired.
    #[derive(Default)]
    struct RetainingScheduler {
        manual: ManualScheduler,
        seen: Mutex<Vec<Task>>,
    }

    impl RetainingScheduler {
        fn fire(&self, index: usize) {
            let task = Arc::clone(&self.seen.lock().unwrap()[index]);
            task();
        }
    }

    impl Scheduler for RetainingScheduler {
        fn schedule_repeating(&self, interval: Duration, task: Task) -> CancelHandle {
            self.seen.lock().unwrap().push(Arc::clone(&task));
            self.manual.schedule_repeating(interval, task)
        }

        fn cancel(&self, handle: CancelHandle) {
            self.manual.cancel(handle);
        }
    }

    #[test]
    fn test_stale_timer_callbacks_do_nothing() {
        let scheduler = Arc::new(RetainingScheduler::default());
        let buffer = OutputBuffer::new(scheduler.clone(), BufferConfig::default());
        let mut rx = buffer.subscribe();

        buffer.initialize_buffer("t1", patch(16, 50)).unwrap();
        buffer.write("t1", "a").unwrap();

        // Replaced timer
        buffer.set_flush_interval("t1", 32).unwrap();
        scheduler.fire(0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(buffer.pending_len("t1").unwrap(), 1);

        scheduler.fire(1);
        assert!(matches!(rx.try_recv().unwrap(), BufferEvent::Flushed { ref data, .. } if data == "a"));

        // Terminal disposed, then recreated under the same id
        buffer.dispose_buffer("t1").unwrap();
        scheduler.fire(1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        buffer.initialize_buffer("t1", None).unwrap();
        buffer.write("t1", "b").unwrap();
        scheduler.fire(1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(buffer.pending_len("t1").unwrap(), 1);

        // Whole manager disposed
        buffer.dispose();
        assert!(matches!(rx.try_recv().unwrap(), BufferEvent::Flushed { ref data, .. } if data == "b"));
        for index in 0..3 {
            scheduler.fire(index);
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // Manager dropped
        drop(buffer);
        scheduler.fire(2);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_stats_recorded() {
        let (scheduler, buffer) = manual();
        buffer.write("t1", "a").unwrap();
        scheduler.tick();
        buffer.write("t1", "b").unwrap();
        buffer.flush("t1").unwrap();

        let stats = buffer.stats("t1").unwrap().unwrap();
        assert_eq!(stats.flush_count, 2);
        assert!(stats.last_flush_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_flush() {
        let scheduler = Arc::new(TokioScheduler::new(tokio::runtime::Handle::current()));
        let buffer = OutputBuffer::new(scheduler.clone(), BufferConfig::default());
        let mut rx = buffer.subscribe();
        buffer.initialize_buffer("t1", patch(16, 50)).unwrap();
        buffer.write("t1", "hello").unwrap();

        let event = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, BufferEvent::Flushed { ref data, .. } if data == "hello"));

        buffer.dispose();
        assert_eq!(scheduler.active_count(), 0);
    }
}
