//! Mouse-tracking mode parser and wheel-to-escape translator.
//!
//! Watches terminal output for DECSET/DECRST private-mode sequences that
//! toggle mouse reporting. While any reporting mode is active, wheel events
//! are encoded as mouse reports and written to the terminal's input channel
//! instead of scrolling the display.
//!
//! Nothing in here returns an error to the caller: malformed sequences and
//! degenerate geometry are logged and recovered from locally.

use crate::error::ProtocolError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, info, warn};

/// X10 compatibility mode: report button press
pub const MODE_NORMAL_TRACKING: u16 = 1000;
/// Report press, release and drag
pub const MODE_BUTTON_EVENT: u16 = 1002;
/// Report all motion
pub const MODE_ANY_EVENT: u16 = 1003;
/// SGR extended coordinates
pub const MODE_SGR: u16 = 1006;

pub const TRACKED_MODES: [u16; 4] = [
    MODE_NORMAL_TRACKING,
    MODE_BUTTON_EVENT,
    MODE_ANY_EVENT,
    MODE_SGR,
];

pub const SCROLL_UP_BUTTON: u8 = 64;
pub const SCROLL_DOWN_BUTTON: u8 = 65;

/// Largest coordinate the legacy encoding can carry (223 + 32 = 255)
const X10_MAX_COORDINATE: u16 = 223;
/// Longest unterminated private-mode sequence kept between chunks
const MAX_CARRY_LEN: usize = 64;

static PRIVATE_MODE_PATTERN: OnceLock<Regex> = OnceLock::new();
static PARTIAL_MODE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn private_mode_pattern() -> &'static Regex {
    PRIVATE_MODE_PATTERN.get_or_init(|| Regex::new(r"\x1b\[\?([0-9;:]*)([hl])").unwrap())
}

fn partial_mode_pattern() -> &'static Regex {
    PARTIAL_MODE_PATTERN.get_or_init(|| Regex::new(r"^\x1b(?:\[(?:\?[0-9;:]*)?)?$").unwrap())
}

/// Writes bytes into a terminal's input channel (the child process)
pub trait InputSink: Send + Sync {
    fn send_input(&self, terminal_id: &str, data: &[u8]);
}

/// Supplies the grid geometry of a terminal's display element
pub trait GeometrySource: Send + Sync {
    fn geometry(&self, terminal_id: &str) -> Option<GridGeometry>;
}

/// Switches a terminal's display between native and intercepted scrolling
pub trait ScrollSurface: Send + Sync {
    fn set_native_scroll(&self, terminal_id: &str, enabled: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub columns: u16,
    pub rows: u16,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

/// Pointer wheel event, coordinates in pixels relative to the terminal element
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelEvent {
    pub delta_y: f64,
    pub client_x: f64,
    pub client_y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WheelOutcome {
    /// No reporting mode active; let the display scroll
    Native,
    /// Report sent to the process; the default scroll must be suppressed
    Intercepted,
}

#[derive(Debug, Default)]
struct TrackingState {
    active_modes: BTreeSet<u16>,
    /// Mirrors `!active_modes.is_empty()`
    wheel_attached: bool,
    /// Unterminated sequence from the end of the previous chunk
    carry: String,
}

#[derive(Default)]
struct Inner {
    disposed: bool,
    terminals: HashMap<String, TrackingState>,
}

/// Per-terminal mouse-mode tracking and wheel translation
pub struct MouseTracker {
    input: Arc<dyn InputSink>,
    geometry: Arc<dyn GeometrySource>,
    surface: Arc<dyn ScrollSurface>,
    inner: Mutex<Inner>,
}

impl MouseTracker {
    pub fn new(
        input: Arc<dyn InputSink>,
        geometry: Arc<dyn GeometrySource>,
        surface: Arc<dyn ScrollSurface>,
    ) -> Self {
        Self {
            input,
            geometry,
            surface,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Scan a chunk of terminal output for mouse-mode toggles
    pub fn process_output(&self, terminal_id: &str, chunk: &str) {
        let toggles = {
            let mut inner = self.lock();
            if inner.disposed {
                return;
            }
            let state = inner.terminals.entry(terminal_id.to_string()).or_default();
            scan_chunk(terminal_id, state, chunk)
        };

        // Surface callbacks run without the lock held
        for native in toggles {
            if native {
                info!("Mouse tracking off for {}, native scrolling restored", terminal_id);
            } else {
                info!("Mouse tracking on for {}, intercepting wheel events", terminal_id);
            }
            self.surface.set_native_scroll(terminal_id, native);
        }
    }

    /// Translate a wheel event. Returns `Native` when no reporting mode is active.
    ///
    /// Events with no vertical movement are swallowed while a mode is active.
    pub fn handle_wheel(&self, terminal_id: &str, event: WheelEvent) -> WheelOutcome {
        let sgr = {
            let inner = self.lock();
            if inner.disposed {
                return WheelOutcome::Native;
            }
            match inner.terminals.get(terminal_id) {
                Some(state) if state.wheel_attached => state.active_modes.contains(&MODE_SGR),
                _ => return WheelOutcome::Native,
            }
        };

        if event.delta_y == 0.0 || event.delta_y.is_nan() {
            debug!("Dropping wheel event without vertical movement on {}", terminal_id);
            return WheelOutcome::Intercepted;
        }

        let (column, row) = match self.geometry.geometry(terminal_id) {
            Some(geometry) => cell_at(&geometry, &event).unwrap_or_else(|e| {
                warn!("Wheel event on {}: {}, reporting at 1;1", terminal_id, e);
                (1, 1)
            }),
            None => {
                debug!("No geometry for {}, reporting at 1;1", terminal_id);
                (1, 1)
            }
        };

        let button = if event.delta_y < 0.0 {
            SCROLL_UP_BUTTON
        } else {
            SCROLL_DOWN_BUTTON
        };
        let report = if sgr {
            encode_sgr(button, column, row)
        } else {
            encode_x10(button, column, row)
        };

        debug!(
            "Wheel button {} at {};{} on {} ({})",
            button,
            column,
            row,
            terminal_id,
            if sgr { "sgr" } else { "x10" }
        );
        self.input.send_input(terminal_id, &report);
        WheelOutcome::Intercepted
    }

    pub fn active_modes(&self, terminal_id: &str) -> BTreeSet<u16> {
        self.lock()
            .terminals
            .get(terminal_id)
            .map(|s| s.active_modes.clone())
            .unwrap_or_default()
    }

    pub fn is_intercepting(&self, terminal_id: &str) -> bool {
        self.lock()
            .terminals
            .get(terminal_id)
            .is_some_and(|s| s.wheel_attached)
    }

    /// Forget a terminal, restoring native scrolling if it was intercepted
    pub fn dispose_terminal(&self, terminal_id: &str) {
        let removed = self.lock().terminals.remove(terminal_id);
        if removed.is_some_and(|s| s.wheel_attached) {
            self.surface.set_native_scroll(terminal_id, true);
        }
    }

    /// Release every terminal. Repeat calls are no-ops.
    pub fn dispose(&self) {
        let terminals = {
            let mut inner = self.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            std::mem::take(&mut inner.terminals)
        };

        for (terminal_id, state) in terminals {
            if state.wheel_attached {
                self.surface.set_native_scroll(&terminal_id, true);
            }
        }
        debug!("Mouse tracker disposed");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Apply every private-mode sequence in `chunk`, returning the scroll
/// toggles to perform (`true` = restore native scrolling)
fn scan_chunk(terminal_id: &str, state: &mut TrackingState, chunk: &str) -> Vec<bool> {
    let text = if state.carry.is_empty() {
        chunk.to_string()
    } else {
        let mut joined = std::mem::take(&mut state.carry);
        joined.push_str(chunk);
        joined
    };

    let mut toggles = Vec::new();
    let mut scanned_to = 0;
    for caps in private_mode_pattern().captures_iter(&text) {
        let enable = &caps[2] == "h";
        for param in caps[1].split(';') {
            let mode = match parse_mode(param) {
                Ok(Some(mode)) => mode,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Skipping private mode on {}: {}", terminal_id, e);
                    continue;
                }
            };
            if let Some(native) = apply_mode(state, mode, enable) {
                toggles.push(native);
            }
        }
        if let Some(whole) = caps.get(0) {
            scanned_to = whole.end();
        }
    }

    if let Some(start) = text[scanned_to..].rfind('\x1b').map(|i| scanned_to + i) {
        let tail = &text[start..];
        if partial_mode_pattern().is_match(tail) {
            if tail.len() <= MAX_CARRY_LEN {
                state.carry = tail.to_string();
            } else {
                debug!("Dropping oversized partial sequence on {}", terminal_id);
            }
        }
    }

    toggles
}

/// Parse one DECSET/DECRST parameter. `Ok(None)` for modes that are not
/// mouse reporting.
fn parse_mode(param: &str) -> Result<Option<u16>, ProtocolError> {
    let mode: u16 = param
        .parse()
        .map_err(|_| ProtocolError::InvalidParameter(param.to_string()))?;
    Ok(TRACKED_MODES.contains(&mode).then_some(mode))
}

/// Returns `Some(native)` when the set crosses empty/non-empty
fn apply_mode(state: &mut TrackingState, mode: u16, enable: bool) -> Option<bool> {
    if enable {
        state.active_modes.insert(mode);
    } else {
        state.active_modes.remove(&mode);
    }

    let attached = !state.active_modes.is_empty();
    if attached == state.wheel_attached {
        return None;
    }
    state.wheel_attached = attached;
    Some(!attached)
}

/// 1-based cell under the pointer, clamped to the grid
fn cell_at(geometry: &GridGeometry, event: &WheelEvent) -> Result<(u16, u16), ProtocolError> {
    if geometry.columns == 0
        || geometry.rows == 0
        || !(geometry.pixel_width > 0.0)
        || !(geometry.pixel_height > 0.0)
    {
        return Err(ProtocolError::DegenerateGeometry {
            columns: geometry.columns,
            rows: geometry.rows,
        });
    }

    let cell_width = geometry.pixel_width / f64::from(geometry.columns);
    let cell_height = geometry.pixel_height / f64::from(geometry.rows);
    Ok((
        axis_cell(event.client_x, cell_width, geometry.columns),
        axis_cell(event.client_y, cell_height, geometry.rows),
    ))
}

fn axis_cell(position: f64, cell_size: f64, count: u16) -> u16 {
    let index = (position / cell_size)
        .floor()
        .clamp(0.0, f64::from(count - 1));
    // NaN survives clamp and casts to 0
    index as u16 + 1
}

/// `ESC [ < button ; column ; row M`
pub fn encode_sgr(button: u8, column: u16, row: u16) -> Vec<u8> {
    format!("\x1b[<{};{};{}M", button, column, row).into_bytes()
}

/// `ESC [ M` followed by button, column and row, each offset by 32
pub fn encode_x10(button: u8, column: u16, row: u16) -> Vec<u8> {
    let x = (column.min(X10_MAX_COORDINATE) + 32) as u8;
    let y = (row.min(X10_MAX_COORDINATE) + 32) as u8;
    vec![0x1b, b'[', b'M', button.saturating_add(32), x, y]
}
