//! PTY (pseudo-terminal) management for the hosted process.
//!
//! Provides:
//! - Spawning a command on a fresh PTY
//! - Background reader/writer threads bridged to tokio channels
//! - UTF-8 decoding that keeps split multi-byte characters intact
//! - Raw mode on the controlling terminal, restored on drop
//! - Resize with pixel dimensions (used for wheel geometry)

use crate::mouse::{GeometrySource, GridGeometry, InputSink};
use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execvp, fork, setsid, write, ForkResult, Pid};
use std::ffi::CString;
use std::io::IsTerminal;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Grid size of the PTY, with optional pixel dimensions (0 when unknown)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl TerminalSize {
    /// Size of the controlling terminal, if stdout is one
    pub fn detect() -> Option<Self> {
        let mut winsize = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let ok = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize) == 0 };
        (ok && winsize.ws_row > 0 && winsize.ws_col > 0).then(|| Self::from(winsize))
    }

    /// Explicit overrides first, then the controlling terminal, then 80x24
    pub fn resolve(rows: Option<u16>, cols: Option<u16>) -> Self {
        let detected = Self::detect().unwrap_or_default();
        Self {
            rows: rows.unwrap_or(detected.rows),
            cols: cols.unwrap_or(detected.cols),
            ..detected
        }
    }

    /// Wheel geometry. Without pixel dimensions one pixel maps to one cell.
    pub fn geometry(&self) -> GridGeometry {
        let (pixel_width, pixel_height) = if self.pixel_width > 0 && self.pixel_height > 0 {
            (f64::from(self.pixel_width), f64::from(self.pixel_height))
        } else {
            (f64::from(self.cols), f64::from(self.rows))
        };
        GridGeometry {
            columns: self.cols,
            rows: self.rows,
            pixel_width,
            pixel_height,
        }
    }

    fn winsize(&self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

impl From<Winsize> for TerminalSize {
    fn from(ws: Winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

/// Current PTY size, shared between the main loop and the wheel translator
#[derive(Debug)]
pub struct SharedGeometry {
    size: Mutex<TerminalSize>,
}

impl SharedGeometry {
    pub fn new(size: TerminalSize) -> Self {
        Self {
            size: Mutex::new(size),
        }
    }

    pub fn set(&self, size: TerminalSize) {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;
    }

    pub fn get(&self) -> TerminalSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GeometrySource for SharedGeometry {
    fn geometry(&self, _terminal_id: &str) -> Option<GridGeometry> {
        Some(self.get().geometry())
    }
}

/// Puts stdin in raw mode; the original settings come back on drop
pub struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    /// Returns `Ok(None)` when stdin is not a TTY (headless mode)
    pub fn enter() -> Result<Option<Self>> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            debug!("stdin is not a TTY, skipping raw mode (headless mode)");
            return Ok(None);
        }

        let original = termios::tcgetattr(&stdin).context("Failed to get terminal attributes")?;
        let mut raw = original.clone();
        raw.local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN);
        raw.input_flags.remove(InputFlags::IXON | InputFlags::ICRNL);
        raw.output_flags.remove(OutputFlags::OPOST);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).context("Failed to set raw mode")?;

        debug!("Terminal set to raw mode");
        Ok(Some(Self { original }))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &self.original) {
            warn!("Failed to restore terminal: {}", e);
        } else {
            debug!("Terminal restored");
        }
    }
}

/// PTY handle for the child process
pub struct Pty {
    master_fd: OwnedFd,
    child_pid: Pid,
    running: Arc<AtomicBool>,
}

impl Pty {
    /// Create a PTY of the given size and spawn `command` on it
    pub fn spawn(command: &[String], size: TerminalSize) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("Command cannot be empty");
        }

        // Built before fork: the child must not allocate or fail late
        let args: Vec<CString> = command
            .iter()
            .map(|s| CString::new(s.as_str()))
            .collect::<std::result::Result<_, _>>()
            .context("Command contains a NUL byte")?;

        let OpenptyResult { master, slave } =
            openpty(&size.winsize(), None).context("Failed to open PTY")?;

        match unsafe { fork() }.context("Failed to fork")? {
            ForkResult::Parent { child } => {
                drop(slave);

                let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )?;

                info!(
                    "Spawned {} (PID {}) on a {}x{} PTY",
                    command[0], child, size.cols, size.rows
                );

                Ok(Self {
                    master_fd: master,
                    child_pid: child,
                    running: Arc::new(AtomicBool::new(true)),
                })
            }
            ForkResult::Child => {
                drop(master);
                setsid().ok();

                unsafe {
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as libc::c_ulong, 0);
                }

                let slave_raw = slave.as_raw_fd();
                dup2(slave_raw, libc::STDIN_FILENO).ok();
                dup2(slave_raw, libc::STDOUT_FILENO).ok();
                dup2(slave_raw, libc::STDERR_FILENO).ok();
                if slave_raw > 2 {
                    drop(slave);
                }

                let _ = execvp(&args[0], &args);
                // Only reached when exec failed
                unsafe { libc::_exit(127) }
            }
        }
    }

    pub fn master_fd(&self) -> RawFd {
        self.master_fd.as_raw_fd()
    }

    pub fn child_pid(&self) -> Pid {
        self.child_pid
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            let _ = signal::kill(self.child_pid, Signal::SIGTERM);
        }
    }
}

/// Decodes PTY output, holding back a trailing partial UTF-8 sequence
/// until the rest of it arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Flush whatever is held back, lossily
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Input channel handle usable from synchronous code (the wheel translator)
#[derive(Clone)]
pub struct PtyInput {
    tx: mpsc::Sender<Vec<u8>>,
}

impl InputSink for PtyInput {
    fn send_input(&self, terminal_id: &str, data: &[u8]) {
        if let Err(e) = self.tx.try_send(data.to_vec()) {
            warn!("Dropped {} input bytes for {}: {}", data.len(), terminal_id, e);
        }
    }
}

/// Async PTY wrapper for use with tokio
///
/// Reading and writing happen on background threads since the master fd is
/// polled rather than registered with the reactor.
pub struct AsyncPty {
    output_rx: mpsc::Receiver<Vec<u8>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    child_pid: Pid,
    master_fd: RawFd,
    exit_code: Option<i32>,
    /// Owned PTY for lifecycle management
    pty: Option<Pty>,
}

impl AsyncPty {
    pub fn new(pty: Pty) -> Self {
        let running = pty.running_flag();
        let child_pid = pty.child_pid();
        let master_fd = pty.master_fd();

        let (output_tx, output_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(64);

        let reader_running = Arc::clone(&running);
        std::thread::spawn(move || {
            Self::reader_thread(master_fd, reader_running, output_tx);
        });

        let writer_running = Arc::clone(&running);
        std::thread::spawn(move || {
            Self::writer_thread(master_fd, writer_running, input_rx);
        });

        Self {
            output_rx,
            input_tx,
            running,
            child_pid,
            master_fd,
            exit_code: None,
            pty: Some(pty),
        }
    }

    fn reader_thread(fd: RawFd, running: Arc<AtomicBool>, tx: mpsc::Sender<Vec<u8>>) {
        let mut buf = [0u8; 4096];
        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            match nix::unistd::read(fd, &mut buf) {
                Ok(0) => {
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(nix::errno::Errno::EIO) => {
                    // Child closed its side
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    error!("PTY read error: {}", e);
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        debug!("Reader thread exiting");
    }

    fn writer_thread(fd: RawFd, running: Arc<AtomicBool>, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(data) = rx.blocking_recv() {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let mut written = 0;
            while written < data.len() {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                match write(borrowed, &data[written..]) {
                    Ok(n) => written += n,
                    Err(nix::errno::Errno::EAGAIN) => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        error!("PTY write error: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("Writer thread exiting");
    }

    /// Next chunk of raw output, `None` once the child side is closed
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.input_tx
            .send(data)
            .await
            .map_err(|_| anyhow::anyhow!("PTY channel closed"))
    }

    /// Handle for writing input from synchronous callbacks
    pub fn input(&self) -> PtyInput {
        PtyInput {
            tx: self.input_tx.clone(),
        }
    }

    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        let winsize = size.winsize();
        unsafe {
            if libc::ioctl(self.master_fd, libc::TIOCSWINSZ, &winsize) < 0 {
                anyhow::bail!("Failed to resize PTY");
            }
        }
        debug!("PTY resized to {}x{}", size.cols, size.rows);
        Ok(())
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        signal::kill(self.child_pid, sig)?;
        Ok(())
    }

    /// Exit code once the child has been reaped
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Terminate the child process and reap it
    pub fn shutdown(&mut self) -> Result<()> {
        if self.pty.is_none() {
            return Ok(());
        }
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if was_running {
            let _ = self.signal(Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.exit_code = Some(code);
                    break;
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.exit_code = Some(128 + sig as i32);
                    break;
                }
                Ok(WaitStatus::StillAlive) => std::thread::sleep(Duration::from_millis(50)),
                Ok(_) | Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => return Err(e.into()),
            }
        }

        if self.exit_code.is_none() && start.elapsed() >= Duration::from_secs(2) {
            warn!("Child {} ignored SIGTERM, killing", self.child_pid);
            let _ = self.signal(Signal::SIGKILL);
            let _ = waitpid(self.child_pid, None);
        }

        self.pty.take();
        Ok(())
    }
}

impl Drop for AsyncPty {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_overrides() {
        let size = TerminalSize::resolve(Some(40), Some(120));
        assert_eq!(size.rows, 40);
        assert_eq!(size.cols, 120);
    }

    #[test]
    fn test_geometry_without_pixels_maps_one_pixel_per_cell() {
        let size = TerminalSize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        };
        let geometry = size.geometry();
        assert_eq!(geometry.pixel_width, 80.0);
        assert_eq!(geometry.pixel_height, 24.0);

        let with_pixels = TerminalSize {
            pixel_width: 800,
            pixel_height: 480,
            ..size
        };
        assert_eq!(with_pixels.geometry().pixel_width, 800.0);
    }

    #[test]
    fn test_decoder_holds_split_characters() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "héllo ✓".as_bytes();
        // Split inside the three-byte check mark
        let split = bytes.len() - 1;
        assert_eq!(decoder.decode(&bytes[..split]), "héllo ");
        assert_eq!(decoder.decode(&bytes[split..]), "✓");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"ok\xffok"), "ok\u{fffd}ok");
        assert_eq!(decoder.decode(b"\xe2\x9c"), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn test_shared_geometry_updates() {
        let shared = SharedGeometry::new(TerminalSize::default());
        shared.set(TerminalSize {
            rows: 50,
            cols: 200,
            pixel_width: 0,
            pixel_height: 0,
        });
        let geometry = shared.geometry("main").unwrap();
        assert_eq!(geometry.columns, 200);
        assert_eq!(geometry.rows, 50);
    }

    #[tokio::test]
    async fn test_spawn_echo() {
        let size = TerminalSize::default();
        let pty = Pty::spawn(&["echo".to_string(), "hello".to_string()], size).unwrap();
        let mut async_pty = AsyncPty::new(pty);

        let mut decoder = Utf8Decoder::new();
        let mut output = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !output.contains("hello") {
            match tokio::time::timeout_at(deadline, async_pty.recv()).await {
                Ok(Some(chunk)) => output.push_str(&decoder.decode(&chunk)),
                _ => break,
            }
        }
        assert!(output.contains("hello"));
        async_pty.shutdown().unwrap();
    }
}
