//! term-stream: host a command in a PTY with adaptive output buffering,
//! agent detection and mouse-wheel translation.
//!
//! Usage:
//!   term-stream --name main -- claude --model opus

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use term_stream::buffer::{BufferEvent, OutputBuffer};
use term_stream::config::HostConfig;
use term_stream::detector::builtin_detectors;
use term_stream::error::HostError;
use term_stream::host::TerminalHost;
use term_stream::mouse::{MouseTracker, ScrollSurface, WheelEvent};
use term_stream::protocol::{ControlRequest, ControlResponse, HostEvent, StatusInfo};
use term_stream::pty::{AsyncPty, Pty, RawModeGuard, SharedGeometry, TerminalSize, Utf8Decoder};
use term_stream::registry::PluginRegistry;
use term_stream::scheduler::TokioScheduler;
use term_stream::socket::{default_socket_path, ControlCommand, SocketServer};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Terminal host with adaptive buffering, agent detection and wheel translation
#[derive(Parser, Debug)]
#[command(name = "term-stream")]
#[command(about = "Terminal host with adaptive output buffering and agent detection")]
#[command(version)]
struct Args {
    /// Terminal identifier
    #[arg(short, long, default_value = "main")]
    name: String,

    /// Control socket path (default: /tmp/term-stream-{name}.sock)
    #[arg(short, long)]
    socket: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base flush interval in milliseconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    flush_interval: Option<u64>,

    /// Pending characters that force an immediate flush
    #[arg(long)]
    max_buffer: Option<usize>,

    /// Keep the base flush interval while an agent is running
    #[arg(long)]
    no_adaptive: bool,

    /// Emit agent, overflow and scroll events as JSON lines on stderr
    #[arg(long)]
    json_output: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Terminal rows (for headless mode)
    #[arg(long)]
    rows: Option<u16>,

    /// Terminal columns (for headless mode)
    #[arg(long)]
    cols: Option<u16>,

    /// Command to run (after --)
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

/// Writes JSON events to stderr when `--json-output` is set
#[derive(Clone, Copy)]
struct EventWriter {
    enabled: bool,
}

impl EventWriter {
    fn emit<T: Serialize>(&self, event: &T) {
        if !self.enabled {
            return;
        }
        match serde_json::to_string(event) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => warn!("Failed to serialize event: {}", e),
        }
    }
}

/// There is no display to scroll; mode changes are reported as events
impl ScrollSurface for EventWriter {
    fn set_native_scroll(&self, terminal_id: &str, enabled: bool) {
        self.emit(&HostEvent::ScrollMode {
            terminal_id: terminal_id.to_string(),
            native: enabled,
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!("term-stream v{}", env!("CARGO_PKG_VERSION"));
    info!("Terminal: {}", args.name);
    info!("Command: {:?}", args.command);

    let mut config = match args.config {
        Some(ref path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    if let Some(ms) = args.flush_interval {
        config.buffer.flush_interval_ms = Some(ms);
    }
    if let Some(max) = args.max_buffer {
        config.buffer.max_buffer_size = Some(max);
    }
    if args.no_adaptive {
        config.buffer.adaptive_buffering = Some(false);
    }

    let socket_path = args
        .socket
        .clone()
        .unwrap_or_else(|| default_socket_path(&args.name));
    info!("Socket: {}", socket_path);

    let terminal_id = args.name.clone();
    let events_out = EventWriter {
        enabled: args.json_output,
    };

    // Spawn the child first so detection and buffering see all of its output
    let size = TerminalSize::resolve(args.rows, args.cols);
    let pty = Pty::spawn(&args.command, size).context("Failed to spawn command")?;
    let raw_mode = RawModeGuard::enter().context("Failed to set raw mode")?;
    if raw_mode.is_some() {
        info!("Running in interactive mode (TTY)");
    } else {
        info!("Running in headless mode (no TTY)");
    }
    let mut async_pty = AsyncPty::new(pty);
    let geometry = Arc::new(SharedGeometry::new(size));

    let registry = Arc::new(config.build_registry());
    register_detectors(&registry, &config).await?;

    let scheduler = Arc::new(TokioScheduler::new(Handle::current()));
    let host = TerminalHost::new(
        OutputBuffer::new(scheduler, config.buffer_defaults()),
        registry,
        MouseTracker::new(
            Arc::new(async_pty.input()),
            geometry.clone(),
            Arc::new(events_out),
        ),
    );
    host.open_terminal(&terminal_id, None)?;
    let mut buffer_events = host.subscribe();

    let (command_tx, mut command_rx) = mpsc::channel::<ControlCommand>(16);
    let socket_server = SocketServer::new(socket_path.clone(), command_tx);
    let socket_handle = tokio::spawn(async move {
        if let Err(e) = socket_server.run().await {
            error!("Socket server error: {}", e);
        }
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigwinch = signal(SignalKind::window_change())?;

    // Stdin reader (interactive and piped input alike)
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut decoder = Utf8Decoder::new();

    loop {
        select! {
            Some(command) = command_rx.recv() => {
                let shutdown = matches!(command.request, ControlRequest::Shutdown);
                let response = handle_request(
                    command.request,
                    &host,
                    &async_pty,
                    &geometry,
                    &terminal_id,
                    events_out,
                );
                let _ = command.response_tx.send(response);
                if shutdown {
                    info!("Shutdown requested");
                    break;
                }
            }

            _ = sigint.recv() => {
                info!("SIGINT received");
                let _ = async_pty.signal(nix::sys::signal::Signal::SIGINT);
            }

            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }

            _ = sigwinch.recv() => {
                debug!("SIGWINCH received");
                if let Some(size) = TerminalSize::detect() {
                    match async_pty.resize(size) {
                        Ok(()) => geometry.set(size),
                        Err(e) => warn!("Resize failed: {}", e),
                    }
                }
            }

            Some(data) = stdin_rx.recv() => {
                debug!("Received {} bytes from stdin", data.len());
                if let Err(e) = async_pty.send(data).await {
                    error!("Failed to send to PTY: {}", e);
                }
            }

            result = async_pty.recv() => {
                match result {
                    Some(data) => {
                        let text = decoder.decode(&data);
                        if !text.is_empty() {
                            host.write_output(&terminal_id, &text)?;
                        }
                    }
                    None => {
                        info!("PTY closed");
                        break;
                    }
                }
            }

            event = buffer_events.recv() => {
                match event {
                    Ok(event) => forward_buffer_event(&host, &mut stdout, event, events_out).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Output event receiver lagged by {} events - some output was lost", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Buffer event channel closed");
                        break;
                    }
                }
            }
        }
    }

    info!("Shutting down...");

    // Push out whatever is still buffered before tearing down
    let tail = decoder.finish();
    if !tail.is_empty() {
        host.write_output(&terminal_id, &tail)?;
    }
    let remaining = host.close_terminal(&terminal_id)?;
    debug!("Flushed {} pending characters on close", remaining.chars().count());
    while let Ok(event) = buffer_events.try_recv() {
        forward_buffer_event(&host, &mut stdout, event, events_out).await?;
    }

    host.dispose();
    let _ = async_pty.shutdown();
    events_out.emit(&HostEvent::TerminalExited {
        terminal_id: terminal_id.clone(),
        exit_code: async_pty.exit_code(),
    });

    drop(raw_mode);
    let _ = std::fs::remove_file(&socket_path);
    socket_handle.abort();

    info!("Goodbye!");
    Ok(())
}

/// Register the built-in detectors, apply configured overrides and activate them
async fn register_detectors(registry: &PluginRegistry, config: &HostConfig) -> Result<()> {
    for detector in builtin_detectors().context("Invalid built-in detector pattern")? {
        registry.register(Arc::new(detector))?;
    }
    config.apply_plugin_configs(registry)?;

    for outcome in registry.activate_all().await? {
        if let Err(e) = outcome.result {
            warn!("Detector {} unavailable: {}", outcome.id, e);
        }
    }
    Ok(())
}

/// Write flushed output to stdout and run it through detection
async fn forward_buffer_event(
    host: &TerminalHost,
    stdout: &mut tokio::io::Stdout,
    event: BufferEvent,
    events_out: EventWriter,
) -> Result<()> {
    match event {
        BufferEvent::Flushed {
            terminal_id, data, ..
        } => {
            stdout.write_all(data.as_bytes()).await?;
            stdout.flush().await?;

            match host.process_flushed(&terminal_id, &data) {
                Ok(Some(agent)) => events_out.emit(&HostEvent::AgentDetected(agent)),
                Ok(None) => {}
                Err(e) => debug!("Detection skipped: {}", e),
            }
        }
        overflow @ BufferEvent::Overflow { .. } => {
            debug!("{:?}", overflow);
            events_out.emit(&overflow);
        }
    }
    Ok(())
}

fn handle_request(
    request: ControlRequest,
    host: &TerminalHost,
    pty: &AsyncPty,
    geometry: &SharedGeometry,
    terminal_id: &str,
    events_out: EventWriter,
) -> ControlResponse {
    let result: Result<ControlResponse, HostError> = match request {
        ControlRequest::Wheel {
            delta_y,
            client_x,
            client_y,
        } => Ok(ControlResponse::Wheel {
            outcome: host.handle_wheel(
                terminal_id,
                WheelEvent {
                    delta_y,
                    client_x,
                    client_y,
                },
            ),
        }),

        ControlRequest::Resize {
            rows,
            cols,
            pixel_width,
            pixel_height,
        } => {
            if rows == 0 || cols == 0 {
                return ControlResponse::Error {
                    message: format!("Invalid size {}x{}", cols, rows),
                };
            }
            let size = TerminalSize {
                rows,
                cols,
                pixel_width: pixel_width.unwrap_or(0),
                pixel_height: pixel_height.unwrap_or(0),
            };
            if let Err(e) = pty.resize(size) {
                return ControlResponse::Error {
                    message: e.to_string(),
                };
            }
            geometry.set(size);
            Ok(ControlResponse::Resized { rows, cols })
        }

        ControlRequest::ConfigurePlugin { id, config } => host
            .registry()
            .configure(&id, config)
            .map(|config| ControlResponse::PluginConfigured { id, config })
            .map_err(HostError::from),

        ControlRequest::SetFlushInterval { interval_ms } => host
            .buffer()
            .set_flush_interval(terminal_id, interval_ms)
            .map(|()| ControlResponse::FlushIntervalSet { interval_ms })
            .map_err(HostError::from),

        ControlRequest::AgentDisconnected => host.agent_disconnected(terminal_id).map(|presence| {
            let agent_type = presence.map(|p| p.agent_type);
            events_out.emit(&HostEvent::AgentDisconnected {
                terminal_id: terminal_id.to_string(),
                agent_type: agent_type.clone(),
            });
            ControlResponse::AgentCleared { agent_type }
        }),

        ControlRequest::Status => status(host, terminal_id).map(ControlResponse::Status),

        ControlRequest::Shutdown => Ok(ControlResponse::ShutdownAck),
    };

    result.unwrap_or_else(|e| ControlResponse::Error {
        message: e.to_string(),
    })
}

fn status(host: &TerminalHost, terminal_id: &str) -> Result<StatusInfo, HostError> {
    let buffer = host.buffer();
    Ok(StatusInfo {
        terminal_id: terminal_id.to_string(),
        agent: host.agent(terminal_id),
        mouse_modes: host.mouse().active_modes(terminal_id).into_iter().collect(),
        intercepting_wheel: host.mouse().is_intercepting(terminal_id),
        flush_interval_ms: buffer.flush_interval(terminal_id)?,
        pending_chars: buffer.pending_len(terminal_id)?,
        flush_count: buffer
            .stats(terminal_id)?
            .map(|s| s.flush_count)
            .unwrap_or(0),
        plugins: host.registry().statuses()?,
    })
}
