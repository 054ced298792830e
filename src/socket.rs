//! Unix domain socket server for control requests.
//!
//! Provides a socket interface at `/tmp/term-stream-{name}.sock` that accepts
//! newline-delimited JSON requests (wheel events, resize, plugin
//! configuration, status queries, shutdown). Every request is forwarded to
//! the main loop, which owns the terminal, and answered on the same line
//! order it arrived in.

use crate::protocol::{ControlRequest, ControlResponse};
use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Request forwarded to the main loop together with its reply channel
pub struct ControlCommand {
    pub request: ControlRequest,
    pub response_tx: oneshot::Sender<ControlResponse>,
}

/// Default socket location for a terminal name
pub fn default_socket_path(name: &str) -> String {
    format!("/tmp/term-stream-{}.sock", name)
}

/// Socket server for control requests
pub struct SocketServer {
    /// Path to the Unix socket
    socket_path: String,
    /// Channel into the main loop
    command_tx: mpsc::Sender<ControlCommand>,
}

impl SocketServer {
    pub fn new(socket_path: String, command_tx: mpsc::Sender<ControlCommand>) -> Self {
        Self {
            socket_path,
            command_tx,
        }
    }

    /// Start the socket server
    pub async fn run(self) -> Result<()> {
        let path = Path::new(&self.socket_path);
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove existing socket")?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory {:?}", parent))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .context(format!("Failed to bind socket at {}", self.socket_path))?;

        // Owner only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(&self.socket_path, perms) {
                warn!("Failed to set socket permissions: {}", e);
            }
        }

        info!("Control socket listening at {}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let command_tx = self.command_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, command_tx).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Serve one client until it disconnects or asks for shutdown
async fn handle_connection(
    stream: UnixStream,
    command_tx: mpsc::Sender<ControlCommand>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    debug!("New control connection");

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            debug!("Client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ControlRequest>(trimmed) {
            Ok(request) => handle_request(request, &command_tx).await,
            Err(e) => ControlResponse::Error {
                message: format!("Invalid JSON: {}", e),
            },
        };

        send_response(&mut writer, &response).await?;
        if matches!(response, ControlResponse::ShutdownAck) {
            break;
        }
    }

    Ok(())
}

async fn send_response(writer: &mut OwnedWriteHalf, response: &ControlResponse) -> Result<()> {
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Forward a request to the main loop and wait for its answer
async fn handle_request(
    request: ControlRequest,
    command_tx: &mpsc::Sender<ControlCommand>,
) -> ControlResponse {
    debug!("Control request: {:?}", request);
    let (response_tx, response_rx) = oneshot::channel();

    if command_tx
        .send(ControlCommand {
            request,
            response_tx,
        })
        .await
        .is_err()
    {
        return ControlResponse::Error {
            message: "Host channel closed".to_string(),
        };
    }

    match response_rx.await {
        Ok(response) => response,
        Err(_) => ControlResponse::Error {
            message: "Host dropped the request".to_string(),
        },
    }
}

/// Client for connecting to the socket (for testing and integration)
pub struct SocketClient {
    socket_path: String,
}

impl SocketClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    pub async fn wheel(&self, delta_y: f64, client_x: f64, client_y: f64) -> Result<ControlResponse> {
        self.send_request(ControlRequest::Wheel {
            delta_y,
            client_x,
            client_y,
        })
        .await
    }

    /// Request shutdown
    pub async fn shutdown(&self) -> Result<ControlResponse> {
        self.send_request(ControlRequest::Shutdown).await
    }

    pub async fn send_request(&self, request: ControlRequest) -> Result<ControlResponse> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .context("Failed to connect to socket")?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let request_json = serde_json::to_string(&request)?;
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response: ControlResponse = serde_json::from_str(line.trim())?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mouse::WheelOutcome;
    use tempfile::tempdir;

    /// Stand-in for the main loop: answers wheel and shutdown requests
    fn spawn_host(mut command_rx: mpsc::Receiver<ControlCommand>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let response = match command.request {
                    ControlRequest::Wheel { delta_y, .. } if delta_y < 0.0 => {
                        ControlResponse::Wheel {
                            outcome: WheelOutcome::Intercepted,
                        }
                    }
                    ControlRequest::Wheel { .. } => ControlResponse::Wheel {
                        outcome: WheelOutcome::Native,
                    },
                    ControlRequest::Shutdown => ControlResponse::ShutdownAck,
                    other => ControlResponse::Error {
                        message: format!("unexpected {:?}", other),
                    },
                };
                let _ = command.response_tx.send(response);
            }
        })
    }

    #[tokio::test]
    async fn test_socket_server_client() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock").to_string_lossy().to_string();

        let (command_tx, command_rx) = mpsc::channel(16);
        let host_handle = spawn_host(command_rx);

        let server = SocketServer::new(socket_path.clone(), command_tx);
        let server_handle = tokio::spawn(async move {
            server.run().await.ok();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        let client = SocketClient::new(socket_path);
        let response = client.wheel(-1.0, 5.0, 5.0).await.unwrap();
        assert_eq!(
            response,
            ControlResponse::Wheel {
                outcome: WheelOutcome::Intercepted
            }
        );

        let response = client.shutdown().await.unwrap();
        assert_eq!(response, ControlResponse::ShutdownAck);

        server_handle.abort();
        host_handle.abort();
    }

    #[tokio::test]
    async fn test_handle_request_host_channel_closed() {
        let (command_tx, command_rx) = mpsc::channel(1);
        drop(command_rx);

        let response = handle_request(ControlRequest::Status, &command_tx).await;
        match response {
            ControlResponse::Error { message } => {
                assert!(message.contains("Host channel closed"));
            }
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_request_dropped_reply() {
        let (command_tx, mut command_rx) = mpsc::channel::<ControlCommand>(1);
        tokio::spawn(async move {
            // Receive and drop without answering
            let _ = command_rx.recv().await;
        });

        let response = handle_request(ControlRequest::Status, &command_tx).await;
        assert!(matches!(response, ControlResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_handle_connection_invalid_json() {
        let (command_tx, command_rx) = mpsc::channel(1);
        let host_handle = spawn_host(command_rx);
        let (server_stream, client_stream) = UnixStream::pair().unwrap();

        let server_handle = tokio::spawn(async move {
            handle_connection(server_stream, command_tx).await.unwrap();
        });

        let (reader, mut writer) = client_stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(b"not json\n").await.unwrap();
        writer.flush().await.unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: ControlResponse = serde_json::from_str(line.trim()).unwrap();
        match response {
            ControlResponse::Error { message } => {
                assert!(message.contains("Invalid JSON"));
            }
            other => panic!("Unexpected response: {:?}", other),
        }

        // The connection survives a bad line
        writer
            .write_all(b"{\"type\":\"wheel\",\"delta_y\":2,\"client_x\":0,\"client_y\":0}\n")
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let response: ControlResponse = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(
            response,
            ControlResponse::Wheel {
                outcome: WheelOutcome::Native
            }
        );

        drop(writer);
        server_handle.await.unwrap();
        host_handle.abort();
    }
}
