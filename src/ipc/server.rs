//! IPC server
//!
//! Unix socket server for the tethering control surface. Each accepted
//! connection reads length-prefixed JSON command frames, posts them onto
//! the control-plane event bus and writes the reply frame back. After
//! `RegisterCallback`, callback events are pushed to the same connection
//! as they happen.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::protocol::{
    decode_message, encode_message, CallerIdentity, CommandFrame, IpcCommand, IpcRequest,
    IpcResponse, WireFrame, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
use crate::callbacks::CallbackEvent;
use crate::config::IpcConfig;
use crate::error::{IpcError, TetherResultCode};
use crate::event::{EventSender, TetherEvent};

/// Accepts control connections and forwards commands to the event loop.
pub struct IpcServer {
    config: IpcConfig,
    events: EventSender,
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcServer {
    #[must_use]
    pub fn new(config: IpcConfig, events: EventSender) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            events,
            shutdown_tx,
        }
    }

    /// Run the accept loop until shutdown.
    pub async fn run(&self) -> Result<(), IpcError> {
        if !self.config.enabled {
            info!("IPC server disabled");
            return Ok(());
        }

        let socket_path = &self.config.socket_path;

        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(|e| IpcError::SocketCreation {
                path: socket_path.display().to_string(),
                reason: format!("Failed to remove existing socket: {e}"),
            })?;
        }

        if let Some(parent) = socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| IpcError::SocketCreation {
                    path: socket_path.display().to_string(),
                    reason: format!("Failed to create parent directory: {e}"),
                })?;
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| IpcError::BindError {
            path: socket_path.display().to_string(),
            reason: e.to_string(),
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(self.config.socket_mode);
            std::fs::set_permissions(socket_path, permissions).map_err(|e| {
                IpcError::SocketCreation {
                    path: socket_path.display().to_string(),
                    reason: format!("Failed to set permissions: {e}"),
                }
            })?;
        }

        info!("IPC server listening on {:?}", socket_path);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let events = self.events.clone();
                            let max_size = self.config.max_message_size.min(MAX_MESSAGE_SIZE);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, events, max_size).await {
                                    debug!("IPC connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    #[must_use]
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

/// Sink that wraps pushed callback events into wire frames for one
/// connection's writer task.
struct FrameSink(mpsc::UnboundedSender<WireFrame>);

impl crate::callbacks::EventCallbackSink for FrameSink {
    fn on_event(&self, event: &CallbackEvent) {
        let _ = self.0.send(WireFrame::Event(event.clone()));
    }
}

/// Serve one connection. Reads run sequentially on the read half; all
/// writes (responses and pushed events) are serialized through a writer
/// task, so a pushed event can never tear a half-read command frame.
async fn handle_connection(
    stream: UnixStream,
    events: EventSender,
    max_message_size: usize,
) -> Result<(), IpcError> {
    debug!("new IPC connection");

    let peer_uid = peer_uid(&stream);
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireFrame>();
    let sink = Arc::new(FrameSink(out_tx.clone()));

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if send_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    let result = async {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        loop {
            match read_half.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("IPC client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(IpcError::from(e)),
            }

            let msg_len = u32::from_be_bytes(len_buf) as usize;
            if msg_len > max_message_size {
                warn!("IPC message too large: {msg_len} bytes");
                return Err(IpcError::protocol(format!("message too large: {msg_len}")));
            }

            let mut body = vec![0u8; msg_len];
            read_half.read_exact(&mut body).await?;

            let frame: CommandFrame = match decode_message(&body) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("invalid IPC command: {e}");
                    let _ = out_tx.send(WireFrame::Response(IpcResponse::code(
                        TetherResultCode::InternalError,
                    )));
                    continue;
                }
            };

            let response = dispatch(frame.caller, frame.command, peer_uid, &events, &sink).await;
            if out_tx.send(WireFrame::Response(response)).is_err() {
                return Ok(());
            }
        }
    }
    .await;

    drop(out_tx);
    drop(sink);
    writer.abort();
    result
}

/// Validate the identity against the socket peer and round-trip through
/// the control plane.
async fn dispatch(
    caller: CallerIdentity,
    command: IpcCommand,
    peer_uid: Option<u32>,
    events: &EventSender,
    sink: &Arc<FrameSink>,
) -> IpcResponse {
    // Only root may speak for another uid.
    if let Some(peer) = peer_uid {
        if peer != 0 && peer != caller.uid {
            warn!("peer uid {peer} claimed uid {}", caller.uid);
            return IpcResponse::code(TetherResultCode::NoChangeTetheringPermission);
        }
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let callback_sink = matches!(command, IpcCommand::RegisterCallback)
        .then(|| Arc::clone(sink) as Arc<dyn crate::callbacks::EventCallbackSink>);

    events.send(TetherEvent::Ipc(IpcRequest {
        command,
        caller,
        callback_sink,
        reply: reply_tx,
    }));

    match reply_rx.await {
        Ok(response) => response,
        Err(_) => IpcResponse::code(TetherResultCode::ServiceUnavail),
    }
}

async fn send_frame<W>(stream: &mut W, frame: &WireFrame) -> Result<(), IpcError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let encoded = encode_message(frame)?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(unix)]
fn peer_uid(stream: &UnixStream) -> Option<u32> {
    stream.peer_cred().ok().map(|cred| cred.uid())
}

#[cfg(not(unix))]
fn peer_uid(_stream: &UnixStream) -> Option<u32> {
    None
}

/// Client side, used by the CLI and tests.
pub struct IpcClient {
    socket_path: std::path::PathBuf,
}

impl IpcClient {
    #[must_use]
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send one command and wait for its response. Pushed events that
    /// arrive first are discarded; listeners should hold a dedicated
    /// connection.
    pub async fn send(
        &self,
        caller: CallerIdentity,
        command: IpcCommand,
    ) -> Result<IpcResponse, IpcError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| IpcError::ConnectionError(e.to_string()))?;

        let encoded = encode_message(&CommandFrame { caller, command })?;
        stream.write_all(&encoded).await?;
        stream.flush().await?;

        loop {
            let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
            stream.read_exact(&mut len_buf).await?;
            let msg_len = u32::from_be_bytes(len_buf) as usize;
            if msg_len > MAX_MESSAGE_SIZE {
                return Err(IpcError::protocol(format!("response too large: {msg_len}")));
            }
            let mut body = vec![0u8; msg_len];
            stream.read_exact(&mut body).await?;

            match decode_message::<WireFrame>(&body)? {
                WireFrame::Response(response) => return Ok(response),
                WireFrame::Event(_) => continue,
            }
        }
    }

    pub async fn ping(&self, caller: CallerIdentity) -> Result<bool, IpcError> {
        let response = self.send(caller, IpcCommand::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use tempfile::tempdir;

    use crate::event::channel;

    fn caller() -> CallerIdentity {
        CallerIdentity {
            // Use the test process uid so the peer-credential check passes.
            uid: current_uid(),
            package_name: "com.example.test".into(),
            permissions: BTreeSet::new(),
        }
    }

    #[cfg(unix)]
    fn current_uid() -> u32 {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0)
    }

    #[cfg(not(unix))]
    fn current_uid() -> u32 {
        0
    }

    #[tokio::test]
    async fn ping_roundtrip() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let config = IpcConfig {
            socket_path: socket_path.clone(),
            socket_mode: 0o600,
            enabled: true,
            max_message_size: 64 * 1024,
        };

        let (events, mut rx) = channel();
        let server = IpcServer::new(config, events);
        let shutdown = server.shutdown_sender();
        let server_handle = tokio::spawn(async move { server.run().await });

        // Answer loop standing in for the control plane.
        let responder = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if let TetherEvent::Ipc(req) = ev {
                    let _ = req.reply.send(match req.command {
                        IpcCommand::Ping => IpcResponse::Pong,
                        _ => IpcResponse::ok(),
                    });
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = IpcClient::new(&socket_path);
        assert!(client.ping(caller()).await.unwrap());

        let _ = shutdown.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
        server_handle.abort();
        responder.abort();
    }
}
