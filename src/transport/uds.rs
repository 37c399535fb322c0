use super::TransportState;
use crate::defaults;
use crate::error::{BrokerError, BrokerResult};
use crate::message::Message;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// A single newline-framed Unix domain socket endpoint.
///
/// `Send` serializes concurrent writers internally so frames never
/// interleave; `Receive` is single-reader by construction (the read half is
/// only ever borrowed by whichever task owns the transport's read loop).
pub struct UdsTransport {
    socket_path: PathBuf,
    max_message_size: usize,
    owns_socket_file: bool,
    state: AsyncMutex<TransportState>,
    listener: AsyncMutex<Option<UnixListener>>,
    reader: AsyncMutex<Option<BufReader<OwnedReadHalf>>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
}

impl UdsTransport {
    /// Construct an unbound transport at `socket_path` with the default
    /// maximum message size.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self::with_max_message_size(socket_path, defaults::MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(socket_path: impl AsRef<Path>, max_message_size: usize) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            max_message_size,
            owns_socket_file: false,
            state: AsyncMutex::new(TransportState::Unbound),
            listener: AsyncMutex::new(None),
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn state(&self) -> TransportState {
        *self.state.lock().await
    }

    /// Bind a listener at `socket_path` (server side). Removes a stale
    /// socket file left behind by a prior run and relaxes permissions so a
    /// child running as a different user can still connect.
    pub async fn register_listener(&self) -> BrokerResult<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            BrokerError::transport_io(format!(
                "binding {}: {e}",
                self.socket_path.display()
            ))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &self.socket_path,
                std::fs::Permissions::from_mode(0o666),
            );
        }
        *self.listener.lock().await = Some(listener);
        *self.state.lock().await = TransportState::Listening;
        Ok(())
    }

    /// Accept the single peer connection. Idempotent only in the sense that
    /// calling it twice without an intervening close is a caller bug; the
    /// second call simply blocks on a listener that is still there.
    pub async fn accept(&self) -> BrokerResult<()> {
        let mut listener_guard = self.listener.lock().await;
        let listener = listener_guard
            .as_ref()
            .ok_or_else(|| BrokerError::illegal_state("transport has no listener to accept on"))?;
        let (stream, _addr) = listener.accept().await.map_err(|e| {
            BrokerError::transport_io(format!("accept on {}: {e}", self.socket_path.display()))
        })?;
        drop(listener_guard);
        self.adopt_stream(stream).await;
        Ok(())
    }

    /// Dial `socket_path` as a client.
    pub async fn dial(&self) -> BrokerResult<()> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            BrokerError::transport_io(format!("connecting to {}: {e}", self.socket_path.display()))
        })?;
        self.adopt_stream(stream).await;
        Ok(())
    }

    async fn adopt_stream(&self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(BufReader::new(read_half));
        *self.writer.lock().await = Some(write_half);
        *self.state.lock().await = TransportState::Connected;
    }

    /// Write one marshaled envelope followed by `\n`. Concurrent callers
    /// serialize on the internal write-half lock.
    pub async fn send(&self, msg: &Message) -> BrokerResult<()> {
        let state = self.state().await;
        if state != TransportState::Connected {
            return Err(BrokerError::illegal_state("not connected"));
        }
        let mut bytes = msg.marshal()?;
        bytes.push(b'\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| BrokerError::illegal_state("not connected"))?;
        if let Err(e) = writer.write_all(&bytes).await.and(writer.flush().await) {
            *self.state.lock().await = TransportState::Closed;
            *guard = None;
            return Err(BrokerError::transport_io(format!("write failed: {e}")));
        }
        Ok(())
    }

    /// Read one line-framed envelope. Enforces `max_message_size` on the
    /// accumulated line before it is ever handed to the JSON decoder.
    pub async fn receive(&self) -> BrokerResult<Message> {
        let state = self.state().await;
        if state != TransportState::Connected {
            return Err(BrokerError::illegal_state("not connected"));
        }

        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| BrokerError::illegal_state("not connected"))?;

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = match reader.read_exact(&mut byte).await {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    *self.state.lock().await = TransportState::Closed;
                    *guard = None;
                    return Err(BrokerError::transport_io("peer closed connection"));
                }
                Err(e) => {
                    *self.state.lock().await = TransportState::Closed;
                    *guard = None;
                    return Err(BrokerError::transport_io(format!("read failed: {e}")));
                }
            };
            if n == 0 {
                continue;
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > self.max_message_size {
                return Err(BrokerError::transport_io(format!(
                    "message exceeds maximum size of {} bytes",
                    self.max_message_size
                )));
            }
        }

        Message::unmarshal(&line)
    }

    /// Close the transport. Removes the socket file if this side owns it.
    pub async fn close(&self) -> BrokerResult<()> {
        *self.state.lock().await = TransportState::Closed;
        self.listener.lock().await.take();
        self.reader.lock().await.take();
        self.writer.lock().await.take();
        if self.owns_socket_file {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.socket_path.display(), error = %e, "failed to remove socket file");
                }
            }
        }
        debug!(path = %self.socket_path.display(), "transport closed");
        Ok(())
    }

    /// Mark this transport as the owner of its socket file, so `close`
    /// unlinks it. Only the server side (the one that called
    /// `register_listener`) should set this.
    pub fn set_owns_socket_file(&mut self, owns: bool) {
        self.owns_socket_file = owns;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("procbroker-test-{name}-{}.sock", std::process::id()))
    }

    #[tokio::test]
    async fn send_then_receive_round_trips_over_loopback_socket() {
        let path = socket_path("roundtrip");
        let _ = std::fs::remove_file(&path);

        let mut server = UdsTransport::new(&path);
        server.set_owns_socket_file(true);
        server.register_listener().await.unwrap();

        let client = UdsTransport::new(&path);
        let server_accept = tokio::spawn(async move {
            server.accept().await.unwrap();
            let msg = server.receive().await.unwrap();
            server.close().await.unwrap();
            msg
        });

        client.dial().await.unwrap();
        let msg = Message::new_event("subprocess_ready", "child", &json!({})).unwrap();
        client.send(&msg).await.unwrap();
        client.close().await.unwrap();

        let received = server_accept.await.unwrap();
        assert_eq!(received.id, "subprocess_ready");
    }

    #[tokio::test]
    async fn send_before_connected_is_illegal_state() {
        let path = socket_path("unconnected");
        let transport = UdsTransport::new(&path);
        let msg = Message::new_event("e", "src", &json!({})).unwrap();
        let err = transport.send(&msg).await.unwrap_err();
        assert!(matches!(err, BrokerError::IllegalState(_)));
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let path = socket_path("oversized");
        let _ = std::fs::remove_file(&path);

        let mut server = UdsTransport::with_max_message_size(&path, 8);
        server.set_owns_socket_file(true);
        server.register_listener().await.unwrap();

        let client = UdsTransport::new(&path);
        let server_task = tokio::spawn(async move {
            server.accept().await.unwrap();
            let result = server.receive().await;
            server.close().await.unwrap();
            result
        });

        client.dial().await.unwrap();
        // Write a line far longer than the 8-byte cap directly, bypassing
        // Message::marshal so the oversized-frame path is what's exercised.
        {
            let mut guard = client.writer.lock().await;
            let writer = guard.as_mut().unwrap();
            writer.write_all(b"0123456789abcdef\n").await.unwrap();
            writer.flush().await.unwrap();
        }
        client.close().await.unwrap();

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(BrokerError::TransportIo(_))));
    }
}
