//! Client side of the attach protocol

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use crate::attach::AttachError;
use crate::protocol::{encode, ClientMessage, FrameDecoder, ServerMessage, Signal, StateSnapshot};

/// Connection to an [`AttachServer`](crate::attach::AttachServer) socket
///
/// Terminal bytes from `history` and `output` frames are also appended to a
/// transcript, so callers can wait for text regardless of which frame
/// carried it.
pub struct AttachClient {
    path: PathBuf,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: FrameDecoder<ServerMessage>,
    buf: Vec<u8>,
    transcript: Vec<u8>,
    /// Transcript bytes already returned by `read_until`
    consumed: usize,
    closed: bool,
}

impl AttachClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, AttachError> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|source| AttachError::Io {
                path: path.clone(),
                source,
            })?;
        let (reader, writer) = stream.into_split();
        debug!(path = %path.display(), "Connected to attach socket");

        Ok(Self {
            path,
            reader,
            writer,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; 8192],
            transcript: Vec::new(),
            consumed: 0,
            closed: false,
        })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), AttachError> {
        let frame = encode(message)?;
        self.send_raw(&frame).await
    }

    /// Write bytes as-is, framed or not
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), AttachError> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|source| AttachError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Register as `client_id` and wait for the server's state frame
    ///
    /// The history replayed before it lands in the transcript.
    pub async fn attach(
        &mut self,
        client_id: &str,
        size: Option<(u16, u16)>,
    ) -> Result<StateSnapshot, AttachError> {
        self.send(&ClientMessage::Attach {
            client_id: client_id.to_string(),
            cols: size.map(|(cols, _)| cols),
            rows: size.map(|(_, rows)| rows),
        })
        .await?;

        loop {
            match self.recv().await? {
                Some(ServerMessage::State(state)) => return Ok(state),
                Some(_) => continue,
                None => return Err(AttachError::Closed),
            }
        }
    }

    pub async fn detach(&mut self, client_id: &str) -> Result<(), AttachError> {
        self.send(&ClientMessage::Detach {
            client_id: client_id.to_string(),
        })
        .await
    }

    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<(), AttachError> {
        self.send(&ClientMessage::Stdin {
            data: data.to_vec(),
        })
        .await
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), AttachError> {
        self.send(&ClientMessage::Resize { cols, rows }).await
    }

    pub async fn signal(&mut self, signal: Signal) -> Result<(), AttachError> {
        self.send(&ClientMessage::Signal { signal }).await
    }

    /// Next server message, `None` once the server closed the connection
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>, AttachError> {
        loop {
            if let Some(message) = self.decoder.next_frame()? {
                if let ServerMessage::Output { data, .. } | ServerMessage::History { data } =
                    &message
                {
                    self.transcript.extend_from_slice(data);
                }
                return Ok(Some(message));
            }
            if self.closed {
                return Ok(None);
            }

            let n = self
                .reader
                .read(&mut self.buf)
                .await
                .map_err(|source| AttachError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            if n == 0 {
                self.closed = true;
                continue;
            }
            self.decoder.push(&self.buf[..n]);
        }
    }

    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ServerMessage>, AttachError> {
        within(timeout, self.recv()).await
    }

    /// Read until `needle` shows up in the terminal output, returning the
    /// output up to and including it
    pub async fn read_until(
        &mut self,
        needle: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, AttachError> {
        within(timeout, self.scan_for(needle)).await
    }

    /// Read until the `exit` frame, returning its code and signal
    pub async fn wait_for_exit(
        &mut self,
        timeout: Duration,
    ) -> Result<(Option<i32>, Option<String>), AttachError> {
        within(timeout, self.next_exit()).await
    }

    /// Discard messages until the server closes the connection
    pub async fn drain_until_closed(&mut self, timeout: Duration) -> Result<(), AttachError> {
        within(timeout, self.drain()).await
    }

    async fn scan_for(&mut self, needle: &[u8]) -> Result<Vec<u8>, AttachError> {
        loop {
            if let Some(end) = self.find_unconsumed(needle) {
                let out = self.transcript[self.consumed..end].to_vec();
                self.consumed = end;
                return Ok(out);
            }
            if self.recv().await?.is_none() {
                return Err(AttachError::Closed);
            }
        }
    }

    async fn next_exit(&mut self) -> Result<(Option<i32>, Option<String>), AttachError> {
        loop {
            match self.recv().await? {
                Some(ServerMessage::Exit { code, signal }) => return Ok((code, signal)),
                Some(_) => continue,
                None => return Err(AttachError::Closed),
            }
        }
    }

    async fn drain(&mut self) -> Result<(), AttachError> {
        while self.recv().await?.is_some() {}
        Ok(())
    }

    /// Every terminal byte received so far
    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    fn find_unconsumed(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(self.consumed);
        }
        self.transcript[self.consumed..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|pos| self.consumed + pos + needle.len())
    }
}

async fn within<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, AttachError>>,
) -> Result<T, AttachError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| AttachError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LifecycleState, ServerMessage};
    use tokio::net::UnixListener;

    async fn serve_frames(path: &Path, frames: Vec<ServerMessage>) -> tokio::task::JoinHandle<Vec<u8>> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 1024];
            let n = stream.read(&mut request).await.unwrap();
            for frame in &frames {
                stream.write_all(&encode(frame).unwrap()).await.unwrap();
            }
            request.truncate(n);
            request
        })
    }

    fn state() -> StateSnapshot {
        StateSnapshot {
            id: "worker".into(),
            state: LifecycleState::Running,
            pid: Some(7),
            exit_code: None,
            exit_signal: None,
            client_count: 1,
            buffer_size: 5,
        }
    }

    #[tokio::test]
    async fn test_attach_collects_history_into_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.sock");
        let server = serve_frames(
            &path,
            vec![
                ServerMessage::History { data: b"hello".to_vec() },
                ServerMessage::State(state()),
                ServerMessage::output(b" world"),
                ServerMessage::Exit { code: Some(3), signal: None },
            ],
        )
        .await;

        let mut client = AttachClient::connect(&path).await.unwrap();
        let snapshot = client.attach("tui", Some((80, 24))).await.unwrap();
        assert_eq!(snapshot.pid, Some(7));
        assert_eq!(client.transcript(), b"hello");

        let out = client.read_until(b"world", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(
            client.wait_for_exit(Duration::from_secs(5)).await.unwrap(),
            (Some(3), None)
        );
        assert!(client.recv().await.unwrap().is_none());

        let request = server.await.unwrap();
        let sent = FrameDecoder::<ClientMessage>::new().feed(&request).unwrap();
        assert_eq!(
            sent,
            vec![ClientMessage::Attach {
                client_id: "tui".into(),
                cols: Some(80),
                rows: Some(24),
            }]
        );
    }

    #[tokio::test]
    async fn test_read_until_reports_closed_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.sock");
        let _server = serve_frames(&path, vec![ServerMessage::output(b"partial")]).await;

        let mut client = AttachClient::connect(&path).await.unwrap();
        client.resize(100, 30).await.unwrap();
        let err = client
            .read_until(b"never", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::Closed));
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = AttachClient::connect(dir.path().join("missing.sock"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AttachError::Io { .. }));
    }
}
