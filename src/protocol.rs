//! Attach wire protocol
//!
//! Every frame is a 4-byte big-endian payload length followed by a UTF-8
//! JSON object discriminated by its `type` field. Binary data travels as
//! base64 strings.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Largest payload accepted on encode and decode
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Protocol errors; all of them are fatal for the connection that produced them
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame payload: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Frame payload has no type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A message family that can travel in frames
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Accepted values of the `type` discriminant
    const TYPES: &'static [&'static str];
}

/// Signals a client may forward to the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    #[serde(rename = "SIGINT")]
    Interrupt,
    #[serde(rename = "SIGTERM")]
    Terminate,
    #[serde(rename = "SIGKILL")]
    Kill,
    #[serde(rename = "SIGTSTP")]
    Stop,
}

impl Signal {
    pub fn as_raw(&self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Stop => libc::SIGTSTP,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Stop => "SIGTSTP",
        }
    }
}

/// Name of a raw signal number, `SIG<n>` for ones we do not know
pub fn signal_name(raw: libc::c_int) -> String {
    match raw {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        other => format!("SIG{other}"),
    }
}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Exiting,
    Exited,
}

/// Snapshot of an attach session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub id: String,
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub client_count: usize,
    pub buffer_size: usize,
}

/// Client → server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Attach {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    Detach {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Signal {
        signal: Signal,
    },
    Stdin {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl WireMessage for ClientMessage {
    const TYPES: &'static [&'static str] = &["attach", "detach", "resize", "signal", "stdin"];
}

/// Server → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Output {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        timestamp: i64,
    },
    History {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    State(StateSnapshot),
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
    Error {
        message: String,
    },
}

impl WireMessage for ServerMessage {
    const TYPES: &'static [&'static str] = &["output", "history", "state", "exit", "error"];
}

impl ServerMessage {
    pub fn output(data: &[u8]) -> Self {
        ServerMessage::Output {
            data: data.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Encode one frame with the default payload limit
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    encode_with_limit(message, MAX_PAYLOAD_BYTES)
}

/// Encode one frame, refusing payloads over `max` bytes
pub fn encode_with_limit<T: Serialize>(message: &T, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    if payload.len() > max || payload.len() > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Streaming frame decoder
///
/// Socket reads are pushed in as they arrive; complete frames are pulled
/// out one at a time, any partial tail stays buffered. After an oversized
/// header the stream cannot be resynchronized and the decoder keeps
/// reporting the same error.
pub struct FrameDecoder<T> {
    buf: Vec<u8>,
    max: usize,
    oversized: Option<usize>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: WireMessage> FrameDecoder<T> {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_BYTES)
    }

    pub fn with_max_payload(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
            oversized: None,
            _marker: PhantomData,
        }
    }

    /// Buffer a chunk without decoding it
    pub fn push(&mut self, chunk: &[u8]) {
        if self.oversized.is_none() {
            self.buf.extend_from_slice(chunk);
        }
    }

    /// Decode the next complete frame, if any
    pub fn next_frame(&mut self) -> Result<Option<T>, ProtocolError> {
        if let Some(size) = self.oversized {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max,
            });
        }
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let size = u32::from_be_bytes(header) as usize;
        if size > self.max {
            self.oversized = Some(size);
            self.buf = Vec::new();
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max,
            });
        }
        if self.buf.len() < HEADER_LEN + size {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buf.drain(..HEADER_LEN + size).collect();
        decode_payload(&frame[HEADER_LEN..]).map(Some)
    }

    /// Buffer `chunk` and return every frame it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<T>, ProtocolError> {
        self.push(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl<T: WireMessage> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_payload<T: WireMessage>(payload: &[u8]) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_slice(payload).map_err(ProtocolError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    if !T::TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    serde_json::from_value(value).map_err(ProtocolError::Malformed)
}
