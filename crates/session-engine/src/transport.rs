//! Wire protocol between clients and the engine.
//!
//! Each frame is `[4-byte big-endian length][JSON payload]`. The payload is
//! an envelope tagged by `type`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::ConnectionId;
use crate::error::{EngineError, Result};
use crate::osc::SideChannelCommand;
use crate::registry::SessionId;

const READ_CHUNK: usize = 64 * 1024;

// ── Frames ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Handshake: start a new session and attach to it.
    Create {
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default = "default_cols")]
        cols: i64,
        #[serde(default = "default_rows")]
        rows: i64,
    },
    /// Handshake: join an existing session.
    Attach { session_id: SessionId },
    Attached {
        session_id: SessionId,
        connection_id: ConnectionId,
        cols: u16,
        rows: u16,
    },
    Input { data: String },
    Output { data: String },
    /// Scrollback sent once, right after `attached`.
    Replay { data: String },
    Resize { cols: i64, rows: i64 },
    Ping,
    Pong,
    View {
        command: SideChannelCommand,
        params: String,
    },
    Exit { code: Option<i32> },
    /// Client asks for the session to be terminated.
    Close,
    Error { message: String },
}

fn default_cols() -> i64 {
    80
}

fn default_rows() -> i64 {
    24
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Create { .. } => "create",
            Frame::Attach { .. } => "attach",
            Frame::Attached { .. } => "attached",
            Frame::Input { .. } => "input",
            Frame::Output { .. } => "output",
            Frame::Replay { .. } => "replay",
            Frame::Resize { .. } => "resize",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::View { .. } => "view",
            Frame::Exit { .. } => "exit",
            Frame::Close => "close",
            Frame::Error { .. } => "error",
        }
    }
}

// ── Framing ─────────────────────────────────────────────────────────

pub fn encode_payload(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(frame)
        .map_err(|err| EngineError::Protocol(format!("cannot encode {} frame: {err}", frame.kind())))?;
    Ok(encode_payload(&payload))
}

/// Write one frame, giving up after `limit` so a stuck peer cannot pin the
/// caller.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, limit: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame)?;
    match tokio::time::timeout(limit, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    {
        Ok(result) => Ok(result?),
        Err(_) => Err(EngineError::ConnectionTimeout(limit)),
    }
}

/// Incremental frame reader. `next_frame` is cancel-safe: partial input is
/// kept in `pending` between calls.
pub struct FrameReader<R> {
    reader: R,
    pending: Vec<u8>,
    read_buf: Vec<u8>,
    max_payload: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_payload: usize) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            read_buf: vec![0u8; READ_CHUNK],
            max_payload,
        }
    }

    /// `Ok(None)` on a clean disconnect between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(payload) = self.take_payload()? {
                if payload.is_empty() {
                    continue;
                }
                return serde_json::from_slice(&payload)
                    .map(Some)
                    .map_err(|err| EngineError::Protocol(format!("invalid frame: {err}")));
            }

            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Err(EngineError::Protocol("connection closed mid-frame".into()));
            }
            self.pending.extend_from_slice(&self.read_buf[..n]);
        }
    }

    fn take_payload(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pending.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.pending[0], self.pending[1], self.pending[2], self.pending[3]]) as usize;
        if len > self.max_payload {
            return Err(EngineError::Protocol(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_payload
            )));
        }
        if self.pending.len() < 4 + len {
            return Ok(None);
        }
        let payload = self.pending[4..4 + len].to_vec();
        self.pending.drain(..4 + len);
        Ok(Some(payload))
    }
}

// ── UTF-8 ───────────────────────────────────────────────────────────

/// Turns PTY bytes into text without splitting code points across frames.
/// Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let input = if self.pending.is_empty() {
            bytes.to_vec()
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(bytes);
            joined
        };

        let mut out = String::with_capacity(input.len());
        let mut rest = &input[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        out.push_str(text);
                    }
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            // incomplete code point at the end
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush a dangling partial code point.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned()
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
