//! Reusable harness for session-engine integration tests.
//!
//! Spawns the engine binary against a throwaway HOME, connects over its Unix
//! socket, and speaks the length-prefixed JSON frame protocol.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

// ── Frame encoding/decoding ─────────────────────────────────────────

pub fn encode_frame(frame: &Value) -> Vec<u8> {
    let payload = serde_json::to_vec(frame).expect("frame serializes");
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

pub fn frame_type(frame: &Value) -> &str {
    frame["type"].as_str().unwrap_or("")
}

/// Concatenated `data` of every replay/output frame.
pub fn output_text(frames: &[Value]) -> String {
    frames
        .iter()
        .filter(|f| matches!(frame_type(f), "output" | "replay"))
        .filter_map(|f| f["data"].as_str())
        .collect()
}

// ── EngineHandle ────────────────────────────────────────────────────

/// Handle to a running engine process. Cleans up on drop.
pub struct EngineHandle {
    pub child: Child,
    pub socket_path: PathBuf,
    pub home_dir: PathBuf,
}

impl EngineHandle {
    /// Where the engine keeps session records under the temp HOME.
    pub fn state_dir(&self) -> PathBuf {
        self.home_dir.join(".relay-tty").join("engine")
    }

    pub fn connect(&self) -> io::Result<SocketClient> {
        connect(&self.socket_path)
    }

    /// Connect and create a session running `sh -c <script>`.
    pub fn create_sh(&self, script: &str) -> io::Result<(SocketClient, String)> {
        let mut client = self.connect()?;
        client.send(&json!({"type": "create", "shell": "/bin/sh", "args": ["-c", script]}))?;
        let attached = client
            .wait_for("attached", Duration::from_secs(5))
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no attached frame"))?;
        let id = attached["sessionId"].as_str().unwrap_or_default().to_string();
        Ok((client, id))
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = fs::remove_file(&self.socket_path);
        let _ = fs::remove_dir_all(&self.home_dir);
    }
}

// ── SocketClient ────────────────────────────────────────────────────

/// Client wrapper for a connected Unix socket with frame-level read/write.
pub struct SocketClient {
    stream: UnixStream,
    read_buf: Vec<u8>,
}

impl SocketClient {
    pub fn new(stream: UnixStream) -> Self {
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn send(&mut self, frame: &Value) -> io::Result<()> {
        self.stream.write_all(&encode_frame(frame))
    }

    pub fn send_input(&mut self, data: &str) -> io::Result<()> {
        self.send(&json!({"type": "input", "data": data}))
    }

    pub fn send_resize(&mut self, cols: i64, rows: i64) -> io::Result<()> {
        self.send(&json!({"type": "resize", "cols": cols, "rows": rows}))
    }

    /// Write raw bytes, bypassing framing.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Read the next frame, waiting at most `timeout`. None on timeout or
    /// disconnect.
    pub fn recv_frame(&mut self, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.read_buf.len() >= 4 {
                let len = u32::from_be_bytes([self.read_buf[0], self.read_buf[1], self.read_buf[2], self.read_buf[3]])
                    as usize;
                if self.read_buf.len() >= 4 + len {
                    let payload: Vec<u8> = self.read_buf.drain(..4 + len).skip(4).collect();
                    return serde_json::from_slice(&payload).ok();
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(10))))
                .ok();

            let mut buf = [0u8; 65536];
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return None,
            }
        }
    }

    /// Wait for a frame of the given type, discarding others.
    pub fn wait_for(&mut self, kind: &str, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.recv_frame(remaining) {
                Some(frame) if frame_type(&frame) == kind => return Some(frame),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Collect frames until output contains `needle`; returns everything seen.
    pub fn collect_until_output(&mut self, needle: &str, timeout: Duration) -> Vec<Value> {
        let deadline = Instant::now() + timeout;
        let mut frames = Vec::new();
        while !output_text(&frames).contains(needle) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.recv_frame(remaining) {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        frames
    }

    /// Collect every frame that arrives within `timeout`, stopping early on
    /// disconnect.
    pub fn collect_frames(&mut self, timeout: Duration) -> Vec<Value> {
        let deadline = Instant::now() + timeout;
        let mut frames = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.recv_frame(remaining) {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        frames
    }
}

// ── Spawn helpers ───────────────────────────────────────────────────

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_relay-session-engine"))
}

/// Spawn the engine with default configuration.
pub fn spawn_engine() -> io::Result<EngineHandle> {
    spawn_engine_with_config(None)
}

/// Spawn the engine with HOME pointed at a temp dir so session records stay
/// out of the real `~/.relay-tty/`. `config` is written to a JSON file and
/// passed on the command line.
pub fn spawn_engine_with_config(config: Option<Value>) -> io::Result<EngineHandle> {
    #[allow(deprecated)]
    let home_dir = tempfile::tempdir()?.into_path();
    let socket_path = home_dir.join("engine.sock");

    let mut cmd = Command::new(binary_path());
    cmd.arg(&socket_path);
    if let Some(config) = config {
        let config_path = home_dir.join("engine.json");
        fs::write(&config_path, serde_json::to_vec(&config)?)?;
        cmd.arg(&config_path);
    }
    cmd.env("HOME", &home_dir).env("RUST_LOG", "relay_session_engine=debug");

    let child = cmd.spawn()?;
    let handle = EngineHandle {
        child,
        socket_path,
        home_dir,
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !handle.socket_path.exists() {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "socket did not appear within 5 seconds",
            ));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    // let the listener start accepting
    std::thread::sleep(Duration::from_millis(50));

    Ok(handle)
}

pub fn connect(socket_path: &Path) -> io::Result<SocketClient> {
    UnixStream::connect(socket_path).map(SocketClient::new)
}

pub fn read_json(path: &Path) -> io::Result<Value> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Poll until `check` holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}
