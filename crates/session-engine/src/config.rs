//! Engine configuration.
//!
//! Every tunable the engine uses lives here with its default. The host binary
//! loads an optional JSON file (camelCase keys, any subset of fields); the
//! rest fall back to the defaults below.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::multiplexer::{FlushPolicy, ReadWait};
use crate::pty::TerminationPolicy;

// ── Defaults ─────────────────────────────────────────────────────────

const DEBOUNCE_MS: u64 = 100;
const MAX_FRAME_BYTES: usize = 4096;
const IDLE_GRACE_MS: u64 = 10;
const READ_WAIT_MS: u64 = 50;
const TERMINATE_POLL_MS: u64 = 500;
const TERMINATE_DEADLINE_MS: u64 = 5_000;
const PING_INTERVAL_SECS: u64 = 60;
const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;
const BROADCAST_CAPACITY: usize = 256;
const OSC_PRIVATE_ID: &str = "1337";
const OSC_RESIDUAL_CAP: usize = 4096;
const EVENT_QUEUE: usize = 64;
const SESSION_IDLE_TIMEOUT_SECS: u64 = 300;
const REAP_INTERVAL_SECS: u64 = 30;
const SCROLLBACK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub flush: FlushConfig,
    pub termination: TerminationConfig,
    pub transport: TransportConfig,
    pub side_channel: SideChannelConfig,
    pub registry: RegistryConfig,
    pub spawn: SpawnConfig,
}

impl EngineConfig {
    /// Load from a JSON file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => EngineConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than zero".into(),
                });
            }
            Ok(())
        }

        non_zero("flush.debounceMs", self.flush.debounce_ms)?;
        non_zero("flush.maxFrameBytes", self.flush.max_frame_bytes as u64)?;
        non_zero("flush.idleGraceMs", self.flush.idle_grace_ms)?;
        non_zero("flush.readWaitMs", self.flush.read_wait_ms)?;
        non_zero("termination.pollMs", self.termination.poll_ms)?;
        non_zero("termination.deadlineMs", self.termination.deadline_ms)?;
        non_zero("transport.pingIntervalSecs", self.transport.ping_interval_secs)?;
        non_zero("transport.handshakeTimeoutMs", self.transport.handshake_timeout_ms)?;
        non_zero("transport.maxFramePayload", self.transport.max_frame_payload as u64)?;
        non_zero("sideChannel.residualCap", self.side_channel.residual_cap as u64)?;
        non_zero("sideChannel.eventQueue", self.side_channel.event_queue as u64)?;
        non_zero("registry.reapIntervalSecs", self.registry.reap_interval_secs)?;
        non_zero("registry.scrollbackBytes", self.registry.scrollback_bytes as u64)?;
        non_zero("registry.broadcastCapacity", self.registry.broadcast_capacity as u64)?;

        if self.termination.poll_ms > self.termination.deadline_ms {
            return Err(ConfigError::Invalid {
                field: "termination.pollMs",
                message: "must not exceed termination.deadlineMs".into(),
            });
        }
        if self.side_channel.private_id.is_empty()
            || !self.side_channel.private_id.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(ConfigError::Invalid {
                field: "sideChannel.privateId",
                message: format!("{:?} is not a numeric OSC id", self.side_channel.private_id),
            });
        }
        Ok(())
    }
}

// ── Flush ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlushConfig {
    /// Longest time accumulated output is held before delivery.
    pub debounce_ms: u64,
    pub max_frame_bytes: usize,
    /// Quiet period after the last byte that triggers an early flush.
    pub idle_grace_ms: u64,
    /// Readiness wait while nothing is buffered.
    pub read_wait_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEBOUNCE_MS,
            max_frame_bytes: MAX_FRAME_BYTES,
            idle_grace_ms: IDLE_GRACE_MS,
            read_wait_ms: READ_WAIT_MS,
        }
    }
}

impl FlushConfig {
    pub fn policy(&self) -> FlushPolicy {
        FlushPolicy {
            debounce: Duration::from_millis(self.debounce_ms),
            max_frame_size: self.max_frame_bytes.max(1),
            idle_grace: ReadWait::new(Duration::from_millis(self.idle_grace_ms)),
            read_wait: ReadWait::new(Duration::from_millis(self.read_wait_ms)),
        }
    }
}

// ── Termination ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminationConfig {
    pub poll_ms: u64,
    /// Hard deadline after SIGTERM before SIGKILL is sent.
    pub deadline_ms: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            poll_ms: TERMINATE_POLL_MS,
            deadline_ms: TERMINATE_DEADLINE_MS,
        }
    }
}

impl TerminationConfig {
    pub fn policy(&self) -> TerminationPolicy {
        TerminationPolicy {
            poll_interval: Duration::from_millis(self.poll_ms.max(1)),
            deadline: Duration::from_millis(self.deadline_ms),
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────

/// What to do with a connection that falls behind the output broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackpressurePolicy {
    /// Close the connection; the client may re-attach and get a replay.
    Disconnect,
    /// Skip the frames it missed and keep streaming.
    DropFrames,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Pong timeout equals this interval.
    pub ping_interval_secs: u64,
    pub handshake_timeout_ms: u64,
    pub max_frame_payload: usize,
    pub backpressure: BackpressurePolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: PING_INTERVAL_SECS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            max_frame_payload: MAX_FRAME_PAYLOAD,
            backpressure: BackpressurePolicy::Disconnect,
        }
    }
}

impl TransportConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

// ── Side channel ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SideChannelConfig {
    /// Numeric id in `ESC ] <id> ; Command=params BEL`.
    pub private_id: String,
    /// Largest unterminated envelope carried between flushes.
    pub residual_cap: usize,
    /// Events queued for the dispatch task before new ones are dropped.
    pub event_queue: usize,
    /// Also send each event to attached clients as a `view` frame.
    pub forward_to_clients: bool,
}

impl Default for SideChannelConfig {
    fn default() -> Self {
        Self {
            private_id: OSC_PRIVATE_ID.to_string(),
            residual_cap: OSC_RESIDUAL_CAP,
            event_queue: EVENT_QUEUE,
            forward_to_clients: true,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// Detached sessions older than this are terminated. Zero disables reaping.
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub scrollback_bytes: usize,
    /// Output events a session queues per subscriber before that subscriber
    /// counts as lagging.
    pub broadcast_capacity: usize,
    /// Where session records live for orphan sweeping. `None` disables records.
    pub state_dir: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: SESSION_IDLE_TIMEOUT_SECS,
            reap_interval_secs: REAP_INTERVAL_SECS,
            scrollback_bytes: SCROLLBACK_BYTES,
            broadcast_capacity: BROADCAST_CAPACITY,
            state_dir: default_state_dir(),
        }
    }
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

fn default_state_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(|home| PathBuf::from(home).join(".relay-tty").join("engine"))
}

// ── Spawn ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnConfig {
    /// Used when a create request names no shell.
    pub default_shell: String,
    /// Prepended to the child's PATH (viewer helper commands live here).
    pub helper_bin_dir: Option<PathBuf>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            default_shell: env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            helper_bin_dir: None,
        }
    }
}
