//! Private OSC side-channel: `ESC ] <id> ; <Command>=<params> BEL`.
//!
//! The interceptor sits between the multiplexer's flushes and the clients.
//! Matched envelopes are cut out of the byte stream and turned into
//! [`SideChannelEvent`]s; everything else passes through byte-for-byte.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::registry::SessionId;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

// ── Commands ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SideChannelCommand {
    ViewImage,
    ViewVideo,
    ViewMarkdown,
    ViewHtml,
    ViewEbook,
    ViewPdf,
    ViewLog,
}

impl SideChannelCommand {
    pub const ALL: [SideChannelCommand; 7] = [
        SideChannelCommand::ViewImage,
        SideChannelCommand::ViewVideo,
        SideChannelCommand::ViewMarkdown,
        SideChannelCommand::ViewHtml,
        SideChannelCommand::ViewEbook,
        SideChannelCommand::ViewPdf,
        SideChannelCommand::ViewLog,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SideChannelCommand::ViewImage => "ViewImage",
            SideChannelCommand::ViewVideo => "ViewVideo",
            SideChannelCommand::ViewMarkdown => "ViewMarkdown",
            SideChannelCommand::ViewHtml => "ViewHtml",
            SideChannelCommand::ViewEbook => "ViewEbook",
            SideChannelCommand::ViewPdf => "ViewPdf",
            SideChannelCommand::ViewLog => "ViewLog",
        }
    }
}

impl fmt::Display for SideChannelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl FromStr for SideChannelCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideChannelEvent {
    pub command: SideChannelCommand,
    pub params: String,
    pub session_id: SessionId,
}

// ── Interceptor ─────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Intercepted {
    pub clean: Vec<u8>,
    pub events: Vec<SideChannelEvent>,
}

/// Per-session scanner. Holds back a trailing, not-yet-terminated envelope
/// (or a prefix that could still become one) until the next frame.
pub struct Interceptor {
    session_id: SessionId,
    /// `ESC ] <id> ;`
    prefix: Vec<u8>,
    residual: Vec<u8>,
    residual_cap: usize,
}

impl Interceptor {
    pub fn new(session_id: SessionId, private_id: &str, residual_cap: usize) -> Self {
        let mut prefix = vec![ESC, b']'];
        prefix.extend_from_slice(private_id.as_bytes());
        prefix.push(b';');
        Self {
            session_id,
            prefix,
            residual: Vec::new(),
            residual_cap,
        }
    }

    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }

    pub fn process(&mut self, frame: &[u8]) -> Intercepted {
        let input = if self.residual.is_empty() {
            frame.to_vec()
        } else {
            let mut joined = std::mem::take(&mut self.residual);
            joined.extend_from_slice(frame);
            joined
        };

        let mut out = Intercepted {
            clean: Vec::with_capacity(input.len()),
            events: Vec::new(),
        };
        let mut i = 0;

        while i < input.len() {
            let Some(offset) = input[i..].iter().position(|&b| b == ESC) else {
                out.clean.extend_from_slice(&input[i..]);
                break;
            };
            let start = i + offset;
            out.clean.extend_from_slice(&input[i..start]);
            let rest = &input[start..];

            if rest.len() < self.prefix.len() && self.prefix.starts_with(rest) {
                // could still turn into our envelope
                self.carry(rest, &mut out.clean);
                break;
            }
            if !rest.starts_with(&self.prefix) {
                out.clean.push(ESC);
                i = start + 1;
                continue;
            }

            let body_start = start + self.prefix.len();
            match input[body_start..].iter().position(|&b| b == BEL || b == ESC) {
                Some(len) if input[body_start + len] == BEL => {
                    self.accept(&input[body_start..body_start + len], &mut out.events);
                    i = body_start + len + 1;
                }
                Some(len) => {
                    // a new escape inside the body abandons the envelope
                    self.reject(&input[body_start..body_start + len]);
                    i = body_start + len;
                }
                None => {
                    self.carry(rest, &mut out.clean);
                    break;
                }
            }
        }

        out
    }

    /// Release whatever is still held back. Called on the terminating flush.
    pub fn finish(&mut self) -> Vec<u8> {
        if !self.residual.is_empty() {
            debug!(session = %self.session_id, bytes = self.residual.len(), "releasing unterminated side-channel bytes");
        }
        std::mem::take(&mut self.residual)
    }

    fn carry(&mut self, rest: &[u8], clean: &mut Vec<u8>) {
        if rest.len() > self.residual_cap {
            warn!(
                session = %self.session_id,
                bytes = rest.len(),
                cap = self.residual_cap,
                "unterminated side-channel envelope exceeds residual cap; passing through"
            );
            clean.extend_from_slice(rest);
        } else {
            self.residual = rest.to_vec();
        }
    }

    fn accept(&self, body: &[u8], events: &mut Vec<SideChannelEvent>) {
        let text = String::from_utf8_lossy(body);
        let parsed = text
            .split_once('=')
            .and_then(|(name, params)| Some((name.parse::<SideChannelCommand>().ok()?, params)));
        match parsed {
            Some((command, params)) => events.push(SideChannelEvent {
                command,
                params: params.to_string(),
                session_id: self.session_id,
            }),
            None => self.reject(body),
        }
    }

    fn reject(&self, body: &[u8]) {
        let err = EngineError::MalformedSideChannel {
            payload: String::from_utf8_lossy(body).into_owned(),
        };
        debug!(session = %self.session_id, error = %err, "stripped side-channel envelope");
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
