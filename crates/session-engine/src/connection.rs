//! One client connection: handshake, then a single task that forwards
//! session events out, client frames in, and runs the ping/pong health check.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BackpressurePolicy, TransportConfig};
use crate::error::{EngineError, Result};
use crate::pty::{Dimensions, SessionSpec};
use crate::registry::{Attachment, RegistryHandle, SessionEvent, SessionId};
use crate::transport::{write_frame, Frame, FrameReader, Utf8Decoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ── Health ──────────────────────────────────────────────────────────

/// Liveness bookkeeping for one attached client.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub session_id: SessionId,
    pub ping_interval: Duration,
    last_pong: Instant,
    unanswered_since: Option<Instant>,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, session_id: SessionId, ping_interval: Duration) -> Self {
        Self {
            id,
            session_id,
            ping_interval,
            last_pong: Instant::now(),
            unanswered_since: None,
        }
    }

    pub fn last_pong(&self) -> Instant {
        self.last_pong
    }

    pub fn record_ping(&mut self, now: Instant) {
        self.unanswered_since.get_or_insert(now);
    }

    pub fn record_pong(&mut self, now: Instant) {
        self.last_pong = now;
        self.unanswered_since = None;
    }

    /// When the oldest unanswered ping expires, if one is outstanding.
    pub fn pong_deadline(&self) -> Option<Instant> {
        self.unanswered_since.map(|sent| sent + self.ping_interval)
    }

    /// Dead once a ping has gone a full interval without a pong.
    pub fn is_alive(&self, now: Instant) -> bool {
        self.pong_deadline().map_or(true, |deadline| now < deadline)
    }
}

// ── Serving ─────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEnd {
    ClientClosed,
    SessionEnded(Option<i32>),
    /// Fell behind the broadcast queue under the disconnect policy.
    Overrun(u64),
}

/// Serve a client until it disconnects, its session ends, or it fails the
/// health check. The session itself is never terminated here unless the
/// client sends `close`.
pub async fn serve_connection<S>(stream: S, registry: RegistryHandle, config: TransportConfig)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let connection_id = ConnectionId::new();
    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames = FrameReader::new(read_half, config.max_frame_payload);
    let mut link = Link {
        writer: write_half,
        limit: config.ping_interval(),
    };

    let handshake = time::timeout(config.handshake_timeout(), handshake(&mut frames, &registry, connection_id)).await;
    let attachment = match handshake {
        Ok(Ok(attachment)) => attachment,
        Ok(Err(err)) => {
            if err.is_session_fatal() {
                warn!(connection = %connection_id, error = %err, "session create failed");
            } else {
                debug!(connection = %connection_id, error = %err, "handshake rejected");
            }
            let _ = link.send(&Frame::Error { message: err.to_string() }).await;
            return;
        }
        Err(_) => {
            debug!(connection = %connection_id, "handshake timed out");
            let _ = link
                .send(&Frame::Error {
                    message: "handshake timed out".into(),
                })
                .await;
            return;
        }
    };

    let session_id = attachment.session_id;
    info!(connection = %connection_id, session = %session_id, "client attached");
    let end = run_attached(&mut frames, &mut link, attachment, &config, &registry).await;
    registry.detach(session_id, connection_id).await;

    match end {
        Ok(end) => info!(connection = %connection_id, session = %session_id, ?end, "client detached"),
        Err(err @ EngineError::ConnectionTimeout(_)) => {
            warn!(connection = %connection_id, session = %session_id, error = %err, "dropping unresponsive client")
        }
        Err(err) => debug!(connection = %connection_id, session = %session_id, error = %err, "connection failed"),
    }
}

async fn handshake<R>(
    frames: &mut FrameReader<R>,
    registry: &RegistryHandle,
    connection_id: ConnectionId,
) -> Result<Attachment>
where
    R: AsyncRead + Unpin,
{
    let session_id = match frames.next_frame().await? {
        Some(Frame::Create {
            shell,
            args,
            cwd,
            env,
            cols,
            rows,
        }) => {
            let spec = SessionSpec {
                shell,
                args,
                cwd,
                env,
                dimensions: Dimensions::clamped(cols, rows),
            };
            registry.create(spec).await?
        }
        Some(Frame::Attach { session_id }) => session_id,
        Some(other) => {
            return Err(EngineError::Protocol(format!(
                "expected create or attach, got {}",
                other.kind()
            )))
        }
        None => return Err(EngineError::Protocol("closed before handshake".into())),
    };
    registry.attach(session_id, connection_id).await
}

struct Link<W> {
    writer: W,
    limit: Duration,
}

impl<W: AsyncWrite + Unpin> Link<W> {
    async fn send(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.writer, frame, self.limit).await
    }
}

async fn run_attached<R, W>(
    frames: &mut FrameReader<R>,
    link: &mut Link<W>,
    attachment: Attachment,
    config: &TransportConfig,
    registry: &RegistryHandle,
) -> Result<ConnectionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Attachment {
        session_id,
        connection_id,
        dimensions,
        replay,
        mut events,
        input,
    } = attachment;
    let mut conn = ClientConnection::new(connection_id, session_id, config.ping_interval());
    let mut decoder = Utf8Decoder::default();

    link.send(&Frame::Attached {
        session_id,
        connection_id,
        cols: dimensions.cols,
        rows: dimensions.rows,
    })
    .await?;
    if !replay.is_empty() {
        link.send(&Frame::Replay {
            data: decoder.decode(&replay),
        })
        .await?;
    }

    let mut ping = time::interval_at(Instant::now() + conn.ping_interval, conn.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let pong_deadline = conn.pong_deadline();
        tokio::select! {
            _ = time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                return Err(EngineError::ConnectionTimeout(conn.ping_interval));
            }
            frame = frames.next_frame() => {
                let Some(frame) = frame? else {
                    return Ok(ConnectionEnd::ClientClosed);
                };
                match frame {
                    Frame::Input { data } => {
                        if let Err(err) = input.write(data.into_bytes()).await {
                            debug!(connection = %connection_id, error = %err, "input dropped");
                        }
                    }
                    Frame::Resize { cols, rows } => {
                        if let Err(err) = input.resize(Dimensions::clamped(cols, rows)).await {
                            debug!(connection = %connection_id, error = %err, "resize dropped");
                        }
                    }
                    Frame::Ping => link.send(&Frame::Pong).await?,
                    Frame::Pong => conn.record_pong(Instant::now()),
                    Frame::Close => {
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            if let Err(err) = registry.terminate(session_id).await {
                                debug!(session = %session_id, error = %err, "close request failed");
                            }
                        });
                    }
                    other => {
                        link.send(&Frame::Error {
                            message: format!("unexpected {} frame", other.kind()),
                        })
                        .await?
                    }
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Output(bytes)) => {
                    let data = decoder.decode(&bytes);
                    if !data.is_empty() {
                        link.send(&Frame::Output { data }).await?;
                    }
                }
                Ok(SessionEvent::SideChannel(event)) => {
                    link.send(&Frame::View {
                        command: event.command,
                        params: event.params,
                    })
                    .await?;
                }
                Ok(SessionEvent::Exit { code }) => {
                    let tail = decoder.finish();
                    if !tail.is_empty() {
                        link.send(&Frame::Output { data: tail }).await?;
                    }
                    link.send(&Frame::Exit { code }).await?;
                    return Ok(ConnectionEnd::SessionEnded(code));
                }
                Err(RecvError::Lagged(missed)) => match config.backpressure {
                    BackpressurePolicy::Disconnect => {
                        let _ = link
                            .send(&Frame::Error {
                                message: format!("client fell behind by {missed} frames"),
                            })
                            .await;
                        return Ok(ConnectionEnd::Overrun(missed));
                    }
                    BackpressurePolicy::DropFrames => {
                        warn!(connection = %connection_id, missed, "slow client; dropped output frames");
                    }
                },
                Err(RecvError::Closed) => return Ok(ConnectionEnd::SessionEnded(None)),
            },
            scheduled = ping.tick() => {
                if !conn.is_alive(scheduled) {
                    return Err(EngineError::ConnectionTimeout(conn.ping_interval));
                }
                conn.record_ping(scheduled);
                link.send(&Frame::Ping).await?;
            }
        }
    }
}

// ── Unit tests ──────────────────────────────────────────────────────
