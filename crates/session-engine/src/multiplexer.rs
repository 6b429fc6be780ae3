//! Debounced reader over a PTY's output stream.
//!
//! Bytes are accumulated into an [`OutputFrame`] and handed to a
//! [`FlushSink`] when the frame is old enough, big enough, the producer has
//! gone quiet, or the session is going away. Every trigger goes through the
//! same flush routine and a flush always takes the whole frame.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reads attempted while draining on shutdown before the terminal flush.
const DRAIN_READS: usize = 64;

// ── Readiness wait ──────────────────────────────────────────────────

/// How long a read may wait for the fd to become readable. Never zero: a
/// zero wait turns the read loop into a busy spin on the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadWait(Duration);

impl ReadWait {
    pub const FLOOR: Duration = Duration::from_millis(1);

    pub fn new(wait: Duration) -> Self {
        Self(wait.max(Self::FLOOR))
    }

    pub fn get(self) -> Duration {
        self.0
    }

    pub fn at_most(self, cap: Duration) -> Self {
        Self::new(self.0.min(cap))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Nothing arrived within the wait. Not an error.
    TimedOut,
    Eof,
}

/// Something the multiplexer can pull bytes from. Implementations must
/// return as soon as data is available rather than sleeping out the wait.
pub trait OutputSource: Send {
    fn read_chunk<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        wait: ReadWait,
    ) -> impl Future<Output = io::Result<ReadOutcome>> + Send + 'a;
}

// ── Frames ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Debounce,
    SizeCap,
    Idle,
    Terminating,
}

/// Bytes accumulated since the last flush.
#[derive(Debug, Default)]
pub struct OutputFrame {
    bytes: Vec<u8>,
    started_at: Option<Instant>,
}

impl OutputFrame {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            started_at: None,
        }
    }

    pub fn push(&mut self, data: &[u8], now: Instant) {
        if data.is_empty() {
            return;
        }
        if self.bytes.is_empty() {
            self.started_at = Some(now);
        }
        self.bytes.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }

    fn take(&mut self) -> (Vec<u8>, Option<Instant>) {
        let capacity = self.bytes.capacity();
        let bytes = std::mem::replace(&mut self.bytes, Vec::with_capacity(capacity));
        (bytes, self.started_at.take())
    }
}

/// One delivery to the sink.
#[derive(Debug)]
pub struct Flush {
    pub bytes: Vec<u8>,
    pub reason: FlushReason,
    pub started_at: Option<Instant>,
    pub flushed_at: Instant,
}

pub trait FlushSink: Send {
    /// Called from the multiplexer task. Must not block; a `Terminating`
    /// flush is always the last call and may carry no bytes.
    fn flush(&mut self, flush: Flush);
}

// ── Policy ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    pub debounce: Duration,
    pub max_frame_size: usize,
    pub idle_grace: ReadWait,
    pub read_wait: ReadWait,
}

impl FlushPolicy {
    /// Wait for the next read: the plain read wait while empty, otherwise no
    /// longer than the idle grace or what is left of the debounce window.
    pub fn next_wait(&self, frame: &OutputFrame, now: Instant) -> ReadWait {
        if frame.is_empty() {
            return self.read_wait;
        }
        let remaining = self.debounce.saturating_sub(frame.age(now));
        self.read_wait
            .at_most(self.idle_grace.get())
            .at_most(remaining)
    }
}

// ── Multiplexer ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum MuxExit {
    Eof,
    Shutdown,
    ReadError(io::Error),
}

#[derive(Debug)]
pub struct MuxSummary {
    pub exit: MuxExit,
    pub frames: u64,
    pub bytes: u64,
}

pub struct Multiplexer {
    policy: FlushPolicy,
    frame: OutputFrame,
    frames: u64,
    bytes: u64,
}

impl Multiplexer {
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            frame: OutputFrame::with_capacity(policy.max_frame_size),
            policy,
            frames: 0,
            bytes: 0,
        }
    }

    /// Read until EOF, a read error, or `shutdown` flips to `true` (or its
    /// sender goes away). The terminal flush always happens.
    pub async fn run<S, K>(
        mut self,
        source: &mut S,
        sink: &mut K,
        mut shutdown: watch::Receiver<bool>,
    ) -> MuxSummary
    where
        S: OutputSource,
        K: FlushSink,
    {
        let mut buf = vec![0u8; self.policy.max_frame_size];

        let exit = loop {
            if *shutdown.borrow() {
                self.drain(source, &mut buf, sink).await;
                break MuxExit::Shutdown;
            }

            let now = Instant::now();
            if !self.frame.is_empty() && self.frame.age(now) >= self.policy.debounce {
                self.flush(sink, FlushReason::Debounce);
            }
            let wait = self.policy.next_wait(&self.frame, now);

            let outcome = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_ok() && !*shutdown.borrow() {
                        continue;
                    }
                    self.drain(source, &mut buf, sink).await;
                    break MuxExit::Shutdown;
                }
                outcome = source.read_chunk(&mut buf, wait) => outcome,
            };

            match outcome {
                Ok(ReadOutcome::Data(n)) => self.accept(&buf[..n], sink),
                Ok(ReadOutcome::TimedOut) => {
                    if !self.frame.is_empty() {
                        let reason = if self.frame.age(Instant::now()) >= self.policy.debounce {
                            FlushReason::Debounce
                        } else {
                            FlushReason::Idle
                        };
                        self.flush(sink, reason);
                    }
                }
                Ok(ReadOutcome::Eof) => break MuxExit::Eof,
                Err(err) => {
                    warn!(%err, "PTY read failed");
                    break MuxExit::ReadError(err);
                }
            }
        };

        self.flush(sink, FlushReason::Terminating);
        debug!(frames = self.frames, bytes = self.bytes, ?exit, "multiplexer stopped");
        MuxSummary {
            exit,
            frames: self.frames,
            bytes: self.bytes,
        }
    }

    fn accept<K: FlushSink>(&mut self, data: &[u8], sink: &mut K) {
        if self.frame.len() + data.len() > self.policy.max_frame_size {
            self.flush(sink, FlushReason::SizeCap);
        }
        let now = Instant::now();
        self.frame.push(data, now);
        if self.frame.len() >= self.policy.max_frame_size {
            self.flush(sink, FlushReason::SizeCap);
        } else if self.frame.age(now) >= self.policy.debounce {
            self.flush(sink, FlushReason::Debounce);
        }
    }

    /// Pick up whatever is already readable so trailing output is not lost.
    async fn drain<S: OutputSource, K: FlushSink>(&mut self, source: &mut S, buf: &mut [u8], sink: &mut K) {
        for _ in 0..DRAIN_READS {
            match source.read_chunk(buf, ReadWait::new(ReadWait::FLOOR)).await {
                Ok(ReadOutcome::Data(n)) => self.accept(&buf[..n], sink),
                Ok(ReadOutcome::TimedOut) | Ok(ReadOutcome::Eof) => return,
                Err(err) => {
                    debug!(%err, "read failed while draining");
                    return;
                }
            }
        }
    }

    fn flush<K: FlushSink>(&mut self, sink: &mut K, reason: FlushReason) {
        if self.frame.is_empty() && reason != FlushReason::Terminating {
            return;
        }
        let (bytes, started_at) = self.frame.take();
        if !bytes.is_empty() {
            self.frames += 1;
            self.bytes += bytes.len() as u64;
        }
        sink.flush(Flush {
            bytes,
            reason,
            started_at,
            flushed_at: Instant::now(),
        });
    }
}

// ── Generic readers ─────────────────────────────────────────────────

/// Adapts any `AsyncRead` (pipes, sockets, in-memory duplex) into an
/// [`OutputSource`].
pub struct StreamSource<R> {
    inner: R,
}

impl<R> StreamSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R> OutputSource for StreamSource<R>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    fn read_chunk<'a>(
        &'a mut self,
        buf: &'a mut [u8],
        wait: ReadWait,
    ) -> impl Future<Output = io::Result<ReadOutcome>> + Send + 'a {
        use tokio::io::AsyncReadExt;
        async move {
            match tokio::time::timeout(wait.get(), self.inner.read(buf)).await {
                Err(_) => Ok(ReadOutcome::TimedOut),
                Ok(Ok(0)) => Ok(ReadOutcome::Eof),
                Ok(Ok(n)) => Ok(ReadOutcome::Data(n)),
                Ok(Err(err)) => Err(err),
            }
        }
    }
}

// ── Unit tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::AsyncWriteExt;
    use tokio::time;

    const MS: Duration = Duration::from_millis(1);

    impl FlushSink for Vec<Flush> {
        fn flush(&mut self, flush: Flush) {
            self.push(flush);
        }
    }

    enum Step {
        Bytes(Vec<u8>),
        Pause(Duration),
        Fail(io::ErrorKind),
    }

    /// Plays back a script of bytes and pauses on the (paused) tokio clock.
    struct ScriptedSource {
        steps: VecDeque<Step>,
        calls: usize,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                calls: 0,
            }
        }
    }

    impl OutputSource for ScriptedSource {
        fn read_chunk<'a>(
            &'a mut self,
            buf: &'a mut [u8],
            wait: ReadWait,
        ) -> impl Future<Output = io::Result<ReadOutcome>> + Send + 'a {
            async move {
                self.calls += 1;
                loop {
                    match self.steps.pop_front() {
                        None => return Ok(ReadOutcome::Eof),
                        Some(Step::Bytes(mut data)) => {
                            let n = data.len().min(buf.len());
                            buf[..n].copy_from_slice(&data[..n]);
                            if n < data.len() {
                                self.steps.push_front(Step::Bytes(data.split_off(n)));
                            }
                            return Ok(ReadOutcome::Data(n));
                        }
                        Some(Step::Pause(pause)) => {
                            if pause > wait.get() {
                                time::sleep(wait.get()).await;
                                self.steps.push_front(Step::Pause(pause - wait.get()));
                                return Ok(ReadOutcome::TimedOut);
                            }
                            time::sleep(pause).await;
                        }
                        Some(Step::Fail(kind)) => return Err(io::Error::from(kind)),
                    }
                }
            }
        }
    }

    fn policy() -> FlushPolicy {
        FlushPolicy {
            debounce: 100 * MS,
            max_frame_size: 4096,
            idle_grace: ReadWait::new(10 * MS),
            read_wait: ReadWait::new(50 * MS),
        }
    }

    async fn run_script(steps: Vec<Step>) -> (MuxSummary, Vec<Flush>, usize) {
        let (_tx, rx) = watch::channel(false);
        let mut source = ScriptedSource::new(steps);
        let mut sink = Vec::new();
        let summary = Multiplexer::new(policy()).run(&mut source, &mut sink, rx).await;
        (summary, sink, source.calls)
    }

    fn concat(flushes: &[Flush]) -> Vec<u8> {
        flushes.iter().flat_map(|f| f.bytes.iter().copied()).collect()
    }

    // ── ReadWait tests ──────────────────────────────────────────────

    #[test]
    fn read_wait_is_never_zero() {
        assert_eq!(ReadWait::new(Duration::ZERO).get(), ReadWait::FLOOR);
        assert_eq!(ReadWait::new(50 * MS).at_most(Duration::ZERO).get(), ReadWait::FLOOR);
        assert_eq!(ReadWait::new(50 * MS).at_most(10 * MS).get(), 10 * MS);
    }

    #[test]
    fn next_wait_shrinks_once_bytes_are_buffered() {
        let policy = policy();
        let now = Instant::now();
        let mut frame = OutputFrame::default();
        assert_eq!(policy.next_wait(&frame, now).get(), 50 * MS);
        frame.push(b"x", now);
        assert_eq!(policy.next_wait(&frame, now).get(), 10 * MS);
        assert_eq!(policy.next_wait(&frame, now + 95 * MS).get(), 5 * MS);
    }

    // ── Flush trigger tests ─────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn idle_grace_flushes_small_output() {
        let (summary, flushes, _) =
            run_script(vec![Step::Bytes(b"prompt$ ".to_vec()), Step::Pause(Duration::from_secs(1))]).await;
        assert!(matches!(summary.exit, MuxExit::Eof));
        assert_eq!(flushes[0].bytes, b"prompt$ ");
        assert_eq!(flushes[0].reason, FlushReason::Idle);
        let held = flushes[0].flushed_at - flushes[0].started_at.unwrap();
        assert!(held <= 10 * MS + MS, "held for {held:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn trickle_is_bounded_by_debounce_window() {
        let mut steps = Vec::new();
        for _ in 0..100 {
            steps.push(Step::Bytes(b"x".to_vec()));
            steps.push(Step::Pause(5 * MS));
        }
        let (_, flushes, _) = run_script(steps).await;

        assert_eq!(concat(&flushes), vec![b'x'; 100]);
        let debounced = flushes.iter().filter(|f| f.reason == FlushReason::Debounce).count();
        assert!(debounced >= 3, "expected debounce flushes, got {debounced}");
        for flush in flushes.iter().filter(|f| f.reason != FlushReason::Terminating) {
            let held = flush.flushed_at - flush.started_at.unwrap();
            assert!(held <= 100 * MS + MS, "frame held for {held:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_split_at_max_frame_size() {
        let burst = vec![b'y'; 10_000];
        let (_, flushes, _) =
            run_script(vec![Step::Bytes(burst.clone()), Step::Pause(Duration::from_secs(1))]).await;

        assert_eq!(concat(&flushes), burst);
        assert!(flushes.iter().all(|f| f.bytes.len() <= 4096));
        assert_eq!(flushes[0].reason, FlushReason::SizeCap);
        assert_eq!(flushes[0].bytes.len(), 4096);
        assert_eq!(flushes[1].bytes.len(), 4096);
        assert_eq!(flushes[2].bytes.len(), 10_000 - 8192);
        assert_eq!(flushes[2].reason, FlushReason::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_append_flushes_existing_frame_first() {
        let (_, flushes, _) = run_script(vec![
            Step::Bytes(vec![b'a'; 3000]),
            Step::Bytes(vec![b'b'; 3000]),
        ])
        .await;
        assert_eq!(flushes[0].bytes, vec![b'a'; 3000]);
        assert_eq!(flushes[0].reason, FlushReason::SizeCap);
        assert!(flushes.iter().all(|f| f.bytes.len() <= 4096));
        assert_eq!(concat(&flushes).len(), 6000);
    }

    #[tokio::test(start_paused = true)]
    async fn eof_delivers_trailing_bytes_in_terminating_flush() {
        let (summary, flushes, _) = run_script(vec![Step::Bytes(b"bye\n".to_vec())]).await;
        assert!(matches!(summary.exit, MuxExit::Eof));
        let last = flushes.last().unwrap();
        assert_eq!(last.reason, FlushReason::Terminating);
        assert_eq!(last.bytes, b"bye\n");
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.bytes, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn terminating_flush_happens_even_when_empty() {
        let (_, flushes, _) = run_script(vec![]).await;
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].reason, FlushReason::Terminating);
        assert!(flushes[0].bytes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_ends_the_loop_after_flushing() {
        let (summary, flushes, _) = run_script(vec![
            Step::Bytes(b"partial".to_vec()),
            Step::Fail(io::ErrorKind::BrokenPipe),
        ])
        .await;
        assert!(matches!(summary.exit, MuxExit::ReadError(_)));
        assert_eq!(concat(&flushes), b"partial");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_forces_final_flush_below_thresholds() {
        let (tx, rx) = watch::channel(false);
        let mut source = ScriptedSource::new(vec![
            Step::Bytes(b"tail".to_vec()),
            Step::Pause(Duration::from_secs(3600)),
        ]);
        let mut sink = Vec::new();
        tokio::spawn(async move {
            time::sleep(MS / 2).await;
            let _ = tx.send(true);
            // keep the sender alive past the select
            time::sleep(Duration::from_secs(10)).await;
        });
        let summary = Multiplexer::new(policy()).run(&mut source, &mut sink, rx).await;
        assert!(matches!(summary.exit, MuxExit::Shutdown));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].reason, FlushReason::Terminating);
        assert_eq!(sink[0].bytes, b"tail");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_loop_does_not_spin() {
        let (_, _, calls) = run_script(vec![Step::Pause(Duration::from_secs(1))]).await;
        // 1s of silence at a 50ms wait is about 20 wakeups, not thousands
        assert!(calls <= 25, "read loop woke {calls} times");
    }

    // ── StreamSource tests ──────────────────────────────────────────

    #[tokio::test]
    async fn stream_source_wakes_on_data() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut source = StreamSource::new(reader);
        let mut buf = [0u8; 16];

        let outcome = source.read_chunk(&mut buf, ReadWait::new(10 * MS)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::TimedOut);

        writer.write_all(b"hi").await.unwrap();
        let outcome = source
            .read_chunk(&mut buf, ReadWait::new(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Data(2));
        assert_eq!(&buf[..2], b"hi");

        drop(writer);
        let outcome = source.read_chunk(&mut buf, ReadWait::new(10 * MS)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Eof);
    }
}
