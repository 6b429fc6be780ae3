//! Per-session output history and the broadcast feed clients subscribe to.

use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::registry::SessionEvent;

// ── Ring buffer ─────────────────────────────────────────────────────

/// Fixed-size ring holding the most recent cleaned output.
pub struct Scrollback {
    ring: Box<[u8]>,
    head: usize,
    wrapped: bool,
    total_written: u64,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: vec![0u8; capacity.max(1)].into_boxed_slice(),
            head: 0,
            wrapped: false,
            total_written: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn write(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;

        // only the last `capacity` bytes can survive
        let mut rest = &data[data.len().saturating_sub(self.capacity())..];
        while !rest.is_empty() {
            let n = rest.len().min(self.capacity() - self.head);
            let (chunk, tail) = rest.split_at(n);
            self.ring[self.head..self.head + n].copy_from_slice(chunk);
            self.head += n;
            rest = tail;
            if self.head == self.capacity() {
                self.head = 0;
                self.wrapped = true;
            }
        }
    }

    /// Linearized contents. After a wrap the head is cut at the first
    /// newline so replay never starts mid escape sequence or mid code point.
    pub fn snapshot(&self) -> Vec<u8> {
        if !self.wrapped {
            return self.ring[..self.head].to_vec();
        }
        let (newer, older) = self.ring.split_at(self.head);
        sanitize_start([older, newer].concat())
    }

    pub fn len(&self) -> usize {
        if self.wrapped {
            self.capacity()
        } else {
            self.head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes ever written, including what has since been overwritten.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

fn sanitize_start(buf: Vec<u8>) -> Vec<u8> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(idx) if idx > 0 => buf[idx + 1..].to_vec(),
        _ => buf,
    }
}

// ── Feed ────────────────────────────────────────────────────────────

/// Scrollback plus broadcast sender behind one lock: a subscriber gets the
/// history and its receiver in the same critical section, so nothing is
/// replayed twice and nothing falls in between.
pub struct OutputFeed {
    inner: Mutex<FeedState>,
}

struct FeedState {
    scrollback: Scrollback,
    frames: u64,
    tx: broadcast::Sender<SessionEvent>,
}

/// Running totals of what a feed has published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedTotals {
    pub frames: u64,
    pub bytes: u64,
}

impl OutputFeed {
    pub fn new(scrollback_bytes: usize, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Mutex::new(FeedState {
                scrollback: Scrollback::new(scrollback_bytes),
                frames: 0,
                tx,
            }),
        }
    }

    /// Record cleaned output and fan it out. Never blocks; slow receivers lag.
    pub fn publish_output(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.scrollback.write(&bytes);
        state.frames += 1;
        let _ = state.tx.send(SessionEvent::Output(bytes.into()));
    }

    /// Fan out a non-output event (side-channel, exit). Not kept in history.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.lock().tx.send(event);
    }

    pub fn subscribe_with_replay(&self) -> (Vec<u8>, broadcast::Receiver<SessionEvent>) {
        let state = self.lock();
        (state.scrollback.snapshot(), state.tx.subscribe())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.lock().tx.subscribe()
    }

    pub fn totals(&self) -> FeedTotals {
        let state = self.lock();
        FeedTotals {
            frames: state.frames,
            bytes: state.scrollback.total_written(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FeedState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Unit tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Scrollback tests ────────────────────────────────────────────

    #[test]
    fn scrollback_basic_write_read() {
        let mut sb = Scrollback::new(100);
        sb.write(b"hello");
        assert_eq!(sb.snapshot(), b"hello");
        assert_eq!(sb.len(), 5);
        assert_eq!(sb.total_written(), 5);
    }

    #[test]
    fn scrollback_wraps_and_sanitizes_head() {
        let mut sb = Scrollback::new(10);
        sb.write(b"0123456789");
        sb.write(b"AB\nCD");
        // ring holds "56789AB\nCD"; replay starts after the first newline
        assert_eq!(sb.snapshot(), b"CD");
        assert_eq!(sb.total_written(), 15);
    }

    #[test]
    fn scrollback_oversized_write_keeps_tail() {
        let mut sb = Scrollback::new(5);
        sb.write(b"abcdefghij");
        assert_eq!(sb.len(), 5);
        assert_eq!(sb.snapshot(), b"fghij");
    }

    #[test]
    fn scrollback_exact_fill_is_wrapped() {
        let mut sb = Scrollback::new(4);
        sb.write(b"\nabc");
        assert_eq!(sb.snapshot(), b"\nabc");
        assert!(!sb.is_empty());
    }

    #[test]
    fn scrollback_write_spanning_the_seam() {
        let mut sb = Scrollback::new(6);
        sb.write(b"abcd");
        sb.write(b"\nxyz");
        // ring now holds "cd\nxyz"; "ab" was overwritten
        assert_eq!(sb.len(), 6);
        assert_eq!(sb.snapshot(), b"xyz");
        assert_eq!(sb.total_written(), 8);
    }

    #[test]
    fn sanitize_start_keeps_leading_newline() {
        assert_eq!(sanitize_start(b"\nabc".to_vec()), b"\nabc");
        assert_eq!(sanitize_start(b"xx\nabc".to_vec()), b"abc");
        assert_eq!(sanitize_start(b"no newline".to_vec()), b"no newline");
    }

    // ── Feed tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn subscriber_gets_history_then_live_output() {
        let feed = OutputFeed::new(1024, 16);
        feed.publish_output(b"before ".to_vec());
        let (replay, mut rx) = feed.subscribe_with_replay();
        feed.publish_output(b"after".to_vec());

        assert_eq!(replay, b"before ");
        match rx.recv().await.unwrap() {
            SessionEvent::Output(bytes) => assert_eq!(&bytes[..], b"after"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn exit_events_are_not_replayed() {
        let feed = OutputFeed::new(1024, 16);
        feed.publish_output(b"out".to_vec());
        feed.publish(SessionEvent::Exit { code: Some(0) });
        let (replay, _rx) = feed.subscribe_with_replay();
        assert_eq!(replay, b"out");
        assert_eq!(feed.totals(), FeedTotals { frames: 1, bytes: 3 });
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let feed = OutputFeed::new(8, 1);
        feed.publish_output(b"nobody listening".to_vec());
        feed.publish_output(Vec::new());
        // empty flushes are not frames
        assert_eq!(feed.totals(), FeedTotals { frames: 1, bytes: 16 });
    }
}
