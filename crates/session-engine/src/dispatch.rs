//! Handler lookup for side-channel events.
//!
//! Handlers are registered per command before the registry starts. Each
//! session gets its own dispatch task fed through a bounded queue, so a slow
//! or failing handler never holds up the flush path.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::osc::{SideChannelCommand, SideChannelEvent};
use crate::registry::SessionId;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(SideChannelEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<SideChannelCommand, Vec<Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `command`. Handlers for the same command run in
    /// registration order.
    pub fn register<F, Fut>(&mut self, command: SideChannelCommand, handler: F)
    where
        F: Fn(SideChannelEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        self.handlers.entry(command).or_default().push(handler);
    }

    pub fn handles(&self, command: SideChannelCommand) -> bool {
        self.handlers.get(&command).is_some_and(|h| !h.is_empty())
    }

    /// Run every handler for the event. Errors and panics are logged and
    /// swallowed. Returns how many handlers completed successfully.
    pub async fn dispatch(&self, event: SideChannelEvent) -> usize {
        let Some(handlers) = self.handlers.get(&event.command) else {
            debug!(session = %event.session_id, command = %event.command, "no side-channel handler");
            return 0;
        };

        let mut ok = 0;
        for handler in handlers {
            let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone())));
            let outcome = match invoked {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            match outcome {
                Ok(Ok(())) => ok += 1,
                Ok(Err(err)) => {
                    warn!(session = %event.session_id, command = %event.command, %err, "side-channel handler failed")
                }
                Err(_) => {
                    error!(session = %event.session_id, command = %event.command, "side-channel handler panicked")
                }
            }
        }
        ok
    }

    /// Start the dispatch task for one session. The task ends once every
    /// [`DispatchQueue`] clone is dropped.
    pub fn spawn_session_task(
        self: &Arc<Self>,
        session_id: SessionId,
        capacity: usize,
    ) -> (DispatchQueue, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SideChannelEvent>(capacity.max(1));
        let dispatcher = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatcher.dispatch(event).await;
            }
            debug!(session = %session_id, "dispatch task finished");
        });
        (DispatchQueue { tx, session_id }, task)
    }
}

/// Sending half of a session's dispatch queue. Never blocks.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<SideChannelEvent>,
    session_id: SessionId,
}

impl DispatchQueue {
    pub fn submit(&self, event: SideChannelEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(session = %self.session_id, command = %event.command, "dispatch queue full; dropping side-channel event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

// ── Unit tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn event(command: SideChannelCommand, params: &str) -> SideChannelEvent {
        SideChannelEvent {
            command,
            params: params.to_string(),
            session_id: SessionId::new(),
        }
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            dispatcher.register(SideChannelCommand::ViewImage, move |ev: SideChannelEvent| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(format!("{tag}:{}", ev.params));
                    Ok(())
                }
            });
        }

        let ok = dispatcher.dispatch(event(SideChannelCommand::ViewImage, "/tmp/x.png")).await;
        assert_eq!(ok, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["first:/tmp/x.png", "second:/tmp/x.png"]);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let reached = Arc::new(Mutex::new(false));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(SideChannelCommand::ViewLog, |_| async { Err::<(), HandlerError>("viewer offline".into()) });
        dispatcher.register(SideChannelCommand::ViewLog, |ev: SideChannelEvent| async move {
            if ev.params.starts_with('/') {
                panic!("handler bug");
            }
            Ok(())
        });
        let flag = Arc::clone(&reached);
        dispatcher.register(SideChannelCommand::ViewLog, move |_| {
            let flag = Arc::clone(&flag);
            async move {
                *flag.lock().unwrap() = true;
                Ok(())
            }
        });

        let ok = dispatcher.dispatch(event(SideChannelCommand::ViewLog, "/var/log/syslog")).await;
        assert_eq!(ok, 1);
        assert!(*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn unhandled_command_is_ignored() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.handles(SideChannelCommand::ViewPdf));
        assert_eq!(dispatcher.dispatch(event(SideChannelCommand::ViewPdf, "/a.pdf")).await, 0);
    }

    #[tokio::test]
    async fn session_task_delivers_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(SideChannelCommand::ViewEbook, move |ev: SideChannelEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ev.params);
                Ok(())
            }
        });
        let dispatcher = Arc::new(dispatcher);
        let (queue, task) = dispatcher.spawn_session_task(SessionId::new(), 8);

        assert!(queue.submit(event(SideChannelCommand::ViewEbook, "/books/a.epub")));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("/books/a.epub"));

        drop(queue);
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let gate = Arc::new(Notify::new());
        let mut dispatcher = Dispatcher::new();
        let wait = Arc::clone(&gate);
        dispatcher.register(SideChannelCommand::ViewVideo, move |_| {
            let wait = Arc::clone(&wait);
            async move {
                wait.notified().await;
                Ok(())
            }
        });
        let dispatcher = Arc::new(dispatcher);
        let (queue, _task) = dispatcher.spawn_session_task(SessionId::new(), 1);

        let mut accepted = 0;
        for _ in 0..10 {
            if queue.submit(event(SideChannelCommand::ViewVideo, "/v.mp4")) {
                accepted += 1;
            }
        }
        // one in flight at most plus one queued
        assert!(accepted <= 2, "accepted {accepted}");
        gate.notify_waiters();
    }
}
