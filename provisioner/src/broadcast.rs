//! Per-job event log with replay-then-live subscriptions.
//!
//! Each job owns an append-only [`EventLog`]. A watch channel carries the log
//! length; subscribers register with it *before* reading the log from offset 0,
//! so any append after their last read wakes them and nothing is missed or
//! delivered twice. The producer never waits on subscribers.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::Stream;
use tokio::sync::watch;

use crate::core::types::{EventKind, JobEvent};

/// Ordered events for one job; ends after the terminal state event.
pub type EventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

#[derive(Debug, Default)]
struct LogInner {
    events: Vec<JobEvent>,
    closed: bool,
}

#[derive(Debug)]
pub struct EventLog {
    inner: Mutex<LogInner>,
    appended: watch::Sender<usize>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Mutex::new(LogInner::default()),
            appended,
        }
    }

    /// Append an event. Returns its sequence number, or `None` once closed.
    pub fn append(&self, kind: EventKind) -> Option<u64> {
        self.push(kind, false)
    }

    /// Append the last event and close the log in one step.
    pub fn append_final(&self, kind: EventKind) -> Option<u64> {
        self.push(kind, true)
    }

    fn push(&self, kind: EventKind, close: bool) -> Option<u64> {
        let (seq, len) = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.closed {
                return None;
            }
            let seq = inner.events.len() as u64;
            inner.events.push(JobEvent {
                seq,
                at: Utc::now(),
                kind,
            });
            inner.closed = close;
            (seq, inner.events.len())
        };
        self.appended.send_replace(len);
        Some(seq)
    }

    /// Copy of everything appended so far.
    pub fn snapshot(&self) -> Vec<JobEvent> {
        self.lock().events.clone()
    }

    fn read_from(&self, offset: usize) -> (Vec<JobEvent>, bool) {
        let inner = self.lock();
        let batch = inner.events.get(offset..).unwrap_or_default().to_vec();
        (batch, inner.closed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stream the full backlog, then live events, ending once the log is closed.
    pub fn subscribe(self: &Arc<Self>) -> EventStream {
        let log = Arc::clone(self);
        // Registered before the first read; see module docs.
        let mut appended = log.appended.subscribe();
        Box::pin(async_stream::stream! {
            let mut offset = 0usize;
            loop {
                let (batch, closed) = log.read_from(offset);
                offset += batch.len();
                for event in batch {
                    yield event;
                }
                if closed {
                    break;
                }
                if appended.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}
