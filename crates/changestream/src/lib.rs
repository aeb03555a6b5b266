//! # Change-stream bus (C11)
//!
//! In-process pattern-matched pub/sub of committed mutations (§4.11). The
//! engine calls [`ChangeStreamBus::publish`] once per successful commit;
//! subscribers each get their own bounded channel so one slow reader never
//! blocks the committer or other subscribers.
//!
//! A subscriber whose backlog fills up is dropped rather than backpressured:
//! its data channel is torn down and a single best-effort `Dropped` marker
//! is pushed down a dedicated one-slot control channel, so the reader can
//! tell "I missed events" apart from "the stream ended".

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// What happened to a key: `Put` carries the new value, `Delete` does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Put,
    Delete,
}

/// A single committed mutation, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// What a [`Subscription`] yields: a change, or notice that the bus dropped
/// this subscriber's backlog and will send no further events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Change(ChangeEvent),
    Dropped,
}

struct Subscriber {
    id: u64,
    pattern: String,
    data_tx: Sender<ChangeEvent>,
    control_tx: Sender<()>,
}

/// A handle returned by [`ChangeStreamBus::subscribe`].
pub struct Subscription {
    id: u64,
    data_rx: Receiver<ChangeEvent>,
    control_rx: Receiver<()>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks until the next event or drop notification arrives.
    pub fn recv(&self) -> Option<StreamEvent> {
        crossbeam::channel::select! {
            recv(self.data_rx) -> msg => msg.ok().map(StreamEvent::Change),
            recv(self.control_rx) -> msg => msg.ok().map(|()| StreamEvent::Dropped),
        }
    }

    /// Non-blocking poll; `None` means nothing is available right now.
    pub fn try_recv(&self) -> Option<StreamEvent> {
        if let Ok(event) = self.data_rx.try_recv() {
            return Some(StreamEvent::Change(event));
        }
        if self.control_rx.try_recv().is_ok() {
            return Some(StreamEvent::Dropped);
        }
        None
    }
}

/// Owns every live subscription and fans out committed mutations to the
/// ones whose pattern matches.
pub struct ChangeStreamBus {
    backlog: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ChangeStreamBus {
    /// `backlog` is the per-subscriber bounded channel capacity beyond which
    /// a subscriber is dropped rather than blocking the publisher.
    #[must_use]
    pub fn new(backlog: usize) -> Self {
        ChangeStreamBus {
            backlog,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber. `pattern` is glob-like: `*` matches any
    /// substring, anything else must match literally.
    pub fn subscribe(&self, pattern: impl Into<String>) -> Subscription {
        let (data_tx, data_rx) = bounded(self.backlog);
        let (control_tx, control_rx) = bounded(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            pattern: pattern.into(),
            data_tx,
            control_tx,
        });
        Subscription {
            id,
            data_rx,
            control_rx,
        }
    }

    /// Removes a subscription by id, e.g. on explicit unsubscribe.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Publishes one committed mutation to every subscriber whose pattern
    /// matches `event.key`. Called by the engine in commit order, which is
    /// what gives subscribers in-commit-order delivery (§5).
    pub fn publish(&self, event: ChangeEvent) {
        let key_str = String::from_utf8_lossy(&event.key);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if !glob_match(&sub.pattern, &key_str) {
                return true;
            }
            match sub.data_tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = sub.id, pattern = %sub.pattern, "change-stream backlog exceeded, dropping subscriber");
                    let _ = sub.control_tx.try_send(());
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

/// Glob match supporting only `*` (any substring), matching §4.11's "glob-like
/// (`*` matches any substring)".
fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text[pos..].starts_with(part) {
                return false;
            }
            pos += part.len();
        } else if i == parts.len() - 1 {
            return text[pos..].ends_with(part);
        } else {
            match text[pos..].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }
    }
    true
}
