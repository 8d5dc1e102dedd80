//! Snapshot fan-out to subscribed listeners.
//!
//! Listeners are plain callbacks invoked on the publishing thread. Each
//! listener sees revisions in increasing order and never the same revision
//! twice, even when a publish races with its initial delivery.
//!
//! A panicking listener is logged and isolated: the other listeners and the
//! publisher carry on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::state::SessionSnapshot;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub snapshots_published: u64,
    pub listener_panics: u64,
    pub subscribers: usize,
}

/// Lock-free counters, read via [`SnapshotBroadcast::stats`].
struct AtomicBroadcastStats {
    snapshots_published: AtomicU64,
    listener_panics: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            snapshots_published: AtomicU64::new(0),
            listener_panics: AtomicU64::new(0),
        }
    }
}

type Listener = Box<dyn Fn(&SessionSnapshot) + Send + Sync>;

struct Subscriber {
    id: u64,
    active: AtomicBool,
    /// The lock also serializes calls into the listener.
    slot: Mutex<Slot>,
}

struct Slot {
    listener: Option<Listener>,
    /// Last revision handed to the listener.
    delivered: Option<u64>,
}

struct Inner {
    latest: Arc<SessionSnapshot>,
    subscribers: Vec<Arc<Subscriber>>,
    next_id: u64,
    closed: bool,
}

/// Latest snapshot plus the set of listeners that want to hear about it.
pub struct SnapshotBroadcast {
    inner: Mutex<Inner>,
    atomic_stats: AtomicBroadcastStats,
}

impl Default for SnapshotBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBroadcast {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                latest: Arc::new(SessionSnapshot::default()),
                subscribers: Vec::new(),
                next_id: 0,
                closed: false,
            }),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> Arc<SessionSnapshot> {
        Arc::clone(&self.lock().latest)
    }

    /// Register `listener` and deliver the current snapshot to it before
    /// returning. After [`close`](Self::close) the listener only gets that
    /// one delivery.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        let (subscriber, latest) = {
            let mut inner = self.lock();
            let subscriber = Arc::new(Subscriber {
                id: inner.next_id,
                active: AtomicBool::new(true),
                slot: Mutex::new(Slot {
                    listener: Some(Box::new(listener)),
                    delivered: None,
                }),
            });
            inner.next_id += 1;
            if !inner.closed {
                inner.subscribers.push(Arc::clone(&subscriber));
            }
            (subscriber, Arc::clone(&inner.latest))
        };

        self.deliver(&subscriber, &latest);

        Subscription {
            broadcast: Arc::downgrade(self),
            subscriber: Some(subscriber),
        }
    }

    /// Store `snapshot` as the latest and hand it to every listener.
    pub fn publish(&self, snapshot: SessionSnapshot) {
        let snapshot = Arc::new(snapshot);
        let subscribers = {
            let mut inner = self.lock();
            inner.latest = Arc::clone(&snapshot);
            inner.subscribers.clone()
        };
        self.atomic_stats
            .snapshots_published
            .fetch_add(1, Ordering::Relaxed);

        for subscriber in &subscribers {
            self.deliver(subscriber, &snapshot);
        }
    }

    fn deliver(&self, subscriber: &Subscriber, snapshot: &SessionSnapshot) {
        let mut slot = subscriber
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Slot {
            listener,
            delivered,
        } = &mut *slot;

        if !subscriber.active.load(Ordering::Acquire) {
            return;
        }
        let Some(listener) = listener.as_ref() else {
            return;
        };
        if matches!(*delivered, Some(rev) if rev >= snapshot.revision) {
            return;
        }
        *delivered = Some(snapshot.revision);

        let outcome = catch_unwind(AssertUnwindSafe(|| listener(snapshot)));
        if outcome.is_err() {
            self.atomic_stats
                .listener_panics
                .fetch_add(1, Ordering::Relaxed);
            log::error!(
                "Session listener {} panicked on revision {}",
                subscriber.id,
                snapshot.revision
            );
        }
    }

    /// Drop every listener, releasing whatever they captured. Later publishes
    /// only update [`latest`](Self::latest).
    pub fn close(&self) {
        let subscribers = {
            let mut inner = self.lock();
            inner.closed = true;
            std::mem::take(&mut inner.subscribers)
        };
        for subscriber in &subscribers {
            subscriber.active.store(false, Ordering::Release);
            let listener = subscriber
                .slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listener
                .take();
            drop(listener);
        }
    }

    fn remove(&self, id: u64) {
        self.lock().subscribers.retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            snapshots_published: self
                .atomic_stats
                .snapshots_published
                .load(Ordering::Relaxed),
            listener_panics: self.atomic_stats.listener_panics.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Registration handle returned by `subscribe`.
///
/// Dropping it unsubscribes. Once unsubscribed the listener is not invoked
/// again, except for a delivery already running on another thread.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    broadcast: Weak<SnapshotBroadcast>,
    subscriber: Option<Arc<Subscriber>>,
}

impl Subscription {
    /// Explicit form of dropping the handle.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        let Some(subscriber) = self.subscriber.take() else {
            return;
        };
        subscriber.active.store(false, Ordering::Release);
        if let Some(broadcast) = self.broadcast.upgrade() {
            broadcast.remove(subscriber.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.subscriber.as_ref().map(|s| s.id))
            .finish()
    }
}
