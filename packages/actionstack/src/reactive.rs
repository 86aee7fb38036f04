//! Push-based channels used to broadcast actions and state.
//!
//! Three flavours, all cheap to clone:
//!
//! - [`Subject`]: multi-value broadcast. Subscribers see values sent after
//!   they subscribed. Slow subscribers may lag and skip values.
//! - [`BehaviorSubject`]: holds a current value. New subscribers see the
//!   current value first, then every change.
//! - [`AsyncSubject`]: callback observers whose async work can be awaited by
//!   the producer. `next` returns a future that resolves once every observer
//!   finished handling the value.
//!
//! # Guarantees
//!
//! - **In-memory only**: nothing is persisted or replayed beyond the current
//!   value of a `BehaviorSubject`.
//! - **Isolated observers**: a panicking `AsyncSubject` observer is logged and
//!   does not affect other observers or the producer.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::future::{join_all, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tracing::{error, warn};

use crate::error::panic_message;

/// Default buffer for multi-value subjects.
pub const DEFAULT_CAPACITY: usize = 10000;

// =============================================================================
// Subject
// =============================================================================

/// Multi-value broadcast channel.
pub struct Subject<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Subject<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// The capacity bounds how far a subscriber may fall behind before it
    /// starts skipping values.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send to all current subscribers. Returns how many received it.
    pub fn next(&self, value: T) -> usize {
        self.sender.send(value).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream. Lagged values are skipped with a warning; the
    /// stream ends when the subject is dropped.
    pub fn stream(&self) -> BoxStream<'static, T> {
        receiver_stream(self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Turn a broadcast receiver into a stream that tolerates lag.
pub(crate) fn receiver_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(value) => return Some((value, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged behind subject");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subject")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

// =============================================================================
// BehaviorSubject
// =============================================================================

/// Single current value with change notification.
pub struct BehaviorSubject<T> {
    sender: Arc<watch::Sender<T>>,
}

impl<T: Clone + Send + Sync + 'static> BehaviorSubject<T> {
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// The current value.
    pub fn value(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Replace the current value and notify subscribers.
    pub fn next(&self, value: T) {
        self.sender.send_replace(value);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Current value followed by every subsequent change. Intermediate values
    /// may be coalesced if the consumer is slower than the producer.
    pub fn stream(&self) -> BoxStream<'static, T> {
        let mut rx = self.sender.subscribe();
        rx.mark_changed();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.changed().await.ok()?;
            let value = rx.borrow_and_update().clone();
            Some((value, rx))
        }))
    }
}

impl<T> Clone for BehaviorSubject<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for BehaviorSubject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorSubject")
            .field("value", &*self.sender.borrow())
            .finish()
    }
}

// =============================================================================
// AsyncSubject
// =============================================================================

/// An observer callback whose returned future is awaited by the producer.
pub type AsyncObserver<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct AsyncInner<T> {
    next_id: AtomicU64,
    observers: Mutex<Vec<(u64, AsyncObserver<T>)>>,
}

impl<T> AsyncInner<T> {
    fn remove(&self, id: u64) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(oid, _)| *oid != id);
    }
}

/// Subject whose producers can await their observers.
pub struct AsyncSubject<T> {
    inner: Arc<AsyncInner<T>>,
}

impl<T: Clone + Send + 'static> AsyncSubject<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AsyncInner {
                next_id: AtomicU64::new(1),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register an observer. It stays registered until the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    pub fn subscribe<F, Fut>(&self, observer: F) -> Subscription
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let observer: AsyncObserver<T> = Arc::new(move |value| observer(value).boxed());
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));

        let inner: Weak<AsyncInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.remove(id);
                }
            })),
        }
    }

    /// Deliver `value` to every observer.
    ///
    /// Observers are invoked synchronously in subscription order; the returned
    /// future resolves once all of their futures complete. Dropping it
    /// without awaiting lets the observers' work be abandoned.
    pub fn next(&self, value: T) -> BoxFuture<'static, ()> {
        let observers: Vec<AsyncObserver<T>> = self
            .inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, o)| o.clone())
            .collect();

        let mut pending = Vec::with_capacity(observers.len());
        for observer in observers {
            let value = value.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(|| observer(value))) {
                Ok(fut) => pending.push(async move {
                    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                        error!(panic = %panic_message(panic.as_ref()), "state observer panicked");
                    }
                }),
                Err(panic) => {
                    error!(panic = %panic_message(panic.as_ref()), "state observer panicked");
                }
            }
        }

        Box::pin(async move {
            join_all(pending).await;
        })
    }

    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T> Clone for AsyncSubject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for AsyncSubject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for AsyncSubject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSubject").finish_non_exhaustive()
    }
}

/// Handle to a registered observer. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }

    /// Keep the observer registered for the lifetime of the subject.
    pub fn detach(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_subject_broadcasts_to_all_subscribers() {
        let subject = Subject::<u32>::new();
        let mut a = subject.subscribe();
        let mut b = subject.subscribe();

        assert_eq!(subject.next(7), 2);
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_subject_without_subscribers() {
        let subject = Subject::<u32>::new();
        assert_eq!(subject.next(1), 0);
        assert_eq!(subject.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subject_stream_skips_lag() {
        let subject = Subject::<u32>::with_capacity(2);
        let mut stream = subject.stream();
        for i in 0..5 {
            subject.next(i);
        }
        // Oldest values were overwritten; the stream resumes at the oldest
        // value still buffered.
        assert_eq!(stream.next().await, Some(3));
        assert_eq!(stream.next().await, Some(4));
    }

    #[tokio::test]
    async fn test_behavior_subject_stream_starts_with_current() {
        let subject = BehaviorSubject::new(1u32);
        let mut stream = subject.stream();
        assert_eq!(stream.next().await, Some(1));
        subject.next(2);
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(subject.value(), 2);
    }

    #[tokio::test]
    async fn test_async_subject_awaits_observers() {
        let subject = AsyncSubject::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let s1 = {
            let seen = seen.clone();
            subject.subscribe(move |v| {
                let seen = seen.clone();
                async move {
                    tokio::task::yield_now().await;
                    seen.fetch_add(v as usize, Ordering::SeqCst);
                }
            })
        };
        let s2 = {
            let seen = seen.clone();
            subject.subscribe(move |v| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(v as usize, Ordering::SeqCst);
                }
            })
        };

        subject.next(5).await;
        assert_eq!(seen.load(Ordering::SeqCst), 10);

        drop(s1);
        subject.next(1).await;
        assert_eq!(seen.load(Ordering::SeqCst), 11);
        assert_eq!(subject.observer_count(), 1);
        s2.detach();
        assert_eq!(subject.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_async_subject_isolates_panicking_observer() {
        let subject = AsyncSubject::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = subject.subscribe(|_| async { panic!("observer exploded") });
        let _sync_bad = subject.subscribe(|_| -> futures::future::Ready<()> {
            panic!("observer exploded before returning a future")
        });
        let _good = {
            let hits = hits.clone();
            subject.subscribe(move |_| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        subject.next(1).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
