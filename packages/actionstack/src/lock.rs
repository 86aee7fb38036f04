//! FIFO-fair asynchronous mutual exclusion.
//!
//! [`Lock`] is a plain "held" flag plus a queue of waiters. Releasing hands the
//! lock directly to the longest-waiting caller, so ownership never becomes
//! observable as free while someone is queued and no caller can barge ahead.
//!
//! The lock is not re-entrant: a second `acquire` from the same logical owner
//! queues like any other caller. The dispatch pipeline tracks re-entrancy
//! itself through per-branch child locks and the dispatch scope.
//!
//! # Cancellation
//!
//! Dropping an `acquire` future before it completes removes the caller from
//! the queue. If the lock was already handed to it, the drop passes the lock
//! on to the next waiter instead of leaking it.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tracing::warn;

#[derive(Default)]
struct LockState {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A FIFO-fair async lock with explicit `acquire`/`release`.
#[derive(Default)]
pub struct Lock {
    state: Mutex<LockState>,
}

impl Lock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // The critical sections never panic; recover rather than propagate.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock if it is free. Never queues.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state();
        if state.held {
            return false;
        }
        state.held = true;
        true
    }

    /// Acquire the lock, waiting behind every earlier caller.
    ///
    /// Resolves immediately when the lock is free. The caller must pair this
    /// with [`Lock::release`]; prefer [`Lock::lock`] for scoped use.
    pub async fn acquire(&self) {
        let rx = {
            let mut state = self.state();
            if !state.held {
                state.held = true;
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        PendingAcquire {
            lock: self,
            rx,
            granted: false,
        }
        .await
    }

    /// Release the lock, handing it to the longest waiter if there is one.
    pub fn release(&self) {
        let mut state = self.state();
        if !state.held {
            warn!("release called on a lock that is not held");
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                // Ownership transferred; the lock stays held.
                return;
            }
        }
        state.held = false;
    }

    /// Acquire the lock and return a guard that releases it on drop.
    pub async fn lock(&self) -> LockGuard<'_> {
        self.acquire().await;
        LockGuard { lock: self }
    }

    pub fn is_locked(&self) -> bool {
        self.state().held
    }

    /// Number of callers waiting for the lock.
    pub fn queue_len(&self) -> usize {
        self.state().waiters.len()
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Lock")
            .field("held", &state.held)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// RAII guard returned by [`Lock::lock`].
pub struct LockGuard<'a> {
    lock: &'a Lock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A queued acquisition. Passes the lock on if dropped after being granted.
struct PendingAcquire<'a> {
    lock: &'a Lock,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Future for PendingAcquire<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(_) => {
                // A closed channel means the sender was dropped by `release`
                // after a failed hand-off, which cannot happen for a live
                // receiver; both outcomes mean we own the lock.
                self.granted = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.lock.release();
        }
    }
}
