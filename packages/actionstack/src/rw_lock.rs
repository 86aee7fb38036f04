//! FIFO-ordered async read/write lock with per-owner re-entrancy.
//!
//! Requests are granted strictly in arrival order: a reader that arrives after
//! a queued writer waits behind it even if the lock is currently held only by
//! readers. The one exception is the owner of the active write, which may take
//! nested read or write access without queueing.
//!
//! ```ignore
//! let lock = ReadWriteLock::new();
//! let owner = OwnerId::new();
//! let _w = lock.write(owner).await;
//! let _r = lock.read(owner).await; // re-entrant, granted immediately
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use uuid::Uuid;

/// Identifies the logical owner of a lock request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn new() -> Self {
        OwnerId(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

struct Request {
    owner: OwnerId,
    mode: Mode,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct RwState {
    readers: usize,
    writer: Option<OwnerId>,
    write_depth: usize,
    queue: VecDeque<Request>,
}

impl RwState {
    fn take_read(&mut self, owner: OwnerId) -> bool {
        let reentrant = self.writer == Some(owner);
        if reentrant || (self.writer.is_none() && self.queue.is_empty()) {
            self.readers += 1;
            return true;
        }
        false
    }

    fn take_write(&mut self, owner: OwnerId) -> bool {
        if self.writer == Some(owner) {
            self.write_depth += 1;
            return true;
        }
        if self.writer.is_none() && self.readers == 0 && self.queue.is_empty() {
            self.writer = Some(owner);
            self.write_depth = 1;
            return true;
        }
        false
    }

    /// Grant queued requests from the front until one cannot be granted.
    /// Writes stop the scan; consecutive reads are granted together.
    fn drain(&mut self) {
        loop {
            let grantable = match self.queue.front() {
                None => return,
                // Abandoned request; its waiter is gone.
                Some(front) if front.grant.is_closed() => true,
                Some(front) => match front.mode {
                    Mode::Read => self.writer.is_none(),
                    Mode::Write => self.writer.is_none() && self.readers == 0,
                },
            };
            if !grantable {
                return;
            }
            let Some(req) = self.queue.pop_front() else {
                return;
            };
            if req.grant.send(()).is_err() {
                continue;
            }
            match req.mode {
                Mode::Read => self.readers += 1,
                Mode::Write => {
                    self.writer = Some(req.owner);
                    self.write_depth = 1;
                    return;
                }
            }
        }
    }

    fn release(&mut self, mode: Mode) {
        match mode {
            Mode::Read => self.readers = self.readers.saturating_sub(1),
            Mode::Write => {
                self.write_depth = self.write_depth.saturating_sub(1);
                if self.write_depth == 0 {
                    self.writer = None;
                }
            }
        }
        self.drain();
    }
}

/// Read/write lock where readers share and writers exclude, in FIFO order.
#[derive(Default)]
pub struct ReadWriteLock {
    state: Mutex<RwState>,
}

impl ReadWriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RwState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared access for `owner`.
    pub async fn read(&self, owner: OwnerId) -> ReadGuard<'_> {
        self.acquire(owner, Mode::Read).await;
        ReadGuard { lock: self }
    }

    /// Exclusive access for `owner`.
    pub async fn write(&self, owner: OwnerId) -> WriteGuard<'_> {
        self.acquire(owner, Mode::Write).await;
        WriteGuard { lock: self }
    }

    async fn acquire(&self, owner: OwnerId, mode: Mode) {
        let rx = {
            let mut state = self.state();
            let granted = match mode {
                Mode::Read => state.take_read(owner),
                Mode::Write => state.take_write(owner),
            };
            if granted {
                return;
            }
            let (grant, rx) = oneshot::channel();
            state.queue.push_back(Request { owner, mode, grant });
            rx
        };
        PendingRequest {
            lock: self,
            mode,
            rx,
            granted: false,
        }
        .await
    }

    fn release(&self, mode: Mode) {
        self.state().release(mode);
    }

    /// Number of readers currently holding the lock.
    pub fn readers(&self) -> usize {
        self.state().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.state().writer.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.state().queue.len()
    }
}

impl std::fmt::Debug for ReadWriteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ReadWriteLock")
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("queued", &state.queue.len())
            .finish()
    }
}

/// Shared access; released on drop.
pub struct ReadGuard<'a> {
    lock: &'a ReadWriteLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(Mode::Read);
    }
}

/// Exclusive access; released on drop.
pub struct WriteGuard<'a> {
    lock: &'a ReadWriteLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(Mode::Write);
    }
}

struct PendingRequest<'a> {
    lock: &'a ReadWriteLock,
    mode: Mode,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Future for PendingRequest<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(_) => {
                self.granted = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            // Granted after we stopped listening; give it back.
            self.lock.release(self.mode);
        } else {
            // Still queued; unblock anyone behind us.
            self.lock.state().drain();
        }
    }
}
