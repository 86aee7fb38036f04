//! Execution stack - the live set of in-flight operations.
//!
//! Every unit of work the store performs (a plain action passing through the
//! pipeline, an async action body, an action emitted by a side effect) is
//! recorded here for its duration. The set is used for three things:
//!
//! - diagnostics (`to_vec`, `peek`, `subscribe`)
//! - provenance, since each [`Operation`] links to the operation that caused it
//! - idle detection for module lifecycle and side-effect registration
//!
//! Removal is by identity, not position. Async operations finish out of order,
//! so `pop` scans for the matching entry instead of assuming LIFO.
//!
//! Backed by a `watch` channel: every mutation notifies waiters, nobody polls.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// What kind of work an operation represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// A plain action being reduced.
    Action,
    /// An async action body.
    AsyncAction,
    /// An action emitted by a stream-style side effect.
    Epic,
    /// An action emitted by a coroutine-style side effect.
    Saga,
}

impl OperationKind {
    /// Effects are the two side-effect kinds.
    pub fn is_effect(self) -> bool {
        matches!(self, OperationKind::Epic | OperationKind::Saga)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Action => "action",
            OperationKind::AsyncAction => "async-action",
            OperationKind::Epic => "epic",
            OperationKind::Saga => "saga",
        };
        f.write_str(s)
    }
}

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// A tracked unit of work.
#[derive(Debug)]
pub struct Operation {
    id: u64,
    kind: OperationKind,
    name: String,
    source: Option<OperationHandle>,
    started_at: DateTime<Utc>,
}

/// Shared handle to an operation; identity is the allocation.
pub type OperationHandle = Arc<Operation>;

impl Operation {
    pub fn new(
        kind: OperationKind,
        name: impl Into<String>,
        source: Option<OperationHandle>,
    ) -> OperationHandle {
        Arc::new(Operation {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            name: name.into(),
            source,
            started_at: Utc::now(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Action type, async action name or side-effect name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operation that caused this one, if any.
    pub fn source(&self) -> Option<&OperationHandle> {
        self.source.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// True if this operation or any ancestor was started by a side effect.
    pub fn originates_from_effect(&self) -> bool {
        let mut current = Some(self);
        while let Some(op) = current {
            if op.kind.is_effect() {
                return true;
            }
            current = op.source.as_deref();
        }
        false
    }

    /// Number of ancestors.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.source.as_deref();
        while let Some(op) = current {
            depth += 1;
            current = op.source.as_deref();
        }
        depth
    }
}

/// The live set of in-flight operations.
#[derive(Clone)]
pub struct ExecutionStack {
    ops: Arc<watch::Sender<Vec<OperationHandle>>>,
}

impl Default for ExecutionStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStack {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { ops: Arc::new(tx) }
    }

    /// Record `op` as in flight.
    pub fn push(&self, op: OperationHandle) {
        self.ops.send_modify(|ops| ops.push(op));
    }

    /// Remove `op` by identity. Returns false if it was not present.
    pub fn pop(&self, op: &OperationHandle) -> bool {
        self.ops.send_if_modified(|ops| {
            match ops.iter().rposition(|o| Arc::ptr_eq(o, op)) {
                Some(index) => {
                    ops.remove(index);
                    true
                }
                None => false,
            }
        })
    }

    /// Push `op` and return a guard that pops it on drop.
    pub fn enter(&self, op: OperationHandle) -> OperationGuard {
        self.push(op.clone());
        OperationGuard {
            stack: self.clone(),
            op,
        }
    }

    /// The most recently pushed operation still in flight.
    pub fn peek(&self) -> Option<OperationHandle> {
        self.ops.borrow().last().cloned()
    }

    /// Snapshot of all in-flight operations, oldest first.
    pub fn to_vec(&self) -> Vec<OperationHandle> {
        self.ops.borrow().clone()
    }

    /// Most recently pushed operation matching `predicate`.
    pub fn find_last<F>(&self, predicate: F) -> Option<OperationHandle>
    where
        F: Fn(&Operation) -> bool,
    {
        self.ops.borrow().iter().rev().find(|op| predicate(op)).cloned()
    }

    pub fn len(&self) -> usize {
        self.ops.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.borrow().is_empty()
    }

    /// True if no plain action is mid-flight.
    pub fn is_idle(&self) -> bool {
        !self
            .ops
            .borrow()
            .iter()
            .any(|op| op.kind == OperationKind::Action)
    }

    /// Resolve once no operation of any kind is in flight.
    pub async fn wait_for_empty(&self) {
        let mut rx = self.ops.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|ops| ops.is_empty()).await;
    }

    /// Resolve once no plain action is in flight. Async actions and side
    /// effects may still be outstanding.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.ops.subscribe();
        let _ = rx
            .wait_for(|ops| !ops.iter().any(|op| op.kind == OperationKind::Action))
            .await;
    }

    /// Receive every change to the operation set.
    pub fn subscribe(&self) -> watch::Receiver<Vec<OperationHandle>> {
        self.ops.subscribe()
    }
}

impl fmt::Debug for ExecutionStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops = self.ops.borrow();
        f.debug_list()
            .entries(ops.iter().map(|op| format!("{}:{}", op.kind, op.name)))
            .finish()
    }
}

/// RAII guard that removes an operation from the stack when dropped.
///
/// Dropping covers normal completion, errors and cancellation of the future
/// that owns the guard.
pub struct OperationGuard {
    stack: ExecutionStack,
    op: OperationHandle,
}

impl OperationGuard {
    pub fn operation(&self) -> &OperationHandle {
        &self.op
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.stack.pop(&self.op);
    }
}
