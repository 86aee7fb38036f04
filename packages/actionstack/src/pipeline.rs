//! Dispatch pipeline - the starter stage and strategy selection.
//!
//! Built once per store. The starter stage always runs first and decides,
//! per dispatch, how the work is scheduled:
//!
//! | strategy   | plain action                                   | async action                        |
//! |------------|------------------------------------------------|-------------------------------------|
//! | exclusive  | takes the store lock (or its branch lock)      | runs unlocked with a fresh branch lock |
//! | concurrent | runs immediately                               | runs immediately, no branch lock    |
//!
//! Either way the unit of work is recorded on the execution stack for as long
//! as it runs.
//!
//! # Re-entrancy
//!
//! The pipeline records the current operation in a task-local
//! [`DispatchScope`]. A dispatch issued while the enclosing plain action holds
//! its lock (from a middleware or an awaited state observer) runs nested
//! instead of queueing behind itself. Dispatches from an async action body
//! inherit that action's branch, whether they go through its
//! [`ThunkContext`](crate::ThunkContext) or straight to the store.
//!
//! # Sibling branches
//!
//! Each async action gets its own branch lock, so two async actions started by
//! different top-level dispatches may interleave their child actions. Within
//! one branch the children apply in the order the body issued them.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::action::{Action, AsyncAction, Dispatchable, ThunkContext};
use crate::error::{Result, StoreError};
use crate::lock::{Lock, LockGuard};
use crate::middleware::{MiddlewareApi, Next, PrivilegedApi, SharedMiddleware};
use crate::signature::is_valid_signature;
use crate::stack::{ExecutionStack, Operation, OperationHandle, OperationKind};
use crate::store::StoreInner;
use crate::strategy::{Strategy, StrategyCell};
use crate::value::Value;

// =============================================================================
// Scope
// =============================================================================

/// The serialization domain of one async action.
#[derive(Debug)]
pub(crate) struct Branch {
    /// Present under the exclusive strategy.
    pub lock: Option<Arc<Lock>>,
    pub op: OperationHandle,
}

/// What the current task is doing inside the pipeline.
#[derive(Clone, Debug)]
pub(crate) struct DispatchScope {
    pub op: OperationHandle,
    /// The current plain action holds its serialization lock.
    pub holds_lock: bool,
    pub branch: Option<Arc<Branch>>,
}

tokio::task_local! {
    static SCOPE: DispatchScope;
}

/// The scope of the current task, if it is running inside the pipeline.
pub(crate) fn current_scope() -> Option<DispatchScope> {
    SCOPE.try_with(|scope| scope.clone()).ok()
}

/// Where a dispatch comes from.
#[derive(Clone, Debug, Default)]
pub(crate) struct Origin {
    pub parent: Option<OperationHandle>,
    pub branch: Option<Arc<Branch>>,
}

/// Resolved context for one run through the pipeline.
#[derive(Debug)]
pub(crate) struct DispatchContext {
    pub parent: Option<OperationHandle>,
    pub branch: Option<Arc<Branch>>,
    pub reentrant: bool,
}

impl DispatchContext {
    /// Combine an explicit origin with the task's current scope.
    pub fn resolve(origin: Origin, scope: Option<&DispatchScope>) -> Self {
        let branch = origin
            .branch
            .or_else(|| scope.and_then(|s| s.branch.clone()));
        let parent = origin
            .parent
            .or_else(|| scope.map(|s| s.op.clone()))
            .or_else(|| branch.as_ref().map(|b| b.op.clone()));
        Self {
            parent,
            branch,
            reentrant: scope.is_some_and(|s| s.holds_lock),
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// A dispatch handle bound to a store and, optionally, an async branch.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    store: Weak<StoreInner>,
    branch: Option<Arc<Branch>>,
}

impl Dispatcher {
    pub fn new(store: Weak<StoreInner>, branch: Option<Arc<Branch>>) -> Self {
        Self { store, branch }
    }

    #[cfg(test)]
    pub fn detached() -> Self {
        Self {
            store: Weak::new(),
            branch: None,
        }
    }

    pub async fn dispatch(&self, action: impl Into<Dispatchable>) -> Result<()> {
        let store = self.store.upgrade().ok_or(StoreError::StoreDropped)?;
        let origin = Origin {
            parent: None,
            branch: self.branch.clone(),
        };
        store.dispatch_with(action.into(), origin).await
    }

    /// Last committed state, or null once the store is gone.
    pub fn state(&self) -> Value {
        self.store
            .upgrade()
            .map(|store| store.state.value())
            .unwrap_or_default()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub(crate) struct Pipeline {
    lock: Arc<Lock>,
    stack: ExecutionStack,
    strategy: Arc<StrategyCell>,
    chain: Next,
    store: Weak<StoreInner>,
}

impl Pipeline {
    /// Compose `middleware` right to left in front of the store's reducer.
    pub fn new(
        store: Weak<StoreInner>,
        stack: ExecutionStack,
        strategy: Arc<StrategyCell>,
        middleware: &[SharedMiddleware],
    ) -> Self {
        let lock = Arc::new(Lock::new());

        let innermost = {
            let store = store.clone();
            Next::new(move |action| {
                let store = store.clone();
                Box::pin(async move {
                    match store.upgrade() {
                        Some(store) => store.process_action(action).await,
                        None => Err(StoreError::StoreDropped),
                    }
                })
            })
        };

        let chain = middleware.iter().rev().fold(innermost, |next, mw| {
            let privileged = match mw.signature() {
                Some(sig) if is_valid_signature(sig) => Some(PrivilegedApi {
                    lock: lock.clone(),
                    stack: stack.clone(),
                    strategy: strategy.clone(),
                }),
                Some(_) => {
                    warn!(middleware = %mw.name(), "invalid middleware signature; privileged access denied");
                    None
                }
                None => None,
            };
            let api = MiddlewareApi::new(Dispatcher::new(store.clone(), None), privileged);
            Next::wrap(mw.clone(), api, next)
        });

        Self {
            lock,
            stack,
            strategy,
            chain,
            store,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy.get()
    }

    pub fn set_strategy(&self, strategy: Strategy) -> Strategy {
        self.strategy.set(strategy)
    }

    pub fn lock(&self) -> &Arc<Lock> {
        &self.lock
    }

    /// Run one dispatchable through the starter stage and the chain.
    pub async fn run(&self, dispatchable: Dispatchable, ctx: DispatchContext) -> Result<()> {
        let strategy = self.strategy.get();
        match dispatchable {
            Dispatchable::Action(action) => self.run_action(action, ctx, strategy).await,
            Dispatchable::Async(thunk) => self.run_async(thunk, ctx, strategy).await,
        }
    }

    async fn run_action(&self, action: Action, ctx: DispatchContext, strategy: Strategy) -> Result<()> {
        action.mark_dispatched();

        // Children of an async branch serialize on the branch lock, everything
        // else on the store lock.
        let lock: Option<Arc<Lock>> = match strategy {
            Strategy::Concurrent => None,
            Strategy::Exclusive if ctx.reentrant => None,
            Strategy::Exclusive => Some(
                ctx.branch
                    .as_ref()
                    .and_then(|b| b.lock.clone())
                    .unwrap_or_else(|| self.lock.clone()),
            ),
        };
        let held: Option<LockGuard<'_>> = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        debug!(
            action = %action.action_type(),
            strategy = %strategy,
            locked = held.is_some(),
            nested = ctx.reentrant,
            "processing action"
        );

        let op = Operation::new(OperationKind::Action, action.action_type(), ctx.parent);
        let _guard = self.stack.enter(op.clone());
        let scope = DispatchScope {
            op,
            holds_lock: held.is_some() || ctx.reentrant,
            branch: ctx.branch,
        };
        SCOPE.scope(scope, self.chain.run(action)).await
    }

    async fn run_async(&self, thunk: AsyncAction, ctx: DispatchContext, strategy: Strategy) -> Result<()> {
        let store = self.store.upgrade().ok_or(StoreError::StoreDropped)?;

        let op = Operation::new(OperationKind::AsyncAction, thunk.name(), ctx.parent);
        let branch = Arc::new(Branch {
            lock: (strategy == Strategy::Exclusive).then(|| Arc::new(Lock::new())),
            op: op.clone(),
        });
        let thunk_ctx = ThunkContext {
            dispatcher: Dispatcher::new(self.store.clone(), Some(branch.clone())),
            state: store.state.clone(),
            dependencies: store.dependencies(),
        };
        drop(store);

        debug!(async_action = %thunk.name(), strategy = %strategy, "starting async action");

        let _guard = self.stack.enter(op.clone());
        let scope = DispatchScope {
            op,
            holds_lock: false,
            branch: Some(branch),
        };
        SCOPE
            .scope(scope, thunk.invoke(thunk_ctx))
            .await
            .map_err(|source| {
                warn!(async_action = %thunk.name(), error = %source, "async action failed");
                StoreError::AsyncAction {
                    name: thunk.name().to_string(),
                    source,
                }
            })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("strategy", &self.strategy.get())
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
