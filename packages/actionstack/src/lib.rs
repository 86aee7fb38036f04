//! # Actionstack
//!
//! A single-writer state container: actions flow through a middleware
//! pipeline into reducers that each own one path of an immutable state tree,
//! and side effects turn committed actions into more actions.
//!
//! ## Core Concepts
//!
//! - [`Action`] = a request to change state (`type` + optional payload)
//! - [`AsyncAction`] = a deferred computation that dispatches actions
//! - [`Reducer`] = owns one path of the tree, `(state, action) -> state`
//! - [`Module`] = a slice of the tree with its reducers and dependencies
//! - [`SideEffect`] = a stream function from actions and state to actions
//!
//! ## Architecture
//!
//! ```text
//! store.dispatch(action)
//!     │
//!     ▼ validate
//! Pipeline ── starter (strategy: exclusive lock | concurrent) ── ExecutionStack
//!     │
//!     ├─► Middleware A ─► Middleware B ─► …
//!     │
//!     ▼
//! CombinedReducer (leaf reducers on their own subtrees, minimal copy)
//!     │
//!     ▼ commit (state write lock)
//! state subject ─► select() / observers
//! action subject ─► SideEffect A ─┐
//!                ─► SideEffect B ─┴─► dispatch ──► (back to the top)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One writer** - every commit happens under the state write lock
//! 2. **Reducers own paths** - only changed leaves are written back, so
//!    untouched subtrees keep their identity
//! 3. **FIFO exclusivity** - under the exclusive strategy actions apply in
//!    lock-grant order
//! 4. **Branch order** - actions issued by one async action apply in issue
//!    order under either strategy
//! 5. **Isolated failures** - a failing reducer or side effect is logged and
//!    contained
//!
//! ## Guarantees
//!
//! - **In-memory only**: state is not persisted
//! - **Read-your-write**: with `await_state_propagation` (the default) a
//!   top-level `dispatch` resolves after observers ran and side effects
//!   consumed the action
//! - **No cancellation**: unloading a module or unregistering effects stops
//!   future work only
//!
//! ## Example
//!
//! ```ignore
//! use actionstack::{reducer_fn, Action, Module, Store, Value};
//! use serde_json::json;
//!
//! let counter = reducer_fn(|state, action| {
//!     let state = state.unwrap_or_else(|| json!({"count": 0}).into());
//!     let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
//!     Ok(match action.action_type() {
//!         "INC" => state.with("count", count + 1),
//!         _ => state,
//!     })
//! });
//!
//! let store = Store::builder()
//!     .with_main_module(Module::new("main", counter))
//!     .build()
//!     .await?;
//!
//! for _ in 0..3 {
//!     store.dispatch(Action::new("INC")).await?;
//! }
//! assert_eq!(store.get_state_at(["main", "count"]), Some(3.into()));
//! ```

// Core modules
mod action;
mod effects;
mod error;
mod lifecycle;
mod lock;
mod middleware;
mod module;
mod pipeline;
mod reactive;
mod reducer;
mod rw_lock;
mod settings;
mod stack;
mod store;
mod strategy;
mod tracker;
mod tree;
mod value;

// Capability signatures for privileged middleware
pub mod signature;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export action types
pub use action::{system, Action, ActionBuilder, AsyncAction, Dispatchable, ThunkContext};

// Re-export error types
pub use error::{Result, StoreError};

// Re-export synchronization primitives
pub use lock::{Lock, LockGuard};
pub use rw_lock::{OwnerId, ReadGuard, ReadWriteLock, WriteGuard};
pub use stack::{ExecutionStack, Operation, OperationGuard, OperationHandle, OperationKind};

// Re-export reactive channels
pub use reactive::{AsyncSubject, BehaviorSubject, Subject, Subscription, DEFAULT_CAPACITY};

// Re-export state tree types
pub use value::{Path, Value};

// Re-export reducer types
pub use reducer::{
    compose_meta_reducers, meta_reducer, reducer_fn, CombinedReducer, MetaReducer, Reducer,
    ReducerMap, ReducerTree, SharedReducer,
};

// Re-export pipeline types
pub use middleware::{
    middleware_fn, signed_middleware_fn, Middleware, MiddlewareApi, Next, PrivilegedApi,
    SharedMiddleware,
};
pub use strategy::Strategy;

// Re-export module types
pub use module::{Dependencies, Dependency, DependencyNode, Instance, MapResolver, Module, Resolver};

// Re-export store types (primary entry point)
pub use settings::{StoreSettings, DEFAULT_EFFECT_TIMEOUT_MS};
pub use store::{Store, StoreBuilder, DEFAULT_MAIN_SLICE};

// Re-export side effect types
pub use effects::{effect_fn, saga_fn, EffectsHandle, SagaContext, SharedEffect, SideEffect};
pub use tracker::CompletionTracker;

// Re-export commonly used external types
pub use async_trait::async_trait;
