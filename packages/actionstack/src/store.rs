//! The store - owner of the state tree.
//!
//! The store ties the pieces together:
//!
//! ```text
//! dispatch ─► pipeline (starter → middleware) ─► combined reducer ─► commit
//!                                                                    │
//!          state subject ◄── observers ◄── action subject ◄──────────┘
//!                                               │
//!                                               └─► side effects ─► dispatch
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use actionstack::{Action, Module, Store, reducer_fn};
//!
//! let store = Store::builder()
//!     .with_main_module(Module::new("main", counter_reducer))
//!     .with_strategy("exclusive")
//!     .build()
//!     .await?;
//!
//! store.dispatch(Action::new("INC")).await?;
//! assert_eq!(store.get_state_at(["main", "count"]), Some(1.into()));
//! ```
//!
//! # Commits
//!
//! Every state change goes through one write section guarded by the state
//! read/write lock: read the current root, produce the next one, publish it,
//! assign the action its sequence number and broadcast it. Observers run
//! after the lock is released. Readers that need a stable view across an
//! await use [`Store::read_safe`].
//!
//! # Propagation
//!
//! With `await_state_propagation` set, a top-level `dispatch` resolves only
//! after awaited state observers ran and every registered side effect
//! consumed every action committed so far. Side effects that do not catch up
//! within `effect_timeout_ms` are reported with a warning; the dispatch still
//! succeeds.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::action::{system, Action, Dispatchable};
use crate::error::{Result, StoreError};
use crate::lock::Lock;
use crate::middleware::SharedMiddleware;
use crate::module::{Dependencies, Module, Resolver};
use crate::pipeline::{current_scope, DispatchContext, Origin, Pipeline};
use crate::reactive::{receiver_stream, AsyncSubject, BehaviorSubject, Subject, Subscription};
use crate::reducer::{compose_meta_reducers, CombinedReducer, MetaReducer, ReducerMap, ReducerTree, SharedReducer};
use crate::rw_lock::{OwnerId, ReadWriteLock, WriteGuard};
use crate::settings::StoreSettings;
use crate::stack::{ExecutionStack, OperationKind};
use crate::strategy::{Strategy, StrategyCell};
use crate::tracker::CompletionTracker;
use crate::tree::TreeWriter;
use crate::value::{Path, Value};

/// Slice of the main module unless configured otherwise.
pub const DEFAULT_MAIN_SLICE: &str = "main";

// =============================================================================
// Builder
// =============================================================================

/// Configures and builds a [`Store`].
pub struct StoreBuilder {
    settings: StoreSettings,
    strategy: Option<String>,
    main: Module,
    middleware: Vec<SharedMiddleware>,
    meta_reducers: Vec<MetaReducer>,
    resolver: Option<Arc<dyn Resolver>>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            settings: StoreSettings::default(),
            strategy: None,
            main: Module::new(DEFAULT_MAIN_SLICE, ReducerTree::branch()),
            middleware: Vec::new(),
            meta_reducers: Vec::new(),
            resolver: None,
        }
    }

    pub fn with_settings(mut self, settings: StoreSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Select the initial strategy by name, overriding
    /// `exclusive_action_processing`. Unknown names fail `build`.
    pub fn with_strategy(mut self, name: impl Into<String>) -> Self {
        self.strategy = Some(name.into());
        self
    }

    /// The module whose slice is always present.
    pub fn with_main_module(mut self, module: Module) -> Self {
        self.main = module;
        self
    }

    /// Append a middleware. The first one added sees actions first.
    pub fn with_middleware(mut self, middleware: SharedMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Append a meta-reducer. The first one added is outermost.
    pub fn with_meta_reducer(mut self, meta: MetaReducer) -> Self {
        self.meta_reducers.push(meta);
        self
    }

    pub fn with_resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Validate the configuration, hydrate the initial state and start the
    /// store.
    pub async fn build(self) -> Result<Store> {
        let strategy = match &self.strategy {
            Some(name) => name.parse::<Strategy>()?,
            None => self.settings.strategy(),
        };
        if self.main.slice().trim().is_empty() {
            return Err(StoreError::configuration("main module slice must not be empty"));
        }

        let stack = ExecutionStack::new();
        let strategy_cell = Arc::new(StrategyCell::new(strategy));
        let dependencies = Dependencies::build(
            self.main.dependencies(),
            std::iter::empty(),
            self.resolver.as_deref(),
        );
        let meta_reducers = self.meta_reducers;
        let settings = self.settings;
        let reducer = build_reducer(&self.main, &[], &meta_reducers, &settings)?;
        let middleware = self.middleware;

        let inner = Arc::new_cyclic(|weak| StoreInner {
            pipeline: Pipeline::new(weak.clone(), stack.clone(), strategy_cell, &middleware),
            state: BehaviorSubject::new(Value::object()),
            actions: Subject::new(),
            observers: AsyncSubject::new(),
            reducer: RwLock::new(reducer.clone()),
            main: self.main,
            modules: Mutex::new(Vec::new()),
            dependencies: RwLock::new(Arc::new(dependencies)),
            resolver: self.resolver,
            meta_reducers,
            state_lock: ReadWriteLock::new(),
            module_lock: Lock::new(),
            stack,
            tracker: Arc::new(CompletionTracker::new()),
            sequence: AtomicU64::new(0),
            settings,
        });

        inner.hydrate(reducer, system::initialize_state()).await;

        let store = Store { inner };
        info!(
            main = %store.inner.main.slice(),
            strategy = %strategy,
            middleware = middleware.len(),
            "store built"
        );

        if store.inner.settings.dispatch_system_actions {
            store.dispatch(system::store_initialized()).await?;
        }
        Ok(store)
    }
}

impl fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("settings", &self.settings)
            .field("strategy", &self.strategy)
            .field("main", &self.main)
            .field("middleware", &self.middleware.len())
            .field("meta_reducers", &self.meta_reducers.len())
            .finish_non_exhaustive()
    }
}

/// Combine the main module and `features` into one reducer.
pub(crate) fn build_reducer(
    main: &Module,
    features: &[Module],
    meta_reducers: &[MetaReducer],
    settings: &StoreSettings,
) -> Result<SharedReducer> {
    let mounts = std::iter::once(main)
        .chain(features.iter())
        .map(|m| (m.slice(), m.reducer()));
    let combined: SharedReducer = Arc::new(CombinedReducer::new(ReducerMap::build(mounts)?));
    if settings.enable_meta_reducers && !meta_reducers.is_empty() {
        return Ok(compose_meta_reducers(meta_reducers, combined));
    }
    Ok(combined)
}

// =============================================================================
// Store
// =============================================================================

/// Handle to a running store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    pub(crate) settings: StoreSettings,
    pub(crate) state: BehaviorSubject<Value>,
    /// Committed actions tagged with their sequence number.
    pub(crate) actions: Subject<(u64, Action)>,
    observers: AsyncSubject<Value>,
    reducer: RwLock<SharedReducer>,
    pub(crate) main: Module,
    pub(crate) modules: Mutex<Vec<Module>>,
    dependencies: RwLock<Arc<Dependencies>>,
    resolver: Option<Arc<dyn Resolver>>,
    pub(crate) meta_reducers: Vec<MetaReducer>,
    pub(crate) pipeline: Pipeline,
    state_lock: ReadWriteLock,
    pub(crate) module_lock: Lock,
    pub(crate) stack: ExecutionStack,
    pub(crate) tracker: Arc<CompletionTracker>,
    sequence: AtomicU64,
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Dispatch a plain or async action.
    ///
    /// Fails with `Validation` for a malformed action, before anything runs.
    /// Reducer failures are isolated and do not fail the dispatch.
    pub async fn dispatch(&self, action: impl Into<Dispatchable>) -> Result<()> {
        self.inner
            .dispatch_with(action.into(), Origin::default())
            .await
    }

    /// Parse a JSON action and dispatch it.
    pub async fn dispatch_json(&self, action: serde_json::Value) -> Result<()> {
        let action = Action::try_from(action)?;
        self.dispatch(action).await
    }

    /// The last committed state.
    pub fn get_state(&self) -> Value {
        self.inner.state.value()
    }

    /// The value at `path` (a slice key or a list of keys), or `None` if the
    /// path does not exist.
    pub fn get_state_at(&self, path: impl Into<Path>) -> Option<Value> {
        self.inner.state.value().get_in(&path.into()).cloned()
    }

    /// Stream of `projection` over the state, emitting the current value and
    /// then only values that differ from the previous emission.
    pub fn select<T, F>(&self, projection: F) -> BoxStream<'static, T>
    where
        T: PartialEq + Clone + Send + 'static,
        F: Fn(&Value) -> T + Send + Sync + 'static,
    {
        let mut rx = self.inner.state.subscribe();
        rx.mark_changed();
        stream::unfold((rx, None::<T>, projection), |(mut rx, mut last, projection)| async move {
            loop {
                rx.changed().await.ok()?;
                let value = projection(&rx.borrow_and_update());
                if last.as_ref() != Some(&value) {
                    last = Some(value.clone());
                    return Some((value, (rx, last, projection)));
                }
            }
        })
        .boxed()
    }

    /// Stream of the value at `path`, or `default` while it is missing.
    pub fn select_at(&self, path: impl Into<Path>, default: Value) -> BoxStream<'static, Value> {
        let path = path.into();
        self.select(move |state| state.get_in(&path).cloned().unwrap_or_else(|| default.clone()))
    }

    /// Run `f` against the value at `path` while holding the state read lock,
    /// so no commit lands until `f` completes.
    ///
    /// `f` must not await a dispatch that would commit, or it waits on itself.
    pub async fn read_safe<T, F, Fut>(&self, path: impl Into<Path>, f: F) -> T
    where
        F: FnOnce(Option<Value>) -> Fut,
        Fut: Future<Output = T>,
    {
        let _read = self.inner.state_lock.read(OwnerId::new()).await;
        let value = self.get_state_at(path);
        f(value).await
    }

    /// Stream of committed actions, in commit order.
    pub fn actions(&self) -> BoxStream<'static, Action> {
        receiver_stream(self.inner.actions.subscribe())
            .map(|(_, action)| action)
            .boxed()
    }

    /// Observe every state change. With `await_state_propagation` set the
    /// observer is awaited before the triggering dispatch resolves.
    pub fn subscribe_state<F, Fut>(&self, observer: F) -> Subscription
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.observers.subscribe(observer)
    }

    /// Dependencies of every loaded module.
    pub fn dependencies(&self) -> Arc<Dependencies> {
        self.inner.dependencies()
    }

    pub fn stack(&self) -> &ExecutionStack {
        &self.inner.stack
    }

    pub fn strategy(&self) -> Strategy {
        self.inner.pipeline.strategy()
    }

    /// Switch strategy for subsequent dispatches. Returns the previous one.
    pub fn set_strategy(&self, strategy: Strategy) -> Strategy {
        let previous = self.inner.pipeline.set_strategy(strategy);
        if previous != strategy {
            info!(from = %previous, to = %strategy, "strategy changed");
        }
        previous
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.inner.settings
    }

    /// Resolve once no plain action is mid-flight.
    pub async fn wait_for_idle(&self) {
        self.inner.stack.wait_for_idle().await
    }

    /// Side-effect progress tracker.
    pub fn tracker(&self) -> &CompletionTracker {
        &self.inner.tracker
    }

    /// Set the value at `path`, tagging the change with `action`. Bypasses
    /// reducers and middleware.
    #[cfg(test)]
    pub(crate) async fn set_state(&self, path: impl Into<Path>, value: Value, action: Action) -> Result<Value> {
        self.inner
            .update_state(&path.into(), action, move |_| async move { Ok(value) })
            .await
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("main", &self.inner.main.slice())
            .field("strategy", &self.inner.pipeline.strategy())
            .field("stack", &self.inner.stack)
            .finish_non_exhaustive()
    }
}

impl StoreInner {
    pub(crate) fn dependencies(&self) -> Arc<Dependencies> {
        self.dependencies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn current_reducer(&self) -> SharedReducer {
        self.reducer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_reducer(&self, reducer: SharedReducer) {
        *self.reducer.write().unwrap_or_else(PoisonError::into_inner) = reducer;
    }

    /// Rebuild the dependency tree from the main module and `features`.
    pub(crate) fn rebuild_dependencies(&self, features: &[Module]) {
        let deps = Dependencies::build(
            self.main.dependencies(),
            features.iter().map(|m| (m.slice(), m.dependencies())),
            self.resolver.as_deref(),
        );
        *self
            .dependencies
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(deps);
    }

    /// Entry point for every dispatch, wherever it comes from.
    pub(crate) fn dispatch_with(
        self: &Arc<Self>,
        dispatchable: Dispatchable,
        origin: Origin,
    ) -> BoxFuture<'static, Result<()>> {
        let inner = self.clone();
        Box::pin(async move {
            if let Dispatchable::Action(action) = &dispatchable {
                action.validate()?;
            }
            let scope = current_scope();
            let ctx = DispatchContext::resolve(origin, scope.as_ref());
            let top_level = ctx.parent.is_none();

            inner.pipeline.run(dispatchable, ctx).await?;

            if top_level && inner.settings.await_state_propagation {
                inner.await_propagation().await;
            }
            Ok(())
        })
    }

    /// Wait for side effects to consume everything committed so far.
    async fn await_propagation(&self) {
        if self.tracker.active_count() == 0 {
            return;
        }
        let target = self.tracker.published();
        let timeout = self.settings.effect_timeout();
        if let Err(err) = self.tracker.wait(target, None, timeout).await {
            warn!(
                error = %err,
                lagging = ?self.tracker.lagging(target, None),
                "side effects did not catch up; continuing"
            );
        }
    }

    /// Innermost pipeline stage: reduce `action` and commit.
    pub(crate) async fn process_action(&self, action: Action) -> Result<()> {
        // The reducer is read under the write lock so a module swap never
        // interleaves with a reduction.
        let result = self
            .update_state(&Path::root(), action.clone(), |root| {
                let reducer = self.current_reducer();
                async move { reducer.reduce(root, &action) }
            })
            .await;
        // Reducer failures are logged in `update_state` and never fail dispatch.
        if let Err(err) = result {
            debug!(error = %err, "action left state unchanged");
        }
        Ok(())
    }

    /// Run `reducer` over the whole tree, tagged with `action`.
    pub(crate) async fn hydrate(&self, reducer: SharedReducer, action: Action) {
        let tag = action.clone();
        let _ = self
            .update_state(&Path::root(), tag, move |root| async move {
                reducer.reduce(root, &action)
            })
            .await;
    }

    /// Compute a new value for `path` and commit it tagged with `action`.
    ///
    /// The producer runs under the state write lock and sees the committed
    /// value at `path` (`None` if missing). Every commit takes the lock as a
    /// fresh owner, so two commits never read the same root. A producer error leaves the state
    /// unchanged and is returned as `StoreError::Reducer`.
    pub(crate) async fn update_state<F, Fut>(&self, path: &Path, action: Action, producer: F) -> Result<Value>
    where
        F: FnOnce(Option<Value>) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let guard = self.state_lock.write(OwnerId::new()).await;
        let current = self.state.value();
        let target = if path.is_root() {
            Some(current.clone())
        } else {
            current.get_in(path).cloned()
        };

        let produced = match producer(target.clone()).await {
            Ok(value) => value,
            Err(err) => {
                let err = StoreError::Reducer {
                    path: path.to_string(),
                    action_type: action.action_type().to_string(),
                    message: format!("{err:#}"),
                };
                warn!(error = %err, "state update failed; state unchanged");
                return Err(err);
            }
        };

        let unchanged = target.as_ref().is_some_and(|t| t.same(&produced));
        let next = if unchanged {
            current.clone()
        } else if path.is_root() {
            produced
        } else {
            let mut writer = TreeWriter::new(current.clone());
            writer.set(path, produced);
            writer.finish()
        };

        Ok(self.commit(guard, &current, next, action).await)
    }

    /// Remove the node at `path`, tagged with `action`.
    pub(crate) async fn remove_state(&self, path: &Path, action: Action) -> Value {
        let guard = self.state_lock.write(OwnerId::new()).await;
        let current = self.state.value();
        let mut writer = TreeWriter::new(current.clone());
        let next = if writer.remove(path) {
            writer.finish()
        } else {
            current.clone()
        };
        self.commit(guard, &current, next, action).await
    }

    /// Publish `next` and `action`, then notify observers outside the lock.
    async fn commit(&self, guard: WriteGuard<'_>, previous: &Value, next: Value, action: Action) -> Value {
        let changed = !next.same(previous);
        if changed {
            self.state.next(next.clone());
        }
        let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.tracker.publish(seq);
        self.actions.next((seq, action.clone()));
        drop(guard);

        debug!(action = %action.action_type(), seq, changed, "committed");

        if changed {
            let notify = self.observers.next(next.clone());
            if self.settings.await_state_propagation {
                notify.await;
            } else {
                tokio::spawn(notify);
            }
        }
        next
    }
}

/// Fail if the current task is inside a plain action, where waiting for idle
/// would wait on itself.
pub(crate) fn ensure_outside_action(operation: &'static str) -> Result<()> {
    let Some(scope) = current_scope() else {
        return Ok(());
    };
    let mut current = Some(&scope.op);
    while let Some(op) = current {
        if op.kind() == OperationKind::Action {
            return Err(StoreError::Reentrancy {
                operation,
                action_type: op.name().to_string(),
            });
        }
        current = op.source();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::AsyncAction;
    use crate::middleware::middleware_fn;
    use crate::reducer::{meta_reducer, reducer_fn};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> SharedReducer {
        reducer_fn(|state, action| {
            let state = state.unwrap_or_else(|| json!({"count": 0}).into());
            Ok(match action.action_type() {
                "INC" => {
                    let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
                    state.with("count", count + 1)
                }
                "ADD" => {
                    let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
                    let by = action.payload().and_then(Value::as_i64).unwrap_or(0);
                    state.with("count", count + by)
                }
                _ => state,
            })
        })
    }

    async fn counter_store(strategy: &str) -> Store {
        Store::builder()
            .with_main_module(Module::new("main", counter()))
            .with_strategy(strategy)
            .build()
            .await
            .unwrap()
    }

    fn count(store: &Store) -> i64 {
        store
            .get_state_at(["main", "count"])
            .and_then(|v| v.as_i64())
            .unwrap()
    }

    // =========================================================================
    // Dispatch and reads
    // =========================================================================

    #[tokio::test]
    async fn test_three_increments() {
        let store = counter_store("exclusive").await;
        for _ in 0..3 {
            store.dispatch(Action::new("INC")).await.unwrap();
        }
        assert_eq!(store.get_state().to_json(), json!({"main": {"count": 3}}));
    }

    #[tokio::test]
    async fn test_invalid_action_rejected_before_pipeline() {
        let store = counter_store("concurrent").await;
        let err = store.dispatch(Action::new("")).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));

        let err = store.dispatch_json(json!({"payload": 1})).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        assert_eq!(count(&store), 0);
    }

    #[tokio::test]
    async fn test_get_state_missing_path_is_none() {
        let store = counter_store("concurrent").await;
        assert!(store.get_state_at(["main", "nope"]).is_none());
        assert!(store.get_state_at("absent").is_none());
        assert!(store.get_state_at("main").is_some());
    }

    #[tokio::test]
    async fn test_unchanged_state_keeps_root_identity() {
        let store = counter_store("concurrent").await;
        let before = store.get_state();
        store.dispatch(Action::new("UNKNOWN")).await.unwrap();
        assert!(store.get_state().same(&before));
    }

    #[tokio::test]
    async fn test_dispatch_json() {
        let store = counter_store("concurrent").await;
        store
            .dispatch_json(json!({"type": "ADD", "payload": 5}))
            .await
            .unwrap();
        assert_eq!(count(&store), 5);
    }

    #[tokio::test]
    async fn test_select_is_distinct_until_changed() {
        let store = counter_store("concurrent").await;
        let mut counts = store.select(|s| s.get_in(&Path::from(["main", "count"])).and_then(Value::as_i64));

        assert_eq!(counts.next().await, Some(Some(0)));
        store.dispatch(Action::new("NOOP")).await.unwrap();
        store.dispatch(Action::new("INC")).await.unwrap();
        assert_eq!(counts.next().await, Some(Some(1)));
    }

    #[tokio::test]
    async fn test_select_at_default() {
        let store = counter_store("concurrent").await;
        let mut missing = store.select_at(["cart", "items"], Value::array());
        assert_eq!(missing.next().await, Some(Value::array()));
    }

    #[tokio::test]
    async fn test_actions_stream_sees_commits_in_order() {
        let store = counter_store("exclusive").await;
        let mut actions = store.actions();
        store.dispatch(Action::new("INC")).await.unwrap();
        store.dispatch(Action::with_payload("ADD", 2)).await.unwrap();
        assert_eq!(actions.next().await.unwrap().action_type(), "INC");
        assert_eq!(actions.next().await.unwrap().action_type(), "ADD");
    }

    #[tokio::test]
    async fn test_store_initialized_dispatched() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = seen.clone();
            middleware_fn("rec", move |_api, action, next| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(action.action_type().to_string());
                    next.run(action).await?;
                    Ok(())
                }
            })
        };
        let _store = Store::builder().with_middleware(recorder).build().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![system::STORE_INITIALIZED.to_string()]);

        let quiet = Store::builder()
            .with_settings(StoreSettings {
                dispatch_system_actions: false,
                ..StoreSettings::default()
            })
            .build()
            .await
            .unwrap();
        assert!(quiet.get_state().as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_strategy_fails_build() {
        let err = Store::builder().with_strategy("serial").build().await.unwrap_err();
        assert!(matches!(err, StoreError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_set_state_bypasses_reducers() {
        let store = counter_store("concurrent").await;
        let other = store.get_state_at("main").unwrap();
        store
            .set_state(["extra", "flag"], Value::from(true), Action::new("SET"))
            .await
            .unwrap();
        assert_eq!(store.get_state_at(["extra", "flag"]), Some(Value::from(true)));
        assert!(store.get_state_at("main").unwrap().same(&other));
    }

    // =========================================================================
    // Middleware and meta-reducers
    // =========================================================================

    #[tokio::test]
    async fn test_middleware_order_and_reentrant_dispatch() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer = {
            let order = order.clone();
            middleware_fn("outer", move |api, action, next| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(format!("outer:{}", action.action_type()));
                    let is_inc = action.action_type() == "INC";
                    next.run(action).await?;
                    if is_inc {
                        // Nested dispatch while INC holds the exclusive lock.
                        api.dispatch(Action::new("INC_DONE")).await?;
                    }
                    Ok(())
                }
            })
        };
        let inner = {
            let order = order.clone();
            middleware_fn("inner", move |_api, action, next| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(format!("inner:{}", action.action_type()));
                    next.run(action).await?;
                    Ok(())
                }
            })
        };
        let store = Store::builder()
            .with_main_module(Module::new("main", counter()))
            .with_strategy("exclusive")
            .with_settings(StoreSettings {
                dispatch_system_actions: false,
                ..StoreSettings::default()
            })
            .with_middleware(outer)
            .with_middleware(inner)
            .build()
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), store.dispatch(Action::new("INC")))
            .await
            .expect("nested dispatch must not deadlock")
            .unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer:INC", "inner:INC", "outer:INC_DONE", "inner:INC_DONE"]
        );
        assert_eq!(count(&store), 1);
    }

    #[tokio::test]
    async fn test_meta_reducers_toggle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let meta = {
            let calls = calls.clone();
            meta_reducer(move |inner| {
                let calls = calls.clone();
                reducer_fn(move |state, action| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    inner.reduce(state, action)
                })
            })
        };

        let store = Store::builder()
            .with_main_module(Module::new("main", counter()))
            .with_meta_reducer(meta.clone())
            .build()
            .await
            .unwrap();
        let after_build = calls.load(Ordering::SeqCst);
        assert!(after_build >= 1);
        store.dispatch(Action::new("INC")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), after_build + 1);
        assert_eq!(count(&store), 1);

        calls.store(0, Ordering::SeqCst);
        let disabled = Store::builder()
            .with_main_module(Module::new("main", counter()))
            .with_meta_reducer(meta)
            .with_settings(StoreSettings {
                enable_meta_reducers: false,
                ..StoreSettings::default()
            })
            .build()
            .await
            .unwrap();
        disabled.dispatch(Action::new("INC")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Async actions and strategies
    // =========================================================================

    #[tokio::test]
    async fn test_async_action_dispatches_children_in_order() {
        let store = counter_store("exclusive").await;
        let mut actions = store.actions();
        let thunk = AsyncAction::new("add-then-inc", |ctx| async move {
            ctx.dispatch(Action::with_payload("ADD", 10)).await?;
            tokio::task::yield_now().await;
            ctx.dispatch(Action::new("INC")).await?;
            let seen = ctx.get_state_at(["main", "count"]).and_then(|v| v.as_i64());
            anyhow::ensure!(seen == Some(11), "unexpected count {seen:?}");
            Ok(())
        });
        store.dispatch(thunk).await.unwrap();
        assert_eq!(count(&store), 11);
        assert_eq!(actions.next().await.unwrap().action_type(), "ADD");
        assert_eq!(actions.next().await.unwrap().action_type(), "INC");
        assert!(store.stack().is_empty());
    }

    #[tokio::test]
    async fn test_async_action_error_is_reported() {
        let store = counter_store("concurrent").await;
        let thunk = AsyncAction::new("broken", |_ctx| async { anyhow::bail!("backend down") });
        match store.dispatch(thunk).await {
            Err(StoreError::AsyncAction { name, source }) => {
                assert_eq!(name, "broken");
                assert_eq!(source.to_string(), "backend down");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(store.stack().is_empty());
    }

    #[tokio::test]
    async fn test_async_body_direct_store_dispatch_uses_branch() {
        let store = counter_store("exclusive").await;
        let handle = store.clone();
        let thunk = AsyncAction::new("direct", move |_ctx| {
            let store = handle.clone();
            async move {
                store.dispatch(Action::new("INC")).await?;
                Ok(())
            }
        });
        tokio::time::timeout(Duration::from_secs(2), store.dispatch(thunk))
            .await
            .expect("direct dispatch from async body")
            .unwrap();
        assert_eq!(count(&store), 1);
    }

    #[tokio::test]
    async fn test_set_strategy_at_runtime() {
        let store = counter_store("concurrent").await;
        assert_eq!(store.strategy(), Strategy::Concurrent);
        assert_eq!(store.set_strategy(Strategy::Exclusive), Strategy::Concurrent);
        assert_eq!(store.strategy(), Strategy::Exclusive);
        store.dispatch(Action::new("INC")).await.unwrap();
        assert_eq!(count(&store), 1);
    }

    // =========================================================================
    // Observers and safe reads
    // =========================================================================

    #[tokio::test]
    async fn test_observers_awaited_before_dispatch_resolves() {
        let store = counter_store("concurrent").await;
        let seen = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let seen = seen.clone();
            store.subscribe_state(move |state| {
                let seen = seen.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let count = state.get_in(&Path::from(["main", "count"])).and_then(Value::as_i64);
                    seen.store(count.unwrap_or(0) as usize, Ordering::SeqCst);
                }
            })
        };
        store.dispatch(Action::new("INC")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_safe_blocks_commits() {
        let store = counter_store("concurrent").await;
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_safe(["main", "count"], |value| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        value.and_then(|v| v.as_i64())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.dispatch(Action::new("INC")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count(&store), 0, "commit landed during read_safe");

        release_tx.send(()).unwrap();
        assert_eq!(reader.await.unwrap(), Some(0));
        writer.await.unwrap().unwrap();
        assert_eq!(count(&store), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_commits_never_read_the_same_root() {
        // Each INC stays in the reducer long enough for other commits to queue.
        let slow = reducer_fn(|state, action| {
            let state = state.unwrap_or_else(|| json!({"count": 0}).into());
            if action.action_type() != "INC" {
                return Ok(state);
            }
            std::thread::sleep(Duration::from_millis(2));
            let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
            Ok(state.with("count", count + 1))
        });
        let store = Store::builder()
            .with_main_module(Module::new("main", slow))
            .with_strategy("concurrent")
            .build()
            .await
            .unwrap();

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch(Action::new("INC")).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(count(&store), 40);
    }
}
