//! Side effects - reactive functions that turn actions into more actions.
//!
//! A side effect receives the stream of committed actions, the stream of
//! states and the dependency tree, and returns a stream of derived actions.
//! The store dispatches everything it emits.
//!
//! ```text
//! commit ─► actions ─► effect.run(..) ─► Ok(action) ─► dispatch
//!                                    └─► Err(e)     ─► logged, effect keeps running
//! ```
//!
//! # Key Properties
//!
//! - **Registered when idle**: [`Store::extend`] waits until no plain action
//!   is mid-flight before subscribing.
//! - **Strategy-aware**: under the exclusive strategy every effect of a batch
//!   is driven by one task, one emission at a time. Under the concurrent
//!   strategy each effect runs on its own task.
//! - **No echoes**: an emitted action instance that was already dispatched
//!   (an effect handing its input straight back) is skipped.
//! - **Isolated**: an `Err` item is logged as an effect error; a panic ends
//!   only the panicking effect.
//! - **Tracked**: each effect reports how far it consumed the action stream,
//!   which is what top-level dispatches wait on when
//!   `await_state_propagation` is set.
//!
//! Effects must emit actions rather than calling [`Store::dispatch`]
//! themselves: a top-level dispatch from inside an effect waits for that
//! same effect to catch up and only resolves after `effect_timeout_ms`.
//!
//! # Example
//!
//! ```ignore
//! use futures::{future, StreamExt};
//!
//! let pong = effect_fn("pong", |actions, _state, _deps| {
//!     actions
//!         .filter(|a| future::ready(a.action_type() == "PING"))
//!         .map(|_| Ok(Action::new("PONG")))
//! });
//!
//! let handle = store.extend([pong]).await?;
//! store.dispatch(Action::new("PING")).await?;
//! handle.unregister();
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::error::{panic_message, Result, StoreError};
use crate::module::Dependencies;
use crate::pipeline::Origin;
use crate::reactive::receiver_stream;
use crate::stack::{Operation, OperationKind};
use crate::store::{ensure_outside_action, Store, StoreInner};
use crate::strategy::Strategy;
use crate::tracker::CompletionTracker;
use crate::value::Value;

// =============================================================================
// Side effect contract
// =============================================================================

/// A reactive function from actions and state to derived actions.
pub trait SideEffect: Send + Sync + 'static {
    /// Name used in logs, the execution stack and lag reports.
    fn name(&self) -> &str;

    /// Recorded on the execution stack for every emitted action.
    fn kind(&self) -> OperationKind {
        OperationKind::Epic
    }

    /// Build the output stream. Called once per registration.
    fn run(
        &self,
        actions: BoxStream<'static, Action>,
        state: BoxStream<'static, Value>,
        dependencies: Arc<Dependencies>,
    ) -> BoxStream<'static, anyhow::Result<Action>>;
}

/// Shared side effect handle.
pub type SharedEffect = Arc<dyn SideEffect>;

struct FnEffect<F> {
    name: String,
    f: F,
}

impl<F, S> SideEffect for FnEffect<F>
where
    F: Fn(BoxStream<'static, Action>, BoxStream<'static, Value>, Arc<Dependencies>) -> S
        + Send
        + Sync
        + 'static,
    S: Stream<Item = anyhow::Result<Action>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        actions: BoxStream<'static, Action>,
        state: BoxStream<'static, Value>,
        dependencies: Arc<Dependencies>,
    ) -> BoxStream<'static, anyhow::Result<Action>> {
        (self.f)(actions, state, dependencies).boxed()
    }
}

/// Build a stream-style side effect from a closure.
pub fn effect_fn<F, S>(name: impl Into<String>, f: F) -> SharedEffect
where
    F: Fn(BoxStream<'static, Action>, BoxStream<'static, Value>, Arc<Dependencies>) -> S
        + Send
        + Sync
        + 'static,
    S: Stream<Item = anyhow::Result<Action>> + Send + 'static,
{
    Arc::new(FnEffect {
        name: name.into(),
        f,
    })
}

// =============================================================================
// Sagas
// =============================================================================

type Put = (Action, oneshot::Sender<()>);

/// What a saga body works with: pull actions, read state, put actions.
pub struct SagaContext {
    actions: BoxStream<'static, Action>,
    state: BoxStream<'static, Value>,
    latest: Value,
    dependencies: Arc<Dependencies>,
    out: mpsc::UnboundedSender<Put>,
}

impl SagaContext {
    /// The next committed action, or `None` once the store is gone.
    pub async fn take(&mut self) -> Option<Action> {
        self.actions.next().await
    }

    /// The next committed action of `action_type`.
    pub async fn take_type(&mut self, action_type: &str) -> Option<Action> {
        loop {
            let action = self.actions.next().await?;
            if action.action_type() == action_type {
                return Some(action);
            }
        }
    }

    /// Emit `action`. It is queued right away; the returned future resolves
    /// once the store has dispatched it.
    ///
    /// The future does not borrow the context, so the saga body stays `Send`.
    pub fn put(&self, action: Action) -> impl std::future::Future<Output = ()> + Send + 'static {
        let (ack, acked) = oneshot::channel();
        let queued = self.out.send((action, ack)).is_ok();
        async move {
            if queued {
                let _ = acked.await;
            }
        }
    }

    /// The latest state seen so far.
    pub fn state(&mut self) -> Value {
        while let Some(Some(value)) = self.state.next().now_or_never() {
            self.latest = value;
        }
        self.latest.clone()
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }
}

impl fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaContext").finish_non_exhaustive()
    }
}

/// Drives a saga body and yields what it puts. A put is acknowledged when
/// the runner comes back for the next item, which is after it dispatched the
/// previous one.
struct SagaStream {
    body: Option<BoxFuture<'static, anyhow::Result<()>>>,
    puts: mpsc::UnboundedReceiver<Put>,
    unacked: Option<oneshot::Sender<()>>,
}

impl Stream for SagaStream {
    type Item = anyhow::Result<Action>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(ack) = self.unacked.take() {
            let _ = ack.send(());
        }
        if let Poll::Ready(Some((action, ack))) = self.puts.poll_recv(cx) {
            self.unacked = Some(ack);
            return Poll::Ready(Some(Ok(action)));
        }
        if let Some(body) = self.body.as_mut() {
            if let Poll::Ready(result) = body.poll_unpin(cx) {
                self.body = None;
                if let Err(err) = result {
                    return Poll::Ready(Some(Err(err)));
                }
            }
        }
        match self.puts.poll_recv(cx) {
            Poll::Ready(Some((action, ack))) => {
                self.unacked = Some(ack);
                Poll::Ready(Some(Ok(action)))
            }
            Poll::Ready(None) if self.body.is_none() => Poll::Ready(None),
            _ => Poll::Pending,
        }
    }
}

struct FnSaga<F> {
    name: String,
    f: F,
}

impl<F, Fut> SideEffect for FnSaga<F>
where
    F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Saga
    }

    fn run(
        &self,
        actions: BoxStream<'static, Action>,
        state: BoxStream<'static, Value>,
        dependencies: Arc<Dependencies>,
    ) -> BoxStream<'static, anyhow::Result<Action>> {
        let (out, puts) = mpsc::unbounded_channel();
        let ctx = SagaContext {
            actions,
            state,
            latest: Value::default(),
            dependencies,
            out,
        };
        SagaStream {
            body: Some((self.f)(ctx).boxed()),
            puts,
            unacked: None,
        }
        .boxed()
    }
}

/// Build a coroutine-style side effect: an async body that pulls actions
/// with [`SagaContext::take`] and emits with [`SagaContext::put`].
///
/// ```ignore
/// let checkout = saga_fn("checkout", |mut ctx| async move {
///     while let Some(order) = ctx.take_type("CHECKOUT").await {
///         let api = ctx.dependencies().get::<CartApi>(["cart", "api"]);
///         ctx.put(Action::with_payload("CHECKOUT_DONE", order.payload().cloned().unwrap_or_default())).await;
///     }
///     Ok(())
/// });
/// ```
pub fn saga_fn<F, Fut>(name: impl Into<String>, f: F) -> SharedEffect
where
    F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnSaga {
        name: name.into(),
        f,
    })
}

// =============================================================================
// Input tracking
// =============================================================================

/// The action stream handed to one effect. Whenever the effect finds it
/// empty, everything delivered so far counts as consumed.
struct TrackedActions {
    inner: BoxStream<'static, (u64, Action)>,
    tracker: Arc<CompletionTracker>,
    id: u64,
    delivered: u64,
}

impl Stream for TrackedActions {
    type Item = Action;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Action>> {
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some((seq, action))) => {
                self.delivered = seq;
                Poll::Ready(Some(action))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                self.tracker.consumed(self.id, self.delivered);
                Poll::Pending
            }
        }
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Stop flag checked between effect events.
#[derive(Debug, Default)]
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
struct EffectSlot {
    id: u64,
    name: String,
    kind: OperationKind,
}

enum EffectEvent {
    Emitted(Action),
    Failed(anyhow::Error),
    Panicked(String),
    Finished,
}

type EventStream = BoxStream<'static, (Arc<EffectSlot>, EffectEvent)>;

/// Wrap an effect's output so panics and the end of the stream become
/// events.
fn events(slot: Arc<EffectSlot>, output: BoxStream<'static, anyhow::Result<Action>>) -> EventStream {
    AssertUnwindSafe(output)
        .catch_unwind()
        .map(|item| match item {
            Ok(Ok(action)) => EffectEvent::Emitted(action),
            Ok(Err(err)) => EffectEvent::Failed(err),
            Err(panic) => EffectEvent::Panicked(panic_message(panic.as_ref())),
        })
        .chain(stream::once(future::ready(EffectEvent::Finished)))
        .map(move |event| (slot.clone(), event))
        .boxed()
}

/// Pull events until the streams end or `stop` fires. A dispatch already in
/// progress is never interrupted.
async fn drive(mut events: EventStream, store: Weak<StoreInner>, tracker: Arc<CompletionTracker>, stop: Arc<StopSignal>) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.wait() => break,
            next = events.next() => next,
        };
        let Some((slot, event)) = next else {
            break;
        };
        handle_event(&store, &tracker, &slot, event).await;
    }
}

async fn handle_event(store: &Weak<StoreInner>, tracker: &CompletionTracker, slot: &EffectSlot, event: EffectEvent) {
    match event {
        EffectEvent::Emitted(action) => {
            if action.was_dispatched() {
                debug!(effect = %slot.name, action = %action.action_type(), "skipping already dispatched action");
                return;
            }
            let Some(store) = store.upgrade() else {
                return;
            };
            let op = Operation::new(slot.kind, slot.name.as_str(), None);
            let _guard = store.stack.enter(op.clone());
            let origin = Origin {
                parent: Some(op),
                branch: None,
            };
            let action_type = action.action_type().to_string();
            if let Err(err) = store.dispatch_with(action.into(), origin).await {
                warn!(effect = %slot.name, action = %action_type, error = %err, "effect dispatch failed");
            }
        }
        EffectEvent::Failed(source) => {
            let err = StoreError::Effect {
                name: slot.name.clone(),
                message: format!("{source:#}"),
            };
            warn!(error = %err, "side effect emitted an error");
        }
        EffectEvent::Panicked(message) => {
            let err = StoreError::Effect {
                name: slot.name.clone(),
                message,
            };
            error!(error = %err, "side effect panicked; subscription ended");
        }
        EffectEvent::Finished => {
            debug!(effect = %slot.name, "side effect finished");
            tracker.complete(slot.id);
        }
    }
}

// =============================================================================
// Registration
// =============================================================================

impl Store {
    /// Register side effects once the store is idle.
    ///
    /// Fails with `Reentrancy` when called from inside a plain action.
    pub async fn extend<I>(&self, effects: I) -> Result<EffectsHandle>
    where
        I: IntoIterator<Item = SharedEffect>,
    {
        ensure_outside_action("extend")?;
        let effects: Vec<SharedEffect> = effects.into_iter().collect();
        let inner = &self.inner;
        inner.stack.wait_for_idle().await;

        let tracker = inner.tracker.clone();
        let batch = tracker.next_batch();
        let dependencies = inner.dependencies();
        let mut streams: Vec<EventStream> = Vec::with_capacity(effects.len());
        let mut ids = Vec::with_capacity(effects.len());

        for effect in &effects {
            // Subscribe before registering so nothing committed after the
            // registration baseline can be missed.
            let rx = inner.actions.subscribe();
            let id = tracker.register(batch, effect.name());
            ids.push(id);

            let slot = Arc::new(EffectSlot {
                id,
                name: effect.name().to_string(),
                kind: effect.kind(),
            });
            let input = TrackedActions {
                inner: receiver_stream(rx),
                tracker: tracker.clone(),
                id,
                delivered: 0,
            }
            .boxed();
            let state = inner.state.stream();

            match std::panic::catch_unwind(AssertUnwindSafe(|| {
                effect.run(input, state, dependencies.clone())
            })) {
                Ok(output) => streams.push(events(slot, output)),
                Err(panic) => {
                    error!(
                        effect = %slot.name,
                        panic = %panic_message(panic.as_ref()),
                        "side effect panicked during setup"
                    );
                    tracker.complete(id);
                }
            }
        }

        let stop = Arc::new(StopSignal::default());
        let store = Arc::downgrade(inner);
        let strategy = self.strategy();
        let tasks: Vec<JoinHandle<()>> = match strategy {
            Strategy::Exclusive => {
                let merged = stream::select_all(streams).boxed();
                vec![tokio::spawn(drive(merged, store, tracker.clone(), stop.clone()))]
            }
            Strategy::Concurrent => streams
                .into_iter()
                .map(|events| tokio::spawn(drive(events, store.clone(), tracker.clone(), stop.clone())))
                .collect(),
        };

        info!(
            batch,
            effects = ids.len(),
            mode = if strategy == Strategy::Exclusive { "sequential" } else { "concurrent" },
            "side effects registered"
        );

        Ok(EffectsHandle {
            batch,
            ids,
            tracker,
            stop,
            timeout: inner.settings.effect_timeout(),
            tasks,
        })
    }
}

/// Control over one batch of registered side effects.
///
/// Dropping the handle leaves the effects running for the lifetime of the
/// store.
pub struct EffectsHandle {
    batch: u64,
    ids: Vec<u64>,
    tracker: Arc<CompletionTracker>,
    stop: Arc<StopSignal>,
    timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl EffectsHandle {
    pub fn batch(&self) -> u64 {
        self.batch
    }

    /// Wait until every effect of this batch consumed every action committed
    /// so far. Fails with `Timeout` after `effect_timeout_ms`.
    pub async fn all_executed(&self) -> Result<()> {
        let target = self.tracker.published();
        let result = self
            .tracker
            .wait(target, Some(self.batch), self.timeout)
            .await;
        if let Err(err) = &result {
            warn!(
                batch = self.batch,
                error = %err,
                lagging = ?self.tracker.lagging(target, Some(self.batch)),
                "side effects did not catch up"
            );
        }
        result
    }

    /// Wait until every effect of this batch has finished (stream ended,
    /// panicked or unregistered). Fails with `Timeout` after
    /// `effect_timeout_ms`.
    pub async fn all_completed(&self) -> Result<()> {
        self.tracker
            .wait(u64::MAX, Some(self.batch), self.timeout)
            .await
    }

    /// True until every effect of this batch finished or was unregistered.
    pub fn is_active(&self) -> bool {
        !self.stop.is_stopped() && self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Stop the batch. Emissions not yet dispatched are dropped; a dispatch
    /// already in progress completes. Waiters on this batch are released.
    pub fn unregister(&self) {
        if self.stop.is_stopped() {
            return;
        }
        self.stop.stop();
        for id in &self.ids {
            self.tracker.complete(*id);
        }
        info!(batch = self.batch, effects = self.ids.len(), "side effects unregistered");
    }
}

impl fmt::Debug for EffectsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectsHandle")
            .field("batch", &self.batch)
            .field("effects", &self.ids.len())
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}
