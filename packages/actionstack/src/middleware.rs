//! Middleware contract.
//!
//! Middleware sits between the pipeline's starter stage and the reducer. Each
//! middleware receives the action and a [`Next`] handle; calling
//! `next.run(action)` passes the action on, not calling it swallows the action.
//!
//! ```text
//! dispatch → starter (strategy, lock, stack) → mw[0] → mw[1] → … → reduce + commit
//! ```
//!
//! Middleware composes right to left: the first middleware registered is the
//! outermost and sees the action first.
//!
//! # Privileged middleware
//!
//! A middleware that returns a valid [`signature`](crate::signature) from
//! [`Middleware::signature`] gets a [`PrivilegedApi`] through
//! [`MiddlewareApi::privileged`], with access to the pipeline lock, the
//! execution stack and the strategy flag. Everyone else only gets
//! `get_state` and `dispatch`.
//!
//! ```ignore
//! struct Audit;
//!
//! #[async_trait]
//! impl Middleware for Audit {
//!     fn name(&self) -> &str { "audit" }
//!
//!     async fn handle(&self, api: &MiddlewareApi, action: Action, next: Next) -> anyhow::Result<()> {
//!         let before = api.get_state();
//!         next.run(action.clone()).await?;
//!         if !before.same(&api.get_state()) {
//!             tracing::info!(action = %action.action_type(), "state changed");
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use crate::action::{Action, Dispatchable};
use crate::error::{Result, StoreError};
use crate::lock::Lock;
use crate::pipeline::Dispatcher;
use crate::stack::ExecutionStack;
use crate::strategy::{Strategy, StrategyCell};
use crate::value::{Path, Value};

/// A stage of the dispatch pipeline.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Name used in logs and error reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Capability signature requesting privileged access.
    fn signature(&self) -> Option<&str> {
        None
    }

    /// Handle `action`, usually by calling `next.run(action)`.
    async fn handle(&self, api: &MiddlewareApi, action: Action, next: Next) -> anyhow::Result<()>;
}

/// Shared middleware handle.
pub type SharedMiddleware = Arc<dyn Middleware>;

type NextFn = dyn Fn(Action) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// The rest of the pipeline after the current middleware.
#[derive(Clone)]
pub struct Next(Arc<NextFn>);

impl Next {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: Fn(Action) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Next(Arc::new(f))
    }

    /// Pass `action` to the next stage.
    pub fn run(&self, action: Action) -> BoxFuture<'static, Result<()>> {
        (self.0)(action)
    }

    /// Put `middleware` in front of `next`.
    pub(crate) fn wrap(middleware: SharedMiddleware, api: MiddlewareApi, next: Next) -> Next {
        let api = Arc::new(api);
        Next::new(move |action| {
            let middleware = middleware.clone();
            let api = api.clone();
            let next = next.clone();
            async move {
                middleware
                    .handle(&api, action, next)
                    .await
                    .map_err(|err| match err.downcast::<StoreError>() {
                        Ok(store_err) => store_err,
                        Err(source) => {
                            warn!(middleware = %middleware.name(), error = %source, "middleware failed");
                            StoreError::Middleware {
                                name: middleware.name().to_string(),
                                source,
                            }
                        }
                    })
            }
            .boxed()
        })
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// What every middleware can reach.
#[derive(Clone)]
pub struct MiddlewareApi {
    dispatcher: Dispatcher,
    privileged: Option<PrivilegedApi>,
}

impl MiddlewareApi {
    pub(crate) fn new(dispatcher: Dispatcher, privileged: Option<PrivilegedApi>) -> Self {
        Self {
            dispatcher,
            privileged,
        }
    }

    /// The last committed state.
    pub fn get_state(&self) -> Value {
        self.dispatcher.state()
    }

    pub fn get_state_at(&self, path: impl Into<Path>) -> Option<Value> {
        self.dispatcher.state().get_in(&path.into()).cloned()
    }

    /// Dispatch from inside the pipeline. While the current action holds the
    /// exclusive lock this runs re-entrantly instead of queueing.
    pub async fn dispatch(&self, action: impl Into<Dispatchable>) -> Result<()> {
        self.dispatcher.dispatch(action).await
    }

    /// Extended access, present only for validly signed middleware.
    pub fn privileged(&self) -> Option<&PrivilegedApi> {
        self.privileged.as_ref()
    }
}

impl fmt::Debug for MiddlewareApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareApi")
            .field("privileged", &self.privileged.is_some())
            .finish_non_exhaustive()
    }
}

/// Pipeline internals exposed to signed middleware.
#[derive(Clone)]
pub struct PrivilegedApi {
    pub(crate) lock: Arc<Lock>,
    pub(crate) stack: ExecutionStack,
    pub(crate) strategy: Arc<StrategyCell>,
}

impl PrivilegedApi {
    /// The store-wide lock used by the exclusive strategy.
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn stack(&self) -> &ExecutionStack {
        &self.stack
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy.get()
    }

    /// Switch strategy for subsequent dispatches. Returns the previous one.
    pub fn set_strategy(&self, strategy: Strategy) -> Strategy {
        self.strategy.set(strategy)
    }

    /// Switch strategy by name; unknown names select concurrent with a warning.
    pub fn set_strategy_by_name(&self, name: &str) -> Strategy {
        self.strategy.set(Strategy::parse_or_concurrent(name))
    }
}

impl fmt::Debug for PrivilegedApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivilegedApi")
            .field("strategy", &self.strategy.get())
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Closure middleware
// =============================================================================

struct FnMiddleware<F> {
    name: String,
    signature: Option<String>,
    f: F,
}

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(MiddlewareApi, Action, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    async fn handle(&self, api: &MiddlewareApi, action: Action, next: Next) -> anyhow::Result<()> {
        (self.f)(api.clone(), action, next).await
    }
}

/// Build a middleware from a closure.
///
/// ```ignore
/// let log = middleware_fn("log", |_api, action, next| async move {
///     tracing::debug!(action = %action.action_type(), "dispatching");
///     next.run(action).await?;
///     Ok(())
/// });
/// ```
pub fn middleware_fn<F, Fut>(name: impl Into<String>, f: F) -> SharedMiddleware
where
    F: Fn(MiddlewareApi, Action, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnMiddleware {
        name: name.into(),
        signature: None,
        f,
    })
}

/// Like [`middleware_fn`], presenting `signature` for privileged access.
pub fn signed_middleware_fn<F, Fut>(
    name: impl Into<String>,
    signature: impl Into<String>,
    f: F,
) -> SharedMiddleware
where
    F: Fn(MiddlewareApi, Action, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnMiddleware {
        name: name.into(),
        signature: Some(signature.into()),
        f,
    })
}
