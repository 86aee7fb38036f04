//! Actions and async actions.
//!
//! An [`Action`] is an immutable record describing an intended state change.
//! It is a cheap-clone handle: clones share identity, while two actions built
//! separately are distinct even if they are structurally equal. The store uses
//! identity to recognise an action that was already dispatched.
//!
//! An [`AsyncAction`] is a named deferred computation. It is never reduced
//! itself; it dispatches zero or more plain actions through its
//! [`ThunkContext`].
//!
//! [`Dispatchable`] is what `Store::dispatch` accepts: the two kinds are
//! decided at the API boundary, not probed at runtime.
//!
//! # Example
//!
//! ```ignore
//! use actionstack::{Action, AsyncAction};
//!
//! store.dispatch(Action::new("INC")).await?;
//!
//! let load = AsyncAction::new("load-items", |ctx| async move {
//!     ctx.dispatch(Action::new("LOAD_STARTED")).await?;
//!     let api = ctx.dependencies().get::<ItemsApi>("api").ok_or_else(|| anyhow!("no api"))?;
//!     let items = api.fetch().await?;
//!     ctx.dispatch(Action::with_payload("LOAD_DONE", items)).await?;
//!     Ok(())
//! });
//! store.dispatch(load).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::module::Dependencies;
use crate::pipeline::Dispatcher;
use crate::reactive::BehaviorSubject;
use crate::value::{Path, Value};

// =============================================================================
// Action
// =============================================================================

struct ActionData {
    id: Uuid,
    action_type: String,
    payload: Option<Value>,
    meta: Option<Value>,
    error: bool,
    dispatched: AtomicBool,
}

/// An immutable action record with reference identity.
#[derive(Clone)]
pub struct Action(Arc<ActionData>);

impl Action {
    /// An action with only a type.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self::builder(action_type).build()
    }

    /// An action with a type and payload.
    pub fn with_payload(action_type: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self::builder(action_type).payload(payload).build()
    }

    pub fn builder(action_type: impl Into<String>) -> ActionBuilder {
        ActionBuilder {
            action_type: action_type.into(),
            payload: None,
            meta: None,
            error: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn action_type(&self) -> &str {
        &self.0.action_type
    }

    pub fn payload(&self) -> Option<&Value> {
        self.0.payload.as_ref()
    }

    pub fn meta(&self) -> Option<&Value> {
        self.0.meta.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.0.error
    }

    /// True if `self` and `other` are the same action instance.
    pub fn ptr_eq(&self, other: &Action) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Whether this instance has entered the pipeline before.
    pub fn was_dispatched(&self) -> bool {
        self.0.dispatched.load(Ordering::Acquire)
    }

    /// Mark as dispatched. Returns the previous flag.
    pub(crate) fn mark_dispatched(&self) -> bool {
        self.0.dispatched.swap(true, Ordering::AcqRel)
    }

    /// Reject actions without a usable type.
    pub fn validate(&self) -> Result<()> {
        if self.0.action_type.trim().is_empty() {
            return Err(StoreError::validation("action type must be a non-empty string"));
        }
        Ok(())
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Action");
        s.field("type", &self.0.action_type);
        if let Some(payload) = &self.0.payload {
            s.field("payload", payload);
        }
        if self.0.error {
            s.field("error", &true);
        }
        s.finish_non_exhaustive()
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &self.0.action_type)?;
        if let Some(payload) = &self.0.payload {
            map.serialize_entry("payload", payload)?;
        }
        if let Some(meta) = &self.0.meta {
            map.serialize_entry("meta", meta)?;
        }
        if self.0.error {
            map.serialize_entry("error", &true)?;
        }
        map.end()
    }
}

impl TryFrom<serde_json::Value> for Action {
    type Error = StoreError;

    /// Parse `{type, payload?, meta?, error?}`.
    fn try_from(value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(mut map) = value else {
            return Err(StoreError::validation("action must be a plain object"));
        };
        let action_type = match map.remove("type") {
            Some(serde_json::Value::String(t)) => t,
            Some(_) => return Err(StoreError::validation("action type must be a string")),
            None => return Err(StoreError::validation("action is missing a type")),
        };
        let error = match map.remove("error") {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Bool(b)) => b,
            Some(_) => return Err(StoreError::validation("action error flag must be a boolean")),
        };

        let mut builder = Action::builder(action_type).error(error);
        if let Some(payload) = map.remove("payload") {
            builder = builder.payload(payload);
        }
        if let Some(meta) = map.remove("meta") {
            builder = builder.meta(meta);
        }
        let action = builder.build();
        action.validate()?;
        Ok(action)
    }
}

/// Builder for actions with metadata or an error flag.
#[derive(Debug)]
pub struct ActionBuilder {
    action_type: String,
    payload: Option<Value>,
    meta: Option<Value>,
    error: bool,
}

impl ActionBuilder {
    pub fn payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn meta(mut self, meta: impl Into<Value>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    pub fn error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }

    pub fn build(self) -> Action {
        Action(Arc::new(ActionData {
            id: Uuid::new_v4(),
            action_type: self.action_type,
            payload: self.payload,
            meta: self.meta,
            error: self.error,
            dispatched: AtomicBool::new(false),
        }))
    }
}

// =============================================================================
// AsyncAction
// =============================================================================

type ThunkFn = dyn Fn(ThunkContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A named deferred computation that dispatches plain actions.
#[derive(Clone)]
pub struct AsyncAction {
    name: Arc<str>,
    run: Arc<ThunkFn>,
}

impl AsyncAction {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ThunkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            run: Arc::new(move |ctx| f(ctx).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, ctx: ThunkContext) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.run)(ctx)
    }
}

impl fmt::Debug for AsyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncAction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// What an async action body can reach.
#[derive(Clone)]
pub struct ThunkContext {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) state: BehaviorSubject<Value>,
    pub(crate) dependencies: Arc<Dependencies>,
}

impl ThunkContext {
    /// Dispatch within this async action's branch. Under the exclusive
    /// strategy, actions dispatched here are serialized with each other.
    pub async fn dispatch(&self, action: impl Into<Dispatchable>) -> Result<()> {
        self.dispatcher.dispatch(action).await
    }

    /// The last committed state.
    pub fn get_state(&self) -> Value {
        self.state.value()
    }

    /// The value at `path` in the last committed state.
    pub fn get_state_at(&self, path: impl Into<Path>) -> Option<Value> {
        self.state.value().get_in(&path.into()).cloned()
    }

    /// Dependencies resolved when the async action started.
    pub fn dependencies(&self) -> &Dependencies {
        &self.dependencies
    }
}

impl fmt::Debug for ThunkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThunkContext").finish_non_exhaustive()
    }
}

// =============================================================================
// Dispatchable
// =============================================================================

/// Anything the store can dispatch.
#[derive(Clone, Debug)]
pub enum Dispatchable {
    Action(Action),
    Async(AsyncAction),
}

impl Dispatchable {
    /// Action type or async action name.
    pub fn name(&self) -> &str {
        match self {
            Dispatchable::Action(a) => a.action_type(),
            Dispatchable::Async(a) => a.name(),
        }
    }
}

impl From<Action> for Dispatchable {
    fn from(action: Action) -> Self {
        Dispatchable::Action(action)
    }
}

impl From<AsyncAction> for Dispatchable {
    fn from(action: AsyncAction) -> Self {
        Dispatchable::Async(action)
    }
}

// =============================================================================
// System actions
// =============================================================================

/// Actions the store dispatches about itself.
pub mod system {
    use super::Action;
    use crate::value::Value;

    /// Tags the initial hydration of the state tree.
    pub const INITIALIZE_STATE: &str = "@@actionstack/INITIALIZE_STATE";
    /// Tags hydration or cleanup after a module change.
    pub const UPDATE_STATE: &str = "@@actionstack/UPDATE_STATE";
    pub const STORE_INITIALIZED: &str = "@@actionstack/STORE_INITIALIZED";
    pub const MODULE_LOADED: &str = "@@actionstack/MODULE_LOADED";
    pub const MODULE_UNLOADED: &str = "@@actionstack/MODULE_UNLOADED";

    /// True for any action type the store reserves for itself.
    pub fn is_system(action_type: &str) -> bool {
        action_type.starts_with("@@actionstack/")
    }

    pub fn initialize_state() -> Action {
        Action::new(INITIALIZE_STATE)
    }

    pub fn update_state() -> Action {
        Action::new(UPDATE_STATE)
    }

    pub fn store_initialized() -> Action {
        Action::new(STORE_INITIALIZED)
    }

    pub fn module_loaded(slice: &str) -> Action {
        Action::with_payload(MODULE_LOADED, Value::object().with("slice", slice))
    }

    pub fn module_unloaded(slice: &str) -> Action {
        Action::with_payload(MODULE_UNLOADED, Value::object().with("slice", slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clones_share_identity() {
        let a = Action::new("INC");
        let b = a.clone();
        let c = Action::new("INC");
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_dispatched_flag_is_shared_by_clones() {
        let a = Action::new("PING");
        let echo = a.clone();
        assert!(!echo.was_dispatched());
        assert!(!a.mark_dispatched());
        assert!(echo.was_dispatched());
        assert!(a.mark_dispatched());
    }

    #[test]
    fn test_validate_rejects_blank_type() {
        assert!(Action::new("OK").validate().is_ok());
        assert!(matches!(
            Action::new("").validate(),
            Err(StoreError::Validation { .. })
        ));
        assert!(matches!(
            Action::new("   ").validate(),
            Err(StoreError::Validation { .. })
        ));
    }

    #[test]
    fn test_parse_from_json() {
        let action =
            Action::try_from(json!({"type": "ADD", "payload": {"id": 1}, "meta": "m"})).unwrap();
        assert_eq!(action.action_type(), "ADD");
        assert_eq!(
            action.payload().and_then(|p| p.get("id")).and_then(Value::as_i64),
            Some(1)
        );
        assert_eq!(action.meta().and_then(Value::as_str), Some("m"));
        assert!(!action.is_error());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            json!("ADD"),
            json!([{"type": "ADD"}]),
            json!({"payload": 1}),
            json!({"type": 5}),
            json!({"type": ""}),
            json!({"type": "ADD", "error": "yes"}),
        ] {
            let err = Action::try_from(bad.clone()).unwrap_err();
            assert!(matches!(err, StoreError::Validation { .. }), "{bad} accepted");
        }
    }

    #[test]
    fn test_serializes_optional_fields_only_when_present() {
        let plain = serde_json::to_value(Action::new("A")).unwrap();
        assert_eq!(plain, json!({"type": "A"}));

        let full = Action::builder("B")
            .payload(json!([1, 2]))
            .meta("m")
            .error(true)
            .build();
        assert_eq!(
            serde_json::to_value(full).unwrap(),
            json!({"type": "B", "payload": [1, 2], "meta": "m", "error": true})
        );
    }

    #[test]
    fn test_system_actions() {
        let loaded = system::module_loaded("cart");
        assert_eq!(loaded.action_type(), system::MODULE_LOADED);
        assert_eq!(
            loaded.payload().and_then(|p| p.get("slice")).and_then(Value::as_str),
            Some("cart")
        );
        assert!(system::is_system(loaded.action_type()));
        assert!(!system::is_system("INC"));
    }

    #[test]
    fn test_dispatchable_name() {
        let d: Dispatchable = Action::new("INC").into();
        assert_eq!(d.name(), "INC");
        let d: Dispatchable = AsyncAction::new("load", |_ctx| async { Ok(()) }).into();
        assert_eq!(d.name(), "load");
    }
}
