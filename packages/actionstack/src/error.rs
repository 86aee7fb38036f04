//! Structured error types for the store.
//!
//! `StoreError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! > **Setup-time errors are fatal, steady-state errors are isolated.**
//!
//! - `Configuration` is returned while building the store or loading a module,
//!   before anything observes the new configuration.
//! - `Validation` is returned synchronously to the caller of `dispatch`.
//! - `Reducer` and `Effect` describe failures that were caught, logged and
//!   contained to one subtree or one side effect. They are constructed for
//!   logging and never cross the `dispatch` boundary.
//! - `Timeout` is returned by propagation waits; the store itself only logs it.
//!
//! `anyhow` is the transport for user code (reducers, async actions, side
//! effects, middleware). It is wrapped at the boundary so callers can still
//! match on the kind of failure.
//!
//! # Example
//!
//! ```ignore
//! use actionstack::{Action, StoreError};
//!
//! match store.dispatch(Action::new("")).await {
//!     Ok(()) => {}
//!     Err(StoreError::Validation { reason }) => eprintln!("bad action: {reason}"),
//!     Err(other) => return Err(other.into()),
//! }
//! ```

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors produced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The dispatched action is malformed.
    #[error("invalid action: {reason}")]
    Validation {
        /// Why the action was rejected.
        reason: String,
    },

    /// A leaf reducer failed. Logged, never propagated.
    #[error("reducer at '{path}' failed while handling {action_type}: {message}")]
    Reducer {
        /// Path owned by the failing reducer.
        path: String,
        /// Type of the action being reduced.
        action_type: String,
        /// Error or panic message.
        message: String,
    },

    /// A side effect failed. Logged, never propagated.
    #[error("side effect '{name}' failed: {message}")]
    Effect {
        /// Name of the side effect.
        name: String,
        /// Error or panic message.
        message: String,
    },

    /// Side effects did not catch up within the configured bound.
    #[error("side effects did not complete within {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },

    /// The store or a module was configured incorrectly.
    #[error("invalid store configuration: {message}")]
    Configuration {
        /// What is wrong.
        message: String,
    },

    /// An async action returned an error.
    #[error("async action '{name}' failed: {source}")]
    AsyncAction {
        /// Name of the async action.
        name: String,
        /// The error it returned.
        #[source]
        source: anyhow::Error,
    },

    /// A middleware returned an error.
    #[error("middleware '{name}' failed: {source}")]
    Middleware {
        /// Name of the middleware.
        name: String,
        /// The error it returned.
        #[source]
        source: anyhow::Error,
    },

    /// An operation that waits for the store to go idle was started from
    /// inside a plain action, where it could never observe idleness.
    #[error("{operation} cannot run while action '{action_type}' is being processed")]
    Reentrancy {
        /// The operation that was refused.
        operation: &'static str,
        /// The action currently being processed.
        action_type: String,
    },

    /// A handle outlived the store it belongs to.
    #[error("store has been dropped")]
    StoreDropped,
}

impl StoreError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        StoreError::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        StoreError::Configuration {
            message: message.into(),
        }
    }

    /// Returns true for errors that are reported by the store but never
    /// returned from `dispatch`.
    pub fn is_isolated(&self) -> bool {
        matches!(self, StoreError::Reducer { .. } | StoreError::Effect { .. })
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
