//! Testing utilities for stores, middleware and side effects.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! actionstack = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Recording what reached the reducers
//!
//! ```ignore
//! use actionstack::testing::RecordingMiddleware;
//!
//! let spy = RecordingMiddleware::new();
//! let store = Store::builder()
//!     .with_middleware(spy.shared())
//!     .build()
//!     .await?;
//!
//! store.dispatch(Action::new("PING")).await?;
//! assert_actions!(spy, ["@@actionstack/STORE_INITIALIZED", "PING", "PONG"]);
//! ```
//!
//! ## Using `ActionLatch` for fan-out tests
//!
//! ```ignore
//! use actionstack::testing::shared_latch;
//!
//! let latch = shared_latch(3);
//! let _sub = store.subscribe_state({
//!     let latch = latch.clone();
//!     move |_| {
//!         latch.dec();
//!         async {}
//!     }
//! });
//!
//! store.dispatch(trigger).await?;
//! latch.await_zero().await;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::action::{system, Action};
use crate::middleware::{Middleware, MiddlewareApi, Next, SharedMiddleware};

/// Asserts the action types a [`RecordingMiddleware`] saw, in order.
///
/// ```ignore
/// assert_actions!(spy, ["INC", "INC"]);
/// ```
#[macro_export]
macro_rules! assert_actions {
    ($spy:expr, [$($expected:expr),* $(,)?]) => {{
        let actual = $spy.action_types();
        let expected: ::std::vec::Vec<&str> = ::std::vec![$($expected),*];
        assert_eq!(
            actual, expected,
            "Unexpected action sequence\n  expected: {:?}\n  actual: {:?}",
            expected, actual
        );
    }};
}

pub use assert_actions;

// =============================================================================
// RecordingMiddleware
// =============================================================================

/// An action seen by [`RecordingMiddleware`].
#[derive(Debug, Clone)]
pub struct RecordedAction {
    pub action: Action,
    pub seen_at: DateTime<Utc>,
}

/// A spy middleware that records every action passing through and forwards
/// it unchanged.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingMiddleware {
    recorded: Arc<Mutex<Vec<RecordedAction>>>,
    skip_system: bool,
}

impl RecordingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Do not record the store's own `@@actionstack/...` actions.
    pub fn without_system_actions(mut self) -> Self {
        self.skip_system = true;
        self
    }

    /// This spy as a middleware to hand to the store builder.
    pub fn shared(&self) -> SharedMiddleware {
        Arc::new(self.clone())
    }

    /// Types of every recorded action, in order.
    pub fn action_types(&self) -> Vec<String> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.action.action_type().to_string())
            .collect()
    }

    pub fn was_dispatched(&self, action_type: &str) -> bool {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.action.action_type() == action_type)
    }

    /// Recorded actions of one type.
    pub fn actions_of_type(&self, action_type: &str) -> Vec<Action> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.action.action_type() == action_type)
            .map(|r| r.action.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<RecordedAction> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.recorded.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.recorded.lock().unwrap().clear();
    }

    /// Assert exactly `times` actions of `action_type` were recorded.
    ///
    /// # Panics
    ///
    /// Panics with the full recorded sequence when the count differs.
    pub fn assert_count(&self, action_type: &str, times: usize) {
        let actual = self.actions_of_type(action_type).len();
        assert_eq!(
            actual,
            times,
            "Expected {times} '{action_type}' action(s), recorded {actual}: {:?}",
            self.action_types()
        );
    }
}

#[async_trait]
impl Middleware for RecordingMiddleware {
    fn name(&self) -> &str {
        "recording"
    }

    async fn handle(&self, _api: &MiddlewareApi, action: Action, next: Next) -> anyhow::Result<()> {
        if !(self.skip_system && system::is_system(action.action_type())) {
            self.recorded.lock().unwrap().push(RecordedAction {
                action: action.clone(),
                seen_at: Utc::now(),
            });
        }
        next.run(action).await?;
        Ok(())
    }
}

// =============================================================================
// ActionLatch
// =============================================================================

/// A countdown latch for waiting on an exact number of occurrences.
///
/// Tests should wait for meaning, not time.
///
/// # Timeout Safety
///
/// ```ignore
/// timeout(Duration::from_secs(5), latch.await_zero())
///     .await
///     .expect("latch timed out");
/// ```
#[derive(Debug)]
pub struct ActionLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl ActionLatch {
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            notify: Notify::new(),
        }
    }

    /// Record one occurrence.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("ActionLatch decremented below zero - more occurrences than expected");
        }
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the count to reach zero. Returns immediately if it already has.
    pub async fn await_zero(&self) {
        loop {
            // Register for notification BEFORE checking count
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

/// Arc-wrapped latch for sharing across closures.
pub type SharedActionLatch = Arc<ActionLatch>;

pub fn shared_latch(expected: usize) -> SharedActionLatch {
    Arc::new(ActionLatch::new(expected))
}
