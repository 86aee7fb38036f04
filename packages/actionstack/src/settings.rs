//! Store configuration.
//!
//! [`StoreSettings`] is plain data: serde-friendly with defaults for every
//! field, so it can be embedded in an application's own config file. For
//! twelve-factor setups, [`StoreSettings::from_env`] reads `ACTIONSTACK_*`
//! variables.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::strategy::Strategy;

/// Default bound on side-effect completion waits.
pub const DEFAULT_EFFECT_TIMEOUT_MS: u64 = 30_000;

/// Tunables for a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Dispatch `STORE_INITIALIZED`, `MODULE_LOADED` and `MODULE_UNLOADED`
    /// through the pipeline.
    pub dispatch_system_actions: bool,
    /// Make `dispatch` resolve only after state observers ran and side
    /// effects caught up with the committed actions.
    pub await_state_propagation: bool,
    /// Wrap the combined reducer with the configured meta-reducers.
    pub enable_meta_reducers: bool,
    /// Start with the exclusive strategy instead of concurrent.
    pub exclusive_action_processing: bool,
    /// Upper bound for side-effect completion waits, in milliseconds.
    pub effect_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            dispatch_system_actions: true,
            await_state_propagation: true,
            enable_meta_reducers: true,
            exclusive_action_processing: false,
            effect_timeout_ms: DEFAULT_EFFECT_TIMEOUT_MS,
        }
    }
}

impl StoreSettings {
    /// Load settings from `ACTIONSTACK_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable values fail.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(v) = lookup("ACTIONSTACK_DISPATCH_SYSTEM_ACTIONS") {
            settings.dispatch_system_actions =
                parse_bool("ACTIONSTACK_DISPATCH_SYSTEM_ACTIONS", &v)?;
        }
        if let Some(v) = lookup("ACTIONSTACK_AWAIT_STATE_PROPAGATION") {
            settings.await_state_propagation =
                parse_bool("ACTIONSTACK_AWAIT_STATE_PROPAGATION", &v)?;
        }
        if let Some(v) = lookup("ACTIONSTACK_ENABLE_META_REDUCERS") {
            settings.enable_meta_reducers = parse_bool("ACTIONSTACK_ENABLE_META_REDUCERS", &v)?;
        }
        if let Some(v) = lookup("ACTIONSTACK_STRATEGY") {
            let strategy: Strategy = v.parse()?;
            settings.exclusive_action_processing = strategy == Strategy::Exclusive;
        }
        if let Some(v) = lookup("ACTIONSTACK_EFFECT_TIMEOUT_MS") {
            settings.effect_timeout_ms = v.trim().parse().map_err(|_| {
                StoreError::configuration(format!(
                    "ACTIONSTACK_EFFECT_TIMEOUT_MS must be a number of milliseconds, got '{v}'"
                ))
            })?;
        }

        Ok(settings)
    }

    /// Strategy selected by `exclusive_action_processing`.
    pub fn strategy(&self) -> Strategy {
        if self.exclusive_action_processing {
            Strategy::Exclusive
        } else {
            Strategy::Concurrent
        }
    }

    pub fn effect_timeout(&self) -> Duration {
        Duration::from_millis(self.effect_timeout_ms)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StoreError::configuration(format!(
            "{key} must be a boolean, got '{value}'"
        ))),
    }
}
