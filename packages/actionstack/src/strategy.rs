//! Execution strategies for the dispatch pipeline.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

/// How the pipeline schedules dispatched work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Plain actions take a store-wide lock. Each async action gets its own
    /// branch lock, serializing its children but not blocking other actions.
    Exclusive,
    /// Nothing is serialized; async actions run side by side.
    #[default]
    Concurrent,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Exclusive => "exclusive",
            Strategy::Concurrent => "concurrent",
        }
    }

    /// Parse a strategy name, falling back to concurrent with a warning.
    ///
    /// Used where a bad name must not stop a running store. Setup paths use
    /// [`FromStr`], which fails instead.
    pub fn parse_or_concurrent(name: &str) -> Strategy {
        name.parse().unwrap_or_else(|_| {
            warn!(strategy = %name, "unknown strategy; falling back to concurrent");
            Strategy::Concurrent
        })
    }
}

impl FromStr for Strategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclusive" => Ok(Strategy::Exclusive),
            "concurrent" => Ok(Strategy::Concurrent),
            other => Err(StoreError::configuration(format!(
                "unknown strategy '{other}', expected 'exclusive' or 'concurrent'"
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The runtime-switchable strategy flag shared by the pipeline and the
/// privileged middleware API.
#[derive(Debug)]
pub(crate) struct StrategyCell(AtomicBool);

impl StrategyCell {
    pub fn new(strategy: Strategy) -> Self {
        Self(AtomicBool::new(strategy == Strategy::Exclusive))
    }

    pub fn get(&self) -> Strategy {
        if self.0.load(Ordering::Acquire) {
            Strategy::Exclusive
        } else {
            Strategy::Concurrent
        }
    }

    pub fn set(&self, strategy: Strategy) -> Strategy {
        let was = self
            .0
            .swap(strategy == Strategy::Exclusive, Ordering::AcqRel);
        if was {
            Strategy::Exclusive
        } else {
            Strategy::Concurrent
        }
    }
}
