//! Reducers, reducer trees and the combined reducer.
//!
//! A [`Reducer`] owns one path in the state tree. Modules describe their
//! reducers as a [`ReducerTree`] mounted under the module's slice; the store
//! flattens every loaded module into a [`ReducerMap`] and wraps it in a
//! [`CombinedReducer`].
//!
//! # Reduction pass
//!
//! For each action the combined reducer runs every leaf against its own
//! subtree of the *pre-action* root. Only leaves whose result is not the same
//! node as their input are written back, all through one [`TreeWriter`], so
//! the new root shares every untouched subtree with the old one.
//!
//! A leaf that errors or panics is logged and treated as "no change" for its
//! subtree. The other leaves still run.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::{error, warn};

use crate::action::Action;
use crate::error::{panic_message, Result, StoreError};
use crate::tree::TreeWriter;
use crate::value::{Path, Value};

/// A state transition function owning one path.
///
/// `state` is `None` when nothing exists at the path yet; the reducer should
/// return its initial value. Returning the input value unchanged signals
/// "no change".
pub trait Reducer: Send + Sync + 'static {
    fn reduce(&self, state: Option<Value>, action: &Action) -> anyhow::Result<Value>;
}

/// Reducers are shared by reference; identity matters for duplicate checks.
pub type SharedReducer = Arc<dyn Reducer>;

/// Wraps a reducer in another reducer.
pub type MetaReducer = Arc<dyn Fn(SharedReducer) -> SharedReducer + Send + Sync>;

struct FnReducer<F>(F);

impl<F> Reducer for FnReducer<F>
where
    F: Fn(Option<Value>, &Action) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn reduce(&self, state: Option<Value>, action: &Action) -> anyhow::Result<Value> {
        (self.0)(state, action)
    }
}

/// Build a reducer from a closure.
///
/// ```ignore
/// let counter = reducer_fn(|state, action| {
///     let state = state.unwrap_or_else(|| json!({"count": 0}).into());
///     Ok(match action.action_type() {
///         "INC" => {
///             let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
///             state.with("count", count + 1)
///         }
///         _ => state,
///     })
/// });
/// ```
pub fn reducer_fn<F>(f: F) -> SharedReducer
where
    F: Fn(Option<Value>, &Action) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnReducer(f))
}

/// Build a meta-reducer from a closure.
pub fn meta_reducer<F>(f: F) -> MetaReducer
where
    F: Fn(SharedReducer) -> SharedReducer + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Apply meta-reducers right to left: the first one listed is outermost.
pub fn compose_meta_reducers(meta: &[MetaReducer], reducer: SharedReducer) -> SharedReducer {
    meta.iter().rev().fold(reducer, |inner, wrap| wrap(inner))
}

// =============================================================================
// Reducer trees
// =============================================================================

/// A single reducer or a nested map of reducers.
#[derive(Clone)]
pub enum ReducerTree {
    Leaf(SharedReducer),
    Branch(BTreeMap<String, ReducerTree>),
}

impl ReducerTree {
    pub fn leaf(reducer: SharedReducer) -> Self {
        ReducerTree::Leaf(reducer)
    }

    /// An empty branch; add children with [`ReducerTree::with`].
    pub fn branch() -> Self {
        ReducerTree::Branch(BTreeMap::new())
    }

    /// Add a child. Turns a leaf into a branch.
    pub fn with(self, key: impl Into<String>, child: impl Into<ReducerTree>) -> Self {
        let mut children = match self {
            ReducerTree::Branch(children) => children,
            ReducerTree::Leaf(_) => BTreeMap::new(),
        };
        children.insert(key.into(), child.into());
        ReducerTree::Branch(children)
    }

    /// Number of leaf reducers.
    pub fn leaf_count(&self) -> usize {
        let mut count = 0;
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            match node {
                ReducerTree::Leaf(_) => count += 1,
                ReducerTree::Branch(children) => pending.extend(children.values()),
            }
        }
        count
    }
}

impl From<SharedReducer> for ReducerTree {
    fn from(reducer: SharedReducer) -> Self {
        ReducerTree::Leaf(reducer)
    }
}

impl fmt::Debug for ReducerTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReducerTree::Leaf(_) => f.write_str("Leaf"),
            ReducerTree::Branch(children) => f.debug_map().entries(children.iter()).finish(),
        }
    }
}

/// Every leaf reducer and the path it owns.
#[derive(Clone, Default)]
pub struct ReducerMap {
    entries: Vec<(Path, SharedReducer)>,
}

impl ReducerMap {
    /// Flatten `(slice, tree)` pairs. Each reducer instance may be mounted at
    /// exactly one path.
    pub fn build<'a, I>(mounts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a ReducerTree)>,
    {
        let mut entries = Vec::new();
        let mut seen: HashSet<*const ()> = HashSet::new();
        let mut pending: Vec<(Path, &ReducerTree)> = mounts
            .into_iter()
            .map(|(slice, tree)| (Path::from(vec![slice.to_string()]), tree))
            .collect();
        // Keep declaration order for deterministic passes.
        pending.reverse();

        while let Some((path, node)) = pending.pop() {
            match node {
                ReducerTree::Leaf(reducer) => {
                    let ptr = Arc::as_ptr(reducer) as *const ();
                    if !seen.insert(ptr) {
                        return Err(StoreError::configuration(format!(
                            "reducer at '{path}' is already mounted at another path"
                        )));
                    }
                    entries.push((path, reducer.clone()));
                }
                ReducerTree::Branch(children) => {
                    for (key, child) in children.iter().rev() {
                        pending.push((path.join(key.clone()), child));
                    }
                }
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|(path, _)| path)
    }
}

impl fmt::Debug for ReducerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.paths().map(|p| p.to_string())).finish()
    }
}

// =============================================================================
// Combined reducer
// =============================================================================

/// Runs every leaf of a [`ReducerMap`] and writes only the changed subtrees.
pub struct CombinedReducer {
    map: ReducerMap,
}

impl CombinedReducer {
    pub fn new(map: ReducerMap) -> Self {
        Self { map }
    }
}

impl Reducer for CombinedReducer {
    fn reduce(&self, state: Option<Value>, action: &Action) -> anyhow::Result<Value> {
        let root = state.unwrap_or_else(Value::object);
        let mut writer = TreeWriter::new(root.clone());

        for (path, reducer) in &self.map.entries {
            let current = root.get_in(path).cloned();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                reducer.reduce(current.clone(), action)
            }));

            match outcome {
                Ok(Ok(next)) => {
                    let changed = current.as_ref().map_or(true, |cur| !cur.same(&next));
                    if changed {
                        writer.set(path, next);
                    }
                }
                Ok(Err(err)) => {
                    let err = StoreError::Reducer {
                        path: path.to_string(),
                        action_type: action.action_type().to_string(),
                        message: format!("{err:#}"),
                    };
                    warn!(path = %path, error = %err, "reducer failed; subtree left unchanged");
                }
                Err(panic) => {
                    let err = StoreError::Reducer {
                        path: path.to_string(),
                        action_type: action.action_type().to_string(),
                        message: panic_message(panic.as_ref()),
                    };
                    error!(path = %path, error = %err, "reducer panicked; subtree left unchanged");
                }
            }
        }

        if writer.writes() == 0 {
            return Ok(root);
        }
        Ok(writer.finish())
    }
}

impl fmt::Debug for CombinedReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedReducer")
            .field("paths", &self.map)
            .finish()
    }
}
