//! Copy-on-write path writes with change tracking.
//!
//! A [`TreeWriter`] applies any number of path writes to a state root during
//! one update pass. Every container on a written path is shallow-copied at
//! most once per pass: the [`ChangeEdges`] tree records which nodes already
//! belong to the pass, so a second write under the same parent mutates the
//! copy instead of copying again.
//!
//! Nodes that were not on any written path keep their identity, which is what
//! lets readers of the previous root keep a consistent snapshot and lets
//! observers compare subtrees by pointer.
//!
//! ```text
//! before:  root ─┬─ a ── x        write a.x:  root' ─┬─ a' ── x'
//!                └─ b ── y                           └─ b ── y   (shared)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::value::{Path, Value};

/// Marks which containers were copied during the current pass.
#[derive(Debug, Default)]
pub(crate) struct ChangeEdges {
    copied: bool,
    children: HashMap<String, ChangeEdges>,
}

impl ChangeEdges {
    #[cfg(test)]
    fn is_copied(&self, path: &Path) -> bool {
        let mut edge = self;
        for key in path.keys() {
            match edge.children.get(key) {
                Some(child) => edge = child,
                None => return false,
            }
        }
        edge.copied
    }
}

/// Applies path writes to a root with one shallow copy per touched container.
pub(crate) struct TreeWriter {
    root: Value,
    edges: ChangeEdges,
    writes: usize,
}

impl TreeWriter {
    pub fn new(root: Value) -> Self {
        Self {
            root,
            edges: ChangeEdges::default(),
            writes: 0,
        }
    }

    /// Set the node at `path` to `value`, creating intermediate objects.
    ///
    /// Returns false if the path runs through an array with a non-numeric key.
    pub fn set(&mut self, path: &Path, value: Value) -> bool {
        let Some((last, parents)) = path.keys().split_last() else {
            self.root = value;
            self.edges = ChangeEdges::default();
            self.writes += 1;
            return true;
        };

        let mut node = &mut self.root;
        let mut edge = &mut self.edges;
        for key in parents {
            own_container(node, edge);
            node = match child_slot(node, key) {
                Some(child) => child,
                None => {
                    warn!(path = %path, key = %key, "cannot write through non-numeric array key");
                    return false;
                }
            };
            edge = edge.children.entry(key.clone()).or_default();
        }

        own_container(node, edge);
        match child_slot(node, last) {
            Some(slot) => *slot = value,
            None => {
                warn!(path = %path, key = %last, "cannot write through non-numeric array key");
                return false;
            }
        }
        // The new subtree is foreign to this pass.
        edge.children.remove(last);
        self.writes += 1;
        true
    }

    /// Remove the node at `path`. Missing paths are a no-op.
    pub fn remove(&mut self, path: &Path) -> bool {
        let Some((last, parents)) = path.keys().split_last() else {
            self.root = Value::object();
            self.edges = ChangeEdges::default();
            self.writes += 1;
            return true;
        };
        if self.root.get_in(path).is_none() {
            return false;
        }

        let mut node = &mut self.root;
        let mut edge = &mut self.edges;
        for key in parents {
            own_container(node, edge);
            node = match child_slot(node, key) {
                Some(child) => child,
                None => return false,
            };
            edge = edge.children.entry(key.clone()).or_default();
        }

        own_container(node, edge);
        let removed = match node {
            Value::Object(map) => Arc::make_mut(map).remove(last).is_some(),
            Value::Array(items) => match last.parse::<usize>() {
                Ok(index) if index < items.len() => {
                    Arc::make_mut(items).remove(index);
                    true
                }
                _ => false,
            },
            _ => false,
        };
        edge.children.remove(last);
        if removed {
            self.writes += 1;
        }
        removed
    }

    /// Number of successful writes in this pass.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn finish(self) -> Value {
        self.root
    }

    #[cfg(test)]
    fn edges(&self) -> &ChangeEdges {
        &self.edges
    }
}

/// Make `node` a container owned by this pass.
fn own_container(node: &mut Value, edge: &mut ChangeEdges) {
    match node {
        Value::Object(map) if !edge.copied => {
            *map = Arc::new((**map).clone());
        }
        Value::Array(items) if !edge.copied => {
            *items = Arc::new((**items).clone());
        }
        Value::Object(_) | Value::Array(_) => {}
        _ => {
            *node = Value::object();
            edge.children.clear();
        }
    }
    edge.copied = true;
}

/// Mutable slot for `key` inside an owned container, created if missing.
fn child_slot<'a>(node: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => Some(Arc::make_mut(map).entry(key.to_string()).or_default()),
        Value::Array(items) => {
            let index = key.parse::<usize>().ok()?;
            let items = Arc::make_mut(items);
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            items.get_mut(index)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ptr(v: &Value) -> *const () {
        match v {
            Value::Object(m) => Arc::as_ptr(m) as *const (),
            Value::Array(a) => Arc::as_ptr(a) as *const (),
            _ => std::ptr::null(),
        }
    }

    #[test]
    fn test_set_preserves_untouched_subtrees() {
        let root = Value::from(json!({"a": {"x": 1}, "b": {"y": 2}}));
        let mut writer = TreeWriter::new(root.clone());
        assert!(writer.set(&Path::from(["a", "x"]), Value::from(10)));
        let next = writer.finish();

        assert!(next.get("b").unwrap().same(root.get("b").unwrap()));
        assert!(!next.get("a").unwrap().same(root.get("a").unwrap()));
        assert_eq!(next.get_in(&Path::from(["a", "x"])).and_then(Value::as_i64), Some(10));
        assert_eq!(root.get_in(&Path::from(["a", "x"])).and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn test_two_writes_share_one_copy() {
        let root = Value::from(json!({"a": {"x": 1, "y": 1}}));
        let mut writer = TreeWriter::new(root.clone());

        writer.set(&Path::from(["a", "x"]), Value::from(2));
        let after_first = ptr(writer.root.get("a").unwrap());
        assert!(writer.edges().is_copied(&Path::from("a")));

        writer.set(&Path::from(["a", "y"]), Value::from(3));
        let after_second = ptr(writer.root.get("a").unwrap());

        assert_eq!(after_first, after_second, "second write must reuse the copy");
        assert_eq!(writer.writes(), 2);
        let next = writer.finish();
        assert_eq!(next.to_json(), json!({"a": {"x": 2, "y": 3}}));
    }

    #[test]
    fn test_set_creates_missing_parents() {
        let mut writer = TreeWriter::new(Value::object());
        writer.set(&Path::from(["cart", "items"]), Value::array());
        assert_eq!(writer.finish().to_json(), json!({"cart": {"items": []}}));
    }

    #[test]
    fn test_set_through_array_index() {
        let root = Value::from(json!({"list": [{"n": 1}, {"n": 2}]}));
        let mut writer = TreeWriter::new(root);
        assert!(writer.set(&Path::from(["list", "1", "n"]), Value::from(9)));
        assert!(!writer.set(&Path::from(["list", "nope", "n"]), Value::from(9)));
        assert_eq!(
            writer.finish().to_json(),
            json!({"list": [{"n": 1}, {"n": 9}]})
        );
    }

    #[test]
    fn test_replacing_subtree_resets_edges() {
        let root = Value::from(json!({"a": {"x": 1}}));
        let replacement = Value::from(json!({"x": 5}));
        let mut writer = TreeWriter::new(root);

        writer.set(&Path::from(["a", "x"]), Value::from(2));
        writer.set(&Path::from("a"), replacement.clone());
        // A later write under the replaced node must copy it, not mutate it.
        writer.set(&Path::from(["a", "x"]), Value::from(7));

        assert_eq!(replacement.get("x").and_then(Value::as_i64), Some(5));
        assert_eq!(writer.finish().to_json(), json!({"a": {"x": 7}}));
    }

    #[test]
    fn test_remove_slice() {
        let root = Value::from(json!({"main": {}, "cart": {"items": []}}));
        let mut writer = TreeWriter::new(root.clone());
        assert!(writer.remove(&Path::from("cart")));
        assert!(!writer.remove(&Path::from("missing")));
        let next = writer.finish();
        assert_eq!(next.to_json(), json!({"main": {}}));
        assert!(root.get("cart").is_some());
    }

    #[test]
    fn test_root_write() {
        let mut writer = TreeWriter::new(Value::object());
        writer.set(&Path::root(), Value::from(json!({"k": 1})));
        assert_eq!(writer.finish().to_json(), json!({"k": 1}));
    }
}
