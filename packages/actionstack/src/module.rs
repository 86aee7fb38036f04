//! Module descriptors and the dependency tree.
//!
//! A [`Module`] is a named slice of the state tree: a reducer tree mounted at
//! the slice key plus the dependencies its async actions and side effects
//! need. Dependencies are given either as ready instances or as tokens that
//! the store's [`Resolver`] turns into instances when modules change.
//!
//! The merged [`Dependencies`] tree is rebuilt wholesale on every load and
//! unload. The main module's dependencies sit at the root; each feature
//! module's dependencies sit under its slice key.
//!
//! ```ignore
//! let cart = Module::new("cart", ReducerTree::branch().with("items", items_reducer))
//!     .with_dependency("api", Dependency::token("CartApi"))
//!     .with_dependency("clock", Dependency::instance(SystemClock));
//!
//! store.load_module(cart).await?;
//! let api = store.dependencies().get::<CartApi>(["cart", "api"]);
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, StoreError};
use crate::reducer::ReducerTree;
use crate::value::Path;

/// A type-erased dependency instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

// =============================================================================
// Module descriptor
// =============================================================================

/// A state slice with its reducers and dependencies.
#[derive(Clone)]
pub struct Module {
    slice: String,
    reducer: ReducerTree,
    dependencies: BTreeMap<String, Dependency>,
}

impl Module {
    pub fn new(slice: impl Into<String>, reducer: impl Into<ReducerTree>) -> Self {
        Self {
            slice: slice.into(),
            reducer: reducer.into(),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn with_dependency(mut self, name: impl Into<String>, dependency: Dependency) -> Self {
        self.dependencies.insert(name.into(), dependency);
        self
    }

    pub fn slice(&self) -> &str {
        &self.slice
    }

    pub fn reducer(&self) -> &ReducerTree {
        &self.reducer
    }

    pub fn dependencies(&self) -> &BTreeMap<String, Dependency> {
        &self.dependencies
    }

    /// Checks a feature module before it is loaded next to `main_slice`.
    pub(crate) fn validate_feature(&self, main_slice: &str) -> Result<()> {
        if self.slice.trim().is_empty() {
            return Err(StoreError::configuration("module slice must not be empty"));
        }
        if self.slice == main_slice {
            return Err(StoreError::configuration(format!(
                "module slice '{}' collides with the main module",
                self.slice
            )));
        }
        if self.reducer.leaf_count() == 0 {
            return Err(StoreError::configuration(format!(
                "module '{}' has no reducers",
                self.slice
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("slice", &self.slice)
            .field("reducer", &self.reducer)
            .field("dependencies", &self.dependencies.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A declared dependency.
#[derive(Clone)]
pub enum Dependency {
    /// A ready instance.
    Instance(Instance),
    /// A token for the store's resolver.
    Token(String),
    /// A nested group of dependencies.
    Group(BTreeMap<String, Dependency>),
}

impl Dependency {
    pub fn instance<T: Any + Send + Sync>(value: T) -> Self {
        Dependency::Instance(Arc::new(value))
    }

    pub fn token(token: impl Into<String>) -> Self {
        Dependency::Token(token.into())
    }

    pub fn group<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Dependency)>,
        K: Into<String>,
    {
        Dependency::Group(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Instance(_) => f.write_str("Instance"),
            Dependency::Token(t) => f.debug_tuple("Token").field(t).finish(),
            Dependency::Group(g) => f.debug_map().entries(g.iter()).finish(),
        }
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Turns dependency tokens into instances.
///
/// Called only while modules are loaded or unloaded. Returning `None` leaves
/// the token unresolved; it is retried on the next rebuild.
pub trait Resolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<Instance>;
}

/// Resolver backed by a fixed map of tokens.
#[derive(Default, Clone)]
pub struct MapResolver {
    entries: BTreeMap<String, Instance>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, token: impl Into<String>, value: T) -> Self {
        self.entries.insert(token.into(), Arc::new(value));
        self
    }
}

impl Resolver for MapResolver {
    fn resolve(&self, token: &str) -> Option<Instance> {
        self.entries.get(token).cloned()
    }
}

impl fmt::Debug for MapResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

// =============================================================================
// Dependency tree
// =============================================================================

/// A node of the merged dependency tree.
#[derive(Clone)]
pub enum DependencyNode {
    Resolved(Instance),
    /// A token the resolver could not satisfy.
    Unresolved(String),
    Group(BTreeMap<String, DependencyNode>),
}

impl fmt::Debug for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyNode::Resolved(_) => f.write_str("Resolved"),
            DependencyNode::Unresolved(t) => f.debug_tuple("Unresolved").field(t).finish(),
            DependencyNode::Group(g) => f.debug_map().entries(g.iter()).finish(),
        }
    }
}

/// The merged, resolved dependencies of every loaded module.
#[derive(Clone, Debug, Default)]
pub struct Dependencies {
    root: BTreeMap<String, DependencyNode>,
}

impl Dependencies {
    /// Merge and resolve. `main` lands at the root, each feature under its
    /// slice key.
    ///
    /// The walk uses an explicit work stack, so deeply nested groups cannot
    /// overflow the call stack.
    pub(crate) fn build<'a, I>(
        main: &BTreeMap<String, Dependency>,
        features: I,
        resolver: Option<&dyn Resolver>,
    ) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a BTreeMap<String, Dependency>)>,
    {
        let mut deps = Dependencies::default();
        let mut pending: Vec<(Path, &Dependency)> = Vec::new();

        for (name, dep) in main {
            pending.push((Path::from(vec![name.clone()]), dep));
        }
        for (slice, group) in features {
            for (name, dep) in group {
                pending.push((Path::from(vec![slice.to_string(), name.clone()]), dep));
            }
        }

        while let Some((path, dep)) = pending.pop() {
            match dep {
                Dependency::Instance(instance) => {
                    deps.insert_at(&path, DependencyNode::Resolved(instance.clone()));
                }
                Dependency::Token(token) => {
                    let node = match resolver.and_then(|r| r.resolve(token)) {
                        Some(instance) => DependencyNode::Resolved(instance),
                        None => {
                            warn!(path = %path, token = %token, "dependency token unresolved");
                            DependencyNode::Unresolved(token.clone())
                        }
                    };
                    deps.insert_at(&path, node);
                }
                Dependency::Group(children) => {
                    deps.insert_at(&path, DependencyNode::Group(BTreeMap::new()));
                    for (name, child) in children {
                        pending.push((path.join(name.clone()), child));
                    }
                }
            }
        }

        deps
    }

    /// Insert `node` at `path`, creating groups along the way. An existing
    /// group is kept when `node` is an empty group, so a feature slice and a
    /// same-named main dependency merge instead of clobbering each other.
    fn insert_at(&mut self, path: &Path, node: DependencyNode) {
        let Some((last, parents)) = path.keys().split_last() else {
            return;
        };
        let mut map = &mut self.root;
        for key in parents {
            let slot = map
                .entry(key.clone())
                .or_insert_with(|| DependencyNode::Group(BTreeMap::new()));
            if !matches!(slot, DependencyNode::Group(_)) {
                warn!(path = %path, key = %key, "dependency replaced by a group");
                *slot = DependencyNode::Group(BTreeMap::new());
            }
            map = match slot {
                DependencyNode::Group(children) => children,
                _ => return,
            };
        }
        match (map.get(last), &node) {
            (Some(DependencyNode::Group(_)), DependencyNode::Group(new)) if new.is_empty() => {}
            _ => {
                map.insert(last.clone(), node);
            }
        }
    }

    /// Look up a node by path.
    pub fn node(&self, path: impl Into<Path>) -> Option<&DependencyNode> {
        let path = path.into();
        let (first, rest) = path.keys().split_first()?;
        let mut node = self.root.get(first)?;
        for key in rest {
            node = match node {
                DependencyNode::Group(children) => children.get(key)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Typed lookup of a resolved instance.
    pub fn get<T: Any + Send + Sync>(&self, path: impl Into<Path>) -> Option<Arc<T>> {
        match self.node(path)? {
            DependencyNode::Resolved(instance) => instance.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Paths of tokens the resolver could not satisfy.
    pub fn unresolved(&self) -> Vec<Path> {
        let mut out = Vec::new();
        let mut pending: Vec<(Path, &DependencyNode)> = self
            .root
            .iter()
            .map(|(k, v)| (Path::from(vec![k.clone()]), v))
            .collect();
        while let Some((path, node)) = pending.pop() {
            match node {
                DependencyNode::Unresolved(_) => out.push(path),
                DependencyNode::Group(children) => {
                    pending.extend(children.iter().map(|(k, v)| (path.join(k.clone()), v)));
                }
                DependencyNode::Resolved(_) => {}
            }
        }
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::reducer_fn;
    use crate::value::Value;

    #[derive(Debug, PartialEq)]
    struct Api(&'static str);

    fn deps(entries: &[(&str, Dependency)]) -> BTreeMap<String, Dependency> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_main_at_root_features_under_slice() {
        let main = deps(&[("logger", Dependency::instance(Api("log")))]);
        let cart = deps(&[("api", Dependency::instance(Api("cart")))]);
        let built = Dependencies::build(&main, [("cart", &cart)], None);

        assert_eq!(*built.get::<Api>("logger").unwrap(), Api("log"));
        assert_eq!(*built.get::<Api>(["cart", "api"]).unwrap(), Api("cart"));
        assert!(built.get::<String>("logger").is_none(), "wrong type");
    }

    #[test]
    fn test_tokens_go_through_resolver() {
        let resolver = MapResolver::new().with("CartApi", Api("resolved"));
        let cart = deps(&[
            ("api", Dependency::token("CartApi")),
            ("missing", Dependency::token("Nope")),
        ]);
        let built = Dependencies::build(&BTreeMap::new(), [("cart", &cart)], Some(&resolver));

        assert_eq!(*built.get::<Api>(["cart", "api"]).unwrap(), Api("resolved"));
        assert!(built.get::<Api>(["cart", "missing"]).is_none());
        assert_eq!(built.unresolved(), vec![Path::from(["cart", "missing"])]);
    }

    #[test]
    fn test_nested_groups() {
        let main = deps(&[(
            "services",
            Dependency::group([
                ("a", Dependency::instance(Api("a"))),
                ("inner", Dependency::group([("b", Dependency::instance(Api("b")))])),
            ]),
        )]);
        let built = Dependencies::build(&main, [], None);
        assert_eq!(*built.get::<Api>(["services", "inner", "b"]).unwrap(), Api("b"));
        assert!(matches!(built.node("services"), Some(DependencyNode::Group(_))));
    }

    #[test]
    fn test_feature_merges_with_same_named_main_group() {
        let main = deps(&[(
            "cart",
            Dependency::group([("shared", Dependency::instance(Api("main")))]),
        )]);
        let cart = deps(&[("api", Dependency::instance(Api("cart")))]);
        let built = Dependencies::build(&main, [("cart", &cart)], None);
        assert!(built.get::<Api>(["cart", "shared"]).is_some());
        assert!(built.get::<Api>(["cart", "api"]).is_some());
    }

    #[test]
    fn test_validate_feature() {
        let reducer = reducer_fn(|s, _| Ok(s.unwrap_or_else(Value::object)));
        assert!(Module::new("cart", reducer.clone()).validate_feature("main").is_ok());

        for module in [
            Module::new("", reducer.clone()),
            Module::new("main", reducer),
            Module::new("empty", ReducerTree::branch()),
        ] {
            assert!(matches!(
                module.validate_feature("main"),
                Err(StoreError::Configuration { .. })
            ));
        }
    }
}
