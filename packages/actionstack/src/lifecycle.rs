//! Module lifecycle - loading and unloading feature modules at runtime.
//!
//! Loads and unloads serialize on the store's module lock and wait for the
//! store to go idle (no plain action mid-flight) before touching the reducer
//! or the dependency tree, so a reduction never sees a half-swapped module
//! set. The new reducer is built before anything is mutated; a configuration
//! error leaves the store exactly as it was.
//!
//! ```ignore
//! let cart = Module::new("cart", reducer_fn(|state, _| {
//!     Ok(state.unwrap_or_else(|| json!({"items": []}).into()))
//! }));
//!
//! store.load_module(cart.clone()).await?;
//! assert_eq!(store.get_state_at(["cart", "items"]), Some(Value::array()));
//!
//! store.unload_module("cart", true).await?;
//! assert!(store.get_state_at("cart").is_none());
//! ```
//!
//! Neither call may be awaited from inside a plain action (a middleware or an
//! awaited state observer): the idle wait would wait on the caller. That case
//! fails with [`StoreError::Reentrancy`](crate::StoreError::Reentrancy).

use std::sync::PoisonError;

use tracing::{debug, info};

use crate::action::system;
use crate::error::Result;
use crate::module::Module;
use crate::store::{build_reducer, ensure_outside_action, Store};
use crate::value::Path;

impl Store {
    /// Load a feature module, hydrating its slice with the reducer's initial
    /// value. Loading a slice that is already present is a no-op.
    pub async fn load_module(&self, module: Module) -> Result<()> {
        ensure_outside_action("load_module")?;
        let inner = &self.inner;
        let slice = module.slice().to_string();

        {
            let _lifecycle = inner.module_lock.lock().await;
            if self.has_module(&slice) {
                debug!(slice = %slice, "module already loaded");
                return Ok(());
            }
            module.validate_feature(inner.main.slice())?;
            inner.stack.wait_for_idle().await;

            let mut next = self.loaded();
            next.push(module);
            let reducer = build_reducer(&inner.main, &next, &inner.meta_reducers, &inner.settings)?;

            inner.rebuild_dependencies(&next);
            *inner.modules.lock().unwrap_or_else(PoisonError::into_inner) = next;
            inner.set_reducer(reducer.clone());
            inner.hydrate(reducer, system::update_state()).await;
        }

        info!(slice = %slice, "module loaded");
        if inner.settings.dispatch_system_actions {
            self.dispatch(system::module_loaded(&slice)).await?;
        }
        Ok(())
    }

    /// Unload a feature module. With `clear_state` its slice is deleted from
    /// the state tree; otherwise the tree is recomputed without its reducer and
    /// the slice keeps its last value. Unloading an absent slice is a no-op.
    pub async fn unload_module(&self, slice: &str, clear_state: bool) -> Result<()> {
        ensure_outside_action("unload_module")?;
        let inner = &self.inner;

        {
            let _lifecycle = inner.module_lock.lock().await;
            if !self.has_module(slice) {
                debug!(slice = %slice, "module not loaded");
                return Ok(());
            }
            inner.stack.wait_for_idle().await;

            let next: Vec<Module> = self
                .loaded()
                .into_iter()
                .filter(|m| m.slice() != slice)
                .collect();
            let reducer = build_reducer(&inner.main, &next, &inner.meta_reducers, &inner.settings)?;

            inner.rebuild_dependencies(&next);
            *inner.modules.lock().unwrap_or_else(PoisonError::into_inner) = next;
            inner.set_reducer(reducer.clone());
            if clear_state {
                inner
                    .remove_state(&Path::from(slice), system::update_state())
                    .await;
            } else {
                inner.hydrate(reducer, system::update_state()).await;
            }
        }

        info!(slice = %slice, clear_state, "module unloaded");
        if inner.settings.dispatch_system_actions {
            self.dispatch(system::module_unloaded(slice)).await?;
        }
        Ok(())
    }

    /// Slices of the loaded feature modules, in load order.
    pub fn loaded_modules(&self) -> Vec<String> {
        self.loaded().iter().map(|m| m.slice().to_string()).collect()
    }

    fn loaded(&self) -> Vec<Module> {
        self.inner
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn has_module(&self, slice: &str) -> bool {
        self.inner
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|m| m.slice() == slice)
    }
}
