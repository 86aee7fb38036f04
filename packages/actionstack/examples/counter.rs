//! A counter store with a feature module, an async action and a side effect.
//!
//! ```text
//! cargo run -p actionstack --example counter
//! ACTIONSTACK_STRATEGY=exclusive RUST_LOG=debug cargo run -p actionstack --example counter
//! ```

use anyhow::Result;
use futures::{future, StreamExt};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use actionstack::{
    effect_fn, middleware_fn, reducer_fn, Action, AsyncAction, Dependency, Module, Store,
    StoreSettings, Value,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actionstack=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let settings = StoreSettings::from_env()?;

    let counter = reducer_fn(|state, action| {
        let state = state.unwrap_or_else(|| json!({"count": 0}).into());
        let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
        Ok(match action.action_type() {
            "INC" => state.with("count", count + 1),
            "ADD" => {
                let by = action.payload().and_then(Value::as_i64).unwrap_or(0);
                state.with("count", count + by)
            }
            _ => state,
        })
    });

    let history = reducer_fn(|state, action| {
        let state = state.unwrap_or_else(Value::array);
        Ok(match action.action_type() {
            "MILESTONE" => state.push(action.payload().cloned().unwrap_or_default()),
            _ => state,
        })
    });

    let logger = middleware_fn("logger", |api, action, next| async move {
        let action_type = action.action_type().to_string();
        next.run(action).await?;
        tracing::info!(action = %action_type, state = %api.get_state(), "reduced");
        Ok(())
    });

    let store = Store::builder()
        .with_settings(settings)
        .with_main_module(
            Module::new("main", counter).with_dependency("step", Dependency::instance(5i64)),
        )
        .with_middleware(logger)
        .build()
        .await?;

    store.load_module(Module::new("history", history)).await?;

    // Every tenth count is a milestone.
    let milestones = {
        let store = store.clone();
        effect_fn("milestones", move |actions, _state, _deps| {
            let store = store.clone();
            actions
                .filter(|a| future::ready(matches!(a.action_type(), "INC" | "ADD")))
                .filter_map(move |_| {
                    let count = store
                        .get_state_at(["main", "count"])
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    future::ready((count > 0 && count % 10 == 0).then(|| Ok(Action::with_payload("MILESTONE", count))))
                })
        })
    };
    let handle = store.extend([milestones]).await?;

    let add_steps = AsyncAction::new("add-steps", |ctx| async move {
        let step = ctx.dependencies().get::<i64>("step").map(|s| *s).unwrap_or(1);
        for _ in 0..3 {
            ctx.dispatch(Action::with_payload("ADD", step)).await?;
        }
        Ok(())
    });

    for _ in 0..5 {
        store.dispatch(Action::new("INC")).await?;
    }
    store.dispatch(add_steps).await?;
    handle.all_executed().await?;

    tracing::info!(
        strategy = %store.strategy(),
        count = ?store.get_state_at(["main", "count"]),
        milestones = %store.get_state_at("history").unwrap_or_default(),
        "done"
    );

    handle.unregister();
    store.unload_module("history", true).await?;
    Ok(())
}
