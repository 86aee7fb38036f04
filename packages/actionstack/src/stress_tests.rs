//! Stress tests designed to break the store.
//!
//! These tests exercise ordering, contention and race conditions across the
//! pipeline, the module lifecycle and side effects.

#[cfg(test)]
mod stress_tests {
    use crate::action::{Action, AsyncAction};
    use crate::effects::effect_fn;
    use crate::error::StoreError;
    use crate::middleware::middleware_fn;
    use crate::module::Module;
    use crate::reducer::{reducer_fn, SharedReducer};
    use crate::settings::StoreSettings;
    use crate::store::Store;
    use crate::strategy::Strategy;
    use crate::testing::RecordingMiddleware;
    use crate::tracker::CompletionTracker;
    use crate::value::Value;
    use futures::future;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    // ==========================================================================
    // Test Reducers
    // ==========================================================================

    /// `{count, log}`: INC bumps count, ADD adds the payload, APPEND pushes
    /// the payload onto log.
    fn counter() -> SharedReducer {
        reducer_fn(|state, action| {
            let state = state.unwrap_or_else(|| json!({"count": 0, "log": []}).into());
            let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
            Ok(match action.action_type() {
                "INC" => state.with("count", count + 1),
                "ADD" => {
                    let by = action.payload().and_then(Value::as_i64).unwrap_or(0);
                    state.with("count", count + by)
                }
                "APPEND" => {
                    let log = state.get("log").cloned().unwrap_or_else(Value::array);
                    let entry = action.payload().cloned().unwrap_or_default();
                    state.with("log", log.push(entry))
                }
                _ => state,
            })
        })
    }

    async fn store(strategy: Strategy) -> Store {
        Store::builder()
            .with_main_module(Module::new("main", counter()))
            .with_strategy(strategy.as_str())
            .build()
            .await
            .unwrap()
    }

    fn count(store: &Store) -> i64 {
        store
            .get_state_at(["main", "count"])
            .and_then(|v| v.as_i64())
            .unwrap()
    }

    fn log(store: &Store) -> Vec<String> {
        store
            .get_state_at(["main", "log"])
            .and_then(|v| v.as_array().map(|items| items.iter().map(|i| i.to_string()).collect()))
            .unwrap_or_default()
    }

    // ==========================================================================
    // TEST: Exclusive strategy equals a sequential fold
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_concurrent_dispatch_equals_sequential_fold() {
        let store = store(Strategy::Exclusive).await;
        let amounts: Vec<i64> = (0..400).map(|_| fastrand::i64(-50..50)).collect();
        let expected: i64 = amounts.iter().sum();

        let handles: Vec<_> = amounts
            .into_iter()
            .map(|by| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch(Action::with_payload("ADD", by)).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(count(&store), expected);
        assert!(store.stack().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_strategy_loses_no_updates() {
        let store = store(Strategy::Concurrent).await;
        let handles: Vec<_> = (0..500)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch(Action::new("INC")).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(count(&store), 500);
    }

    /// Like [`counter`], but INC spins for a while before reading the count,
    /// widening the window in which two commits could overlap.
    fn slow_counter() -> SharedReducer {
        reducer_fn(|state, action| {
            let state = state.unwrap_or_else(|| json!({"count": 0}).into());
            if action.action_type() != "INC" {
                return Ok(state);
            }
            let deadline = std::time::Instant::now() + Duration::from_micros(500);
            while std::time::Instant::now() < deadline {
                std::hint::spin_loop();
            }
            let count = state.get("count").and_then(Value::as_i64).unwrap_or(0);
            Ok(state.with("count", count + 1))
        })
    }

    async fn slow_store(strategy: Strategy) -> Store {
        Store::builder()
            .with_main_module(Module::new("main", slow_counter()))
            .with_strategy(strategy.as_str())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_strategy_slow_reducer_loses_no_updates() {
        let store = slow_store(Strategy::Concurrent).await;
        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch(Action::new("INC")).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(count(&store), 200);
    }

    // Branch children under the exclusive strategy serialize per branch only,
    // so branches interleave. Every write must still land.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_branches_lose_no_updates() {
        let store = slow_store(Strategy::Exclusive).await;
        let handles: Vec<_> = (0..4)
            .map(|b| {
                let store = store.clone();
                let branch = AsyncAction::new(format!("branch-{b}"), |ctx| async move {
                    for _ in 0..10 {
                        ctx.dispatch(Action::new("INC")).await?;
                    }
                    Ok(())
                });
                tokio::spawn(async move { store.dispatch(branch).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(count(&store), 40);
        assert!(store.stack().is_empty());
    }

    // ==========================================================================
    // TEST: Exclusive lock grants in FIFO order
    // ==========================================================================
    //
    // A slow middleware keeps the lock held while the other dispatches queue.
    // The log must come out in queue order.

    #[tokio::test]
    async fn test_exclusive_applies_in_lock_grant_order() {
        let slow = middleware_fn("slow", |_api, action, next| async move {
            tokio::task::yield_now().await;
            next.run(action).await?;
            Ok(())
        });
        let store = Store::builder()
            .with_main_module(Module::new("main", counter()))
            .with_strategy("exclusive")
            .with_middleware(slow)
            .build()
            .await
            .unwrap();

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch(Action::with_payload("APPEND", i)).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let expected: Vec<String> = (0..50).map(|i: i32| i.to_string()).collect();
        assert_eq!(log(&store), expected);
    }

    // ==========================================================================
    // TEST: Async branches keep their own order
    // ==========================================================================
    //
    // Two async actions started by two top-level dispatches each issue their
    // children in order. Children of one branch must apply in issue order;
    // across branches they are allowed to interleave.

    fn branch(name: &'static str, n: usize) -> AsyncAction {
        AsyncAction::new(name, move |ctx| async move {
            for i in 0..n {
                ctx.dispatch(Action::with_payload("APPEND", format!("{name}{i}"))).await?;
                tokio::task::yield_now().await;
            }
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_async_branches_preserve_per_branch_order() {
        for strategy in [Strategy::Exclusive, Strategy::Concurrent] {
            let store = store(strategy).await;
            let a = tokio::spawn({
                let store = store.clone();
                async move { store.dispatch(branch("a", 30)).await }
            });
            let b = tokio::spawn({
                let store = store.clone();
                async move { store.dispatch(branch("b", 30)).await }
            });
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();

            let log = log(&store);
            assert_eq!(log.len(), 60, "strategy {strategy}");
            for prefix in ["\"a", "\"b"] {
                let ours: Vec<&String> = log.iter().filter(|e| e.starts_with(prefix)).collect();
                let expected: Vec<String> = (0..30)
                    .map(|i| format!("{prefix}{i}\""))
                    .collect();
                assert_eq!(
                    ours.into_iter().cloned().collect::<Vec<_>>(),
                    expected,
                    "branch {prefix} out of order under {strategy}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_sibling_branches_may_interleave_under_exclusive() {
        let store = store(Strategy::Exclusive).await;
        let a = tokio::spawn({
            let store = store.clone();
            async move { store.dispatch(branch("a", 10)).await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.dispatch(branch("b", 10)).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let log = log(&store);
        let switches = log
            .windows(2)
            .filter(|w| w[0].as_bytes()[1] != w[1].as_bytes()[1])
            .count();
        assert!(switches > 1, "expected interleaved siblings, got {log:?}");
    }

    // ==========================================================================
    // TEST: Nested async actions and reentrant dispatch do not deadlock
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nested_async_actions_under_exclusive() {
        let store = store(Strategy::Exclusive).await;
        let outer = AsyncAction::new("outer", |ctx| async move {
            ctx.dispatch(Action::new("INC")).await?;
            ctx.dispatch(AsyncAction::new("inner", |ctx| async move {
                for _ in 0..5 {
                    ctx.dispatch(Action::new("INC")).await?;
                }
                Ok(())
            }))
            .await?;
            ctx.dispatch(Action::new("INC")).await?;
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(5), store.dispatch(outer))
            .await
            .expect("nested async actions deadlocked")
            .unwrap();
        assert_eq!(count(&store), 7);
        assert!(store.stack().is_empty());
    }

    // ==========================================================================
    // TEST: Side effects under load
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_effects_answer_every_ping() {
        let spy = RecordingMiddleware::new().without_system_actions();
        let store = Store::builder()
            .with_main_module(Module::new("main", counter()))
            .with_middleware(spy.shared())
            .build()
            .await
            .unwrap();
        let pong = effect_fn("pong", |actions, _state, _deps| {
            actions
                .filter(|a| future::ready(a.action_type() == "PING"))
                .map(|_| Ok(Action::new("INC")))
        });
        let _handle = store.extend([pong]).await.unwrap();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch(Action::new("PING")).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(count(&store), 100);
        spy.assert_count("PING", 100);
        spy.assert_count("INC", 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tracker_register_complete_race() {
        let tracker = Arc::new(CompletionTracker::new());
        let handles: Vec<_> = (0..2000u64)
            .map(|seq| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let batch = tracker.next_batch();
                    let id = tracker.register(batch, "racer");
                    tracker.publish(seq);
                    tokio::task::yield_now().await;
                    tracker.consumed(id, seq);
                    tracker.complete(id);
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let active = tracker.active_count();
        assert_eq!(active, 0, "tracker leaked {active} entries");
        tracker
            .wait(tracker.published(), None, Duration::from_millis(50))
            .await
            .unwrap();
    }

    // ==========================================================================
    // TEST: Module lifecycle under load
    // ==========================================================================

    fn cart() -> Module {
        Module::new(
            "cart",
            reducer_fn(|state, _| Ok(state.unwrap_or_else(|| json!({"items": []}).into()))),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_load_unload_while_dispatching() {
        let store = store(Strategy::Exclusive).await;
        let dispatchers: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.dispatch(Action::new("INC")).await })
            })
            .collect();

        for _ in 0..10 {
            store.load_module(cart()).await.unwrap();
            assert_eq!(store.get_state_at(["cart", "items"]), Some(Value::array()));
            store.unload_module("cart", true).await.unwrap();
            assert!(store.get_state_at("cart").is_none());
        }
        for h in dispatchers {
            h.await.unwrap().unwrap();
        }

        assert_eq!(count(&store), 200);
        assert!(store.loaded_modules().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_of_same_slice_load_once() {
        let store = store(Strategy::Concurrent).await;
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.load_module(cart()).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.loaded_modules(), vec!["cart".to_string()]);
    }

    // ==========================================================================
    // TEST: Runtime strategy switches mid-stream
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_strategy_switch_under_load() {
        let store = Store::builder()
            .with_main_module(Module::new("main", counter()))
            .with_settings(StoreSettings {
                exclusive_action_processing: true,
                ..StoreSettings::default()
            })
            .build()
            .await
            .unwrap();
        assert_eq!(store.strategy(), Strategy::Exclusive);

        let handles: Vec<_> = (0..300)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    if i == 150 {
                        store.set_strategy(Strategy::Concurrent);
                    }
                    store.dispatch(Action::new("INC")).await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(count(&store), 300);
    }

    // ==========================================================================
    // TEST: Validation never reaches the pipeline
    // ==========================================================================

    #[tokio::test]
    async fn test_invalid_actions_are_rejected_under_load() {
        let spy = RecordingMiddleware::new().without_system_actions();
        let store = Store::builder().with_middleware(spy.shared()).build().await.unwrap();
        for i in 0..100 {
            let action = if i % 2 == 0 { Action::new("") } else { Action::new("OK") };
            let result = store.dispatch(action).await;
            if i % 2 == 0 {
                assert!(matches!(result, Err(StoreError::Validation { .. })));
            } else {
                result.unwrap();
            }
        }
        spy.assert_count("OK", 50);
        assert_eq!(spy.count(), 50);
    }
}
