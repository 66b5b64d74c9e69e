use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::TryStreamExt;
use serde_json::{json, Value};

use chronicle::{
    Event, EventHandlers, EventStoreBuilder, InMemoryStore, InMemoryWriteLock, MetadataMatcher,
    Operation, ProjectionManager, ProjectionStatus, ProjectorError, Registry, StreamSource,
    WriteLockStrategy,
};

use crate::support::{new_store, new_store_with_stream};

fn count_inc() -> EventHandlers {
    EventHandlers::new().handle("Inc", |state: Value, _event, _ctx| {
        json!({"n": state["n"].as_i64().unwrap_or(0) + 1})
    })
}

async fn seed_counter_stream(store: &chronicle::EventStore) {
    // 5 Inc events and 2 of another name, interleaved.
    let names = ["Inc", "Inc", "Other", "Inc", "Inc", "Other", "Inc"];
    let events = names
        .iter()
        .map(|name| Event::new(*name, Value::Null))
        .collect();
    store.append_to("events", events).await.unwrap();
}

#[tokio::test]
async fn counts_matching_events_and_tracks_positions() {
    let store = new_store_with_stream("events").await;
    seed_counter_stream(&store).await;

    let manager = ProjectionManager::new(store);
    let mut projector = manager.create_projector("count");
    projector.init(|| json!({"n": 0})).unwrap();
    projector.from_stream(StreamSource::new("events")).unwrap();
    projector.when(count_inc()).unwrap();

    projector.run(false).await.unwrap();

    assert_eq!(Some(&json!({"n": 5})), projector.state());
    // The position is the last seen event number, not the number of
    // handled events: unmatched names still advance the cursor.
    assert_eq!(Some(&7), projector.positions().get("events"));
    assert_eq!(ProjectionStatus::Idle, projector.status());
}

#[tokio::test]
async fn when_any_sees_every_event() {
    let store = new_store_with_stream("events").await;
    seed_counter_stream(&store).await;

    let manager = ProjectionManager::new(store);
    let mut projector = manager.create_projector("all");
    projector.init(|| json!({"n": 0})).unwrap();
    projector.from_stream(StreamSource::new("events")).unwrap();
    projector
        .when_any(|state: Value, _event, _ctx| json!({"n": state["n"].as_i64().unwrap_or(0) + 1}))
        .unwrap();

    projector.run(false).await.unwrap();
    assert_eq!(Some(&json!({"n": 7})), projector.state());
}

#[tokio::test]
async fn source_matcher_keeps_positions_on_real_numbers() {
    let store = new_store_with_stream("orders").await;
    let events = (1..=4)
        .map(|version| {
            Event::new("Placed", json!({}))
                .with_aggregate_id("x")
                .with_version(version)
        })
        .collect();
    store.append_to("orders", events).await.unwrap();

    let matcher =
        MetadataMatcher::new().match_field("_aggregate_version", Operation::Greater, json!(2));
    let manager = ProjectionManager::new(store);
    let mut projector = manager.create_projector("late-orders");
    projector.init(|| json!({"n": 0})).unwrap();
    projector
        .from_stream(StreamSource::new("orders").with_matcher(matcher))
        .unwrap();
    projector
        .when_any(|state: Value, _event, _ctx| json!({"n": state["n"].as_i64().unwrap_or(0) + 1}))
        .unwrap();

    projector.run(false).await.unwrap();

    assert_eq!(Some(&json!({"n": 2})), projector.state());
    assert_eq!(Some(&4), projector.positions().get("orders"));
}

#[tokio::test]
async fn a_second_run_resumes_from_the_checkpoint() {
    let store = new_store_with_stream("events").await;
    seed_counter_stream(&store).await;

    let manager = ProjectionManager::new(store.clone());
    let mut projector = manager.create_projector("count");
    projector.init(|| json!({"n": 0})).unwrap();
    projector.from_stream(StreamSource::new("events")).unwrap();
    projector.when(count_inc()).unwrap();

    projector.run(false).await.unwrap();
    store
        .append_to("events", vec![Event::new("Inc", Value::Null)])
        .await
        .unwrap();
    projector.run(false).await.unwrap();

    assert_eq!(Some(&json!({"n": 6})), projector.state());
    assert_eq!(Some(&8), projector.positions().get("events"));
}

#[tokio::test]
async fn identical_streams_produce_identical_projections() {
    let mut states = Vec::new();
    for _ in 0..2 {
        let store = new_store_with_stream("events").await;
        seed_counter_stream(&store).await;

        let manager = ProjectionManager::new(store);
        let mut projector = manager.create_projector("count");
        projector.init(|| json!({"n": 0})).unwrap();
        projector.from_stream(StreamSource::new("events")).unwrap();
        projector.when(count_inc()).unwrap();
        projector.run(false).await.unwrap();

        states.push(projector.state().cloned());
    }
    assert_eq!(states[0], states[1]);
}

#[tokio::test]
async fn from_all_discovers_streams_created_later() {
    let store = new_store_with_stream("s1").await;
    store
        .append_to("s1", vec![Event::new("E", Value::Null), Event::new("E", Value::Null)])
        .await
        .unwrap();

    let manager = ProjectionManager::new(store.clone());
    let mut projector = manager.create_projector("everything");
    projector.init(|| json!({"n": 0})).unwrap();
    projector.from_all().unwrap();
    projector
        .when_any(|state: Value, _event, _ctx| json!({"n": state["n"].as_i64().unwrap_or(0) + 1}))
        .unwrap();

    projector.run(false).await.unwrap();
    assert_eq!(Some(&json!({"n": 2})), projector.state());

    store.create_stream("s2").await.unwrap();
    store
        .append_to("s2", vec![Event::new("E", Value::Null)])
        .await
        .unwrap();

    projector.run(false).await.unwrap();
    assert_eq!(Some(&json!({"n": 3})), projector.state());
    assert_eq!(Some(&1), projector.positions().get("s2"));
}

#[tokio::test]
async fn merge_ties_resolve_in_declaration_order() {
    let store = new_store_with_stream("zebra").await;
    store.create_stream("apple").await.unwrap();

    // Same timestamp and same number in both streams: only the declared
    // source order can break the tie.
    let at = Utc::now();
    store
        .append_to("zebra", vec![Event::new("E", Value::Null).with_created_at(at)])
        .await
        .unwrap();
    store
        .append_to("apple", vec![Event::new("E", Value::Null).with_created_at(at)])
        .await
        .unwrap();

    let manager = ProjectionManager::new(store);
    let mut projector = manager.create_projector("tie");
    projector.init(|| json!([])).unwrap();
    projector
        .from_streams(vec![StreamSource::new("zebra"), StreamSource::new("apple")])
        .unwrap();
    projector
        .when_any(|state: Value, event: &Event, _ctx| {
            let mut seen = state.as_array().cloned().unwrap_or_default();
            seen.push(json!(event.metadata().stream()));
            Value::Array(seen)
        })
        .unwrap();

    projector.run(false).await.unwrap();
    assert_eq!(Some(&json!(["zebra", "apple"])), projector.state());
}

#[tokio::test]
async fn emit_and_link_to_write_through_the_store() {
    let store = new_store_with_stream("events").await;
    store
        .append_to("events", vec![Event::new("Inc", json!({"i": 1}))])
        .await
        .unwrap();

    let manager = ProjectionManager::new(store.clone());
    let mut projector = manager.create_projector("audit");
    projector.init(|| Value::Null).unwrap();
    projector.from_stream(StreamSource::new("events")).unwrap();
    projector
        .when_any(|state: Value, event: &Event, ctx: &mut chronicle::ProjectorContext| {
            ctx.emit(Event::new("Audited", event.payload().clone()));
            ctx.link_to("copies", Event::new("Copied", event.payload().clone()));
            state
        })
        .unwrap();

    projector.run(false).await.unwrap();

    // `emit` targets the stream named after the projection.
    let audited: Vec<Event> = store
        .load("audit", 1, None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(1, audited.len());
    assert_eq!("Audited", audited[0].name());

    let copies: Vec<Event> = store
        .load("copies", 1, None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(1, copies.len());
}

#[tokio::test]
async fn stop_handler_breaks_the_fold() {
    let store = new_store_with_stream("events").await;
    seed_counter_stream(&store).await;

    let manager = ProjectionManager::new(store);
    let mut projector = manager.create_projector("one-shot");
    projector.init(|| json!({"n": 0})).unwrap();
    projector.from_stream(StreamSource::new("events")).unwrap();
    projector
        .when_any(|state: Value, _event, ctx: &mut chronicle::ProjectorContext| {
            ctx.stop();
            json!({"n": state["n"].as_i64().unwrap_or(0) + 1})
        })
        .unwrap();

    projector.run(false).await.unwrap();

    assert_eq!(Some(&json!({"n": 1})), projector.state());
    assert_eq!(Some(&1), projector.positions().get("events"));
}

#[tokio::test]
async fn stop_signal_is_honored_while_running() {
    let store = new_store_with_stream("events").await;
    seed_counter_stream(&store).await;

    let manager = ProjectionManager::new(store);
    let mut projector = manager.create_projector("long-runner");
    projector.init(|| json!({"n": 0})).unwrap();
    projector.from_stream(StreamSource::new("events")).unwrap();
    projector.when(count_inc()).unwrap();

    let runner = tokio::spawn(async move {
        let result = projector.run(true).await;
        (projector, result)
    });

    // Wait until the record exists and reads Running, so the signal cannot
    // be overwritten by the projector's own status write.
    loop {
        let names = manager.fetch_projection_names().await.unwrap();
        if names.contains(&"long-runner".to_string())
            && manager.fetch_projection_status("long-runner").await == ProjectionStatus::Running
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.stop_projection("long-runner").await.unwrap();

    let (projector, result) = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("projector did not honor the stop signal")
        .unwrap();
    result.unwrap();

    assert_eq!(Some(&json!({"n": 5})), projector.state());
    assert_eq!(
        ProjectionStatus::Idle,
        manager.fetch_projection_status("long-runner").await
    );
}

#[tokio::test]
async fn reset_clears_the_checkpoint_and_reprocesses() {
    let store = new_store_with_stream("s").await;
    let events = (0..10).map(|_| Event::new("Inc", Value::Null)).collect();
    store.append_to("s", events).await.unwrap();

    let inits = Arc::new(AtomicU32::new(0));
    let handled = Arc::new(AtomicU32::new(0));

    let manager = ProjectionManager::new(store);
    let mut projector = manager.create_projector("count");
    let init_probe = Arc::clone(&inits);
    projector
        .init(move || {
            init_probe.fetch_add(1, Ordering::SeqCst);
            json!({"n": 0})
        })
        .unwrap();
    projector.from_stream(StreamSource::new("s")).unwrap();
    let handled_probe = Arc::clone(&handled);
    projector
        .when_any(move |state: Value, _event, _ctx| {
            handled_probe.fetch_add(1, Ordering::SeqCst);
            json!({"n": state["n"].as_i64().unwrap_or(0) + 1})
        })
        .unwrap();

    projector.run(false).await.unwrap();
    assert_eq!(Some(&10), projector.positions().get("s"));
    assert_eq!(10, handled.load(Ordering::SeqCst));

    manager.reset_projection("count").await.unwrap();
    projector.run(false).await.unwrap();

    // The init factory ran again and every event was folded a second time.
    assert!(inits.load(Ordering::SeqCst) >= 2);
    assert_eq!(20, handled.load(Ordering::SeqCst));
    assert_eq!(Some(&json!({"n": 10})), projector.state());
    assert_eq!(Some(&10), projector.positions().get("s"));
}

#[tokio::test]
async fn delete_signal_removes_the_projection_record() {
    let store = new_store_with_stream("events").await;
    seed_counter_stream(&store).await;

    let manager = ProjectionManager::new(store);
    let mut projector = manager.create_projector("doomed");
    projector.init(|| json!({"n": 0})).unwrap();
    projector.from_stream(StreamSource::new("events")).unwrap();
    projector.when(count_inc()).unwrap();

    projector.run(false).await.unwrap();
    assert!(manager
        .fetch_projection_names()
        .await
        .unwrap()
        .contains(&"doomed".to_string()));

    manager.delete_projection("doomed", false).await.unwrap();
    projector.run(false).await.unwrap();

    assert!(!manager
        .fetch_projection_names()
        .await
        .unwrap()
        .contains(&"doomed".to_string()));
    // The in-memory fold went back to its initial state.
    assert_eq!(Some(&json!({"n": 0})), projector.state());
}

#[tokio::test]
async fn delete_can_drop_the_emitted_stream() {
    let store = new_store_with_stream("events").await;
    store
        .append_to("events", vec![Event::new("Inc", Value::Null)])
        .await
        .unwrap();

    let manager = ProjectionManager::new(store.clone());
    let mut projector = manager.create_projector("emitter");
    projector.init(|| Value::Null).unwrap();
    projector.from_stream(StreamSource::new("events")).unwrap();
    projector
        .when_any(|state: Value, _event, ctx: &mut chronicle::ProjectorContext| {
            ctx.emit(Event::new("Echo", Value::Null));
            state
        })
        .unwrap();

    projector.run(false).await.unwrap();
    assert!(store.has_stream("emitter").await.unwrap());

    manager.delete_projection("emitter", true).await.unwrap();
    projector.run(false).await.unwrap();

    assert!(!store.has_stream("emitter").await.unwrap());
}

#[tokio::test]
async fn build_phase_misuse_is_rejected() {
    let store = new_store().await;
    let manager = ProjectionManager::new(store);

    let mut projector = manager.create_projector("p");
    projector.init(|| Value::Null).unwrap();
    assert!(matches!(
        projector.init(|| Value::Null),
        Err(ProjectorError::AlreadyInitialized)
    ));

    projector.from_all().unwrap();
    assert!(matches!(
        projector.from_stream(StreamSource::new("s")),
        Err(ProjectorError::FromAlreadyCalled)
    ));

    projector.when_any(|state, _, _| state).unwrap();
    assert!(matches!(
        projector.when(EventHandlers::new()),
        Err(ProjectorError::WhenAlreadyCalled)
    ));
}

#[tokio::test]
async fn run_requires_handlers_state_and_sources() {
    let store = new_store().await;
    let manager = ProjectionManager::new(store);

    let mut projector = manager.create_projector("p1");
    projector.init(|| Value::Null).unwrap();
    projector.from_all().unwrap();
    assert!(matches!(
        projector.run(false).await,
        Err(ProjectorError::NoHandler)
    ));

    let mut projector = manager.create_projector("p2");
    projector.from_all().unwrap();
    projector.when_any(|state, _, _| state).unwrap();
    assert!(matches!(
        projector.run(false).await,
        Err(ProjectorError::StateNotInitialised)
    ));

    let mut projector = manager.create_projector("p3");
    projector.init(|| Value::Null).unwrap();
    projector.when_any(|state, _, _| state).unwrap();
    assert!(matches!(
        projector.run(false).await,
        Err(ProjectorError::NoSources)
    ));
}

#[tokio::test]
async fn empty_handler_names_are_invalid() {
    let store = new_store().await;
    let manager = ProjectionManager::new(store);

    let mut projector = manager.create_projector("p");
    let handlers = EventHandlers::new().handle("", |state, _, _| state);
    assert!(matches!(
        projector.when(handlers),
        Err(ProjectorError::InvalidHandler(_))
    ));
}

#[tokio::test]
async fn a_held_write_lock_rejects_the_run() {
    let locks = InMemoryWriteLock::new();
    let store = EventStoreBuilder::new(InMemoryStore::new())
        .with_write_lock(locks.clone())
        .try_build()
        .await
        .unwrap();
    store.install().await.unwrap();
    store.create_stream("events").await.unwrap();

    let manager = ProjectionManager::new(store);
    let mut projector = manager.create_projector("locked");
    projector.init(|| Value::Null).unwrap();
    projector.from_stream(StreamSource::new("events")).unwrap();
    projector.when_any(|state, _, _| state).unwrap();

    assert!(locks.create_lock("locked").await.unwrap());
    assert!(matches!(
        projector.run(false).await,
        Err(ProjectorError::AlreadyRunning(_))
    ));

    locks.release_lock("locked").await.unwrap();
    projector.run(false).await.unwrap();
}

#[tokio::test]
async fn registry_projections_are_available_through_the_store() {
    let registry = Registry::new().projection("count", |projector: &mut chronicle::Projector| {
        projector.init(|| json!({"n": 0}))?;
        projector.from_stream(StreamSource::new("events"))?;
        projector.when(count_inc())?;
        Ok(())
    });
    let store = EventStoreBuilder::new(InMemoryStore::new())
        .with_registry(registry)
        .try_build()
        .await
        .unwrap();
    store.install().await.unwrap();
    store.create_stream("events").await.unwrap();
    seed_counter_stream(&store).await;

    let mut projector = store.get_projector("count").await.unwrap();
    projector.run(false).await.unwrap();
    assert_eq!(Some(&json!({"n": 5})), projector.state());

    assert!(matches!(
        store.get_projector("nope").await,
        Err(chronicle::StoreError::ProjectionNotFound(_))
    ));
}

#[tokio::test]
async fn registry_setup_errors_surface_at_build_time() {
    let registry = Registry::new().projection("broken", |projector: &mut chronicle::Projector| {
        projector.init(|| Value::Null)?;
        projector.init(|| Value::Null)?;
        Ok(())
    });
    let result = EventStoreBuilder::new(InMemoryStore::new())
        .with_registry(registry)
        .try_build()
        .await;
    assert!(matches!(result, Err(ProjectorError::AlreadyInitialized)));
}
