use futures::TryStreamExt;

use chronicle::{AggregateRoot, Event, RepositoryError, StoreError};

use crate::support::{new_store_with_stream, Ticket};

#[tokio::test]
async fn save_stamps_identity_and_versions() {
    let store = new_store_with_stream("tickets").await;
    let repository = store.create_repository::<Ticket>("tickets").await;

    let mut ticket = Ticket::open("t-1");
    ticket.comment("first");
    let mut root = AggregateRoot::new(ticket);

    repository.save(&mut root).await.unwrap();
    assert_eq!(2, root.version());

    let events: Vec<Event> = store
        .load("tickets", 1, None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(2, events.len());
    for (i, event) in events.iter().enumerate() {
        assert_eq!(Some("t-1"), event.metadata().aggregate_id());
        assert_eq!(Some("ticket"), event.metadata().aggregate_type());
        assert_eq!(Some(i as u64 + 1), event.metadata().aggregate_version());
    }
}

#[tokio::test]
async fn save_without_pending_events_is_a_no_op() {
    let store = new_store_with_stream("tickets").await;
    let repository = store.create_repository::<Ticket>("tickets").await;

    let mut root = AggregateRoot::new(Ticket::default());
    repository.save(&mut root).await.unwrap();
    assert_eq!(0, root.version());
}

#[tokio::test]
async fn load_replays_events_into_state() {
    let store = new_store_with_stream("tickets").await;
    let repository = store.create_repository::<Ticket>("tickets").await;

    let mut ticket = Ticket::open("t-1");
    ticket.comment("a");
    ticket.comment("b");
    repository.save(&mut AggregateRoot::new(ticket)).await.unwrap();

    let root = repository.load("t-1").await.unwrap().unwrap();
    assert_eq!("t-1", root.id());
    assert_eq!(3, root.version());
    assert!(root.inner().open);
    assert_eq!(2, root.inner().comments);
}

#[tokio::test]
async fn load_is_deterministic() {
    let store = new_store_with_stream("tickets").await;
    let repository = store.create_repository::<Ticket>("tickets").await;

    let mut ticket = Ticket::open("t-1");
    ticket.comment("a");
    repository.save(&mut AggregateRoot::new(ticket)).await.unwrap();

    let first = repository.load("t-1").await.unwrap().unwrap();
    let second = repository.load("t-1").await.unwrap().unwrap();
    assert_eq!(first.version(), second.version());
    assert_eq!(first.inner().comments, second.inner().comments);
}

#[tokio::test]
async fn aggregates_sharing_a_stream_stay_isolated() {
    let store = new_store_with_stream("tickets").await;
    let repository = store.create_repository::<Ticket>("tickets").await;

    repository
        .save(&mut AggregateRoot::new(Ticket::open("t-1")))
        .await
        .unwrap();
    let mut other = Ticket::open("t-2");
    other.comment("unrelated");
    repository.save(&mut AggregateRoot::new(other)).await.unwrap();

    let root = repository.load("t-1").await.unwrap().unwrap();
    assert_eq!(1, root.version());
    assert_eq!(0, root.inner().comments);
}

#[tokio::test]
async fn missing_aggregate_loads_as_none_and_fails_get() {
    let store = new_store_with_stream("tickets").await;
    let repository = store.create_repository::<Ticket>("tickets").await;

    assert!(repository.load("ghost").await.unwrap().is_none());
    assert!(matches!(
        repository.get("ghost").await,
        Err(RepositoryError::AggregateNotFound(_))
    ));
}

#[tokio::test]
async fn saving_on_top_of_a_loaded_root_continues_the_version_sequence() {
    let store = new_store_with_stream("tickets").await;
    let repository = store.create_repository::<Ticket>("tickets").await;

    repository
        .save(&mut AggregateRoot::new(Ticket::open("t-1")))
        .await
        .unwrap();

    let mut root = repository.get("t-1").await.unwrap();
    root.inner_mut().comment("later");
    repository.save(&mut root).await.unwrap();
    assert_eq!(2, root.version());

    let events: Vec<Event> = store
        .load("tickets", 1, None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(Some(2), events[1].metadata().aggregate_version());
}

#[tokio::test]
async fn stale_root_save_is_a_concurrency_error() {
    let store = new_store_with_stream("tickets").await;
    let repository = store.create_repository::<Ticket>("tickets").await;

    repository
        .save(&mut AggregateRoot::new(Ticket::open("t-1")))
        .await
        .unwrap();

    let mut fresh = repository.get("t-1").await.unwrap();
    let mut stale = repository.get("t-1").await.unwrap();

    fresh.inner_mut().comment("wins");
    repository.save(&mut fresh).await.unwrap();

    stale.inner_mut().comment("loses");
    let result = repository.save(&mut stale).await;
    assert!(matches!(
        result,
        Err(RepositoryError::Store(StoreError::Concurrency { .. }))
    ));
}

#[tokio::test]
async fn registry_bound_repository_resolves_by_type() {
    use chronicle::{EventStoreBuilder, InMemoryStore, Registry};

    let store = EventStoreBuilder::new(InMemoryStore::new())
        .with_registry(Registry::new().aggregate::<Ticket>("tickets"))
        .try_build()
        .await
        .unwrap();
    store.install().await.unwrap();
    store.create_stream("tickets").await.unwrap();

    let repository = store.repository::<Ticket>().await.unwrap();
    assert_eq!("tickets", repository.stream());

    repository
        .save(&mut AggregateRoot::new(Ticket::open("t-9")))
        .await
        .unwrap();
    assert!(repository.load("t-9").await.unwrap().is_some());
}
