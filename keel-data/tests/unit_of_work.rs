mod common;

use common::{init_tracing, seed, Customer, Order};
use keel_data::prelude::*;
use keel_data::{TransactionEvent, TransactionEventKind};
use std::sync::{Arc, Mutex};

fn recorder(uow: &UnitOfWork<MemoryStore>) -> Arc<Mutex<Vec<TransactionEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    uow.events().subscribe(move |event| sink.lock().unwrap().push(*event));
    seen
}

fn kinds(seen: &Arc<Mutex<Vec<TransactionEvent>>>) -> Vec<TransactionEventKind> {
    seen.lock().unwrap().iter().map(|e| e.kind).collect()
}

#[tokio::test]
async fn test_commit_persists_across_repositories() {
    init_tracing();
    let store = MemoryStore::new();
    let mut uow = UnitOfWork::new(DbContext::new(store.clone()));
    let seen = recorder(&uow);
    let customers = uow.repository::<Customer>();
    let orders = uow.repository::<Order>();

    let id = uow.begin().await.unwrap();
    assert!(uow.is_active());
    let customer = customers.add(Customer::new("alice", "Lyon", 31)).unwrap();
    orders.add(Order::new(customer.id, 99)).unwrap();
    uow.commit().await.unwrap();

    assert!(!uow.is_active());
    assert_eq!(store.len("customers"), 1);
    assert_eq!(store.len("orders"), 1);
    assert_eq!(
        kinds(&seen),
        vec![TransactionEventKind::Started, TransactionEventKind::Committed]
    );
    assert!(seen.lock().unwrap().iter().all(|e| e.transaction_id == id));
}

#[tokio::test]
async fn test_failed_commit_rolls_back_every_write() {
    let store = MemoryStore::new();
    let mut uow = UnitOfWork::new(DbContext::new(store.clone()));
    let seen = recorder(&uow);
    let customers = uow.repository::<Customer>();
    let orders = uow.repository::<Order>();

    uow.begin().await.unwrap();
    let parent = customers.add(Customer::new("bob", "Paris", 45)).unwrap();
    assert!(customers.save().await.unwrap().succeeded());
    assert_eq!(customers.count(None).await.unwrap(), 1);
    // not committed yet
    assert!(store.is_empty("customers"));

    // the child points at a customer that does not exist
    orders.add(Order::new(uuid::Uuid::new_v4(), 1)).unwrap();
    let err = uow.commit().await.unwrap_err();
    assert!(matches!(err, DataError::Constraint(_)));

    assert!(!uow.is_active());
    assert!(store.is_empty("customers"));
    assert!(store.is_empty("orders"));
    assert!(!uow.context().has_changes());
    assert!(customers.get_by_id(parent.id).await.unwrap().is_none());
    assert_eq!(
        kinds(&seen),
        vec![TransactionEventKind::Started, TransactionEventKind::RolledBack]
    );
}

#[tokio::test]
async fn test_explicit_rollback_discards_saved_changes() {
    let store = MemoryStore::new();
    let mut uow = UnitOfWork::new(DbContext::new(store.clone()));
    let customers = uow.repository::<Customer>();

    uow.begin().await.unwrap();
    customers.add(Customer::new("carol", "Lyon", 27)).unwrap();
    customers.save().await.unwrap();
    uow.rollback().await.unwrap();

    assert!(store.is_empty("customers"));
    assert!(!store.in_transaction());
}

#[tokio::test]
async fn test_state_machine_errors() {
    let store = MemoryStore::new();
    let mut uow = UnitOfWork::new(DbContext::new(store));
    let seen = recorder(&uow);

    assert!(matches!(uow.commit().await, Err(DataError::NoActiveTransaction)));
    // rollback while idle is a no-op
    uow.rollback().await.unwrap();
    assert!(seen.lock().unwrap().is_empty());

    uow.begin().await.unwrap();
    assert!(matches!(uow.begin().await, Err(DataError::AlreadyActive)));
    uow.commit().await.unwrap();
    uow.begin().await.unwrap();
    uow.rollback().await.unwrap();

    assert_eq!(
        kinds(&seen),
        vec![
            TransactionEventKind::Started,
            TransactionEventKind::Committed,
            TransactionEventKind::Started,
            TransactionEventKind::RolledBack,
        ]
    );
}

#[tokio::test]
async fn test_dispose_rolls_back_silently() {
    let store = MemoryStore::new();
    let mut uow = UnitOfWork::new(DbContext::new(store.clone()));
    let seen = recorder(&uow);
    let customers = uow.repository::<Customer>();

    uow.begin().await.unwrap();
    customers.add(Customer::new("dave", "Lyon", 52)).unwrap();
    customers.save().await.unwrap();
    uow.dispose().await;
    uow.dispose().await;

    assert!(store.is_empty("customers"));
    assert_eq!(kinds(&seen), vec![TransactionEventKind::Started]);
    assert!(uow.is_disposed());
    assert!(matches!(uow.begin().await, Err(DataError::Disposed)));
    assert!(matches!(uow.commit().await, Err(DataError::Disposed)));
    assert!(matches!(uow.rollback().await, Err(DataError::Disposed)));
    assert!(matches!(customers.get_all().await, Err(DataError::Disposed)));
}

#[tokio::test]
async fn test_drop_releases_the_transaction() {
    let store = MemoryStore::new();
    let context;
    {
        let mut uow = UnitOfWork::new(DbContext::new(store.clone()));
        context = uow.context().clone();
        let customers = uow.repository::<Customer>();
        uow.begin().await.unwrap();
        customers.add(Customer::new("erin", "Nice", 38)).unwrap();
        customers.save().await.unwrap();
    }
    assert!(!store.in_transaction());
    assert!(store.is_empty("customers"));
    assert!(context.is_disposed());
}

#[tokio::test]
async fn test_reads_inside_transaction_see_saved_rows() {
    let store = MemoryStore::new();
    seed(&store, &[Customer::new("fay", "Lyon", 30)]).await;
    let mut uow = UnitOfWork::new(DbContext::new(store.clone()));
    let customers = uow.repository::<Customer>();

    uow.begin().await.unwrap();
    customers.add(Customer::new("gus", "Lyon", 40)).unwrap();
    customers.save().await.unwrap();
    let mut spec = customers.create_specification();
    spec.and(Customer::CITY.eq("Lyon"));
    assert_eq!(customers.list(&spec).await.unwrap().len(), 2);
    uow.rollback().await.unwrap();
    assert_eq!(customers.list(&spec).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rollback_keeps_writes_of_other_contexts() {
    let store = MemoryStore::new();
    let mut uow = UnitOfWork::new(DbContext::new(store.clone()));
    let inside = uow.repository::<Customer>();
    let outside = Repository::<Customer, _>::new(DbContext::new(store.clone()).into_shared());

    uow.begin().await.unwrap();
    inside.add(Customer::new("hal", "Lyon", 61)).unwrap();
    assert!(inside.save().await.unwrap().succeeded());
    let bob = outside.add(Customer::new("bob", "Paris", 45)).unwrap();
    assert!(outside.save().await.unwrap().succeeded());
    uow.rollback().await.unwrap();

    assert_eq!(store.len("customers"), 1);
    assert_eq!(outside.get_by_id(bob.id).await.unwrap(), Some(bob));
}

#[tokio::test]
async fn test_uncommitted_writes_stay_inside_the_transaction() {
    let store = MemoryStore::new();
    let mut uow = UnitOfWork::new(DbContext::new(store.clone()));
    let inside = uow.repository::<Customer>();
    let outside = Repository::<Customer, _>::new(DbContext::new(store.clone()).into_shared());

    uow.begin().await.unwrap();
    let ida = inside.add(Customer::new("ida", "Nice", 29)).unwrap();
    assert!(inside.save().await.unwrap().succeeded());
    assert!(outside.get_by_id(ida.id).await.unwrap().is_none());
    assert_eq!(outside.count(None).await.unwrap(), 0);

    uow.commit().await.unwrap();
    assert_eq!(outside.get_by_id(ida.id).await.unwrap(), Some(ida));
}

#[tokio::test]
async fn test_concurrent_units_of_work_commit_independently() {
    let store = MemoryStore::new();
    let mut first = UnitOfWork::new(DbContext::new(store.clone()));
    let mut second = UnitOfWork::new(DbContext::new(store.clone()));

    first.begin().await.unwrap();
    second.begin().await.unwrap();
    first
        .repository::<Customer>()
        .add(Customer::new("jo", "Lyon", 33))
        .unwrap();
    second
        .repository::<Customer>()
        .add(Customer::new("kim", "Paris", 41))
        .unwrap();
    first.commit().await.unwrap();
    second.rollback().await.unwrap();

    assert_eq!(store.len("customers"), 1);
    assert!(!store.in_transaction());
}
