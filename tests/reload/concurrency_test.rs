// tests/reload/concurrency_test.rs
//
// Writers racing on the same model through the optimistic store.
use cubesync::config::Settings;
use cubesync::events::ChannelEventSink;
use cubesync::index::{LayoutId, INDEX_ID_STEP, TABLE_INDEX_START_ID};
use cubesync::manager::ModelManager;
use cubesync::model::BrokenReason;
use cubesync::reload::Reconciler;
use cubesync::store::InMemoryStore;
use cubesync::test_utils::{
    country_table, hierarchy_rule, init_test_logging, sales_model, sales_store, without_column,
    PROJECT,
};
use std::collections::BTreeSet;
use std::sync::Arc;

fn patient_settings() -> Settings {
    let mut settings = Settings::default();
    settings.store.max_retries = 50;
    settings
}

fn setup(settings: Settings) -> (Arc<InMemoryStore>, ModelManager<InMemoryStore>, String) {
    init_test_logging();
    let (store, manager) = sales_store(settings);
    let id = manager
        .create_model(&sales_model("sales"), Some(hierarchy_rule()))
        .unwrap()
        .model
        .id;
    (store, manager, id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_table_indexes_get_distinct_ids() {
    let (_store, manager, id) = setup(patient_settings());
    let manager = Arc::new(manager);
    let orders: Vec<Vec<u32>> = vec![
        vec![14],
        vec![15],
        vec![16],
        vec![14, 15],
        vec![15, 16],
        vec![14, 16],
        vec![16, 14],
        vec![1, 2],
    ];

    let mut handles = Vec::new();
    for order in orders.clone() {
        let manager = manager.clone();
        let id = id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            manager.add_table_index(PROJECT, &id, order)
        }));
    }
    let mut added = BTreeSet::new();
    for handle in handles {
        added.insert(handle.await.unwrap().unwrap());
    }

    // each table index gets its own index id, holding one layout
    let expected: BTreeSet<LayoutId> = (0..8)
        .map(|n| TABLE_INDEX_START_ID + n * INDEX_ID_STEP + 1)
        .collect();
    assert_eq!(added, expected);

    let plan = manager.get_plan(PROJECT, &id).unwrap();
    let stored: BTreeSet<Vec<u32>> = plan
        .layouts()
        .filter(|l| l.is_table_index())
        .map(|l| l.col_order.clone())
        .collect();
    assert_eq!(stored, orders.into_iter().collect());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_breakers_emit_one_event() {
    let (events, mut published) = ChannelEventSink::new();
    let (_store, manager, id) = setup(patient_settings());
    let manager = Arc::new(manager.with_events(Arc::new(events)));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        let id = id.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            manager.mark_broken(PROJECT, &id, BrokenReason::Event)
        }));
    }
    for handle in handles {
        let model = handle.await.unwrap().unwrap();
        assert_eq!(model.reason(), BrokenReason::Event);
    }

    let first = published.recv().await.unwrap();
    assert_eq!(first.model_id, id);
    assert!(published.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reload_racing_with_plan_edit() {
    let (store, manager, id) = setup(patient_settings());
    let manager = Arc::new(manager);
    let reconciler = Reconciler::new(store.clone(), patient_settings());

    let reload = tokio::task::spawn_blocking(move || {
        reconciler.reload_from_store(PROJECT, without_column(&country_table(), "latitude"))
    });
    let edit = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || manager.add_table_index(PROJECT, &id, vec![14, 15]))
    };
    reload.await.unwrap().unwrap();
    let table_index = edit.await.unwrap().unwrap();

    let plan = manager.get_plan(PROJECT, &id).unwrap();
    assert_eq!(plan.layout(table_index).unwrap().col_order, vec![14, 15]);
    assert!(plan.layouts().all(|l| !l.col_order.contains(&16)));
    assert!(manager
        .get_model(PROJECT, &id)
        .unwrap()
        .measure(100_004)
        .unwrap()
        .tomb);
}
