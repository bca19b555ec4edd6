// tests/reload/repair_test.rs
use cubesync::config::Settings;
use cubesync::dataflow::{RealizationStatus, SegmentRange};
use cubesync::error::CubeError;
use cubesync::index::RuleBasedIndex;
use cubesync::jobs::{ChannelJobSubmitter, JobKind};
use cubesync::manager::ModelManager;
use cubesync::model::{BrokenReason, ColumnStatus, JoinTableDesc, Model};
use cubesync::reload::{ModelRepair, Reconciler, ReloadOutcome, RepairError};
use cubesync::store::InMemoryStore;
use cubesync::test_utils::{
    country_table, fact_table, hierarchy_rule, init_test_logging, sales_model, sales_rule,
    sales_store, without_column, ACCOUNT, COUNTRY, PROJECT,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn setup(rule: RuleBasedIndex) -> (Arc<InMemoryStore>, ModelManager<InMemoryStore>, String) {
    init_test_logging();
    let (store, manager) = sales_store(Settings::default());
    let id = manager
        .create_model(&sales_model("sales"), Some(rule))
        .unwrap()
        .model
        .id;
    (store, manager, id)
}

fn joins(seller_key: &str, country_table: &str) -> Vec<JoinTableDesc> {
    vec![
        JoinTableDesc::new(ACCOUNT, "SELLER_ACCOUNT", &[seller_key], &["SELLER_ACCOUNT.ACCOUNT_ID"]),
        JoinTableDesc::new(
            country_table,
            "SELLER_COUNTRY",
            &["SELLER_ACCOUNT.ACCOUNT_COUNTRY"],
            &["SELLER_COUNTRY.COUNTRY"],
        ),
    ]
}

/// Reload the fact table without SELLER_ID, breaking the seller join.
fn break_seller_join(store: &Arc<InMemoryStore>, model_id: &str) {
    let report = Reconciler::new(store.clone(), Settings::default())
        .reload_from_store(PROJECT, without_column(&fact_table(), "seller_id"))
        .unwrap();
    assert!(matches!(
        report.model(model_id).unwrap().outcome,
        ReloadOutcome::Broken { .. }
    ));
}

#[test]
fn test_failed_repair_persists_nothing() {
    let (store, manager, id) = setup(hierarchy_rule());
    break_seller_join(&store, &id);
    let before: Model = manager.get_model(PROJECT, &id).unwrap();

    let fix = ModelRepair::default().with_filter("TEST_KYLIN_FACT.PRICE > 0");
    let err = Reconciler::new(store.clone(), Settings::default())
        .repair(PROJECT, &id, &fix)
        .unwrap_err();
    match err {
        CubeError::Repair(RepairError::Unresolved { reason, detail }) => {
            assert_eq!(reason, BrokenReason::Schema);
            assert!(detail.contains("SELLER_ID"), "{detail}");
        }
        other => panic!("expected unresolved repair, got {other:?}"),
    }
    assert_eq!(manager.get_model(PROJECT, &id).unwrap(), before);
}

#[test]
fn test_repair_with_new_join_key() {
    let (store, manager, id) = setup(hierarchy_rule());
    break_seller_join(&store, &id);
    let layouts = manager.get_plan(PROJECT, &id).unwrap().layout_ids();

    let (jobs, mut submitted) = ChannelJobSubmitter::new();
    let fix = ModelRepair::default().with_joins(joins("TEST_KYLIN_FACT.BUYER_ID", COUNTRY));
    let repaired = Reconciler::new(store.clone(), Settings::default())
        .with_jobs(Arc::new(jobs))
        .repair(PROJECT, &id, &fix)
        .unwrap();

    assert!(!repaired.is_broken());
    assert_eq!(repaired.named_column(6).unwrap().status, ColumnStatus::Tomb);
    assert!(repaired.measure(100_003).unwrap().tomb);
    // nothing moved tables, so nothing was re-created
    assert_eq!(repaired.next_column_id(), 19);

    let dataflow = manager.get_dataflow(PROJECT, &id).unwrap();
    assert_eq!(dataflow.status, RealizationStatus::Online);
    assert_eq!(dataflow.segments.len(), 1);
    assert_eq!(dataflow.segments[0].range, SegmentRange::FULL);

    let job = submitted.try_recv().unwrap();
    assert_eq!(job.request.kind, JobKind::IndexBuild);
    assert_eq!(job.request.layouts, layouts);
}

#[test]
fn test_retabled_alias_renumbers_columns_and_measures() {
    let (store, manager, id) = setup(sales_rule());
    let mut v2 = country_table();
    v2.name = "TEST_COUNTRY_V2".to_string();
    manager.save_tables(PROJECT, &[v2]).unwrap();
    manager.mark_broken(PROJECT, &id, BrokenReason::Event).unwrap();

    let fix = ModelRepair::default().with_joins(joins(
        "TEST_KYLIN_FACT.SELLER_ID",
        "DEFAULT.TEST_COUNTRY_V2",
    ));
    let repaired = Reconciler::new(store.clone(), Settings::default())
        .repair(PROJECT, &id, &fix)
        .unwrap();

    let new_ids: BTreeMap<&str, u32> = [14, 15, 16, 17]
        .into_iter()
        .map(|old| {
            let name = repaired.named_column(old).unwrap().name.as_str();
            let live = repaired
                .all_named_columns
                .iter()
                .find(|c| c.name == name && c.is_live())
                .unwrap();
            (name, live.id)
        })
        .collect();
    assert_eq!(
        new_ids,
        BTreeMap::from([("COUNTRY", 19), ("COUNTRY_NAME", 20), ("LATITUDE", 21), ("LONGITUDE", 22)])
    );
    assert_eq!(repaired.named_column(19).unwrap().status, ColumnStatus::Dimension);
    assert_eq!(repaired.named_column(22).unwrap().status, ColumnStatus::Exist);
    assert!(repaired.measure(100_004).unwrap().tomb);
    let moved = repaired.measure(100_006).unwrap();
    assert_eq!(moved.name, "MAX_LATITUDE");
    assert!(!moved.tomb);

    let plan = manager.get_plan(PROJECT, &id).unwrap();
    let rule = plan.rule_based_index.clone().unwrap();
    assert_eq!(rule.dimensions, vec![1, 2, 3, 4, 19, 20, 21]);
    assert_eq!(rule.measures, vec![100_000, 100_001, 100_006]);
    // the calendar group is untouched, every country layout is rebuilt
    for kept in [1, 10_001, 20_001, 30_001] {
        assert!(plan.layout(kept).is_some(), "layout {kept} should survive");
    }
    for gone in [40_001, 50_001, 60_001, 70_001, 80_001] {
        assert!(plan.layout(gone).is_none(), "layout {gone} should be gone");
    }
    assert_eq!(plan.layouts().count(), 9);
    assert!(plan
        .layouts()
        .all(|l| !l.col_order.iter().any(|c| [14, 15, 16, 17, 100_004].contains(c))));
}

#[test]
fn test_repair_can_clear_filter() {
    let (store, manager, id) = setup(hierarchy_rule());
    let mut model = manager.get_model(PROJECT, &id).unwrap();
    model.filter_condition = Some("TEST_KYLIN_FACT.PRICE > 0".to_string());
    manager.update_model(&model).unwrap();
    manager.mark_broken(PROJECT, &id, BrokenReason::Event).unwrap();

    let repaired = Reconciler::new(store.clone(), Settings::default())
        .repair(PROJECT, &id, &ModelRepair::default().with_filter("  "))
        .unwrap();
    assert!(repaired.filter_condition.is_none());
    assert_eq!(repaired.reason(), BrokenReason::None);
    assert_eq!(repaired.join_tables, manager.get_model(PROJECT, &id).unwrap().join_tables);
}

#[test]
fn test_healthy_model_cannot_be_repaired() {
    let (store, _manager, id) = setup(hierarchy_rule());
    let err = Reconciler::new(store, Settings::default())
        .repair(PROJECT, &id, &ModelRepair::default())
        .unwrap_err();
    assert!(
        matches!(err, CubeError::Repair(RepairError::NotBroken { .. })),
        "{err:?}"
    );
}

#[test]
fn test_repair_of_unknown_model_is_not_found() {
    let (store, _manager, _id) = setup(hierarchy_rule());
    let err = Reconciler::new(store, Settings::default())
        .repair(PROJECT, "no-such-model", &ModelRepair::default())
        .unwrap_err();
    assert!(matches!(err, CubeError::NotFound { .. }), "{err:?}");
}
