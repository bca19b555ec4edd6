// tests/reload/reload_test.rs
use cubesync::config::Settings;
use cubesync::dataflow::{Dataflow, RealizationStatus, Segment, SegmentRange, SegmentStatus};
use cubesync::error::CubeError;
use cubesync::events::ChannelEventSink;
use cubesync::index::{AggregationGroup, IndexPlan, LayoutId, RuleBasedIndex};
use cubesync::jobs::{ChannelJobSubmitter, JobKind};
use cubesync::manager::ModelManager;
use cubesync::model::{BrokenReason, ColumnStatus, DataType, FunctionKind, Model, TableDesc};
use cubesync::reload::{Reconciler, ReloadOutcome};
use cubesync::store::{InMemoryStore, MetadataStoreExt};
use cubesync::test_utils::{
    account_table, country_table, fact_table, hierarchy_rule, init_test_logging, sales_model,
    sales_rule, sales_skeleton, sales_store, with_type, without_column, ACCOUNT, FACT, PROJECT,
};
use std::collections::BTreeSet;
use std::sync::Arc;

struct Fixture {
    store: Arc<InMemoryStore>,
    manager: ModelManager<InMemoryStore>,
    model_id: String,
}

impl Fixture {
    fn new(model: Model, rule: Option<RuleBasedIndex>) -> Self {
        init_test_logging();
        let (store, manager) = sales_store(Settings::default());
        let model_id = manager.create_model(&model, rule).unwrap().model.id;
        Self {
            store,
            manager,
            model_id,
        }
    }

    fn reconciler(&self) -> Reconciler<InMemoryStore> {
        Reconciler::new(self.store.clone(), Settings::default())
    }

    fn model(&self) -> Model {
        self.manager.get_model(PROJECT, &self.model_id).unwrap()
    }

    fn plan(&self) -> IndexPlan {
        self.manager.get_plan(PROJECT, &self.model_id).unwrap()
    }

    fn dataflow(&self) -> Dataflow {
        self.manager.get_dataflow(PROJECT, &self.model_id).unwrap()
    }

    fn add_ready_segment(&self, layouts: &[LayoutId]) {
        self.store
            .update::<Dataflow>(PROJECT, &self.model_id, 3, |mut dataflow| {
                let mut segment = Segment::ready(SegmentRange::new(0, 1_000));
                for layout in layouts {
                    segment = segment.with_layout(*layout, 10);
                }
                dataflow.segments.push(segment);
                Ok(dataflow)
            })
            .unwrap();
    }
}

fn ids(items: &[LayoutId]) -> BTreeSet<LayoutId> {
    items.iter().copied().collect()
}

#[test]
fn test_removed_hierarchy_leaf() {
    let fixture = Fixture::new(sales_model("sales"), Some(hierarchy_rule()));
    fixture
        .manager
        .add_table_index(PROJECT, &fixture.model_id, vec![14, 15, 16])
        .unwrap();
    assert_eq!(
        fixture.plan().layout_ids(),
        ids(&[1, 10_001, 20_001, 30_001, 20_000_000_001])
    );

    let report = fixture
        .reconciler()
        .reload(PROJECT, &country_table(), without_column(&country_table(), "latitude"))
        .unwrap();

    let model_report = report.model(&fixture.model_id).unwrap();
    assert_eq!(model_report.outcome, ReloadOutcome::Modified);
    assert_eq!(model_report.tombed_columns, BTreeSet::from([16]));
    assert_eq!(model_report.tombed_measures, BTreeSet::from([100_004]));
    assert_eq!(model_report.layouts.to_remove, ids(&[30_001, 20_000_000_001]));
    assert!(model_report.layouts.to_add.is_empty());
    assert!(model_report.layouts.to_refresh.is_empty());

    let plan = fixture.plan();
    assert_eq!(plan.layout_ids(), ids(&[1, 10_001, 20_001]));
    assert!(plan.layout(20_001).unwrap().base);
    let rule = plan.rule_based_index.unwrap();
    assert_eq!(rule.dimensions, vec![14, 15]);

    let model = fixture.model();
    assert_eq!(model.named_column(16).unwrap().status, ColumnStatus::Tomb);
    assert!(model.measure(100_004).unwrap().tomb);
    assert!(!model.is_broken());
}

#[test]
fn test_removed_column_cascades_through_computed_column() {
    let fixture = Fixture::new(sales_model("sales"), Some(sales_rule()));
    let before = fixture.plan().layout_ids();

    let report = fixture
        .reconciler()
        .reload_from_store(PROJECT, without_column(&fact_table(), "price"))
        .unwrap();

    assert_eq!(report.diff.removed, vec!["PRICE".to_string()]);
    let model_report = report.model(&fixture.model_id).unwrap();
    assert_eq!(model_report.outcome, ReloadOutcome::Modified);
    assert_eq!(
        model_report.dropped_computed_columns,
        vec!["TEST_KYLIN_FACT.DEAL_AMOUNT".to_string()]
    );
    assert_eq!(model_report.tombed_columns, BTreeSet::from([8, 18]));
    assert_eq!(model_report.tombed_measures, BTreeSet::from([100_001, 100_005]));
    assert_eq!(model_report.layouts.to_remove, before);
    assert_eq!(model_report.layouts.to_add.len(), 9);

    let model = fixture.model();
    assert!(model.computed_columns.is_empty());
    let plan = fixture.plan();
    assert!(plan.layouts().all(|l| !l.col_order.contains(&100_001)));
    assert!(plan.layout_ids().is_disjoint(&before));
}

#[test]
fn test_removed_column_is_tombed_under_every_alias() {
    let model = sales_skeleton("two_accounts")
        .join(
            ACCOUNT,
            "BUYER_ACCOUNT",
            &["TEST_KYLIN_FACT.BUYER_ID"],
            &["BUYER_ACCOUNT.ACCOUNT_ID"],
        )
        .dimension("CAL_DT", "TEST_KYLIN_FACT.CAL_DT")
        .dimension("SELLER_LEVEL", "SELLER_ACCOUNT.ACCOUNT_BUYER_LEVEL")
        .dimension("BUYER_LEVEL", "BUYER_ACCOUNT.ACCOUNT_BUYER_LEVEL")
        .dimension("BUYER_COUNTRY", "BUYER_ACCOUNT.ACCOUNT_COUNTRY")
        .measure("COUNT_ALL", FunctionKind::Count, None)
        .build();
    let fixture = Fixture::new(model, None);

    let report = fixture
        .reconciler()
        .reload_from_store(PROJECT, without_column(&account_table(), "account_buyer_level"))
        .unwrap();

    let model_report = report.model(&fixture.model_id).unwrap();
    assert_eq!(model_report.tombed_columns, BTreeSet::from([1, 2]));
    assert_eq!(fixture.model().live_column_ids(), BTreeSet::from([0, 3]));
}

#[test]
fn test_unchanged_schema_keeps_snapshot_and_is_idempotent() {
    let fixture = Fixture::new(sales_model("sales"), Some(hierarchy_rule()));
    let mut snapshotted = fact_table();
    snapshotted.last_snapshot_path = Some("/snapshots/test_kylin_fact/1".to_string());
    fixture.manager.save_tables(PROJECT, &[snapshotted]).unwrap();

    let mut commented = fact_table();
    commented.columns[8].comment = Some("unit price".to_string());
    let report = fixture
        .reconciler()
        .reload_from_store(PROJECT, commented.clone())
        .unwrap();
    assert!(report.models.is_empty());
    assert_eq!(report.diff.comment_changed, vec!["PRICE".to_string()]);

    let stored: TableDesc = fixture.store.get(PROJECT, FACT).unwrap().unwrap();
    assert_eq!(
        stored.last_snapshot_path.as_deref(),
        Some("/snapshots/test_kylin_fact/1")
    );
    assert_eq!(stored.columns[8].comment.as_deref(), Some("unit price"));

    let again = fixture
        .reconciler()
        .reload_from_store(PROJECT, commented.clone())
        .unwrap();
    assert!(again.models.is_empty());
    let unchanged: TableDesc = fixture.store.get(PROJECT, FACT).unwrap().unwrap();
    assert_eq!(unchanged.mvcc, stored.mvcc);

    let widened = commented.with_column("discount", DataType::Double);
    let report = fixture
        .reconciler()
        .reload_from_store(PROJECT, widened)
        .unwrap();
    assert_eq!(report.diff.added, vec!["DISCOUNT".to_string()]);
    assert_eq!(
        report.model(&fixture.model_id).unwrap().outcome,
        ReloadOutcome::Unchanged
    );
    let reloaded: TableDesc = fixture.store.get(PROJECT, FACT).unwrap().unwrap();
    assert!(reloaded.last_snapshot_path.is_none());
    assert_eq!(fixture.model().mvcc, 0);
}

#[test]
fn test_type_change_refreshes_layouts_and_rederives_measure() {
    let rule = RuleBasedIndex::new([1], [100_000, 100_002]).with_group(AggregationGroup::new([1]));
    let fixture = Fixture::new(sales_model("sales"), Some(rule));
    fixture.add_ready_segment(&[1, 10_001]);

    let (jobs, mut submitted) = ChannelJobSubmitter::new();
    let reconciler = fixture.reconciler().with_jobs(Arc::new(jobs));
    let report = reconciler
        .reload_from_store(PROJECT, with_type(&fact_table(), "item_count", DataType::BigInt))
        .unwrap();

    let model_report = report.model(&fixture.model_id).unwrap();
    assert_eq!(model_report.outcome, ReloadOutcome::Modified);
    assert!(model_report.tombed_measures.is_empty());
    assert_eq!(model_report.layouts.to_refresh, ids(&[1, 10_001]));
    assert!(model_report.layouts.to_remove.is_empty());

    let job = submitted.try_recv().unwrap();
    assert_eq!(job.request.kind, JobKind::IndexRefresh);
    assert_eq!(job.request.layouts, ids(&[1, 10_001]));
    assert!(submitted.try_recv().is_err());
    assert_eq!(report.jobs, vec![job.id]);

    let measure = fixture.model().measure(100_002).cloned().unwrap();
    assert_eq!(
        measure.function.return_type,
        FunctionKind::Sum.derive_return_type(&DataType::BigInt, "bigint")
    );
}

#[test]
fn test_type_change_tombs_incompatible_measure() {
    let fixture = Fixture::new(sales_model("sales"), Some(hierarchy_rule()));

    let report = fixture
        .reconciler()
        .reload_from_store(PROJECT, with_type(&country_table(), "latitude", DataType::Boolean))
        .unwrap();

    let model_report = report.model(&fixture.model_id).unwrap();
    assert_eq!(model_report.tombed_measures, BTreeSet::from([100_004]));
    assert!(model_report.tombed_columns.is_empty());
    assert_eq!(model_report.layouts.to_refresh, ids(&[30_001]));
    assert!(fixture.model().measure(100_004).unwrap().tomb);
}

#[test]
fn test_retyped_sum_argument_tombs_measure() {
    let model = sales_skeleton("site_sum")
        .dimension("CAL_DT", "TEST_KYLIN_FACT.CAL_DT")
        .column("LSTG_SITE_ID", "TEST_KYLIN_FACT.LSTG_SITE_ID")
        .measure("COUNT_ALL", FunctionKind::Count, None)
        .measure("SITE_SUM", FunctionKind::Sum, Some("TEST_KYLIN_FACT.LSTG_SITE_ID"))
        .build();
    let rule = RuleBasedIndex::new([0], [100_000, 100_001]).with_group(AggregationGroup::new([0]));
    let fixture = Fixture::new(model, Some(rule));
    fixture.add_ready_segment(&fixture.plan().layout_ids().into_iter().collect::<Vec<_>>());

    let report = fixture
        .reconciler()
        .reload_from_store(
            PROJECT,
            with_type(&fact_table(), "lstg_site_id", DataType::Varchar(20)),
        )
        .unwrap();

    let model_report = report.model(&fixture.model_id).unwrap();
    assert_eq!(model_report.outcome, ReloadOutcome::Modified);
    assert_eq!(model_report.tombed_measures, BTreeSet::from([100_001]));
    assert!(model_report.tombed_columns.is_empty());
    assert!(report.events.is_empty());

    let model = fixture.model();
    assert!(!model.is_broken());
    assert!(model.measure(100_001).unwrap().tomb);
    assert_eq!(model.named_column(1).unwrap().status, ColumnStatus::Exist);
    assert!(fixture
        .plan()
        .layouts()
        .all(|l| !l.col_order.contains(&100_001)));
    let dataflow = fixture.dataflow();
    assert_eq!(dataflow.status, RealizationStatus::Online);
    assert!(dataflow.has_segments());
}

#[test]
fn test_computed_column_without_inferable_type_is_dropped() {
    let rule = RuleBasedIndex::new([1], [100_000, 100_002, 100_005])
        .with_group(AggregationGroup::new([1]));
    let fixture = Fixture::new(sales_model("sales"), Some(rule));

    // PRICE * ITEM_COUNT has no type once ITEM_COUNT is text
    let report = fixture
        .reconciler()
        .reload_from_store(
            PROJECT,
            with_type(&fact_table(), "item_count", DataType::Varchar(20)),
        )
        .unwrap();

    let model_report = report.model(&fixture.model_id).unwrap();
    assert_eq!(model_report.outcome, ReloadOutcome::Modified);
    assert_eq!(
        model_report.dropped_computed_columns,
        vec!["TEST_KYLIN_FACT.DEAL_AMOUNT".to_string()]
    );
    assert_eq!(model_report.tombed_columns, BTreeSet::from([18]));
    assert_eq!(model_report.tombed_measures, BTreeSet::from([100_002, 100_005]));

    let model = fixture.model();
    assert!(!model.is_broken());
    assert!(model.computed_columns.is_empty());
    assert_eq!(model.named_column(9).unwrap().status, ColumnStatus::Exist);
    let plan = fixture.plan();
    assert_eq!(plan.rule_based_index.clone().unwrap().measures, vec![100_000]);
    assert!(plan
        .layouts()
        .all(|l| !l.col_order.iter().any(|c| [18, 100_002, 100_005].contains(c))));
}

#[test]
fn test_broken_model_keeps_structure_then_heals() {
    let mut model = sales_model("sales");
    model.filter_condition = Some("TEST_KYLIN_FACT.PRICE > 0".to_string());
    let fixture = Fixture::new(model, Some(hierarchy_rule()));
    fixture.add_ready_segment(&[1]);
    let layouts = fixture.plan().layout_ids();

    let (events, mut published) = ChannelEventSink::new();
    let (jobs, mut submitted) = ChannelJobSubmitter::new();
    let reconciler = fixture
        .reconciler()
        .with_events(Arc::new(events))
        .with_jobs(Arc::new(jobs));

    // price disappears: the computed column would go, but the filter breaks
    let report = reconciler
        .reload_from_store(PROJECT, without_column(&fact_table(), "price"))
        .unwrap();
    let model_report = report.model(&fixture.model_id).unwrap();
    match &model_report.outcome {
        ReloadOutcome::Broken { detail } => assert!(detail.contains("filter condition"), "{detail}"),
        other => panic!("expected broken, got {other:?}"),
    }
    assert_eq!(report.events.len(), 1);

    let broken = fixture.model();
    assert!(broken.is_broken());
    assert_eq!(broken.reason(), BrokenReason::Schema);
    assert_eq!(broken.computed_columns.len(), 1);
    assert_eq!(broken.named_column(8).unwrap().status, ColumnStatus::Exist);
    assert_eq!(fixture.plan().layout_ids(), layouts);
    let dataflow = fixture.dataflow();
    assert_eq!(dataflow.status, RealizationStatus::Broken);
    assert!(dataflow.segments.is_empty());

    let event = published.try_recv().unwrap();
    assert_eq!(event.model_id, fixture.model_id);
    assert_eq!(event.reason, BrokenReason::Schema);

    // still missing: no second event
    let report = reconciler
        .reload_from_store(
            PROJECT,
            without_column(&fact_table(), "price").with_column("discount", DataType::Double),
        )
        .unwrap();
    assert_eq!(
        report.model(&fixture.model_id).unwrap().outcome,
        ReloadOutcome::StillBroken
    );
    assert!(published.try_recv().is_err());

    // price comes back
    let report = reconciler.reload_from_store(PROJECT, fact_table()).unwrap();
    assert_eq!(
        report.model(&fixture.model_id).unwrap().outcome,
        ReloadOutcome::Healed
    );
    let healed = fixture.model();
    assert!(!healed.is_broken());
    assert_eq!(healed.reason(), BrokenReason::None);
    let dataflow = fixture.dataflow();
    assert_eq!(dataflow.status, RealizationStatus::Online);
    assert_eq!(dataflow.segments.len(), 1);
    assert_eq!(dataflow.segments[0].range, SegmentRange::FULL);
    assert_eq!(dataflow.segments[0].status, SegmentStatus::New);

    let job = submitted.try_recv().unwrap();
    assert_eq!(job.request.kind, JobKind::IndexBuild);
    assert_eq!(job.request.layouts, layouts);
}

#[test]
fn test_model_broken_for_other_reason_is_left_alone() {
    let fixture = Fixture::new(sales_model("sales"), Some(hierarchy_rule()));
    fixture
        .manager
        .mark_broken(PROJECT, &fixture.model_id, BrokenReason::Event)
        .unwrap();
    let before = fixture.model();

    let report = fixture
        .reconciler()
        .reload_from_store(PROJECT, without_column(&country_table(), "latitude"))
        .unwrap();

    assert_eq!(
        report.model(&fixture.model_id).unwrap().outcome,
        ReloadOutcome::StillBroken
    );
    assert_eq!(fixture.model(), before);
}

#[test]
fn test_jobs_can_be_switched_off() {
    let fixture = Fixture::new(sales_model("sales"), Some(hierarchy_rule()));
    fixture.add_ready_segment(&[1]);
    let mut settings = Settings::default();
    settings.reload.submit_jobs = false;
    let (jobs, mut submitted) = ChannelJobSubmitter::new();
    let reconciler = Reconciler::new(fixture.store.clone(), settings).with_jobs(Arc::new(jobs));

    let report = reconciler
        .reload_from_store(PROJECT, with_type(&country_table(), "latitude", DataType::Float))
        .unwrap();
    assert!(!report.model(&fixture.model_id).unwrap().layouts.to_refresh.is_empty());
    assert!(report.jobs.is_empty());
    assert!(submitted.try_recv().is_err());
}

#[test]
fn test_reload_of_unknown_table_fails() {
    let fixture = Fixture::new(sales_model("sales"), None);
    let stranger = TableDesc::new(PROJECT, "default", "nowhere");
    let err = fixture
        .reconciler()
        .reload_from_store(PROJECT, stranger)
        .unwrap_err();
    assert!(matches!(err, CubeError::NotFound { .. }), "{err:?}");
}
