// tests/index/plan_test.rs
use cubesync::index::{
    expand, AggregationGroup, ColumnChanges, ExpandOptions, IndexPlan, LayoutDiff, LayoutId,
    RuleBasedIndex, TABLE_INDEX_START_ID,
};
use cubesync::test_utils::{hierarchy_rule, sales_rule};
use insta::assert_snapshot;
use std::collections::{BTreeMap, BTreeSet};

fn materialize(plan: &mut IndexPlan, rule: &RuleBasedIndex, tombed: &[u32], type_changed: &[u32]) -> LayoutDiff {
    let specs = expand(rule, ExpandOptions::default()).unwrap();
    let tombed: BTreeSet<u32> = tombed.iter().copied().collect();
    let type_changed: BTreeSet<u32> = type_changed.iter().copied().collect();
    let renumbered = BTreeMap::new();
    let diff = plan.materialize(
        &specs,
        ColumnChanges {
            tombed: &tombed,
            type_changed: &type_changed,
            renumbered: &renumbered,
        },
    );
    plan.rule_based_index = Some(rule.clone());
    diff
}

fn plan_for(rule: &RuleBasedIndex) -> IndexPlan {
    let mut plan = IndexPlan::new("sales", "default");
    materialize(&mut plan, rule, &[], &[]);
    plan
}

fn ids(items: &[LayoutId]) -> BTreeSet<LayoutId> {
    items.iter().copied().collect()
}

#[test]
fn test_sales_rule_layout_ids() {
    let plan = plan_for(&sales_rule());
    let listing = plan
        .layouts()
        .map(|l| format!("{} {:?}{}", l.id, l.col_order, if l.base { " base" } else { "" }))
        .collect::<Vec<_>>()
        .join("\n");
    assert_snapshot!(listing, @r"
    1 [1, 100000, 100001]
    10001 [1, 4, 100000, 100001]
    20001 [1, 2, 3, 100000, 100001]
    30001 [1, 2, 3, 4, 100000, 100001]
    40001 [100000, 100001, 100004]
    50001 [14, 100000, 100001, 100004]
    60001 [14, 15, 100000, 100001, 100004]
    70001 [14, 15, 16, 100000, 100001, 100004]
    80001 [1, 2, 3, 4, 14, 15, 16, 100000, 100001, 100004] base
    ");
    assert_eq!(plan.next_aggregation_index_id, 90_000);
}

#[test]
fn test_removed_hierarchy_leaf_drops_its_layouts() {
    let mut plan = plan_for(&hierarchy_rule());
    let table_index = plan.add_table_index(vec![14, 15, 16]);
    assert_eq!(table_index, TABLE_INDEX_START_ID + 1);

    let removed = BTreeSet::from([16]);
    let pruned = hierarchy_rule().pruned(&removed);
    let diff = materialize(&mut plan, &pruned, &[16], &[]);

    assert_eq!(diff.to_remove, ids(&[30_001, 20_000_000_001]));
    assert!(diff.to_add.is_empty());
    assert!(diff.to_refresh.is_empty());
    assert_eq!(plan.layout_ids(), ids(&[1, 10_001, 20_001]));
    let base: Vec<LayoutId> = plan.layouts().filter(|l| l.base).map(|l| l.id).collect();
    assert_eq!(base, vec![20_001]);
}

#[test]
fn test_type_change_refreshes_layouts() {
    let mut plan = plan_for(&hierarchy_rule());
    let diff = materialize(&mut plan, &hierarchy_rule(), &[], &[16]);
    assert_eq!(diff.to_refresh, ids(&[30_001]));
    assert!(diff.to_add.is_empty());
    assert!(diff.to_remove.is_empty());
}

#[test]
fn test_renumbered_manual_layout_is_recreated() {
    let mut plan = IndexPlan::new("sales", "default");
    let manual = plan.add_manual_layout(&[10, 11], &[100_000]);
    assert_eq!(manual, 1);

    let tombed = BTreeSet::from([10]);
    let renumbered = BTreeMap::from([(10, 19)]);
    let diff = plan.materialize(
        &[],
        ColumnChanges {
            tombed: &tombed,
            type_changed: &BTreeSet::new(),
            renumbered: &renumbered,
        },
    );

    assert_eq!(diff.to_remove, ids(&[1]));
    assert_eq!(diff.to_add, ids(&[10_001]));
    let carried = plan.layout(10_001).unwrap();
    assert_eq!(carried.col_order, vec![19, 11, 100_000]);
    assert!(carried.manual);
}

#[test]
fn test_blacklisted_layout_stays_gone_until_its_column_dies() {
    let mut plan = plan_for(&hierarchy_rule());
    let removed = plan.blacklist(&ids(&[10_001]));
    assert_eq!(removed, ids(&[10_001]));

    let diff = materialize(&mut plan, &hierarchy_rule(), &[], &[]);
    assert!(diff.is_empty());
    assert!(plan.layout(10_001).is_none());
    assert_eq!(plan.to_be_deleted.get(&10_001), Some(&vec![14, 100_000]));

    let pruned = hierarchy_rule().pruned(&BTreeSet::from([14]));
    materialize(&mut plan, &pruned, &[14], &[]);
    assert!(plan.to_be_deleted.is_empty());
}

#[test]
fn test_manual_layout_outlives_rule_change() {
    let mut plan = plan_for(&hierarchy_rule());
    assert_eq!(plan.add_manual_layout(&[14], &[100_000]), 10_001);

    let narrower = RuleBasedIndex::new([14, 15, 16], [100_000])
        .with_group(AggregationGroup::new([14, 15, 16]).with_mandatory([14, 15]));
    let diff = materialize(&mut plan, &narrower, &[], &[]);

    assert_eq!(diff.to_remove, ids(&[1]));
    assert!(diff.to_add.is_empty());
    let kept = plan.layout(10_001).unwrap();
    assert!(kept.manual);
    assert!(!kept.auto);
}

#[test]
fn test_plan_round_trips_through_json() {
    let mut plan = plan_for(&sales_rule());
    plan.add_table_index(vec![1, 2]);
    let json = serde_json::to_string(&plan).unwrap();
    let back: IndexPlan = serde_json::from_str(&json).unwrap();
    assert_eq!(back, plan);
}
