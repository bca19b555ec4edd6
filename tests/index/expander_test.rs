// tests/index/expander_test.rs
use cubesync::config::LayoutSettings;
use cubesync::index::{expand, AggregationGroup, ExpandOptions, LayoutSpec, RuleBasedIndex, RuleError};
use cubesync::test_utils::{hierarchy_rule, sales_rule};
use insta::assert_snapshot;

fn listing(specs: &[LayoutSpec]) -> String {
    specs
        .iter()
        .map(|s| {
            let base = if s.base { " base" } else { "" };
            format!("{:?} {:?}{}", s.dimensions, s.measures, base)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn test_sales_rule_layouts() {
    let specs = expand(&sales_rule(), ExpandOptions::default()).unwrap();
    assert_snapshot!(listing(&specs), @r"
    [1] [100000, 100001]
    [1, 4] [100000, 100001]
    [1, 2, 3] [100000, 100001]
    [1, 2, 3, 4] [100000, 100001]
    [] [100000, 100001, 100004]
    [14] [100000, 100001, 100004]
    [14, 15] [100000, 100001, 100004]
    [14, 15, 16] [100000, 100001, 100004]
    [1, 2, 3, 4, 14, 15, 16] [100000, 100001, 100004] base
    ");
}

#[test]
fn test_hierarchy_rule_base_merges_with_full_chain() {
    let specs = expand(&hierarchy_rule(), ExpandOptions::default()).unwrap();
    assert_snapshot!(listing(&specs), @r"
    [] [100000]
    [14] [100000]
    [14, 15] [100000]
    [14, 15, 16] [100000] base
    ");
}

#[test]
fn test_base_layout_follows_settings() {
    let settings = LayoutSettings {
        base_layout_enabled: false,
        ..LayoutSettings::default()
    };
    let specs = expand(&sales_rule(), ExpandOptions::from(&settings)).unwrap();
    assert_eq!(specs.len(), 8);
    assert!(specs.iter().all(|s| !s.base));
}

#[test]
fn test_combination_limit_rejects_rule() {
    let options = ExpandOptions {
        max_combinations: 3,
        ..ExpandOptions::default()
    };
    let err = expand(&sales_rule(), options).unwrap_err();
    assert_eq!(
        err,
        RuleError::TooManyCombinations {
            group: 0,
            count: 4,
            limit: 3
        }
    );
}

#[test]
fn test_dim_cap_is_per_group() {
    let rule = RuleBasedIndex::new([1, 2, 3, 4], [100_000])
        .with_group(AggregationGroup::new([1, 2]).with_dim_cap(1))
        .with_group(AggregationGroup::new([3, 4]));
    let specs = expand(
        &rule,
        ExpandOptions {
            base_layout: false,
            ..ExpandOptions::default()
        },
    )
    .unwrap();
    let dims: Vec<Vec<u32>> = specs.iter().map(|s| s.dimensions.clone()).collect();
    assert!(dims.contains(&vec![3, 4]));
    assert!(!dims.contains(&vec![1, 2]));
}

#[test]
fn test_rule_validation_errors() {
    let overlapping = RuleBasedIndex::new([1, 2, 3], [])
        .with_group(AggregationGroup::new([1, 2, 3]).with_joint([1, 2]).with_mandatory([2]));
    assert_eq!(
        expand(&overlapping, ExpandOptions::default()).unwrap_err(),
        RuleError::OverlappingRule { group: 0, dim: 2 }
    );

    let unknown = RuleBasedIndex::new([1], []).with_group(AggregationGroup::new([1, 9]));
    assert_eq!(
        expand(&unknown, ExpandOptions::default()).unwrap_err(),
        RuleError::UnknownDimension { group: 0, dim: 9 }
    );

    let small_joint = RuleBasedIndex::new([1, 2], []).with_group(AggregationGroup::new([1, 2]).with_joint([1]));
    assert_eq!(
        expand(&small_joint, ExpandOptions::default()).unwrap_err(),
        RuleError::JointTooSmall { group: 0, joint: 0 }
    );
}

#[test]
fn test_rule_reads_from_json() {
    let json = r#"{
        "dimensions": [14, 15, 16],
        "measures": [100000],
        "aggregation_groups": [
            { "includes": [14, 15, 16], "select_rule": { "hierarchy_dims": [[14, 15, 16]] } }
        ]
    }"#;
    let rule: RuleBasedIndex = serde_json::from_str(json).unwrap();
    assert_eq!(rule, hierarchy_rule());
}

#[test]
fn test_empty_rule_has_no_base() {
    let specs = expand(&RuleBasedIndex::default(), ExpandOptions::default()).unwrap();
    assert!(specs.is_empty());
}
