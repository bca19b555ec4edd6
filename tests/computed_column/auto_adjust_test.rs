// tests/computed_column/auto_adjust_test.rs
use cubesync::computed_column::{ComputedColumnResolver, ConflictCause};
use cubesync::config::{ComputedColumnSettings, Settings};
use cubesync::error::CubeError;
use cubesync::manager::ModelManager;
use cubesync::model::{DataType, FunctionKind, Model, ParameterDesc};
use cubesync::sql::SqlParserCanonicalizer;
use cubesync::store::InMemoryStore;
use cubesync::test_utils::{init_test_logging, sales_catalog, sales_model, sales_skeleton, sales_store};
use std::sync::Arc;

fn decimal() -> DataType {
    DataType::Decimal {
        precision: 19,
        scale: 4,
    }
}

fn adjusting() -> (Arc<InMemoryStore>, ModelManager<InMemoryStore>) {
    init_test_logging();
    let mut settings = Settings::default();
    settings.computed_column.auto_adjust = true;
    let (store, manager) = sales_store(settings);
    manager.create_model(&sales_model("model_a"), None).unwrap();
    (store, manager)
}

/// A model defining `name` on the fact table, exposed as a column and
/// summed by a measure.
fn cc_model(alias: &str, name: &str, expression: &str) -> Model {
    let column_ref = format!("TEST_KYLIN_FACT.{}", name);
    sales_skeleton(alias)
        .dimension("CAL_DT", "TEST_KYLIN_FACT.CAL_DT")
        .computed_column("TEST_KYLIN_FACT", name, expression, decimal())
        .column(name, &column_ref)
        .measure(&format!("{}_SUM", name), FunctionKind::Sum, Some(&column_ref))
        .partition("TEST_KYLIN_FACT.CAL_DT")
        .build()
}

#[test]
fn test_same_name_is_renamed_to_fresh_name() {
    let (_store, manager) = adjusting();
    let checked = manager
        .create_model(&cc_model("model_b", "DEAL_AMOUNT", "price + item_count"), None)
        .unwrap();

    assert_eq!(checked.adjustments.len(), 1);
    let detail = &checked.adjustments[0];
    assert_eq!(detail.conflict.cause, ConflictCause::SameNameDiffExpr);
    assert_eq!(detail.renamed_to, "TEST_KYLIN_FACT.DEAL_AMOUNT_1");

    let stored = manager.get_model("default", &checked.model.id).unwrap();
    assert_eq!(stored.computed_columns[0].column_name, "DEAL_AMOUNT_1");
    let column = stored.live_column_by_ref("TEST_KYLIN_FACT.DEAL_AMOUNT_1").unwrap();
    assert_eq!(column.name, "DEAL_AMOUNT_1");
    let measure = stored.all_measures.last().unwrap();
    assert_eq!(
        measure.function.parameters,
        vec![ParameterDesc::Column("TEST_KYLIN_FACT.DEAL_AMOUNT_1".to_string())]
    );
}

#[test]
fn test_fresh_names_skip_taken_suffixes() {
    let (_store, manager) = adjusting();
    manager
        .create_model(&cc_model("model_b", "DEAL_AMOUNT", "price + item_count"), None)
        .unwrap();
    let checked = manager
        .create_model(&cc_model("model_c", "DEAL_AMOUNT", "price - item_count"), None)
        .unwrap();
    assert_eq!(checked.adjustments[0].renamed_to, "TEST_KYLIN_FACT.DEAL_AMOUNT_2");
}

#[test]
fn test_same_expression_takes_existing_name() {
    let (_store, manager) = adjusting();
    let checked = manager
        .create_model(&cc_model("model_c", "AMOUNT_DEAL", "PRICE*ITEM_COUNT"), None)
        .unwrap();

    let detail = &checked.adjustments[0];
    assert_eq!(detail.conflict.cause, ConflictCause::SameExprDiffName);
    assert_eq!(detail.renamed_to, "TEST_KYLIN_FACT.DEAL_AMOUNT");
    assert!(checked
        .model
        .live_column_by_ref("TEST_KYLIN_FACT.DEAL_AMOUNT")
        .is_some_and(|c| c.name == "DEAL_AMOUNT"));
}

#[test]
fn test_position_conflicts_stay_fatal() {
    let (_store, manager) = adjusting();
    let model = sales_skeleton("model_e")
        .computed_column(
            "SELLER_ACCOUNT",
            "DEAL_AMOUNT",
            "SELLER_ACCOUNT.ACCOUNT_BUYER_LEVEL * 2",
            DataType::Integer,
        )
        .build();
    let err = manager.create_model(&model, None).unwrap_err();
    match err {
        CubeError::Conflict(conflict) => {
            assert_eq!(conflict.cause, ConflictCause::WrongPositionDueToName)
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[test]
fn test_check_model_respects_flag() {
    let resolver = ComputedColumnResolver::new(
        Arc::new(SqlParserCanonicalizer::new()),
        ComputedColumnSettings::default(),
    );
    let model_a = sales_model("model_a");
    let model_b = cc_model("model_b", "DEAL_AMOUNT", "price + item_count");
    let others = vec![model_a];

    let err = resolver
        .check_model(&model_b, &others, &sales_catalog(), false)
        .unwrap_err();
    assert!(matches!(err, CubeError::Conflict(_)));

    let checked = resolver
        .check_model(&model_b, &others, &sales_catalog(), true)
        .unwrap();
    assert_eq!(checked.adjustments.len(), 1);
    assert!(!checked.model.computed_columns[0].inner_expression.is_empty());
    // the input is not touched
    assert_eq!(model_b.computed_columns[0].column_name, "DEAL_AMOUNT");
}

#[test]
fn test_rename_reaches_dependent_computed_columns_only() {
    let resolver = ComputedColumnResolver::new(
        Arc::new(SqlParserCanonicalizer::new()),
        ComputedColumnSettings::default(),
    );
    let model_b = sales_skeleton("model_b")
        .computed_column("TEST_KYLIN_FACT", "DEAL_AMOUNT", "price + item_count", decimal())
        .computed_column("TEST_KYLIN_FACT", "DEAL_AMOUNT_NET", "price - 1", decimal())
        .computed_column("TEST_KYLIN_FACT", "DEAL_TWICE", "deal_amount * 2", decimal())
        .computed_column("TEST_KYLIN_FACT", "NET_TWICE", "deal_amount_net  *  2", decimal())
        .build();

    let checked = resolver
        .check_model(&model_b, &[sales_model("model_a")], &sales_catalog(), true)
        .unwrap();
    assert_eq!(checked.adjustments.len(), 1);
    assert_eq!(checked.adjustments[0].renamed_to, "TEST_KYLIN_FACT.DEAL_AMOUNT_1");

    let expressions: Vec<&str> = checked
        .model
        .computed_columns
        .iter()
        .map(|cc| cc.expression.as_str())
        .collect();
    assert_eq!(
        expressions,
        vec!["price + item_count", "price - 1", "DEAL_AMOUNT_1 * 2", "deal_amount_net  *  2"]
    );
}
