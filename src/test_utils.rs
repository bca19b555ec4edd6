//! Shared fixtures for unit and integration tests.
//!
//! The sales fixture is a star-ish schema: a fact table joined to a seller
//! account, which is joined to the seller's country.
//!
//! ```text
//!   TEST_KYLIN_FACT ──SELLER_ID=ACCOUNT_ID──▶ SELLER_ACCOUNT ──ACCOUNT_COUNTRY=COUNTRY──▶ SELLER_COUNTRY
//! ```
//!
//! Column ids of [`sales_model`]:
//!
//! | id | column                             | status    |
//! |----|------------------------------------|-----------|
//! | 0  | TEST_KYLIN_FACT.TRANS_ID           | exist     |
//! | 1  | TEST_KYLIN_FACT.CAL_DT             | dimension |
//! | 2  | TEST_KYLIN_FACT.LSTG_FORMAT_NAME   | dimension |
//! | 3  | TEST_KYLIN_FACT.LEAF_CATEG_ID      | dimension |
//! | 4  | TEST_KYLIN_FACT.LSTG_SITE_ID       | dimension |
//! | 5  | TEST_KYLIN_FACT.SLR_SEGMENT_CD     | dimension |
//! | 6  | TEST_KYLIN_FACT.SELLER_ID          | dimension |
//! | 7  | TEST_KYLIN_FACT.BUYER_ID           | exist     |
//! | 8  | TEST_KYLIN_FACT.PRICE              | exist     |
//! | 9  | TEST_KYLIN_FACT.ITEM_COUNT         | exist     |
//! | 10 | SELLER_ACCOUNT.ACCOUNT_ID          | dimension |
//! | 11 | SELLER_ACCOUNT.ACCOUNT_BUYER_LEVEL | dimension |
//! | 12 | SELLER_ACCOUNT.ACCOUNT_SELLER_LEVEL| dimension |
//! | 13 | SELLER_ACCOUNT.ACCOUNT_COUNTRY     | dimension |
//! | 14 | SELLER_COUNTRY.COUNTRY             | dimension |
//! | 15 | SELLER_COUNTRY.NAME                | dimension |
//! | 16 | SELLER_COUNTRY.LATITUDE            | dimension |
//! | 17 | SELLER_COUNTRY.LONGITUDE           | exist     |
//! | 18 | TEST_KYLIN_FACT.DEAL_AMOUNT (cc)   | exist     |
//!
//! Measures start at 100000: COUNT_ALL, GMV_SUM, ITEM_COUNT_SUM,
//! SELLER_CNT, MAX_LATITUDE, DEAL_AMOUNT_SUM.

use crate::config::Settings;
use crate::index::{AggregationGroup, RuleBasedIndex};
use crate::manager::ModelManager;
use crate::model::{
    catalog, ColumnStatus, ComputedColumnDesc, DataType, FunctionKind, JoinTableDesc, Measure,
    Model, ParameterDesc, PartitionDesc, TableCatalog, TableDesc,
};
use crate::store::InMemoryStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub const PROJECT: &str = "default";

pub const FACT: &str = "DEFAULT.TEST_KYLIN_FACT";
pub const ACCOUNT: &str = "DEFAULT.TEST_ACCOUNT";
pub const COUNTRY: &str = "DEFAULT.TEST_COUNTRY";

/// Install a test-friendly tracing subscriber once per process.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn decimal() -> DataType {
    DataType::Decimal {
        precision: 19,
        scale: 4,
    }
}

pub fn fact_table() -> TableDesc {
    TableDesc::new(PROJECT, "default", "test_kylin_fact")
        .with_column("trans_id", DataType::BigInt)
        .with_column("cal_dt", DataType::Date)
        .with_column("lstg_format_name", DataType::Varchar(256))
        .with_column("leaf_categ_id", DataType::BigInt)
        .with_column("lstg_site_id", DataType::Integer)
        .with_column("slr_segment_cd", DataType::SmallInt)
        .with_column("seller_id", DataType::Integer)
        .with_column("buyer_id", DataType::Integer)
        .with_column("price", decimal())
        .with_column("item_count", DataType::Integer)
}

pub fn account_table() -> TableDesc {
    TableDesc::new(PROJECT, "default", "test_account")
        .with_column("account_id", DataType::Integer)
        .with_column("account_buyer_level", DataType::Integer)
        .with_column("account_seller_level", DataType::Integer)
        .with_column("account_country", DataType::Varchar(256))
        .with_column("account_contact", DataType::Varchar(256))
}

pub fn country_table() -> TableDesc {
    TableDesc::new(PROJECT, "default", "test_country")
        .with_column("country", DataType::Varchar(256))
        .with_column("latitude", DataType::Double)
        .with_column("longitude", DataType::Double)
        .with_column("name", DataType::Varchar(256))
}

pub fn sales_tables() -> Vec<TableDesc> {
    vec![fact_table(), account_table(), country_table()]
}

pub fn sales_catalog() -> TableCatalog {
    catalog(sales_tables())
}

/// `table` without `column`.
pub fn without_column(table: &TableDesc, column: &str) -> TableDesc {
    let mut next = table.clone();
    next.columns.retain(|c| !c.name.eq_ignore_ascii_case(column));
    next
}

/// `table` with `column` retyped.
pub fn with_type(table: &TableDesc, column: &str, datatype: DataType) -> TableDesc {
    let mut next = table.clone();
    for c in &mut next.columns {
        if c.name.eq_ignore_ascii_case(column) {
            c.datatype = datatype.clone();
        }
    }
    next
}

/// Incremental model construction with sequential ids.
pub struct ModelBuilder {
    model: Model,
}

impl ModelBuilder {
    pub fn new(alias: &str, root_table: &str, root_alias: &str) -> Self {
        Self {
            model: Model::new(PROJECT, alias, root_table, root_alias),
        }
    }

    pub fn join(mut self, table: &str, alias: &str, fk: &[&str], pk: &[&str]) -> Self {
        self.model
            .join_tables
            .push(JoinTableDesc::new(table, alias, fk, pk));
        self
    }

    pub fn dimension(mut self, name: &str, column_ref: &str) -> Self {
        self.model.add_column(name, column_ref, ColumnStatus::Dimension);
        self
    }

    pub fn column(mut self, name: &str, column_ref: &str) -> Self {
        self.model.add_column(name, column_ref, ColumnStatus::Exist);
        self
    }

    pub fn measure(mut self, name: &str, kind: FunctionKind, column_ref: Option<&str>) -> Self {
        let parameter = match column_ref {
            Some(column) => ParameterDesc::Column(column.to_uppercase()),
            None => ParameterDesc::Constant("1".to_string()),
        };
        let id = self.model.next_measure_id();
        self.model
            .all_measures
            .push(Measure::new(id, name, kind, vec![parameter]));
        self
    }

    pub fn computed_column(
        mut self,
        alias: &str,
        name: &str,
        expression: &str,
        datatype: DataType,
    ) -> Self {
        let table = self
            .model
            .alias_table(alias)
            .unwrap_or(alias)
            .to_string();
        self.model
            .computed_columns
            .push(ComputedColumnDesc::new(table, alias, name, expression, datatype));
        self
    }

    pub fn partition(mut self, column_ref: &str) -> Self {
        self.model.partition_desc = Some(PartitionDesc::new(column_ref));
        self
    }

    pub fn filter(mut self, condition: &str) -> Self {
        self.model.filter_condition = Some(condition.to_string());
        self
    }

    pub fn build(self) -> Model {
        self.model
    }
}

/// Root, seller account and seller country, with no columns.
pub fn sales_skeleton(alias: &str) -> ModelBuilder {
    ModelBuilder::new(alias, FACT, "TEST_KYLIN_FACT")
        .join(
            ACCOUNT,
            "SELLER_ACCOUNT",
            &["TEST_KYLIN_FACT.SELLER_ID"],
            &["SELLER_ACCOUNT.ACCOUNT_ID"],
        )
        .join(
            COUNTRY,
            "SELLER_COUNTRY",
            &["SELLER_ACCOUNT.ACCOUNT_COUNTRY"],
            &["SELLER_COUNTRY.COUNTRY"],
        )
}

/// The sales model; see the module docs for its ids.
pub fn sales_model(alias: &str) -> Model {
    sales_skeleton(alias)
        .column("TRANS_ID", "TEST_KYLIN_FACT.TRANS_ID")
        .dimension("CAL_DT", "TEST_KYLIN_FACT.CAL_DT")
        .dimension("LSTG_FORMAT_NAME", "TEST_KYLIN_FACT.LSTG_FORMAT_NAME")
        .dimension("LEAF_CATEG_ID", "TEST_KYLIN_FACT.LEAF_CATEG_ID")
        .dimension("LSTG_SITE_ID", "TEST_KYLIN_FACT.LSTG_SITE_ID")
        .dimension("SLR_SEGMENT_CD", "TEST_KYLIN_FACT.SLR_SEGMENT_CD")
        .dimension("SELLER_ID", "TEST_KYLIN_FACT.SELLER_ID")
        .column("BUYER_ID", "TEST_KYLIN_FACT.BUYER_ID")
        .column("PRICE", "TEST_KYLIN_FACT.PRICE")
        .column("ITEM_COUNT", "TEST_KYLIN_FACT.ITEM_COUNT")
        .dimension("ACCOUNT_ID", "SELLER_ACCOUNT.ACCOUNT_ID")
        .dimension("ACCOUNT_BUYER_LEVEL", "SELLER_ACCOUNT.ACCOUNT_BUYER_LEVEL")
        .dimension("ACCOUNT_SELLER_LEVEL", "SELLER_ACCOUNT.ACCOUNT_SELLER_LEVEL")
        .dimension("ACCOUNT_COUNTRY", "SELLER_ACCOUNT.ACCOUNT_COUNTRY")
        .dimension("COUNTRY", "SELLER_COUNTRY.COUNTRY")
        .dimension("COUNTRY_NAME", "SELLER_COUNTRY.NAME")
        .dimension("LATITUDE", "SELLER_COUNTRY.LATITUDE")
        .column("LONGITUDE", "SELLER_COUNTRY.LONGITUDE")
        .computed_column(
            "TEST_KYLIN_FACT",
            "DEAL_AMOUNT",
            "price * item_count",
            decimal(),
        )
        .column("DEAL_AMOUNT", "TEST_KYLIN_FACT.DEAL_AMOUNT")
        .measure("COUNT_ALL", FunctionKind::Count, None)
        .measure("GMV_SUM", FunctionKind::Sum, Some("TEST_KYLIN_FACT.PRICE"))
        .measure(
            "ITEM_COUNT_SUM",
            FunctionKind::Sum,
            Some("TEST_KYLIN_FACT.ITEM_COUNT"),
        )
        .measure(
            "SELLER_CNT",
            FunctionKind::CountDistinct,
            Some("TEST_KYLIN_FACT.SELLER_ID"),
        )
        .measure(
            "MAX_LATITUDE",
            FunctionKind::Max,
            Some("SELLER_COUNTRY.LATITUDE"),
        )
        .measure(
            "DEAL_AMOUNT_SUM",
            FunctionKind::Sum,
            Some("TEST_KYLIN_FACT.DEAL_AMOUNT"),
        )
        .partition("TEST_KYLIN_FACT.CAL_DT")
        .build()
}

/// Country hierarchy `[14, 15, 16]` over `COUNT_ALL`.
pub fn hierarchy_rule() -> RuleBasedIndex {
    RuleBasedIndex::new([14, 15, 16], [100_000])
        .with_group(AggregationGroup::new([14, 15, 16]).with_hierarchy([14, 15, 16]))
}

/// Two groups: calendar/format dims with a joint, and the country
/// hierarchy with measures on latitude.
pub fn sales_rule() -> RuleBasedIndex {
    RuleBasedIndex::new([1, 2, 3, 4, 14, 15, 16], [100_000, 100_001, 100_004])
        .with_group(
            AggregationGroup::new([1, 2, 3, 4])
                .with_mandatory([1])
                .with_joint([2, 3])
                .with_measures([100_000, 100_001]),
        )
        .with_group(AggregationGroup::new([14, 15, 16]).with_hierarchy([14, 15, 16]))
}

/// An in-memory store holding the sales tables, and a manager over it.
pub fn sales_store(settings: Settings) -> (Arc<InMemoryStore>, ModelManager<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let manager = ModelManager::new(store.clone(), settings);
    manager
        .save_tables(PROJECT, &sales_tables())
        .expect("sales tables");
    (store, manager)
}
