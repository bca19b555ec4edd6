//! Semantic model types: models, named columns, measures, joins and
//! computed columns, plus the source table schemas they bind to.

pub mod computed_column;
pub mod join;
pub mod measure;
pub mod table;
pub mod types;

pub use computed_column::ComputedColumnDesc;
pub use join::{JoinDesc, JoinTableDesc, JoinType, TableKind};
pub use measure::{FunctionDesc, FunctionKind, Measure, ParameterDesc, MEASURE_ID_BASE};
pub use table::{ColumnDesc, TableDesc};
pub use types::{DataType, DataTypeError, TypeFamily};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Source tables keyed by identity (`DATABASE.TABLE`).
pub type TableCatalog = BTreeMap<String, TableDesc>;

/// Build a catalog from table descriptors.
pub fn catalog(tables: impl IntoIterator<Item = TableDesc>) -> TableCatalog {
    tables.into_iter().map(|t| (t.identity(), t)).collect()
}

/// Split an `ALIAS.COLUMN` reference.
pub fn split_column_ref(column_ref: &str) -> Option<(&str, &str)> {
    let (alias, column) = column_ref.split_once('.')?;
    if alias.is_empty() || column.is_empty() || column.contains('.') {
        return None;
    }
    Some((alias, column))
}

/// Why a model is broken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokenReason {
    #[default]
    None,
    /// A physical schema reference no longer resolves.
    Schema,
    /// Complete segments overlap without being a refresh or merge.
    SegmentOverlap,
    /// Broken by an external event.
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnStatus {
    Dimension,
    Exist,
    Tomb,
}

/// A column exposed by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedColumn {
    pub id: u32,
    pub name: String,
    /// Qualified source reference, `ALIAS.COLUMN`.
    pub column_ref: String,
    pub status: ColumnStatus,
}

impl NamedColumn {
    pub fn is_live(&self) -> bool {
        self.status != ColumnStatus::Tomb
    }

    pub fn is_dimension(&self) -> bool {
        self.status == ColumnStatus::Dimension
    }

    pub fn alias(&self) -> Option<&str> {
        split_column_ref(&self.column_ref).map(|(alias, _)| alias)
    }

    pub fn column(&self) -> Option<&str> {
        split_column_ref(&self.column_ref).map(|(_, column)| column)
    }
}

/// Root fact table reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionDesc {
    /// Qualified partition date column.
    pub column: String,
    #[serde(default = "default_date_format")]
    pub date_format: String,
}

fn default_date_format() -> String {
    "yyyy-MM-dd".to_string()
}

impl PartitionDesc {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into().to_uppercase(),
            date_format: default_date_format(),
        }
    }
}

/// Sub-partitioning of segments by additional key columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiPartitionDesc {
    pub columns: Vec<String>,
    #[serde(default)]
    pub partitions: Vec<MultiPartitionValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiPartitionValue {
    pub id: u64,
    pub values: Vec<String>,
}

/// A semantic model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub project: String,
    pub alias: String,
    #[serde(default)]
    pub mvcc: u64,
    #[serde(default)]
    pub broken: bool,
    #[serde(default)]
    pub broken_reason: BrokenReason,
    pub root_fact_table: TableRef,
    #[serde(default)]
    pub join_tables: Vec<JoinTableDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_desc: Option<PartitionDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_partition_desc: Option<MultiPartitionDesc>,
    #[serde(default)]
    pub all_named_columns: Vec<NamedColumn>,
    #[serde(default)]
    pub all_measures: Vec<Measure>,
    #[serde(default)]
    pub computed_columns: Vec<ComputedColumnDesc>,
}

impl Model {
    pub fn new(
        project: impl Into<String>,
        alias: impl Into<String>,
        root_table: impl Into<String>,
        root_alias: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project: project.into(),
            alias: alias.into(),
            mvcc: 0,
            broken: false,
            broken_reason: BrokenReason::None,
            root_fact_table: TableRef {
                table: root_table.into().to_uppercase(),
                alias: root_alias.into().to_uppercase(),
            },
            join_tables: Vec::new(),
            filter_condition: None,
            partition_desc: None,
            multi_partition_desc: None,
            all_named_columns: Vec::new(),
            all_measures: Vec::new(),
            computed_columns: Vec::new(),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn reason(&self) -> BrokenReason {
        self.broken_reason
    }

    pub fn mark_broken(&mut self, reason: BrokenReason) {
        self.broken = true;
        self.broken_reason = reason;
    }

    pub fn clear_broken(&mut self) {
        self.broken = false;
        self.broken_reason = BrokenReason::None;
    }

    pub fn root_alias(&self) -> &str {
        &self.root_fact_table.alias
    }

    /// `(alias, table identity)` pairs, root first.
    pub fn aliases(&self) -> Vec<(&str, &str)> {
        std::iter::once((
            self.root_fact_table.alias.as_str(),
            self.root_fact_table.table.as_str(),
        ))
        .chain(
            self.join_tables
                .iter()
                .map(|j| (j.alias.as_str(), j.table.as_str())),
        )
        .collect()
    }

    pub fn alias_table(&self, alias: &str) -> Option<&str> {
        self.aliases()
            .into_iter()
            .find(|(a, _)| a.eq_ignore_ascii_case(alias))
            .map(|(_, table)| table)
    }

    /// Aliases under which `table` is joined into this model.
    pub fn aliases_of_table(&self, table: &str) -> BTreeSet<String> {
        self.aliases()
            .into_iter()
            .filter(|(_, t)| t.eq_ignore_ascii_case(table))
            .map(|(alias, _)| alias.to_uppercase())
            .collect()
    }

    pub fn binds_table(&self, table: &str) -> bool {
        !self.aliases_of_table(table).is_empty()
    }

    /// Table identities referenced by the model, deduplicated.
    pub fn table_identities(&self) -> BTreeSet<String> {
        self.aliases()
            .into_iter()
            .map(|(_, table)| table.to_uppercase())
            .collect()
    }

    pub fn named_column(&self, id: u32) -> Option<&NamedColumn> {
        self.all_named_columns.iter().find(|c| c.id == id)
    }

    /// Live named column bound to `column_ref`.
    pub fn live_column_by_ref(&self, column_ref: &str) -> Option<&NamedColumn> {
        self.all_named_columns
            .iter()
            .find(|c| c.is_live() && c.column_ref.eq_ignore_ascii_case(column_ref))
    }

    pub fn measure(&self, id: u32) -> Option<&Measure> {
        self.all_measures.iter().find(|m| m.id == id)
    }

    pub fn next_column_id(&self) -> u32 {
        self.all_named_columns
            .iter()
            .map(|c| c.id + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn next_measure_id(&self) -> u32 {
        self.all_measures
            .iter()
            .map(|m| m.id + 1)
            .max()
            .unwrap_or(MEASURE_ID_BASE)
            .max(MEASURE_ID_BASE)
    }

    pub fn dimension_ids(&self) -> BTreeSet<u32> {
        self.all_named_columns
            .iter()
            .filter(|c| c.is_dimension())
            .map(|c| c.id)
            .collect()
    }

    pub fn live_column_ids(&self) -> BTreeSet<u32> {
        self.all_named_columns
            .iter()
            .filter(|c| c.is_live())
            .map(|c| c.id)
            .collect()
    }

    pub fn live_measure_ids(&self) -> BTreeSet<u32> {
        self.all_measures
            .iter()
            .filter(|m| !m.tomb)
            .map(|m| m.id)
            .collect()
    }

    pub fn computed_column(&self, alias: &str, name: &str) -> Option<&ComputedColumnDesc> {
        self.computed_columns
            .iter()
            .find(|cc| cc.table_alias.eq_ignore_ascii_case(alias) && cc.is_named(name))
    }

    /// References whose resolution decides whether the model is broken:
    /// partition columns and join keys.
    pub fn critical_refs(&self) -> Vec<(CriticalRef, &str)> {
        let mut refs = Vec::new();
        if let Some(partition) = &self.partition_desc {
            refs.push((CriticalRef::PartitionColumn, partition.column.as_str()));
        }
        if let Some(multi) = &self.multi_partition_desc {
            refs.extend(
                multi
                    .columns
                    .iter()
                    .map(|c| (CriticalRef::MultiPartitionColumn, c.as_str())),
            );
        }
        for join in &self.join_tables {
            refs.extend(join.key_refs().map(|k| (CriticalRef::JoinKey, k)));
        }
        refs
    }

    /// Push a named column with the next id and return that id.
    pub fn add_column(&mut self, name: &str, column_ref: &str, status: ColumnStatus) -> u32 {
        let id = self.next_column_id();
        self.all_named_columns.push(NamedColumn {
            id,
            name: name.to_string(),
            column_ref: column_ref.to_uppercase(),
            status,
        });
        id
    }
}

/// Kind of a model-critical reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalRef {
    PartitionColumn,
    MultiPartitionColumn,
    JoinKey,
}

impl std::fmt::Display for CriticalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CriticalRef::PartitionColumn => write!(f, "partition column"),
            CriticalRef::MultiPartitionColumn => write!(f, "multi-partition column"),
            CriticalRef::JoinKey => write!(f, "join key"),
        }
    }
}
