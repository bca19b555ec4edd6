// src/model/table.rs
use crate::model::types::DataType;
use serde::{Deserialize, Serialize};

/// A source column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub id: u32,
    pub name: String,
    pub datatype: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ColumnDesc {
    pub fn new(id: u32, name: impl Into<String>, datatype: DataType) -> Self {
        Self {
            id,
            name: name.into().to_uppercase(),
            datatype,
            comment: None,
        }
    }
}

/// A source table schema as seen by the metadata layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDesc {
    pub project: String,
    pub database: String,
    pub name: String,
    pub columns: Vec<ColumnDesc>,
    /// Location of the last lookup snapshot; passthrough metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot_path: Option<String>,
    #[serde(default)]
    pub mvcc: u64,
}

impl TableDesc {
    pub fn new(project: impl Into<String>, database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            database: database.into().to_uppercase(),
            name: name.into().to_uppercase(),
            columns: Vec::new(),
            last_snapshot_path: None,
            mvcc: 0,
        }
    }

    /// Append a column, assigning the next column id.
    pub fn with_column(mut self, name: &str, datatype: DataType) -> Self {
        let id = self.next_column_id();
        self.columns.push(ColumnDesc::new(id, name, datatype));
        self
    }

    /// `DATABASE.TABLE`
    pub fn identity(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.find_column(name).is_some()
    }

    pub fn next_column_id(&self) -> u32 {
        self.columns.iter().map(|c| c.id + 1).max().unwrap_or(1)
    }

    /// Hash over column names and types only.
    ///
    /// Comments and passthrough metadata do not contribute, so two schemas with
    /// the same fingerprint have no structural difference.
    pub fn structural_fingerprint(&self) -> Result<String, serde_json::Error> {
        let mut shape: Vec<(String, String)> = self
            .columns
            .iter()
            .map(|c| (c.name.to_uppercase(), c.datatype.to_string()))
            .collect();
        shape.sort();
        crate::store::compute_hash(&shape)
    }
}
