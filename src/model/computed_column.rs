// src/model/computed_column.rs
use crate::model::types::DataType;
use serde::{Deserialize, Serialize};

/// A computed column hosted on one alias of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedColumnDesc {
    /// Hosting table identity (`DATABASE.TABLE`).
    pub table_identity: String,
    pub table_alias: String,
    pub column_name: String,
    /// Expression as written by the user.
    pub expression: String,
    /// Canonical form produced by the expression canonicalizer.
    #[serde(default)]
    pub inner_expression: String,
    pub datatype: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ComputedColumnDesc {
    pub fn new(
        table_identity: impl Into<String>,
        table_alias: impl Into<String>,
        column_name: impl Into<String>,
        expression: impl Into<String>,
        datatype: DataType,
    ) -> Self {
        Self {
            table_identity: table_identity.into().to_uppercase(),
            table_alias: table_alias.into().to_uppercase(),
            column_name: column_name.into().to_uppercase(),
            expression: expression.into(),
            inner_expression: String::new(),
            datatype,
            comment: None,
        }
    }

    /// `ALIAS.COLUMN` reference used by dimensions and measures.
    pub fn column_ref(&self) -> String {
        format!("{}.{}", self.table_alias, self.column_name)
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.column_name.eq_ignore_ascii_case(name)
    }
}
