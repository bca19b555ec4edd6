//! SQL expression handling for computed columns and filter conditions.
//!
//! - [`ExpressionCanonicalizer`] - the contract the resolver and reconciler
//!   depend on
//! - [`ExprScope`] - the columns an expression may reference
//! - [`canonical`] - the default implementation on top of sqlparser-rs
//! - [`keywords`] - reserved words of the query and push-down dialects

pub mod canonical;
pub mod keywords;

pub use canonical::{rename_column, rewrite_qualifiers, SqlParserCanonicalizer};

use crate::model::{split_column_ref, DataType, Model, TableCatalog};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlError {
    #[error("cannot parse expression '{expr}': {message}")]
    Unparsable { expr: String, message: String },

    #[error("unknown column '{column}'")]
    UnknownColumn { column: String },

    #[error("unknown table alias '{alias}'")]
    UnknownAlias { alias: String },

    #[error("column '{column}' is ambiguous between {aliases:?}")]
    AmbiguousColumn { column: String, aliases: Vec<String> },

    #[error("unsupported expression: {detail}")]
    Unsupported { detail: String },

    #[error("cannot infer type of '{expr}'")]
    CannotInferType { expr: String },
}

/// Canonicalization and typing of SQL expressions.
///
/// Equal logical expressions must canonicalize to equal strings regardless of
/// whitespace, identifier case, qualification or literal formatting.
/// Implementations must be `Send + Sync` so the resolver can be shared
/// across threads.
pub trait ExpressionCanonicalizer: Send + Sync {
    /// Canonical form with every column qualified by its alias.
    fn massage(&self, expr: &str, scope: &ExprScope) -> Result<String, SqlError>;

    /// Result type of the expression.
    fn evaluate_type(&self, expr: &str, scope: &ExprScope) -> Result<DataType, SqlError>;

    /// Qualified `ALIAS.COLUMN` references the expression reads.
    fn referenced_columns(&self, expr: &str, scope: &ExprScope)
        -> Result<BTreeSet<String>, SqlError>;
}

/// Columns visible to an expression, grouped by table alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExprScope {
    aliases: BTreeMap<String, BTreeMap<String, DataType>>,
}

impl ExprScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical columns of every alias in `model`, looked up in `tables`.
    ///
    /// Aliases whose table is missing from the catalog are present but empty.
    pub fn for_model(model: &Model, tables: &TableCatalog) -> Self {
        let mut scope = Self::new();
        for (alias, table) in model.aliases() {
            let columns = scope.aliases.entry(alias.to_uppercase()).or_default();
            if let Some(desc) = tables.get(&table.to_uppercase()) {
                for column in &desc.columns {
                    columns.insert(column.name.to_uppercase(), column.datatype.clone());
                }
            }
        }
        scope
    }

    /// Add the model's computed columns to their hosting aliases.
    pub fn with_computed_columns(mut self, model: &Model) -> Self {
        for cc in &model.computed_columns {
            self.add_column(&cc.table_alias, &cc.column_name, cc.datatype.clone());
        }
        self
    }

    pub fn add_column(&mut self, alias: &str, column: &str, datatype: DataType) {
        self.aliases
            .entry(alias.to_uppercase())
            .or_default()
            .insert(column.to_uppercase(), datatype);
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.aliases.contains_key(&alias.to_uppercase())
    }

    /// Type of a qualified `ALIAS.COLUMN` reference.
    pub fn column_type(&self, column_ref: &str) -> Option<&DataType> {
        let (alias, column) = split_column_ref(column_ref)?;
        self.aliases
            .get(&alias.to_uppercase())?
            .get(&column.to_uppercase())
    }

    pub fn contains(&self, column_ref: &str) -> bool {
        self.column_type(column_ref).is_some()
    }

    /// Resolve a possibly unqualified column to `(ALIAS, COLUMN, type)`.
    pub fn resolve(
        &self,
        qualifier: Option<&str>,
        column: &str,
    ) -> Result<(String, String, DataType), SqlError> {
        let column = column.to_uppercase();
        match qualifier {
            Some(alias) => {
                let alias = alias.to_uppercase();
                let columns = self
                    .aliases
                    .get(&alias)
                    .ok_or_else(|| SqlError::UnknownAlias {
                        alias: alias.clone(),
                    })?;
                let datatype = columns
                    .get(&column)
                    .ok_or_else(|| SqlError::UnknownColumn {
                        column: format!("{}.{}", alias, column),
                    })?;
                Ok((alias, column, datatype.clone()))
            }
            None => {
                let matches: Vec<(&String, &DataType)> = self
                    .aliases
                    .iter()
                    .filter_map(|(alias, columns)| columns.get(&column).map(|t| (alias, t)))
                    .collect();
                match matches.as_slice() {
                    [] => Err(SqlError::UnknownColumn { column }),
                    [(alias, datatype)] => Ok(((*alias).clone(), column, (*datatype).clone())),
                    _ => Err(SqlError::AmbiguousColumn {
                        column,
                        aliases: matches.iter().map(|(a, _)| (*a).clone()).collect(),
                    }),
                }
            }
        }
    }
}
