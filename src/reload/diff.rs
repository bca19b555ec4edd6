//! Name-keyed comparison of two versions of a table schema.

use crate::model::{DataType, TableDesc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeChange {
    pub name: String,
    pub old: DataType,
    pub new: DataType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub type_changed: Vec<TypeChange>,
    /// Comment-only edits. Never impacts a model.
    pub comment_changed: Vec<String>,
}

impl SchemaDiff {
    /// Compare `old` and `new` column by (case-insensitive) name. Results
    /// follow column order: `removed` in `old` order, the rest in `new` order.
    pub fn between(old: &TableDesc, new: &TableDesc) -> Self {
        let mut diff = SchemaDiff::default();

        for column in &old.columns {
            if !new.has_column(&column.name) {
                diff.removed.push(column.name.to_uppercase());
            }
        }

        for column in &new.columns {
            let name = column.name.to_uppercase();
            match old.find_column(&column.name) {
                None => diff.added.push(name),
                Some(before) => {
                    if before.datatype != column.datatype {
                        diff.type_changed.push(TypeChange {
                            name: name.clone(),
                            old: before.datatype.clone(),
                            new: column.datatype.clone(),
                        });
                    }
                    if before.comment != column.comment {
                        diff.comment_changed.push(name);
                    }
                }
            }
        }

        diff
    }

    /// Any added, removed or retyped column.
    pub fn is_structural(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.type_changed.is_empty())
    }

    pub fn removed_set(&self) -> BTreeSet<String> {
        self.removed.iter().cloned().collect()
    }

    pub fn type_change(&self, column: &str) -> Option<&TypeChange> {
        self.type_changed
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
    }
}
