// src/model/join.rs
use serde::{Deserialize, Serialize};

use super::split_column_ref;

/// A table joined into a model under an alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinTableDesc {
    /// Table identity (`DATABASE.TABLE`).
    pub table: String,
    pub alias: String,
    #[serde(default)]
    pub kind: TableKind,
    pub join: JoinDesc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Fact,
    #[default]
    Lookup,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    #[default]
    Left,
}

/// Join condition: `foreign_key[i] = primary_key[i]`.
///
/// Primary keys live on the joined alias, foreign keys on its parent alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDesc {
    #[serde(default)]
    pub join_type: JoinType,
    pub primary_key: Vec<String>,
    pub foreign_key: Vec<String>,
}

impl JoinTableDesc {
    pub fn new(
        table: impl Into<String>,
        alias: impl Into<String>,
        foreign_key: &[&str],
        primary_key: &[&str],
    ) -> Self {
        Self {
            table: table.into().to_uppercase(),
            alias: alias.into().to_uppercase(),
            kind: TableKind::Lookup,
            join: JoinDesc {
                join_type: JoinType::Left,
                primary_key: primary_key.iter().map(|s| s.to_uppercase()).collect(),
                foreign_key: foreign_key.iter().map(|s| s.to_uppercase()).collect(),
            },
        }
    }

    /// Alias on the foreign-key side, if every foreign key agrees on one.
    pub fn parent_alias(&self) -> Option<&str> {
        let mut aliases = self
            .join
            .foreign_key
            .iter()
            .filter_map(|fk| split_column_ref(fk).map(|(alias, _)| alias));
        let first = aliases.next()?;
        if aliases.all(|a| a.eq_ignore_ascii_case(first)) {
            Some(first)
        } else {
            None
        }
    }

    /// Every qualified column used by the join condition.
    pub fn key_refs(&self) -> impl Iterator<Item = &str> {
        self.join
            .primary_key
            .iter()
            .chain(self.join.foreign_key.iter())
            .map(String::as_str)
    }
}
