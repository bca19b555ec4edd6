//! Repair of schema-broken models from a user-supplied fix.

use super::impact::unresolved_reference;
use crate::computed_column::JoinGraph;
use crate::error::CubeResult;
use crate::index::{expand, ColumnChanges, ExpandOptions, IndexPlan, LayoutDiff};
use crate::model::{
    split_column_ref, BrokenReason, ColumnStatus, JoinTableDesc, Measure, Model,
    MultiPartitionDesc, PartitionDesc, TableCatalog,
};
use crate::sql::{ExprScope, ExpressionCanonicalizer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepairError {
    #[error("model {model} is not broken")]
    NotBroken { model: String },

    #[error("repair leaves the model broken ({reason:?}): {detail}")]
    Unresolved { reason: BrokenReason, detail: String },
}

/// Replacement parts for a broken model. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRepair {
    #[serde(default)]
    pub join_tables: Option<Vec<JoinTableDesc>>,
    #[serde(default)]
    pub partition_desc: Option<PartitionDesc>,
    #[serde(default)]
    pub multi_partition_desc: Option<MultiPartitionDesc>,
    #[serde(default)]
    pub filter_condition: Option<String>,
}

impl ModelRepair {
    pub fn with_joins(mut self, joins: Vec<JoinTableDesc>) -> Self {
        self.join_tables = Some(joins);
        self
    }

    pub fn with_partition(mut self, partition: PartitionDesc) -> Self {
        self.partition_desc = Some(partition);
        self
    }

    pub fn with_multi_partition(mut self, multi: MultiPartitionDesc) -> Self {
        self.multi_partition_desc = Some(multi);
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_condition = Some(filter.into());
        self
    }

    fn apply(&self, model: &mut Model) {
        if let Some(joins) = &self.join_tables {
            model.join_tables = joins.clone();
        }
        if let Some(partition) = &self.partition_desc {
            model.partition_desc = Some(partition.clone());
        }
        if let Some(multi) = &self.multi_partition_desc {
            model.multi_partition_desc = Some(multi.clone());
        }
        if let Some(filter) = &self.filter_condition {
            model.filter_condition = (!filter.trim().is_empty()).then(|| filter.clone());
        }
    }
}

/// A repaired model and the plan rebuilt around it.
#[derive(Debug, Clone)]
pub struct RepairedModel {
    pub model: Model,
    pub plan: IndexPlan,
    pub layouts: LayoutDiff,
    /// Old id → new id for columns and measures re-created on aliases whose
    /// table changed.
    pub renumbered: BTreeMap<u32, u32>,
    pub tombed: BTreeSet<u32>,
}

/// Apply `fix` to the broken `model` and rebuild its plan.
pub fn repair_model(
    model: &Model,
    plan: &IndexPlan,
    fix: &ModelRepair,
    catalog: &TableCatalog,
    canonicalizer: &dyn ExpressionCanonicalizer,
    options: ExpandOptions,
) -> CubeResult<RepairedModel> {
    if !model.is_broken() {
        return Err(RepairError::NotBroken {
            model: model.alias.clone(),
        }
        .into());
    }
    let unresolved = |detail: String| RepairError::Unresolved {
        reason: model.reason(),
        detail,
    };

    let mut fixed = model.clone();
    fix.apply(&mut fixed);
    validate_joins(&fixed, catalog).map_err(unresolved)?;
    if let Some(detail) = unresolved_reference(&fixed, catalog, canonicalizer)? {
        return Err(unresolved(detail).into());
    }

    let old_tables: BTreeMap<String, String> = model
        .aliases()
        .into_iter()
        .map(|(alias, table)| (alias.to_uppercase(), table.to_uppercase()))
        .collect();
    let new_tables: BTreeMap<String, String> = fixed
        .aliases()
        .into_iter()
        .map(|(alias, table)| (alias.to_uppercase(), table.to_uppercase()))
        .collect();
    let retabled: BTreeSet<String> = new_tables
        .iter()
        .filter(|(alias, table)| old_tables.get(*alias) != Some(*table))
        .map(|(alias, _)| alias.clone())
        .collect();
    let on_retabled = |column_ref: &str| {
        split_column_ref(column_ref).is_some_and(|(alias, _)| retabled.contains(&alias.to_uppercase()))
    };

    // computed columns must live on a known alias and still resolve
    let mut dropped_refs = BTreeSet::new();
    loop {
        let scope = ExprScope::for_model(&fixed, catalog).with_computed_columns(&fixed);
        let victim = fixed.computed_columns.iter().position(|cc| {
            !new_tables.contains_key(&cc.table_alias)
                || canonicalizer
                    .referenced_columns(&cc.expression, &scope)
                    .is_err()
        });
        match victim {
            Some(index) => {
                dropped_refs.insert(fixed.computed_columns.remove(index).column_ref());
            }
            None => break,
        }
    }

    let scope = ExprScope::for_model(&fixed, catalog).with_computed_columns(&fixed);
    let mut renumbered = BTreeMap::new();
    let mut tombed = BTreeSet::new();

    let mut recreated = Vec::new();
    for column in &mut fixed.all_named_columns {
        if !column.is_live() {
            continue;
        }
        let resolves = !dropped_refs.contains(&column.column_ref) && scope.contains(&column.column_ref);
        if resolves && !on_retabled(&column.column_ref) {
            continue;
        }
        let status = column.status;
        column.status = ColumnStatus::Tomb;
        tombed.insert(column.id);
        if resolves {
            recreated.push((column.id, column.name.clone(), column.column_ref.clone(), status));
        }
    }
    for (old_id, name, column_ref, status) in recreated {
        let new_id = fixed.add_column(&name, &column_ref, status);
        renumbered.insert(old_id, new_id);
    }

    let mut recreated_measures = Vec::new();
    for measure in &mut fixed.all_measures {
        if measure.tomb {
            continue;
        }
        let resolves = measure
            .column_refs()
            .all(|c| !dropped_refs.contains(&c.to_uppercase()) && scope.contains(c));
        let moved = measure.column_refs().any(on_retabled);
        if resolves && !moved {
            continue;
        }
        measure.tomb = true;
        tombed.insert(measure.id);
        if resolves {
            recreated_measures.push(measure.clone());
        }
    }
    for measure in recreated_measures {
        let new_id = fixed.next_measure_id();
        renumbered.insert(measure.id, new_id);
        fixed.all_measures.push(Measure {
            id: new_id,
            tomb: false,
            ..measure
        });
    }

    fixed.clear_broken();

    let dead: BTreeSet<u32> = tombed
        .iter()
        .copied()
        .filter(|id| !renumbered.contains_key(id))
        .collect();
    let mut next_plan = plan.clone();
    let rule = plan
        .rule_based_index
        .as_ref()
        .map(|r| r.remapped(&renumbered).pruned(&dead));
    let specs = match &rule {
        Some(rule) => expand(rule, options)?,
        None => Vec::new(),
    };
    next_plan.rule_based_index = rule;
    let no_type_changes = BTreeSet::new();
    let layouts = next_plan.materialize(
        &specs,
        ColumnChanges {
            tombed: &tombed,
            type_changed: &no_type_changes,
            renumbered: &renumbered,
        },
    );

    Ok(RepairedModel {
        model: fixed,
        plan: next_plan,
        layouts,
        renumbered,
        tombed,
    })
}

/// Tree shape, known tables, and comparable key families.
fn validate_joins(model: &Model, catalog: &TableCatalog) -> Result<(), String> {
    let mut seen = BTreeSet::new();
    for (alias, _) in model.aliases() {
        if !seen.insert(alias.to_uppercase()) {
            return Err(format!("alias {} is used more than once", alias));
        }
    }
    JoinGraph::from_model(model).check_tree()?;

    let scope = ExprScope::for_model(model, catalog);
    for join in &model.join_tables {
        let keys = &join.join;
        if keys.foreign_key.is_empty() || keys.foreign_key.len() != keys.primary_key.len() {
            return Err(format!(
                "join of {} needs matching foreign and primary keys",
                join.alias
            ));
        }
        for (fk, pk) in keys.foreign_key.iter().zip(keys.primary_key.iter()) {
            let (Some(fk_type), Some(pk_type)) = (scope.column_type(fk), scope.column_type(pk))
            else {
                let missing = if scope.contains(fk) { pk } else { fk };
                return Err(format!("join key {} does not resolve", missing));
            };
            if fk_type.family() != pk_type.family() {
                return Err(format!(
                    "join key {} ({}) cannot be compared with {} ({})",
                    fk, fk_type, pk, pk_type
                ));
            }
        }
    }
    Ok(())
}
