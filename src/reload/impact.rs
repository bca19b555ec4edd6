//! Per-model impact of a table schema change.
//!
//! ```text
//!   removed columns ──▶ tomb named columns ──▶ drop computed columns
//!                                 │                      │
//!                                 ▼                      ▼
//!                          tomb measures ◀────── dead column refs
//!                                 │
//!   retyped columns ──▶ re-evaluate cc types ──▶ refresh / tomb / re-derive
//!                                 │
//!                                 ▼
//!                 prune rule ──▶ expand ──▶ IndexPlan::materialize
//! ```
//!
//! Analysis is pure: it works on copies and leaves persistence to the
//! caller. A model that ends up broken keeps its pre-reload structure.

use super::diff::SchemaDiff;
use crate::error::CubeResult;
use crate::index::{expand, ColumnChanges, ExpandOptions, IndexPlan, LayoutDiff};
use crate::model::{
    split_column_ref, BrokenReason, ColumnStatus, DataType, Model, TableCatalog, TableDesc,
};
use crate::sql::{ExprScope, ExpressionCanonicalizer, SqlError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// What a reload did to one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReloadOutcome {
    Unchanged,
    Modified,
    /// Transitioned into `Broken(Schema)` in this reload.
    Broken { detail: String },
    /// Was already broken and still is.
    StillBroken,
    /// Was `Broken(Schema)` and resolves again.
    Healed,
}

#[derive(Debug, Clone)]
pub struct ModelImpact {
    pub model: Model,
    pub plan: IndexPlan,
    pub outcome: ReloadOutcome,
    pub tombed_columns: BTreeSet<u32>,
    pub tombed_measures: BTreeSet<u32>,
    pub dropped_computed_columns: Vec<String>,
    pub layouts: LayoutDiff,
}

impl ModelImpact {
    fn untouched(model: &Model, plan: &IndexPlan, outcome: ReloadOutcome) -> Self {
        Self {
            model: model.clone(),
            plan: plan.clone(),
            outcome,
            tombed_columns: BTreeSet::new(),
            tombed_measures: BTreeSet::new(),
            dropped_computed_columns: Vec::new(),
            layouts: LayoutDiff::default(),
        }
    }
}

/// Inputs shared by every model affected by one table reload.
pub struct ImpactContext<'a> {
    /// The table after the change.
    pub table: &'a TableDesc,
    pub diff: &'a SchemaDiff,
    /// Project tables with `table` already swapped in.
    pub catalog: &'a TableCatalog,
    pub canonicalizer: &'a dyn ExpressionCanonicalizer,
    pub expand: ExpandOptions,
}

/// First model reference that no longer resolves against `catalog`, if any.
///
/// Checks that every joined table exists, then partition and join-key
/// columns, then the filter condition.
pub fn unresolved_reference(
    model: &Model,
    catalog: &TableCatalog,
    canonicalizer: &dyn ExpressionCanonicalizer,
) -> CubeResult<Option<String>> {
    for (alias, table) in model.aliases() {
        if !catalog.contains_key(&table.to_uppercase()) {
            return Ok(Some(format!(
                "table {} of alias {} does not exist",
                table, alias
            )));
        }
    }

    let scope = ExprScope::for_model(model, catalog).with_computed_columns(model);
    for (kind, column_ref) in model.critical_refs() {
        if !scope.contains(column_ref) {
            return Ok(Some(format!("{} {} does not resolve", kind, column_ref)));
        }
    }

    if let Some(filter) = &model.filter_condition {
        match canonicalizer.referenced_columns(filter, &scope) {
            Ok(_) => {}
            Err(SqlError::UnknownColumn { column }) => {
                return Ok(Some(format!(
                    "filter condition references unknown column {}",
                    column
                )))
            }
            Err(SqlError::UnknownAlias { alias }) => {
                return Ok(Some(format!(
                    "filter condition references unknown alias {}",
                    alias
                )))
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(None)
}

/// Compute the impact of `ctx` on `model` and its index plan.
pub fn analyze(ctx: &ImpactContext<'_>, model: &Model, plan: &IndexPlan) -> CubeResult<ModelImpact> {
    if model.is_broken() && model.reason() != BrokenReason::Schema {
        return Ok(ModelImpact::untouched(model, plan, ReloadOutcome::StillBroken));
    }

    let aliases = model.aliases_of_table(&ctx.table.identity());
    let mut next = model.clone();

    let mut dead_refs = BTreeSet::new();
    for column in &model.all_named_columns {
        let Some((alias, name)) = split_column_ref(&column.column_ref) else {
            continue;
        };
        if aliases.contains(&alias.to_uppercase())
            && !ctx.table.has_column(name)
            && model.computed_column(alias, name).is_none()
        {
            dead_refs.insert(column.column_ref.to_uppercase());
        }
    }
    for alias in &aliases {
        for removed in &ctx.diff.removed {
            dead_refs.insert(format!("{}.{}", alias, removed));
        }
    }

    let mut physical_types: BTreeMap<String, DataType> = BTreeMap::new();
    for alias in &aliases {
        for change in &ctx.diff.type_changed {
            physical_types.insert(format!("{}.{}", alias, change.name), change.new.clone());
        }
    }

    let CcSurvey { dropped, retyped: cc_types } =
        drop_unresolvable_ccs(ctx, &mut next, &physical_types)?;
    dead_refs.extend(dropped.iter().cloned());

    let mut tombed_columns = BTreeSet::new();
    for column in &mut next.all_named_columns {
        if column.is_live() && dead_refs.contains(&column.column_ref.to_uppercase()) {
            column.status = ColumnStatus::Tomb;
            tombed_columns.insert(column.id);
        }
    }

    let mut tombed_measures = BTreeSet::new();
    for measure in &mut next.all_measures {
        if !measure.tomb && measure.column_refs().any(|c| dead_refs.contains(&c.to_uppercase())) {
            measure.tomb = true;
            tombed_measures.insert(measure.id);
        }
    }

    let retyped = apply_type_changes(physical_types, &cc_types, &mut next, &mut tombed_measures);

    if let Some(detail) = unresolved_reference(&next, ctx.catalog, ctx.canonicalizer)? {
        if model.is_broken() {
            return Ok(ModelImpact::untouched(model, plan, ReloadOutcome::StillBroken));
        }
        debug!(model = %model.alias, %detail, "model broken by reload");
        let mut broken = model.clone();
        broken.mark_broken(BrokenReason::Schema);
        return Ok(ModelImpact {
            outcome: ReloadOutcome::Broken { detail },
            ..ModelImpact::untouched(&broken, plan, ReloadOutcome::Unchanged)
        });
    }

    let healed = model.is_broken();
    if healed {
        next.clear_broken();
    }

    let removed_ids: BTreeSet<u32> = tombed_columns.union(&tombed_measures).copied().collect();
    let mut next_plan = plan.clone();
    let renumbered = BTreeMap::new();
    let rule = plan.rule_based_index.as_ref().map(|r| r.pruned(&removed_ids));
    let specs = match &rule {
        Some(rule) => expand(rule, ctx.expand)?,
        None => Vec::new(),
    };
    next_plan.rule_based_index = rule;
    let layouts = next_plan.materialize(
        &specs,
        ColumnChanges {
            tombed: &removed_ids,
            type_changed: &retyped,
            renumbered: &renumbered,
        },
    );

    let outcome = if healed {
        ReloadOutcome::Healed
    } else if next != *model || next_plan != *plan || !layouts.is_empty() {
        ReloadOutcome::Modified
    } else {
        ReloadOutcome::Unchanged
    };

    Ok(ModelImpact {
        model: next,
        plan: next_plan,
        outcome,
        tombed_columns,
        tombed_measures,
        dropped_computed_columns: dropped,
        layouts,
    })
}

/// Computed columns removed by a reload, and the new types of those that
/// read a retyped column.
struct CcSurvey {
    dropped: Vec<String>,
    retyped: BTreeMap<String, DataType>,
}

/// Drop computed columns whose expression no longer resolves, or whose type
/// can no longer be inferred after `physical_types` applied. Repeats until
/// stable, since a computed column may reference another.
fn drop_unresolvable_ccs(
    ctx: &ImpactContext<'_>,
    model: &mut Model,
    physical_types: &BTreeMap<String, DataType>,
) -> CubeResult<CcSurvey> {
    let mut dropped = Vec::new();
    loop {
        let scope = ExprScope::for_model(model, ctx.catalog).with_computed_columns(model);
        let mut retyped = BTreeMap::new();
        let mut victim = None;
        for (index, cc) in model.computed_columns.iter().enumerate() {
            let referenced = match ctx.canonicalizer.referenced_columns(&cc.expression, &scope) {
                Ok(referenced) => referenced,
                Err(SqlError::UnknownColumn { .. }) | Err(SqlError::UnknownAlias { .. }) => {
                    victim = Some((index, "no longer resolves"));
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            if !referenced.iter().any(|c| physical_types.contains_key(c)) {
                continue;
            }
            match ctx.canonicalizer.evaluate_type(&cc.expression, &scope) {
                Ok(datatype) => {
                    retyped.insert(cc.column_ref(), datatype);
                }
                Err(SqlError::CannotInferType { .. }) | Err(SqlError::Unsupported { .. }) => {
                    victim = Some((index, "type no longer inferable"));
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        let Some((index, why)) = victim else {
            return Ok(CcSurvey { dropped, retyped });
        };
        let cc = model.computed_columns.remove(index);
        debug!(model = %model.alias, cc = %cc.column_ref(), why, "dropping computed column");
        dropped.push(cc.column_ref());
    }
}

/// Apply retyped physical columns, and the computed columns that follow
/// them. Returns ids whose layouts need a refresh.
fn apply_type_changes(
    mut changed: BTreeMap<String, DataType>,
    cc_types: &BTreeMap<String, DataType>,
    model: &mut Model,
    tombed_measures: &mut BTreeSet<u32>,
) -> BTreeSet<u32> {
    if changed.is_empty() {
        return BTreeSet::new();
    }

    for cc in &mut model.computed_columns {
        let Some(datatype) = cc_types.get(&cc.column_ref()) else {
            continue;
        };
        if *datatype != cc.datatype {
            debug!(cc = %cc.column_ref(), from = %cc.datatype, to = %datatype, "computed column retyped");
            cc.datatype = datatype.clone();
        }
        changed.insert(cc.column_ref().to_uppercase(), datatype.clone());
    }

    let mut retyped = BTreeSet::new();
    for column in &model.all_named_columns {
        if column.is_live() && changed.contains_key(&column.column_ref.to_uppercase()) {
            retyped.insert(column.id);
        }
    }

    for measure in &mut model.all_measures {
        if measure.tomb {
            continue;
        }
        let new_types: Vec<&DataType> = measure
            .column_refs()
            .filter_map(|c| changed.get(&c.to_uppercase()))
            .collect();
        if new_types.is_empty() {
            continue;
        }
        let kind = measure.function.expression;
        if new_types.iter().any(|t| !kind.accepts(t)) {
            measure.tomb = true;
            tombed_measures.insert(measure.id);
            continue;
        }
        let sole = measure.sole_column().is_some();
        if let (true, [only]) = (sole, new_types.as_slice()) {
            let derived = kind.derive_return_type(only, &measure.function.return_type);
            measure.function.return_type = derived;
        }
        retyped.insert(measure.id);
    }

    retyped
}
