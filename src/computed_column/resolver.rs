use super::join_path::JoinGraph;
use super::naming::validate_cc_name;
use super::{
    BadModelError, ConflictCause, ConflictDetail, ConflictError, ConflictVerdict,
};
use crate::config::ComputedColumnSettings;
use crate::error::{CubeResult, ValidationError};
use crate::model::{ComputedColumnDesc, Model, ParameterDesc, TableCatalog};
use crate::sql::{rename_column, rewrite_qualifiers, ExprScope, ExpressionCanonicalizer};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// A model after conflict checking, with the renames auto-adjust applied.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckedModel {
    pub model: Model,
    pub adjustments: Vec<ConflictDetail>,
}

/// One computed column in comparison form.
#[derive(Debug, Clone)]
struct Entry {
    index: usize,
    alias: String,
    name: String,
    canonical: String,
    /// Canonical expression with alias qualifiers replaced by join-path
    /// signatures.
    comparison: String,
    /// Join-path signature of the hosting alias.
    position: String,
}

impl Entry {
    fn column_ref(&self) -> String {
        format!("{}.{}", self.alias, self.name)
    }
}

struct Prepared {
    model_alias: String,
    graph: JoinGraph,
    entries: Vec<Entry>,
}

/// Checks computed columns within and across the models of a project.
///
/// Stateless apart from its configuration; one instance can serve many
/// threads.
#[derive(Clone)]
pub struct ComputedColumnResolver {
    canonicalizer: Arc<dyn ExpressionCanonicalizer>,
    settings: ComputedColumnSettings,
}

impl ComputedColumnResolver {
    pub fn new(canonicalizer: Arc<dyn ExpressionCanonicalizer>, settings: ComputedColumnSettings) -> Self {
        Self {
            canonicalizer,
            settings,
        }
    }

    pub fn settings(&self) -> &ComputedColumnSettings {
        &self.settings
    }

    /// Check one candidate column as if it were part of `model`.
    ///
    /// A column of `model` with the same alias and name is replaced by the
    /// candidate. `project_models` may include `model` itself; it is skipped.
    pub fn check_conflict(
        &self,
        candidate: &ComputedColumnDesc,
        model: &Model,
        project_models: &[Model],
        tables: &TableCatalog,
    ) -> CubeResult<ConflictVerdict> {
        let mut hosted = model.clone();
        let index = match hosted
            .computed_columns
            .iter()
            .position(|cc| cc.table_alias == candidate.table_alias && cc.is_named(&candidate.column_name))
        {
            Some(index) => {
                hosted.computed_columns[index] = candidate.clone();
                index
            }
            None => {
                hosted.computed_columns.push(candidate.clone());
                hosted.computed_columns.len() - 1
            }
        };

        let prepared = self.prepare(&hosted, tables, true)?;
        let others = self.prepare_others(&hosted, project_models, tables);
        let conflicts = match prepared.entries.iter().find(|e| e.index == index) {
            Some(entry) => conflicts_for(entry, &prepared, &others),
            None => Vec::new(),
        };
        if conflicts.is_empty() {
            Ok(ConflictVerdict::Clear)
        } else {
            Ok(ConflictVerdict::Conflicts(conflicts))
        }
    }

    /// Validate and canonicalize every computed column of `model` and check
    /// it against the project.
    ///
    /// Without `auto_adjust` the first conflict is returned as an error and
    /// nothing is changed. With it, name and expression conflicts against
    /// other models are resolved by renaming; position and self conflicts
    /// stay fatal.
    pub fn check_model(
        &self,
        model: &Model,
        project_models: &[Model],
        tables: &TableCatalog,
        auto_adjust: bool,
    ) -> CubeResult<CheckedModel> {
        self.validate_names(model, tables)?;

        let mut model = model.clone();
        let scope = ExprScope::for_model(&model, tables).with_computed_columns(&model);
        for cc in &mut model.computed_columns {
            cc.inner_expression = self.canonicalizer.massage(&cc.expression, &scope)?;
            let referenced = self.canonicalizer.referenced_columns(&cc.expression, &scope)?;
            let local_prefix = format!("{}.", cc.table_alias);
            if cc.table_alias != model.root_fact_table.alias
                && !referenced.iter().any(|c| c.starts_with(&local_prefix))
            {
                return Err(BadModelError::NotRootFactForNonLocalExpr {
                    cc: cc.column_ref(),
                    alias: cc.table_alias.clone(),
                }
                .into());
            }
        }

        let others = self.prepare_others(&model, project_models, tables);
        let mut adjustments = Vec::new();

        for index in 0..model.computed_columns.len() {
            let prepared = self.prepare(&model, tables, true)?;
            let Some(entry) = prepared.entries.iter().find(|e| e.index == index) else {
                continue;
            };
            let conflicts = conflicts_for(entry, &prepared, &others);
            let Some(first) = conflicts.first() else {
                continue;
            };
            if !auto_adjust || conflicts.iter().any(|c| !c.cause.is_adjustable()) {
                let fatal = conflicts
                    .iter()
                    .find(|c| !c.cause.is_adjustable())
                    .unwrap_or(first);
                return Err(fatal.clone().into());
            }

            let (conflict, new_name) = match conflicts
                .iter()
                .find(|c| c.cause == ConflictCause::SameExprDiffName)
            {
                Some(conflict) => (conflict.clone(), conflict.advise.clone().unwrap_or_default()),
                None => (
                    first.clone(),
                    fresh_name(&entry.name, &model, project_models),
                ),
            };
            let renamed_to = rename_cc(&mut model, index, &new_name)?;
            info!(
                model = %model.alias,
                from = %conflict.bad_cc,
                to = %renamed_to,
                cause = ?conflict.cause,
                "auto-adjusted computed column"
            );

            let prepared = self.prepare(&model, tables, true)?;
            if let Some(entry) = prepared.entries.iter().find(|e| e.index == index) {
                if let Some(remaining) = conflicts_for(entry, &prepared, &others).into_iter().next() {
                    return Err(remaining.into());
                }
            }
            adjustments.push(ConflictDetail {
                conflict,
                renamed_to,
            });
        }

        if !adjustments.is_empty() {
            let scope = ExprScope::for_model(&model, tables).with_computed_columns(&model);
            for cc in &mut model.computed_columns {
                cc.inner_expression = self.canonicalizer.massage(&cc.expression, &scope)?;
            }
        }

        Ok(CheckedModel { model, adjustments })
    }

    fn validate_names(&self, model: &Model, tables: &TableCatalog) -> CubeResult<()> {
        for cc in &model.computed_columns {
            validate_cc_name(&cc.column_name, &self.settings)?;
            let table = model
                .alias_table(&cc.table_alias)
                .ok_or_else(|| ValidationError::UnresolvedReference {
                    what: format!("computed column {}", cc.column_ref()),
                    reference: cc.table_alias.clone(),
                })?;
            if tables
                .get(table)
                .is_some_and(|desc| desc.has_column(&cc.column_name))
            {
                return Err(ValidationError::ColumnNameClash {
                    name: cc.column_name.clone(),
                    table: table.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn prepare_others(&self, model: &Model, project_models: &[Model], tables: &TableCatalog) -> Vec<Prepared> {
        project_models
            .iter()
            .filter(|other| other.id != model.id)
            .filter_map(|other| self.prepare(other, tables, false).ok())
            .collect()
    }

    /// Canonical and comparison forms of every computed column of `model`.
    ///
    /// With `strict` a column that fails to canonicalize is an error;
    /// otherwise it is skipped, so a broken neighbour model cannot block
    /// the check.
    fn prepare(&self, model: &Model, tables: &TableCatalog, strict: bool) -> CubeResult<Prepared> {
        let graph = JoinGraph::from_model(model);
        let scope = ExprScope::for_model(model, tables).with_computed_columns(model);
        let mut entries = Vec::new();
        for (index, cc) in model.computed_columns.iter().enumerate() {
            let canonical = if !strict && !cc.inner_expression.is_empty() {
                Ok(cc.inner_expression.clone())
            } else {
                self.canonicalizer.massage(&cc.expression, &scope)
            };
            let canonical = match canonical {
                Ok(canonical) => canonical,
                Err(err) if strict => return Err(err.into()),
                Err(err) => {
                    debug!(model = %model.alias, cc = %cc.column_ref(), error = %err, "skipping computed column");
                    continue;
                }
            };
            let comparison = rewrite_qualifiers(&canonical, |alias| graph.signature(alias))?;
            let position = graph
                .signature(&cc.table_alias)
                .unwrap_or_else(|| cc.table_alias.clone());
            entries.push(Entry {
                index,
                alias: cc.table_alias.clone(),
                name: cc.column_name.clone(),
                canonical,
                comparison,
                position,
            });
        }
        Ok(Prepared {
            model_alias: model.alias.clone(),
            graph,
            entries,
        })
    }
}

fn conflicts_for(candidate: &Entry, model: &Prepared, others: &[Prepared]) -> Vec<ConflictError> {
    let conflict = |cause, other: &Entry, conflicting_model: &str, advise| ConflictError {
        cause,
        bad_cc: candidate.column_ref(),
        bad_expression: candidate.canonical.clone(),
        conflicting_model: conflicting_model.to_string(),
        conflicting_cc: other.column_ref(),
        advise,
    };

    let mut conflicts = Vec::new();
    for other in model.entries.iter().filter(|e| e.index != candidate.index) {
        if other.name.eq_ignore_ascii_case(&candidate.name) {
            conflicts.push(conflict(
                ConflictCause::SelfConflictSameName,
                other,
                &model.model_alias,
                None,
            ));
        } else if other.comparison == candidate.comparison {
            conflicts.push(conflict(
                ConflictCause::SelfConflictSameExpression,
                other,
                &model.model_alias,
                None,
            ));
        }
    }

    for prepared in others {
        for other in &prepared.entries {
            let same_name = other.name.eq_ignore_ascii_case(&candidate.name);
            let same_expr = other.comparison == candidate.comparison;
            let same_position = other.position == candidate.position;
            let relocate = || {
                prepared
                    .graph
                    .path_graph(&other.alias)
                    .and_then(|path| model.graph.find_isomorphic_alias(&path))
            };
            let found = match (same_name, same_expr, same_position) {
                (true, _, false) => Some((ConflictCause::WrongPositionDueToName, relocate())),
                (true, false, true) => Some((
                    ConflictCause::SameNameDiffExpr,
                    Some(other.canonical.clone()),
                )),
                (false, true, true) => Some((
                    ConflictCause::SameExprDiffName,
                    Some(other.name.clone()),
                )),
                (false, true, false) => Some((ConflictCause::WrongPositionDueToExpr, relocate())),
                _ => None,
            };
            if let Some((cause, advise)) = found {
                conflicts.push(conflict(cause, other, &prepared.model_alias, advise));
            }
        }
    }
    conflicts
}

/// `NAME_1`, `NAME_2`, ... whichever is first unused in the project.
fn fresh_name(base: &str, model: &Model, project_models: &[Model]) -> String {
    let taken: BTreeSet<String> = project_models
        .iter()
        .chain(std::iter::once(model))
        .flat_map(|m| m.computed_columns.iter())
        .map(|cc| cc.column_name.to_uppercase())
        .collect();
    (1..)
        .map(|n| format!("{}_{}", base.to_uppercase(), n))
        .find(|name| !taken.contains(name))
        .unwrap_or_else(|| base.to_uppercase())
}

/// Rename computed column `index` and every reference to it. Returns the
/// new `ALIAS.NAME`.
fn rename_cc(model: &mut Model, index: usize, new_name: &str) -> CubeResult<String> {
    let cc = &mut model.computed_columns[index];
    let old_name = cc.column_name.clone();
    let old_ref = cc.column_ref();
    cc.column_name = new_name.to_uppercase();
    let new_ref = cc.column_ref();

    for column in &mut model.all_named_columns {
        if column.column_ref.eq_ignore_ascii_case(&old_ref) {
            column.column_ref = new_ref.clone();
            if column.name.eq_ignore_ascii_case(&old_name) {
                column.name = new_name.to_uppercase();
            }
        }
    }
    for measure in &mut model.all_measures {
        for parameter in &mut measure.function.parameters {
            if let ParameterDesc::Column(column) = parameter {
                if column.eq_ignore_ascii_case(&old_ref) {
                    *column = new_ref.clone();
                }
            }
        }
    }
    if let Some(partition) = &mut model.partition_desc {
        if partition.column.eq_ignore_ascii_case(&old_ref) {
            partition.column = new_ref.clone();
        }
    }
    if let Some(multi) = &mut model.multi_partition_desc {
        for column in &mut multi.columns {
            if column.eq_ignore_ascii_case(&old_ref) {
                *column = new_ref.clone();
            }
        }
    }
    if let Some(filter) = &model.filter_condition {
        model.filter_condition = Some(rename_column(filter, &old_ref, &new_ref)?);
    }
    for (position, other) in model.computed_columns.iter_mut().enumerate() {
        if position != index {
            other.expression = rename_column(&other.expression, &old_ref, &new_ref)?;
        }
    }
    Ok(new_ref)
}
