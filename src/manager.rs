//! Direct edits to models, their index plans and dataflows.
//!
//! Every operation is one optimistic transaction through the store, retried
//! on version conflicts. Validation failures leave the store untouched.

use crate::computed_column::{validate_display_name, CheckedModel, ComputedColumnResolver, JoinGraph};
use crate::config::Settings;
use crate::dataflow::{Dataflow, RealizationStatus};
use crate::error::{CubeError, CubeResult, ValidationError};
use crate::events::{DiscardEvents, EventSink, ModelBroken};
use crate::index::{
    expand, ColumnChanges, ExpandOptions, IndexPlan, LayoutDiff, LayoutId, RuleBasedIndex,
};
use crate::jobs::{DiscardJobs, JobKind, JobRequest, JobSubmitter};
use crate::model::{catalog, BrokenReason, ColumnStatus, Model, TableCatalog, TableDesc};
use crate::sql::{ExprScope, ExpressionCanonicalizer, SqlParserCanonicalizer};
use crate::store::{with_retries, MetadataStore, MetadataStoreExt, UnitOfWork};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ModelManager<S: MetadataStore + ?Sized> {
    store: Arc<S>,
    settings: Settings,
    canonicalizer: Arc<dyn ExpressionCanonicalizer>,
    jobs: Arc<dyn JobSubmitter>,
    events: Arc<dyn EventSink>,
}

impl<S: MetadataStore + ?Sized> ModelManager<S> {
    pub fn new(store: Arc<S>, settings: Settings) -> Self {
        Self {
            store,
            settings,
            canonicalizer: Arc::new(SqlParserCanonicalizer::new()),
            jobs: Arc::new(DiscardJobs),
            events: Arc::new(DiscardEvents),
        }
    }

    pub fn with_jobs(mut self, jobs: Arc<dyn JobSubmitter>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_canonicalizer(mut self, canonicalizer: Arc<dyn ExpressionCanonicalizer>) -> Self {
        self.canonicalizer = canonicalizer;
        self
    }

    fn resolver(&self) -> ComputedColumnResolver {
        ComputedColumnResolver::new(
            self.canonicalizer.clone(),
            self.settings.computed_column.clone(),
        )
    }

    fn expand_options(&self) -> ExpandOptions {
        ExpandOptions::from(&self.settings.layout)
    }

    fn retries(&self) -> u32 {
        self.settings.store.max_retries
    }

    pub fn get_model(&self, project: &str, model_id: &str) -> CubeResult<Model> {
        self.store
            .get(project, model_id)?
            .ok_or_else(|| CubeError::not_found("model", model_id))
    }

    pub fn get_plan(&self, project: &str, model_id: &str) -> CubeResult<IndexPlan> {
        self.store
            .get(project, model_id)?
            .ok_or_else(|| CubeError::not_found("index_plan", model_id))
    }

    pub fn get_dataflow(&self, project: &str, model_id: &str) -> CubeResult<Dataflow> {
        self.store
            .get(project, model_id)?
            .ok_or_else(|| CubeError::not_found("dataflow", model_id))
    }

    /// Model whose alias is `alias`, ignoring case.
    pub fn find_model(&self, project: &str, alias: &str) -> CubeResult<Model> {
        self.store
            .list::<Model>(project)?
            .into_iter()
            .find(|m| m.alias.eq_ignore_ascii_case(alias))
            .ok_or_else(|| CubeError::not_found("model", alias))
    }

    /// Store the source table descriptors a model can bind to.
    pub fn save_tables(&self, project: &str, tables: &[TableDesc]) -> CubeResult<()> {
        with_retries(&format!("{}/tables", project), self.retries(), || {
            let mut unit = UnitOfWork::new();
            for table in tables {
                let mut table = table.clone();
                table.project = project.to_string();
                match self.store.get::<TableDesc>(project, &table.identity())? {
                    Some(current) => unit.put(&table, current.mvcc)?,
                    None => unit.create(&table)?,
                };
            }
            unit.commit(self.store.as_ref())?;
            Ok(())
        })
    }

    /// Create a model together with its index plan and dataflow.
    ///
    /// The model's computed columns are checked against the project and,
    /// with `computed_column.auto_adjust`, renamed to agree with it.
    pub fn create_model(&self, model: &Model, rule: Option<RuleBasedIndex>) -> CubeResult<CheckedModel> {
        let project = model.project.as_str();
        with_retries(&format!("{}/model/{}", project, model.id), self.retries(), || {
            let existing: Vec<Model> = self.store.list(project)?;
            if existing
                .iter()
                .any(|m| m.id == model.id || m.alias.eq_ignore_ascii_case(&model.alias))
            {
                return Err(ValidationError::ModelExists {
                    project: project.to_string(),
                    model: model.alias.clone(),
                }
                .into());
            }
            let tables = self.tables(project)?;
            let checked = self.validate(model, &existing, &tables)?;
            let created = &checked.model;

            let mut plan = IndexPlan::new(created.id.clone(), project);
            if let Some(rule) = &rule {
                check_rule(rule, created)?;
                let specs = expand(rule, self.expand_options())?;
                plan.materialize(&specs, no_changes(&BTreeSet::new(), &BTreeMap::new()));
                plan.rule_based_index = Some(rule.clone());
            }
            let dataflow = Dataflow::new(created.id.clone(), project);

            let mut unit = UnitOfWork::new();
            let saved = unit.create(created)?;
            unit.create(&plan)?;
            unit.create(&dataflow)?;
            unit.commit(self.store.as_ref())?;

            info!(project, model = %saved.alias, layouts = plan.layout_ids().len(), "model created");
            Ok(CheckedModel {
                model: saved,
                adjustments: checked.adjustments,
            })
        })
    }

    /// Replace a model definition. Column and measure ids are append-only;
    /// layouts built on newly tombed ids are removed.
    pub fn update_model(&self, model: &Model) -> CubeResult<CheckedModel> {
        let project = model.project.as_str();
        with_retries(&format!("{}/model/{}", project, model.id), self.retries(), || {
            let current = self.get_model(project, &model.id)?;
            check_append_only(&current, model)?;

            let others: Vec<Model> = self
                .store
                .list::<Model>(project)?
                .into_iter()
                .filter(|m| m.id != model.id)
                .collect();
            if others.iter().any(|m| m.alias.eq_ignore_ascii_case(&model.alias)) {
                return Err(ValidationError::ModelExists {
                    project: project.to_string(),
                    model: model.alias.clone(),
                }
                .into());
            }
            let tables = self.tables(project)?;
            let checked = self.validate(model, &others, &tables)?;

            let mut plan = self.get_plan(project, &model.id)?;
            let mut dataflow = self.get_dataflow(project, &model.id)?;
            let plan_before = plan.clone();
            let dataflow_before = dataflow.clone();

            let live_before: BTreeSet<u32> = current
                .live_column_ids()
                .union(&current.live_measure_ids())
                .copied()
                .collect();
            let live_after: BTreeSet<u32> = checked
                .model
                .live_column_ids()
                .union(&checked.model.live_measure_ids())
                .copied()
                .collect();
            let mut removed: BTreeSet<u32> = live_before.difference(&live_after).copied().collect();
            // dimensions demoted to plain columns leave the rule too
            removed.extend(current.dimension_ids().difference(&checked.model.dimension_ids()));

            let rule = plan.rule_based_index.as_ref().map(|r| r.pruned(&removed));
            let diff = self.rematerialize(&mut plan, &removed, rule)?;
            dataflow.purge_layouts(&diff.to_remove);

            let mut unit = UnitOfWork::new();
            let saved = unit.put(&checked.model, model.mvcc)?;
            if plan != plan_before {
                unit.put(&plan, plan_before.mvcc)?;
            }
            if dataflow != dataflow_before {
                unit.put(&dataflow, dataflow_before.mvcc)?;
            }
            unit.commit(self.store.as_ref())?;
            info!(project, model = %saved.alias, removed = diff.to_remove.len(), "model updated");
            self.submit(&saved, &dataflow, &diff);
            Ok(CheckedModel {
                model: saved,
                adjustments: checked.adjustments,
            })
        })
    }

    /// Replace the aggregation rule of a model.
    pub fn update_rule(&self, project: &str, model_id: &str, rule: RuleBasedIndex) -> CubeResult<LayoutDiff> {
        let model = self.get_model(project, model_id)?;
        check_rule(&rule, &model)?;
        rule.validate(self.settings.layout.max_combinations)?;
        self.edit_plan(project, &model, |manager, plan| {
            manager.rematerialize(plan, &BTreeSet::new(), Some(rule.clone()))
        })
    }

    /// Re-expand the current rule under current settings, e.g. after the
    /// base layout switch changed.
    pub fn refresh_layouts(&self, project: &str, model_id: &str) -> CubeResult<LayoutDiff> {
        let model = self.get_model(project, model_id)?;
        self.edit_plan(project, &model, |manager, plan| {
            let rule = plan.rule_based_index.clone();
            manager.rematerialize(plan, &BTreeSet::new(), rule)
        })
    }

    /// Add a table index over live columns, in the given order.
    pub fn add_table_index(&self, project: &str, model_id: &str, col_order: Vec<u32>) -> CubeResult<LayoutId> {
        let model = self.get_model(project, model_id)?;
        let mut added = None;
        self.edit_plan(project, &model, |manager, plan| {
            // re-read on every attempt: a racing reload may have tombed a column
            let live = manager.get_model(project, model_id)?.live_column_ids();
            if let Some(unknown) = col_order.iter().find(|id| !live.contains(id)) {
                return Err(ValidationError::UnresolvedReference {
                    what: "table index".to_string(),
                    reference: unknown.to_string(),
                }
                .into());
            }
            let before = plan.layout_ids();
            let id = plan.add_table_index(col_order.clone());
            added = Some(id);
            let mut diff = LayoutDiff::default();
            if !before.contains(&id) {
                diff.to_add.insert(id);
            }
            Ok(diff)
        })?;
        added.ok_or_else(|| CubeError::not_found("layout", model_id))
    }

    /// Delete layouts and keep the rule from producing them again.
    pub fn blacklist_layouts(
        &self,
        project: &str,
        model_id: &str,
        layouts: &BTreeSet<LayoutId>,
    ) -> CubeResult<BTreeSet<LayoutId>> {
        let model = self.get_model(project, model_id)?;
        let diff = self.edit_plan(project, &model, |_, plan| {
            Ok(LayoutDiff {
                to_remove: plan.blacklist(layouts),
                ..LayoutDiff::default()
            })
        })?;
        Ok(diff.to_remove)
    }

    /// Break a model for a non-schema reason. Breaking an already broken
    /// model changes nothing and emits nothing.
    pub fn mark_broken(&self, project: &str, model_id: &str, reason: BrokenReason) -> CubeResult<Model> {
        if reason == BrokenReason::None {
            return Err(ValidationError::IllegalBrokenReason(reason).into());
        }
        let (model, transitioned) = with_retries(
            &format!("{}/model/{}", project, model_id),
            self.retries(),
            || {
                let mut model = self.get_model(project, model_id)?;
                if model.is_broken() {
                    return Ok((model, false));
                }
                let mut dataflow = self.get_dataflow(project, model_id)?;
                let expected = (model.mvcc, dataflow.mvcc);
                model.mark_broken(reason);
                dataflow.clear_segments();
                dataflow.status = RealizationStatus::Broken;

                let mut unit = UnitOfWork::new();
                let saved = unit.put(&model, expected.0)?;
                unit.put(&dataflow, expected.1)?;
                unit.commit(self.store.as_ref())?;
                Ok((saved, true))
            },
        )?;
        if transitioned {
            warn!(project, model = %model.alias, ?reason, "model marked broken");
            self.events.publish(ModelBroken {
                project: project.to_string(),
                model_id: model.id.clone(),
                reason,
            });
        }
        Ok(model)
    }

    /// Break the model with `SegmentOverlap` when two complete segments
    /// overlap illegally. Returns whether it did.
    pub fn verify_segments(&self, project: &str, model_id: &str) -> CubeResult<bool> {
        let dataflow = self.get_dataflow(project, model_id)?;
        let Some((a, b)) = dataflow.overlapping_segments() else {
            return Ok(false);
        };
        debug!(project, model_id, first = %a.id, second = %b.id, "overlapping segments");
        let model = self.get_model(project, model_id)?;
        if model.is_broken() {
            return Ok(false);
        }
        self.mark_broken(project, model_id, BrokenReason::SegmentOverlap)?;
        Ok(true)
    }

    /// Delete a model with its index plan and dataflow.
    pub fn drop_model(&self, project: &str, model_id: &str) -> CubeResult<()> {
        with_retries(&format!("{}/model/{}", project, model_id), self.retries(), || {
            let model = self.get_model(project, model_id)?;
            let mut unit = UnitOfWork::new();
            unit.delete(&model);
            if let Some(plan) = self.store.get::<IndexPlan>(project, model_id)? {
                unit.delete(&plan);
            }
            if let Some(dataflow) = self.store.get::<Dataflow>(project, model_id)? {
                unit.delete(&dataflow);
            }
            unit.commit(self.store.as_ref())?;
            info!(project, model = %model.alias, "model dropped");
            Ok(())
        })
    }

    fn tables(&self, project: &str) -> CubeResult<TableCatalog> {
        Ok(catalog(self.store.list::<TableDesc>(project)?))
    }

    /// Structural checks, then the computed column check.
    fn validate(&self, model: &Model, others: &[Model], tables: &TableCatalog) -> CubeResult<CheckedModel> {
        let settings = &self.settings.computed_column;
        validate_display_name("model", &model.alias, settings)?;
        JoinGraph::from_model(model)
            .check_tree()
            .map_err(ValidationError::JoinGraph)?;
        for (alias, table) in model.aliases() {
            if !tables.contains_key(&table.to_uppercase()) {
                return Err(ValidationError::UnresolvedReference {
                    what: format!("alias {}", alias),
                    reference: table.to_string(),
                }
                .into());
            }
        }

        let checked = self
            .resolver()
            .check_model(model, others, tables, settings.auto_adjust)?;
        let model = &checked.model;
        let scope = ExprScope::for_model(model, tables).with_computed_columns(model);

        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        for column in &model.all_named_columns {
            if !ids.insert(column.id) {
                return Err(ValidationError::IdNotAppendOnly {
                    kind: "column",
                    id: column.id,
                }
                .into());
            }
            if !column.is_live() {
                continue;
            }
            validate_display_name("dimension", &column.name, settings)?;
            if !names.insert(column.name.to_uppercase()) {
                return Err(ValidationError::DuplicateName {
                    kind: "column",
                    name: column.name.clone(),
                }
                .into());
            }
            if !scope.contains(&column.column_ref) {
                return Err(ValidationError::UnresolvedReference {
                    what: format!("column {}", column.name),
                    reference: column.column_ref.clone(),
                }
                .into());
            }
        }

        let mut names = BTreeSet::new();
        for measure in &model.all_measures {
            if measure.id < crate::model::MEASURE_ID_BASE || !ids.insert(measure.id) {
                return Err(ValidationError::IdNotAppendOnly {
                    kind: "measure",
                    id: measure.id,
                }
                .into());
            }
            if measure.tomb {
                continue;
            }
            validate_display_name("measure", &measure.name, settings)?;
            if !names.insert(measure.name.to_uppercase()) {
                return Err(ValidationError::DuplicateName {
                    kind: "measure",
                    name: measure.name.clone(),
                }
                .into());
            }
            for column_ref in measure.column_refs() {
                let datatype = scope.column_type(column_ref).ok_or_else(|| {
                    ValidationError::UnresolvedReference {
                        what: format!("measure {}", measure.name),
                        reference: column_ref.to_string(),
                    }
                })?;
                if !measure.function.expression.accepts(datatype) {
                    return Err(ValidationError::IncompatibleMeasure {
                        measure: measure.name.clone(),
                        datatype: datatype.to_string(),
                    }
                    .into());
                }
            }
        }

        for (kind, column_ref) in model.critical_refs() {
            if !scope.contains(column_ref) {
                return Err(ValidationError::UnresolvedReference {
                    what: kind.to_string(),
                    reference: column_ref.to_string(),
                }
                .into());
            }
        }
        if let Some(filter) = &model.filter_condition {
            self.canonicalizer.referenced_columns(filter, &scope)?;
        }
        Ok(checked)
    }

    /// Install `rule` and re-materialize it, dropping layouts that hold any
    /// of `removed`.
    fn rematerialize(
        &self,
        plan: &mut IndexPlan,
        removed: &BTreeSet<u32>,
        rule: Option<RuleBasedIndex>,
    ) -> CubeResult<LayoutDiff> {
        let specs = match &rule {
            Some(rule) => expand(rule, self.expand_options())?,
            None => Vec::new(),
        };
        let renumbered = BTreeMap::new();
        let diff = plan.materialize(&specs, no_changes(removed, &renumbered));
        plan.rule_based_index = rule;
        Ok(diff)
    }

    /// Read-modify-write the plan of `model`, purging removed layouts from
    /// its dataflow and submitting jobs for added ones.
    fn edit_plan(
        &self,
        project: &str,
        model: &Model,
        mut edit: impl FnMut(&Self, &mut IndexPlan) -> CubeResult<LayoutDiff>,
    ) -> CubeResult<LayoutDiff> {
        let (diff, dataflow) = with_retries(
            &format!("{}/index_plan/{}", project, model.id),
            self.retries(),
            || {
                let mut plan = self.get_plan(project, &model.id)?;
                let mut dataflow = self.get_dataflow(project, &model.id)?;
                let (plan_mvcc, dataflow_mvcc) = (plan.mvcc, dataflow.mvcc);
                let before = plan.clone();
                let diff = edit(self, &mut plan)?;
                if plan == before {
                    return Ok((diff, dataflow));
                }
                let mut unit = UnitOfWork::new();
                unit.put(&plan, plan_mvcc)?;
                if !diff.to_remove.is_empty() {
                    dataflow.purge_layouts(&diff.to_remove);
                    dataflow = unit.put(&dataflow, dataflow_mvcc)?;
                }
                unit.commit(self.store.as_ref())?;
                Ok((diff, dataflow))
            },
        )?;
        debug!(
            project,
            model = %model.alias,
            added = diff.to_add.len(),
            removed = diff.to_remove.len(),
            "index plan updated"
        );
        self.submit(model, &dataflow, &diff);
        Ok(diff)
    }

    fn submit(&self, model: &Model, dataflow: &Dataflow, diff: &LayoutDiff) {
        if !self.settings.reload.submit_jobs || !dataflow.has_segments() || diff.to_add.is_empty() {
            return;
        }
        let request = JobRequest {
            project: model.project.clone(),
            model_id: model.id.clone(),
            layouts: diff.to_add.clone(),
            kind: JobKind::IndexBuild,
        };
        if let Err(err) = self.jobs.submit(request) {
            warn!(model = %model.alias, error = %err, "failed to submit layout job");
        }
    }
}

fn no_changes<'a>(tombed: &'a BTreeSet<u32>, renumbered: &'a BTreeMap<u32, u32>) -> ColumnChanges<'a> {
    ColumnChanges {
        tombed,
        type_changed: &EMPTY,
        renumbered,
    }
}

static EMPTY: BTreeSet<u32> = BTreeSet::new();

/// Rule dimensions must be live dimensions, rule measures live measures.
fn check_rule(rule: &RuleBasedIndex, model: &Model) -> CubeResult<()> {
    let dimensions = model.dimension_ids();
    let measures = model.live_measure_ids();
    for id in &rule.dimensions {
        if !dimensions.contains(id) {
            return Err(ValidationError::UnresolvedReference {
                what: "aggregation rule".to_string(),
                reference: format!("dimension {}", id),
            }
            .into());
        }
    }
    for id in &rule.measures {
        if !measures.contains(id) {
            return Err(ValidationError::UnresolvedReference {
                what: "aggregation rule".to_string(),
                reference: format!("measure {}", id),
            }
            .into());
        }
    }
    Ok(())
}

/// Every stored id survives with its source reference; tombs stay tombs.
fn check_append_only(current: &Model, next: &Model) -> Result<(), ValidationError> {
    for before in &current.all_named_columns {
        let after = next.named_column(before.id);
        let kept = after.is_some_and(|after| {
            after.column_ref.eq_ignore_ascii_case(&before.column_ref)
                && (before.is_live() || after.status == ColumnStatus::Tomb)
        });
        if !kept {
            return Err(ValidationError::IdNotAppendOnly {
                kind: "column",
                id: before.id,
            });
        }
    }
    let max_column = current.all_named_columns.iter().map(|c| c.id).max();
    for column in &next.all_named_columns {
        if current.named_column(column.id).is_none() && max_column.is_some_and(|max| column.id <= max) {
            return Err(ValidationError::IdNotAppendOnly {
                kind: "column",
                id: column.id,
            });
        }
    }

    for before in &current.all_measures {
        let kept = next
            .measure(before.id)
            .is_some_and(|after| !before.tomb || after.tomb);
        if !kept {
            return Err(ValidationError::IdNotAppendOnly {
                kind: "measure",
                id: before.id,
            });
        }
    }
    let max_measure = current.all_measures.iter().map(|m| m.id).max();
    for measure in &next.all_measures {
        if current.measure(measure.id).is_none() && max_measure.is_some_and(|max| measure.id <= max) {
            return Err(ValidationError::IdNotAppendOnly {
                kind: "measure",
                id: measure.id,
            });
        }
    }
    Ok(())
}
