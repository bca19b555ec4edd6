//! Schema reload reconciliation.
//!
//! The [`Reconciler`] applies a new version of a source table to every
//! model bound to it, in one optimistic transaction:
//!
//! ```text
//!   old table ─┐
//!              ├─▶ SchemaDiff ──▶ analyze(model) per bound model
//!   new table ─┘                         │
//!                                        ▼
//!            UnitOfWork [table, model, plan, dataflow, ...] ──▶ commit (CAS)
//!                                        │
//!                                        ▼
//!                      publish ModelBroken events, submit build jobs
//! ```
//!
//! A model's lifecycle:
//!
//! ```text
//!   Healthy ⇄ Healthy(modified) ──▶ Broken{reason} ──repair──▶ Healthy(modified)
//! ```
//!
//! Brokenness is persisted on the model, never returned as an error.

mod diff;
mod impact;
mod repair;

pub use diff::{SchemaDiff, TypeChange};
pub use impact::{analyze, unresolved_reference, ImpactContext, ModelImpact, ReloadOutcome};
pub use repair::{repair_model, ModelRepair, RepairError, RepairedModel};

use crate::config::Settings;
use crate::dataflow::{Dataflow, RealizationStatus, Segment};
use crate::error::{CubeError, CubeResult};
use crate::events::{DiscardEvents, EventSink, ModelBroken};
use crate::index::{ExpandOptions, IndexPlan, LayoutDiff, LayoutId};
use crate::jobs::{DiscardJobs, JobId, JobKind, JobRequest, JobSubmitter};
use crate::model::{catalog, BrokenReason, Model, TableDesc};
use crate::sql::{ExpressionCanonicalizer, SqlParserCanonicalizer};
use crate::store::{with_retries, MetadataStore, MetadataStoreExt, StoreError, UnitOfWork};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-model section of a [`ReloadReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelReport {
    pub model_id: String,
    pub model_alias: String,
    pub outcome: ReloadOutcome,
    pub tombed_columns: BTreeSet<u32>,
    pub tombed_measures: BTreeSet<u32>,
    pub dropped_computed_columns: Vec<String>,
    pub layouts: LayoutDiff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub project: String,
    pub table: String,
    pub diff: SchemaDiff,
    pub models: Vec<ModelReport>,
    /// Broken transitions, in model order. Also pushed through the sink.
    pub events: Vec<ModelBroken>,
    pub jobs: Vec<JobId>,
}

impl ReloadReport {
    pub fn model(&self, model_id: &str) -> Option<&ModelReport> {
        self.models.iter().find(|m| m.model_id == model_id)
    }
}

/// Side effects that may only happen once the transaction committed.
#[derive(Default)]
struct AfterCommit {
    events: Vec<ModelBroken>,
    jobs: Vec<JobRequest>,
}

/// Applies table schema changes and repairs to models in a store.
pub struct Reconciler<S: MetadataStore + ?Sized> {
    store: Arc<S>,
    settings: Settings,
    canonicalizer: Arc<dyn ExpressionCanonicalizer>,
    jobs: Arc<dyn JobSubmitter>,
    events: Arc<dyn EventSink>,
}

impl<S: MetadataStore + ?Sized> Reconciler<S> {
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

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Apply the change from `old` to `new` to the stored table and every
    /// model bound to it.
    pub fn reload(&self, project: &str, old: &TableDesc, new: TableDesc) -> CubeResult<ReloadReport> {
        let entity = format!("{}/table/{}", project, new.identity());
        let (report, after) = with_retries(&entity, self.settings.store.max_retries, || {
            self.try_reload(project, old, &new)
        })?;
        Ok(self.finish(report, after))
    }

    /// Like [`Reconciler::reload`], diffing against the stored version of
    /// the table.
    pub fn reload_from_store(&self, project: &str, new: TableDesc) -> CubeResult<ReloadReport> {
        let identity = new.identity();
        let entity = format!("{}/table/{}", project, identity);
        let (report, after) = with_retries(&entity, self.settings.store.max_retries, || {
            let old: TableDesc = self
                .store
                .get(project, &identity)?
                .ok_or_else(|| CubeError::not_found("table", identity.as_str()))?;
            self.try_reload(project, &old, &new)
        })?;
        Ok(self.finish(report, after))
    }

    /// Repair a broken model. On failure nothing is persisted and the model
    /// stays broken with its reason.
    pub fn repair(&self, project: &str, model_id: &str, fix: &ModelRepair) -> CubeResult<Model> {
        let entity = format!("{}/model/{}", project, model_id);
        let (model, after) = with_retries(&entity, self.settings.store.max_retries, || {
            self.try_repair(project, model_id, fix)
        })?;
        self.dispatch(after);
        Ok(model)
    }

    fn try_reload(
        &self,
        project: &str,
        old: &TableDesc,
        new: &TableDesc,
    ) -> CubeResult<(ReloadReport, AfterCommit)> {
        let identity = new.identity();
        let stored: Option<TableDesc> = self.store.get(project, &identity)?;
        let diff = SchemaDiff::between(old, new);
        let mut report = ReloadReport {
            project: project.to_string(),
            table: identity.clone(),
            diff: diff.clone(),
            models: Vec::new(),
            events: Vec::new(),
            jobs: Vec::new(),
        };
        let mut unit = UnitOfWork::new();

        let mut next_table = new.clone();
        next_table.project = project.to_string();
        let structural = old.structural_fingerprint().map_err(StoreError::from)?
            != new.structural_fingerprint().map_err(StoreError::from)?;
        if !structural {
            next_table.last_snapshot_path = stored
                .as_ref()
                .and_then(|t| t.last_snapshot_path.clone())
                .or_else(|| old.last_snapshot_path.clone());
            match &stored {
                Some(current) if same_table(current, &next_table) => {}
                Some(current) => {
                    unit.put(&next_table, current.mvcc)?;
                }
                None => {
                    unit.create(&next_table)?;
                }
            }
            unit.commit(self.store.as_ref())?;
            debug!(project, table = %identity, "schema unchanged, dependent models untouched");
            return Ok((report, AfterCommit::default()));
        }

        next_table.last_snapshot_path = None;
        match &stored {
            Some(current) => unit.put(&next_table, current.mvcc)?,
            None => unit.create(&next_table)?,
        };

        let mut tables = catalog(self.store.list::<TableDesc>(project)?);
        tables.insert(identity.clone(), next_table.clone());
        let ctx = ImpactContext {
            table: &next_table,
            diff: &diff,
            catalog: &tables,
            canonicalizer: self.canonicalizer.as_ref(),
            expand: ExpandOptions::from(&self.settings.layout),
        };

        let mut after = AfterCommit::default();
        let models: Vec<Model> = self.store.list(project)?;
        for model in models.iter().filter(|m| m.binds_table(&identity)) {
            let plan: IndexPlan = self
                .store
                .get(project, &model.id)?
                .ok_or_else(|| CubeError::not_found("index_plan", model.id.as_str()))?;
            let dataflow: Dataflow = self
                .store
                .get(project, &model.id)?
                .ok_or_else(|| CubeError::not_found("dataflow", model.id.as_str()))?;

            let impact = analyze(&ctx, model, &plan)?;
            self.stage_impact(&mut unit, &mut after, model, &plan, dataflow, &impact)?;
            report.models.push(ModelReport {
                model_id: model.id.clone(),
                model_alias: model.alias.clone(),
                outcome: impact.outcome,
                tombed_columns: impact.tombed_columns,
                tombed_measures: impact.tombed_measures,
                dropped_computed_columns: impact.dropped_computed_columns,
                layouts: impact.layouts,
            });
        }

        info!(
            project,
            table = %identity,
            models = report.models.len(),
            writes = unit.len(),
            "committing reload"
        );
        unit.commit(self.store.as_ref())?;
        report.events = after.events.clone();
        Ok((report, after))
    }

    fn stage_impact(
        &self,
        unit: &mut UnitOfWork,
        after: &mut AfterCommit,
        model: &Model,
        plan: &IndexPlan,
        mut dataflow: Dataflow,
        impact: &ModelImpact,
    ) -> CubeResult<()> {
        match &impact.outcome {
            ReloadOutcome::Unchanged | ReloadOutcome::StillBroken => {}
            ReloadOutcome::Broken { detail } => {
                warn!(project = %model.project, model = %model.alias, %detail, "model broken by schema change");
                unit.put(&impact.model, model.mvcc)?;
                dataflow.clear_segments();
                dataflow.status = RealizationStatus::Broken;
                unit.put(&dataflow, dataflow.mvcc)?;
                after.events.push(ModelBroken {
                    project: model.project.clone(),
                    model_id: model.id.clone(),
                    reason: BrokenReason::Schema,
                });
            }
            ReloadOutcome::Modified | ReloadOutcome::Healed => {
                unit.put(&impact.model, model.mvcc)?;
                if impact.plan != *plan {
                    unit.put(&impact.plan, plan.mvcc)?;
                }
                let before = dataflow.clone();
                dataflow.purge_layouts(&impact.layouts.to_remove);
                if impact.outcome == ReloadOutcome::Healed {
                    info!(project = %model.project, model = %model.alias, "model healed by schema change");
                    dataflow.status = RealizationStatus::Online;
                    if !dataflow.has_segments() {
                        dataflow.segments.push(Segment::pending_full_range());
                    }
                }
                if dataflow != before {
                    unit.put(&dataflow, before.mvcc)?;
                }
                if dataflow.has_segments() {
                    after.jobs.extend(build_jobs(
                        model,
                        &impact.layouts,
                        impact.outcome == ReloadOutcome::Healed,
                        &impact.plan,
                    ));
                }
            }
        }
        Ok(())
    }

    fn try_repair(
        &self,
        project: &str,
        model_id: &str,
        fix: &ModelRepair,
    ) -> CubeResult<(Model, AfterCommit)> {
        let model: Model = self
            .store
            .get(project, model_id)?
            .ok_or_else(|| CubeError::not_found("model", model_id))?;
        let plan: IndexPlan = self
            .store
            .get(project, model_id)?
            .ok_or_else(|| CubeError::not_found("index_plan", model_id))?;
        let mut dataflow: Dataflow = self
            .store
            .get(project, model_id)?
            .ok_or_else(|| CubeError::not_found("dataflow", model_id))?;
        let tables = catalog(self.store.list::<TableDesc>(project)?);

        let repaired = repair_model(
            &model,
            &plan,
            fix,
            &tables,
            self.canonicalizer.as_ref(),
            ExpandOptions::from(&self.settings.layout),
        )?;

        let mut unit = UnitOfWork::new();
        let saved = unit.put(&repaired.model, model.mvcc)?;
        unit.put(&repaired.plan, plan.mvcc)?;
        let expected = dataflow.mvcc;
        dataflow.purge_layouts(&repaired.layouts.to_remove);
        dataflow.status = RealizationStatus::Online;
        if !dataflow.has_segments() {
            dataflow.segments.push(Segment::pending_full_range());
        }
        unit.put(&dataflow, expected)?;
        unit.commit(self.store.as_ref())?;

        info!(
            project,
            model = %model.alias,
            renumbered = repaired.renumbered.len(),
            tombed = repaired.tombed.len(),
            "model repaired"
        );
        let mut after = AfterCommit::default();
        after
            .jobs
            .extend(build_jobs(&saved, &repaired.layouts, true, &repaired.plan));
        Ok((saved, after))
    }

    fn finish(&self, mut report: ReloadReport, after: AfterCommit) -> ReloadReport {
        report.jobs = self.dispatch(after);
        report
    }

    /// Publish events and submit jobs for a committed transaction.
    fn dispatch(&self, after: AfterCommit) -> Vec<JobId> {
        for event in after.events {
            self.events.publish(event);
        }
        if !self.settings.reload.submit_jobs {
            return Vec::new();
        }
        let mut ids = Vec::new();
        for request in after.jobs {
            match self.jobs.submit(request) {
                Ok(id) => ids.push(id),
                Err(err) => warn!(error = %err, "failed to submit layout job"),
            }
        }
        ids
    }
}

/// Jobs for one model: new layouts to build, stale ones to refresh. With
/// `all_layouts` every layout of the plan is built, e.g. for a fresh
/// full-range segment.
fn build_jobs(model: &Model, diff: &LayoutDiff, all_layouts: bool, plan: &IndexPlan) -> Vec<JobRequest> {
    let request = |layouts: BTreeSet<LayoutId>, kind| JobRequest {
        project: model.project.clone(),
        model_id: model.id.clone(),
        layouts,
        kind,
    };
    let mut jobs = Vec::new();
    let to_build = if all_layouts {
        plan.layout_ids()
    } else {
        diff.to_add.clone()
    };
    if !to_build.is_empty() {
        jobs.push(request(to_build, JobKind::IndexBuild));
    }
    if !all_layouts && !diff.to_refresh.is_empty() {
        jobs.push(request(diff.to_refresh.clone(), JobKind::IndexRefresh));
    }
    jobs
}

/// Equal apart from the version counter.
fn same_table(a: &TableDesc, b: &TableDesc) -> bool {
    TableDesc { mvcc: 0, ..a.clone() } == TableDesc { mvcc: 0, ..b.clone() }
}
