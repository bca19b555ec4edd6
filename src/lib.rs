//! # cubesync
//!
//! Keeps OLAP cube metadata consistent while the source tables underneath it
//! evolve.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Model (tables, joins, columns, measures, CCs)     │
//! └─────────────────────────────────────────────────────────┘
//!            │                                  │
//!            ▼ [computed_column]                ▼ [index]
//! ┌──────────────────────────┐    ┌──────────────────────────┐
//! │  conflict check / adjust │    │ rule expansion + plan    │
//! │  (sql canonicalizer)     │    │ (layout ids, blacklist)  │
//! └──────────────────────────┘    └──────────────────────────┘
//!            │                                  │
//!            └───────────────┬──────────────────┘
//!                            ▼ [manager / reload]
//! ┌─────────────────────────────────────────────────────────┐
//! │   optimistic unit of work over the metadata store        │
//! │   (model + index plan + dataflow commit together)        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼ after commit
//! ┌──────────────────────────┐    ┌──────────────────────────┐
//! │  events (ModelBroken)    │    │  jobs (build / refresh)  │
//! └──────────────────────────┘    └──────────────────────────┘
//! ```

pub mod computed_column;
pub mod config;
pub mod dataflow;
pub mod error;
pub mod events;
pub mod index;
pub mod jobs;
pub mod manager;
pub mod model;
pub mod reload;
pub mod sql;
pub mod store;
pub mod test_utils;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::computed_column::{CheckedModel, ComputedColumnResolver, ConflictCause, ConflictError};
    pub use crate::config::Settings;
    pub use crate::dataflow::{dataflow_status, segment_status, Dataflow, Segment, SegmentRange};
    pub use crate::error::{CubeError, CubeResult, ValidationError};
    pub use crate::events::{EventSink, ModelBroken};
    pub use crate::index::{expand, AggregationGroup, IndexPlan, LayoutDiff, LayoutId, RuleBasedIndex, SelectRule};
    pub use crate::jobs::{JobKind, JobRequest, JobSubmitter};
    pub use crate::manager::ModelManager;
    pub use crate::model::{BrokenReason, ColumnStatus, Model, TableDesc};
    pub use crate::reload::{ModelRepair, Reconciler, ReloadOutcome, ReloadReport, SchemaDiff};
    pub use crate::sql::{ExpressionCanonicalizer, SqlParserCanonicalizer};
    pub use crate::store::{InMemoryStore, MetadataStore, MetadataStoreExt, SqliteStore};
}
