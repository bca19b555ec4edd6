//! Crate-level error types.
//!
//! Every fallible public operation returns [`CubeResult`]. Brokenness of a
//! model is persisted state and never surfaces here.

use crate::computed_column::{BadModelError, ConflictError};
use crate::index::RuleError;
use crate::model::BrokenReason;
use crate::reload::RepairError;
use crate::sql::SqlError;
use crate::store::StoreError;
use thiserror::Error;

pub type CubeResult<T> = Result<T, CubeError>;

#[derive(Debug, Error)]
pub enum CubeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    BadModel(#[from] BadModelError),

    #[error(transparent)]
    Repair(#[from] RepairError),

    #[error("transaction on {entity} gave up after {attempts} attempts")]
    TransactionConflict { entity: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },
}

impl From<RuleError> for CubeError {
    fn from(err: RuleError) -> Self {
        CubeError::Validation(ValidationError::Rule(err))
    }
}

impl CubeError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        CubeError::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Rejected input. Nothing is mutated when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} name must not be empty")]
    EmptyName { kind: &'static str },

    #[error("{kind} name '{name}' contains illegal characters")]
    IllegalName { kind: &'static str, name: String },

    #[error("{kind} name '{name}' is longer than {max} characters")]
    NameTooLong {
        kind: &'static str,
        name: String,
        max: usize,
    },

    #[error("'{name}' is a reserved keyword")]
    ReservedKeyword { name: String },

    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("computed column '{name}' clashes with a physical column of {table}")]
    ColumnNameClash { name: String, table: String },

    #[error("{kind} id {id} was removed or reassigned; ids are append-only")]
    IdNotAppendOnly { kind: &'static str, id: u32 },

    #[error("{what} references unknown '{reference}'")]
    UnresolvedReference { what: String, reference: String },

    #[error("join graph is invalid: {0}")]
    JoinGraph(String),

    #[error("measure {measure} cannot aggregate {datatype}")]
    IncompatibleMeasure { measure: String, datatype: String },

    #[error("{0:?} cannot be used to break a model")]
    IllegalBrokenReason(BrokenReason),

    #[error("model {model} is already defined in project {project}")]
    ModelExists { project: String, model: String },

    #[error(transparent)]
    Rule(#[from] RuleError),
}
