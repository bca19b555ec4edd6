//! Computed column conflict resolution.
//!
//! Computed columns are shared project-wide: a name means one expression, and
//! an expression has one name, at one join position. The resolver checks a
//! model's computed columns against itself and every other model of the
//! project and either reports the first conflict or, in auto-adjust mode,
//! renames the model's columns to agree with the project.

pub mod join_path;
pub mod naming;
mod resolver;

pub use join_path::{JoinGraph, PathGraph};
pub use naming::{validate_cc_name, validate_display_name};
pub use resolver::{CheckedModel, ComputedColumnResolver};

use std::fmt;
use thiserror::Error;

/// Why two computed columns conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictCause {
    /// Same name as another model's column, different expression.
    SameNameDiffExpr,
    /// Same expression as another model's column, different name.
    SameExprDiffName,
    /// Same expression as another model's column, hosted at a different
    /// join position.
    WrongPositionDueToExpr,
    /// Same name as another model's column, hosted at a different join
    /// position.
    WrongPositionDueToName,
    /// Two columns of one model share a name.
    SelfConflictSameName,
    /// Two columns of one model share an expression.
    SelfConflictSameExpression,
}

impl ConflictCause {
    /// Whether auto-adjust may resolve this cause by renaming.
    pub fn is_adjustable(&self) -> bool {
        matches!(
            self,
            ConflictCause::SameNameDiffExpr | ConflictCause::SameExprDiffName
        )
    }
}

/// A computed column conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictError {
    pub cause: ConflictCause,
    /// The offending column, `ALIAS.NAME`.
    pub bad_cc: String,
    pub bad_expression: String,
    /// Alias of the model holding the other column.
    pub conflicting_model: String,
    /// The other column, `ALIAS.NAME`.
    pub conflicting_cc: String,
    pub advise: Option<String>,
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause {
            ConflictCause::SameNameDiffExpr => write!(
                f,
                "Computed column {} is defined as '{}', but model {} defines {} with a different expression",
                self.bad_cc, self.bad_expression, self.conflicting_model, self.conflicting_cc
            )?,
            ConflictCause::SameExprDiffName => write!(
                f,
                "Expression '{}' of computed column {} is already defined as {} in model {}",
                self.bad_expression, self.bad_cc, self.conflicting_cc, self.conflicting_model
            )?,
            ConflictCause::WrongPositionDueToExpr => write!(
                f,
                "Expression '{}' of computed column {} is defined on a different join position as {} in model {}",
                self.bad_expression, self.bad_cc, self.conflicting_cc, self.conflicting_model
            )?,
            ConflictCause::WrongPositionDueToName => write!(
                f,
                "Computed column {} is defined on a different join position as {} in model {}",
                self.bad_cc, self.conflicting_cc, self.conflicting_model
            )?,
            ConflictCause::SelfConflictSameName => write!(
                f,
                "Computed column name {} is defined more than once in model {}",
                self.bad_cc, self.conflicting_model
            )?,
            ConflictCause::SelfConflictSameExpression => write!(
                f,
                "Computed columns {} and {} in model {} share the expression '{}'",
                self.bad_cc, self.conflicting_cc, self.conflicting_model, self.bad_expression
            )?,
        }
        match (&self.advise, self.cause) {
            (Some(advise), ConflictCause::SameNameDiffExpr) => {
                write!(f, "; use the expression '{}'", advise)
            }
            (Some(advise), ConflictCause::SameExprDiffName) => {
                write!(f, "; use the name {}", advise)
            }
            (Some(advise), _) => write!(f, "; define it on table {}", advise),
            (
                None,
                ConflictCause::WrongPositionDueToExpr | ConflictCause::WrongPositionDueToName,
            ) => write!(f, "; no suggestion could be provided"),
            (None, _) => Ok(()),
        }
    }
}

impl std::error::Error for ConflictError {}

/// A model shape the resolver refuses to accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BadModelError {
    #[error("computed column {cc} reads no column of {alias} and must be defined on the root fact table")]
    NotRootFactForNonLocalExpr { cc: String, alias: String },
}

/// Outcome of checking one computed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictVerdict {
    Clear,
    Conflicts(Vec<ConflictError>),
}

impl ConflictVerdict {
    pub fn is_clear(&self) -> bool {
        matches!(self, ConflictVerdict::Clear)
    }

    pub fn conflicts(&self) -> &[ConflictError] {
        match self {
            ConflictVerdict::Clear => &[],
            ConflictVerdict::Conflicts(conflicts) => conflicts,
        }
    }
}

/// A conflict auto-adjust resolved, kept for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDetail {
    pub conflict: ConflictError,
    /// New `ALIAS.NAME` of the adjusted column.
    pub renamed_to: String,
}
