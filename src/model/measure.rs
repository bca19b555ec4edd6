// src/model/measure.rs
use crate::model::types::{DataType, TypeFamily};
use serde::{Deserialize, Serialize};

/// First id handed out to measures; dimension ids stay below it.
pub const MEASURE_ID_BASE: u32 = 100_000;

/// A measure definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub id: u32,
    pub name: String,
    pub function: FunctionDesc,
    #[serde(default)]
    pub tomb: bool,
}

/// Aggregate function applied by a measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDesc {
    pub expression: FunctionKind,
    pub parameters: Vec<ParameterDesc>,
    pub return_type: String,
}

/// A function parameter: either a qualified column reference or a constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParameterDesc {
    Column(String),
    Constant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionKind {
    Sum,
    Min,
    Max,
    Count,
    CountDistinct,
    TopN,
    PercentileApprox,
    CollectSet,
    Corr,
}

impl FunctionKind {
    /// Whether the function can aggregate a column of `arg` type.
    pub fn accepts(&self, arg: &DataType) -> bool {
        match self {
            FunctionKind::Sum | FunctionKind::PercentileApprox | FunctionKind::Corr => {
                arg.is_numeric()
            }
            FunctionKind::TopN => arg.is_numeric(),
            FunctionKind::Min | FunctionKind::Max => matches!(
                arg.family(),
                TypeFamily::Numeric | TypeFamily::DateTime | TypeFamily::Text
            ),
            FunctionKind::Count | FunctionKind::CountDistinct | FunctionKind::CollectSet => true,
        }
    }

    /// Derive the return type for an argument type.
    ///
    /// Sketch-based functions keep their declared return type.
    pub fn derive_return_type(&self, arg: &DataType, declared: &str) -> String {
        match self {
            FunctionKind::Sum => match arg {
                DataType::Decimal { scale, .. } => format!("decimal(19,{})", scale),
                t if t.is_integer() => "bigint".to_string(),
                _ => "double".to_string(),
            },
            FunctionKind::Min | FunctionKind::Max => arg.to_string(),
            FunctionKind::Count => "bigint".to_string(),
            FunctionKind::Corr => "double".to_string(),
            FunctionKind::CountDistinct
            | FunctionKind::TopN
            | FunctionKind::PercentileApprox
            | FunctionKind::CollectSet => declared.to_string(),
        }
    }
}

impl Measure {
    pub fn new(id: u32, name: impl Into<String>, expression: FunctionKind, parameters: Vec<ParameterDesc>) -> Self {
        let return_type = match expression {
            FunctionKind::Count => "bigint",
            FunctionKind::CountDistinct => "bitmap",
            FunctionKind::TopN => "topn(100)",
            FunctionKind::PercentileApprox => "percentile(100)",
            FunctionKind::Corr => "double",
            _ => "",
        };
        Self {
            id,
            name: name.into(),
            function: FunctionDesc {
                expression,
                parameters,
                return_type: return_type.to_string(),
            },
            tomb: false,
        }
    }

    /// Qualified column references used as parameters, in order.
    pub fn column_refs(&self) -> impl Iterator<Item = &str> {
        self.function.parameters.iter().filter_map(|p| match p {
            ParameterDesc::Column(c) => Some(c.as_str()),
            ParameterDesc::Constant(_) => None,
        })
    }

    /// The single column argument, if the measure has exactly one.
    pub fn sole_column(&self) -> Option<&str> {
        let mut refs = self.column_refs();
        match (refs.next(), refs.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }

    pub fn references(&self, column_ref: &str) -> bool {
        self.column_refs().any(|c| c.eq_ignore_ascii_case(column_ref))
    }
}
