//! Column data types and their families.
//!
//! Types are stored as their lowercase SQL spelling (`decimal(19,4)`,
//! `varchar(256)`) so metadata stays readable on disk.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a type string cannot be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Unknown data type: '{0}'")]
pub struct DataTypeError(pub String);

/// A source column data type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DataType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Char(u32),
    Varchar(u32),
    String,
    Date,
    Timestamp,
    Binary,
}

/// Coarse grouping used for compatibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Boolean,
    Numeric,
    Text,
    DateTime,
    Binary,
}

impl DataType {
    pub fn family(&self) -> TypeFamily {
        match self {
            DataType::Boolean => TypeFamily::Boolean,
            DataType::TinyInt
            | DataType::SmallInt
            | DataType::Integer
            | DataType::BigInt
            | DataType::Float
            | DataType::Double
            | DataType::Decimal { .. } => TypeFamily::Numeric,
            DataType::Char(_) | DataType::Varchar(_) | DataType::String => TypeFamily::Text,
            DataType::Date | DataType::Timestamp => TypeFamily::DateTime,
            DataType::Binary => TypeFamily::Binary,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.family() == TypeFamily::Numeric
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::TinyInt | DataType::SmallInt | DataType::Integer | DataType::BigInt
        )
    }

    pub fn is_approximate(&self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }

    /// Rank of an integer type; wider types rank higher.
    fn integer_rank(&self) -> u8 {
        match self {
            DataType::TinyInt => 1,
            DataType::SmallInt => 2,
            DataType::Integer => 3,
            DataType::BigInt => 4,
            _ => 0,
        }
    }

    /// Result type of an arithmetic expression over two numeric operands.
    ///
    /// Returns `None` if either side is not numeric.
    pub fn widen(&self, other: &DataType) -> Option<DataType> {
        if !self.is_numeric() || !other.is_numeric() {
            return None;
        }
        if self.is_approximate() || other.is_approximate() {
            return Some(DataType::Double);
        }
        match (self, other) {
            (
                DataType::Decimal {
                    precision: p1,
                    scale: s1,
                },
                DataType::Decimal {
                    precision: p2,
                    scale: s2,
                },
            ) => Some(DataType::Decimal {
                precision: (*p1).max(*p2),
                scale: (*s1).max(*s2),
            }),
            (DataType::Decimal { precision, scale }, _)
            | (_, DataType::Decimal { precision, scale }) => Some(DataType::Decimal {
                precision: (*precision).max(19),
                scale: *scale,
            }),
            _ => {
                if self.integer_rank() >= other.integer_rank() {
                    Some(self.clone())
                } else {
                    Some(other.clone())
                }
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "boolean"),
            DataType::TinyInt => write!(f, "tinyint"),
            DataType::SmallInt => write!(f, "smallint"),
            DataType::Integer => write!(f, "integer"),
            DataType::BigInt => write!(f, "bigint"),
            DataType::Float => write!(f, "float"),
            DataType::Double => write!(f, "double"),
            DataType::Decimal { precision, scale } => write!(f, "decimal({},{})", precision, scale),
            DataType::Char(n) => write!(f, "char({})", n),
            DataType::Varchar(n) => write!(f, "varchar({})", n),
            DataType::String => write!(f, "string"),
            DataType::Date => write!(f, "date"),
            DataType::Timestamp => write!(f, "timestamp"),
            DataType::Binary => write!(f, "binary"),
        }
    }
}

impl FromStr for DataType {
    type Err = DataTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s.trim().to_lowercase().split_whitespace().collect();
        let (base, args) = match normalized.find('(') {
            Some(open) if normalized.ends_with(')') => (
                &normalized[..open],
                Some(&normalized[open + 1..normalized.len() - 1]),
            ),
            Some(_) => return Err(DataTypeError(s.to_string())),
            None => (normalized.as_str(), None),
        };

        let numbers: Vec<u32> = match args {
            Some(args) => args
                .split(',')
                .map(|n| n.parse::<u32>())
                .collect::<Result<_, _>>()
                .map_err(|_| DataTypeError(s.to_string()))?,
            None => Vec::new(),
        };

        let data_type = match (base, numbers.as_slice()) {
            ("boolean" | "bool", []) => DataType::Boolean,
            ("tinyint", []) => DataType::TinyInt,
            ("smallint", []) => DataType::SmallInt,
            ("int" | "integer", []) => DataType::Integer,
            ("bigint" | "long", []) => DataType::BigInt,
            ("float" | "real", []) => DataType::Float,
            ("double", []) => DataType::Double,
            ("decimal" | "numeric", []) => DataType::Decimal {
                precision: 19,
                scale: 4,
            },
            ("decimal" | "numeric", [p]) => DataType::Decimal {
                precision: narrow(*p, s)?,
                scale: 0,
            },
            ("decimal" | "numeric", [p, sc]) if sc <= p => DataType::Decimal {
                precision: narrow(*p, s)?,
                scale: narrow(*sc, s)?,
            },
            ("char", [n]) => DataType::Char(*n),
            ("varchar", [n]) => DataType::Varchar(*n),
            ("varchar" | "string", []) => DataType::String,
            ("date", []) => DataType::Date,
            ("timestamp" | "datetime", []) => DataType::Timestamp,
            ("binary" | "varbinary", _) => DataType::Binary,
            _ => return Err(DataTypeError(s.to_string())),
        };
        Ok(data_type)
    }
}

fn narrow(n: u32, original: &str) -> Result<u8, DataTypeError> {
    u8::try_from(n)
        .ok()
        .filter(|n| *n <= 38)
        .ok_or_else(|| DataTypeError(original.to_string()))
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for DataType {
    type Error = DataTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
