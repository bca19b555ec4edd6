//! Expression canonicalization on top of sqlparser-rs.
//!
//! Expressions are parsed with `GenericDialect` and rewritten in place:
//! unquoted identifiers and function names are uppercased, bare columns are
//! qualified with the alias they resolve to, redundant parentheses around
//! atoms are dropped and numeric literals lose trailing zeros. Printing the
//! rewritten AST gives the canonical string, so whitespace differences
//! vanish as well.

use super::{ExprScope, ExpressionCanonicalizer, SqlError};
use crate::model::{split_column_ref, DataType, TypeFamily};
use sqlparser::ast::{
    visit_expressions, visit_expressions_mut, BinaryOperator, Expr, FunctionArg, FunctionArgExpr,
    FunctionArguments, Ident, UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use std::collections::BTreeSet;
use std::ops::ControlFlow;

/// Default [`ExpressionCanonicalizer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlParserCanonicalizer;

impl SqlParserCanonicalizer {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionCanonicalizer for SqlParserCanonicalizer {
    fn massage(&self, expr: &str, scope: &ExprScope) -> Result<String, SqlError> {
        let mut parsed = parse(expr)?;
        canonicalize(&mut parsed, scope)?;
        Ok(parsed.to_string())
    }

    fn evaluate_type(&self, expr: &str, scope: &ExprScope) -> Result<DataType, SqlError> {
        let parsed = parse(expr)?;
        infer_type(&parsed, scope)
    }

    fn referenced_columns(
        &self,
        expr: &str,
        scope: &ExprScope,
    ) -> Result<BTreeSet<String>, SqlError> {
        let parsed = parse(expr)?;
        let mut columns = BTreeSet::new();
        let flow = visit_expressions(&parsed, |e| {
            let resolved = match e {
                Expr::Identifier(ident) => scope.resolve(None, &ident.value),
                Expr::CompoundIdentifier(parts) => resolve_compound(parts, scope),
                _ => return ControlFlow::Continue(()),
            };
            match resolved {
                Ok((alias, column, _)) => {
                    columns.insert(format!("{}.{}", alias, column));
                    ControlFlow::Continue(())
                }
                Err(err) => ControlFlow::Break(err),
            }
        });
        match flow {
            ControlFlow::Break(err) => Err(err),
            ControlFlow::Continue(()) => Ok(columns),
        }
    }
}

/// Parse a standalone expression, rejecting trailing input.
fn parse(expr: &str) -> Result<Expr, SqlError> {
    let unparsable = |e: ParserError| SqlError::Unparsable {
        expr: expr.to_string(),
        message: e.to_string(),
    };
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(expr).map_err(unparsable)?;
    let parsed = parser.parse_expr().map_err(unparsable)?;
    let next = parser.peek_token().token;
    if next != Token::EOF {
        return Err(SqlError::Unparsable {
            expr: expr.to_string(),
            message: format!("unexpected trailing input '{}'", next),
        });
    }
    Ok(parsed)
}

fn resolve_compound(
    parts: &[Ident],
    scope: &ExprScope,
) -> Result<(String, String, DataType), SqlError> {
    match parts {
        [alias, column] => scope.resolve(Some(&alias.value), &column.value),
        _ => Err(SqlError::Unsupported {
            detail: format!(
                "column reference '{}'",
                parts
                    .iter()
                    .map(|p| p.value.as_str())
                    .collect::<Vec<_>>()
                    .join(".")
            ),
        }),
    }
}

fn qualified(alias: String, column: String) -> Expr {
    Expr::CompoundIdentifier(vec![Ident::new(alias), Ident::new(column)])
}

fn is_atomic(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Identifier(_)
            | Expr::CompoundIdentifier(_)
            | Expr::Value(_)
            | Expr::Function(_)
            | Expr::Nested(_)
            | Expr::Cast { .. }
    )
}

/// `1.50` -> `1.5`, `2.0` -> `2`; exponent forms are left alone.
fn normalize_number(number: &str) -> String {
    if !number.contains('.') || number.contains(['e', 'E']) {
        return number.to_string();
    }
    let trimmed = number.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn canonicalize(expr: &mut Expr, scope: &ExprScope) -> Result<(), SqlError> {
    let flow = visit_expressions_mut(expr, |e| {
        match e {
            Expr::Identifier(ident) => match scope.resolve(None, &ident.value) {
                Ok((alias, column, _)) => *e = qualified(alias, column),
                Err(err) => return ControlFlow::Break(err),
            },
            Expr::CompoundIdentifier(parts) => match resolve_compound(parts, scope) {
                Ok((alias, column, _)) => *e = qualified(alias, column),
                Err(err) => return ControlFlow::Break(err),
            },
            Expr::Function(function) => {
                for part in function.name.0.iter_mut() {
                    if part.quote_style.is_none() {
                        part.value = part.value.to_uppercase();
                    }
                }
            }
            Expr::Value(Value::Number(number, _)) => *number = normalize_number(number),
            Expr::Nested(inner) if is_atomic(&**inner) => {
                let unwrapped = std::mem::replace(inner.as_mut(), Expr::Value(Value::Null));
                *e = unwrapped;
            }
            _ => {}
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(err) => Err(err),
        ControlFlow::Continue(()) => Ok(()),
    }
}

fn function_args(args: &FunctionArguments) -> Vec<&Expr> {
    match args {
        FunctionArguments::List(list) => list
            .args
            .iter()
            .filter_map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Some(e),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn widen_all<'a>(
    exprs: impl IntoIterator<Item = &'a Expr>,
    scope: &ExprScope,
    whole: &Expr,
) -> Result<DataType, SqlError> {
    let cannot = || SqlError::CannotInferType {
        expr: whole.to_string(),
    };
    let mut result: Option<DataType> = None;
    for expr in exprs {
        let next = infer_type(expr, scope)?;
        result = Some(match result {
            None => next,
            Some(current) if current == next => current,
            Some(current) if current.is_numeric() => current.widen(&next).ok_or_else(cannot)?,
            Some(current) if current.family() == next.family() && next.family() == TypeFamily::Text => {
                DataType::String
            }
            Some(_) => return Err(cannot()),
        });
    }
    result.ok_or_else(cannot)
}

fn infer_type(expr: &Expr, scope: &ExprScope) -> Result<DataType, SqlError> {
    let cannot = || SqlError::CannotInferType {
        expr: expr.to_string(),
    };
    match expr {
        Expr::Identifier(ident) => scope.resolve(None, &ident.value).map(|(_, _, t)| t),
        Expr::CompoundIdentifier(parts) => resolve_compound(parts, scope).map(|(_, _, t)| t),
        Expr::Nested(inner) => infer_type(inner, scope),
        Expr::Value(value) => match value {
            Value::Number(number, _) => Ok(literal_number_type(number)),
            Value::SingleQuotedString(_) | Value::DoubleQuotedString(_) => Ok(DataType::String),
            Value::Boolean(_) => Ok(DataType::Boolean),
            _ => Err(cannot()),
        },
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::Plus
            | BinaryOperator::Minus
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo => {
                let left = infer_type(left, scope)?;
                let right = infer_type(right, scope)?;
                left.widen(&right).ok_or_else(cannot)
            }
            BinaryOperator::StringConcat => Ok(DataType::String),
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::And
            | BinaryOperator::Or => Ok(DataType::Boolean),
            _ => Err(cannot()),
        },
        Expr::UnaryOp { op, expr: operand } => match op {
            UnaryOperator::Not => Ok(DataType::Boolean),
            UnaryOperator::Minus | UnaryOperator::Plus => infer_type(operand, scope),
            _ => Err(cannot()),
        },
        Expr::Cast { data_type, .. } | Expr::TypedString { data_type, .. } => {
            data_type.to_string().parse().map_err(|_| cannot())
        }
        Expr::Case {
            results,
            else_result,
            ..
        } => widen_all(
            results.iter().chain(else_result.as_deref()),
            scope,
            expr,
        ),
        Expr::IsNull(_)
        | Expr::IsNotNull(_)
        | Expr::IsTrue(_)
        | Expr::IsFalse(_)
        | Expr::Between { .. }
        | Expr::InList { .. }
        | Expr::Like { .. }
        | Expr::ILike { .. } => Ok(DataType::Boolean),
        Expr::Substring { .. } | Expr::Trim { .. } => Ok(DataType::String),
        Expr::Extract { .. } => Ok(DataType::Integer),
        Expr::Ceil { expr: inner, .. } | Expr::Floor { expr: inner, .. } => {
            infer_type(inner, scope)
        }
        Expr::Function(function) => {
            let name = function
                .name
                .0
                .last()
                .map(|i| i.value.to_uppercase())
                .unwrap_or_default();
            let args = function_args(&function.args);
            match name.as_str() {
                "CONCAT" | "SUBSTR" | "SUBSTRING" | "UPPER" | "LOWER" | "TRIM" | "LTRIM"
                | "RTRIM" | "REPLACE" | "LPAD" | "RPAD" | "DATE_FORMAT" => Ok(DataType::String),
                "LENGTH" | "CHAR_LENGTH" | "YEAR" | "QUARTER" | "MONTH" | "WEEK" | "DAY"
                | "DAYOFMONTH" | "DAYOFWEEK" | "DAYOFYEAR" | "HOUR" | "MINUTE" | "SECOND" => {
                    Ok(DataType::Integer)
                }
                "DATE" | "TO_DATE" | "CURRENT_DATE" => Ok(DataType::Date),
                "TO_TIMESTAMP" | "CURRENT_TIMESTAMP" | "NOW" => Ok(DataType::Timestamp),
                "ABS" | "ROUND" | "CEIL" | "CEILING" | "FLOOR" | "TRUNCATE" => args
                    .first()
                    .map(|arg| infer_type(arg, scope))
                    .unwrap_or_else(|| Err(cannot())),
                "POWER" | "SQRT" | "LN" | "LOG10" | "EXP" => Ok(DataType::Double),
                "COALESCE" | "IFNULL" | "NVL" | "GREATEST" | "LEAST" => {
                    widen_all(args, scope, expr)
                }
                _ => Err(cannot()),
            }
        }
        _ => Err(cannot()),
    }
}

fn literal_number_type(number: &str) -> DataType {
    if number.contains(['e', 'E']) {
        return DataType::Double;
    }
    match number.split_once('.') {
        Some((whole, fraction)) => {
            let scale = fraction.len().min(38) as u8;
            let precision = (whole.trim_start_matches('-').len() + fraction.len()).clamp(1, 38) as u8;
            DataType::Decimal {
                precision: precision.max(scale),
                scale,
            }
        }
        None if number.parse::<i32>().is_ok() => DataType::Integer,
        None => DataType::BigInt,
    }
}

/// Replace references to `from` (`ALIAS.COLUMN`) with `to` in `expr`.
///
/// Bare identifiers matching the column name of `from` are replaced with the
/// bare column name of `to`. A rewritten result is printed from the AST, so
/// its formatting is normalized; without a match `expr` comes back as is.
pub fn rename_column(expr: &str, from: &str, to: &str) -> Result<String, SqlError> {
    let unknown = |column: &str| SqlError::UnknownColumn {
        column: column.to_string(),
    };
    let (from_alias, from_column) = split_column_ref(from).ok_or_else(|| unknown(from))?;
    let (to_alias, to_column) = split_column_ref(to).ok_or_else(|| unknown(to))?;

    let mut parsed = parse(expr)?;
    let mut renamed = false;
    let _ = visit_expressions_mut(&mut parsed, |e| {
        match e {
            Expr::CompoundIdentifier(parts)
                if parts.len() == 2
                    && parts[0].value.eq_ignore_ascii_case(from_alias)
                    && parts[1].value.eq_ignore_ascii_case(from_column) =>
            {
                *e = qualified(to_alias.to_string(), to_column.to_string());
                renamed = true;
            }
            Expr::Identifier(ident) if ident.value.eq_ignore_ascii_case(from_column) => {
                *e = Expr::Identifier(Ident::new(to_column));
                renamed = true;
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    if !renamed {
        return Ok(expr.to_string());
    }
    Ok(parsed.to_string())
}

/// Replace the qualifier of every `ALIAS.COLUMN` reference for which
/// `rewrite` returns a substitute.
pub fn rewrite_qualifiers(
    expr: &str,
    rewrite: impl Fn(&str) -> Option<String>,
) -> Result<String, SqlError> {
    let mut parsed = parse(expr)?;
    let _ = visit_expressions_mut(&mut parsed, |e| {
        if let Expr::CompoundIdentifier(parts) = e {
            if let [alias, _] = parts.as_mut_slice() {
                if let Some(substitute) = rewrite(&alias.value) {
                    *alias = Ident::new(substitute);
                }
            }
        }
        ControlFlow::<()>::Continue(())
    });
    Ok(parsed.to_string())
}
