//! Name validation for computed columns and display names.

use crate::config::ComputedColumnSettings;
use crate::error::ValidationError;
use crate::sql::keywords;
use regex::Regex;
use std::sync::LazyLock;

static CC_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap());

/// Validate a computed column name.
///
/// Non-empty, a letter followed by letters, digits or underscores, no longer
/// than the configured maximum, and not reserved by either SQL dialect.
pub fn validate_cc_name(name: &str, settings: &ComputedColumnSettings) -> Result<(), ValidationError> {
    const KIND: &str = "computed column";
    check_length(KIND, name, settings.max_name_length)?;
    if !CC_NAME.is_match(name) {
        return Err(ValidationError::IllegalName {
            kind: KIND,
            name: name.to_string(),
        });
    }
    if keywords::is_reserved(name) {
        return Err(ValidationError::ReservedKeyword {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate a dimension or measure display name.
///
/// Same shape as a computed column name, except that the configured symbol
/// set is also allowed after the first character.
pub fn validate_display_name(
    kind: &'static str,
    name: &str,
    settings: &ComputedColumnSettings,
) -> Result<(), ValidationError> {
    check_length(kind, name, settings.max_name_length)?;
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let rest_ok = chars.all(|c| {
        c.is_ascii_alphanumeric() || c == '_' || settings.display_name_symbols.contains(c)
    });
    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(ValidationError::IllegalName {
            kind,
            name: name.to_string(),
        })
    }
}

fn check_length(kind: &'static str, name: &str, max: usize) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyName { kind });
    }
    if name.chars().count() > max {
        return Err(ValidationError::NameTooLong {
            kind,
            name: name.to_string(),
            max,
        });
    }
    Ok(())
}
