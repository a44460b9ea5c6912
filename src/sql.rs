//! SQL text helpers
//!
//! Identifiers are interpolated into generated SQL (they cannot be bound as
//! query parameters), so every identifier that reaches a generator must first
//! pass [`ensure_identifier`]. Generators additionally double-quote them.

use crate::error::{identifier_error, validation_error, AppError};
use once_cell::sync::Lazy;
use regex::Regex;
use validator::{ValidationError, ValidationErrors, ValidationErrorsKind};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("identifier regex"));

/// Column types: `text`, `varchar(255)`, `numeric(10, 2)`, `double precision`, `text[]`
static COLUMN_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)[a-z][a-z0-9_]*( [a-z][a-z0-9_]*)*( ?\(\d+(, ?\d+)?\))?(\[\])?$").expect("column type regex")
});

/// PostgreSQL truncates identifiers beyond this many bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

pub const INVALID_IDENTIFIER: &str = "invalid_identifier";

pub fn is_valid_identifier(name: &str) -> bool {
    name.len() <= MAX_IDENTIFIER_LEN && IDENTIFIER.is_match(name)
}

/// Reject anything that is not a plain lowercase identifier
pub fn ensure_identifier(name: &str, what: &str) -> Result<(), AppError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(identifier_error(format!(
            "{} '{}' must match ^[a-z_][a-z0-9_]*$ and be at most {} bytes",
            what, name, MAX_IDENTIFIER_LEN
        )))
    }
}

/// Double-quote an identifier. Callers validate first; quoting is a second fence.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// validator hook for identifier fields
pub fn validate_identifier(name: &str) -> Result<(), ValidationError> {
    if is_valid_identifier(name) {
        return Ok(());
    }
    let mut err = ValidationError::new(INVALID_IDENTIFIER);
    err.message = Some(format!("'{}' is not a valid identifier (expected ^[a-z_][a-z0-9_]*$)", name).into());
    Err(err)
}

/// validator hook for lists of identifiers
pub fn validate_identifier_list(names: &[String]) -> Result<(), ValidationError> {
    names.iter().try_for_each(|n| validate_identifier(n))
}

/// validator hook for column types
pub fn validate_column_type(data_type: &str) -> Result<(), ValidationError> {
    if COLUMN_TYPE.is_match(data_type.trim()) {
        return Ok(());
    }
    let mut err = ValidationError::new("invalid_column_type");
    err.message = Some(format!("'{}' is not a recognised column type", data_type).into());
    Err(err)
}

fn invalid_default(expr: &str, reason: &str) -> ValidationError {
    let mut err = ValidationError::new("invalid_default");
    err.message = Some(format!("default expression '{}' {}", expr, reason).into());
    err
}

/// validator hook for raw SQL default expressions. The expression must stay a
/// single term: no separators or comments, balanced brackets, and no comma
/// outside brackets or quotes.
pub fn validate_default_expr(expr: &str) -> Result<(), ValidationError> {
    if expr.contains(';') || expr.contains("--") || expr.contains("/*") {
        return Err(invalid_default(expr, "may not contain statement separators or comments"));
    }

    let mut open: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    for c in expr.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => open.push(')'),
            (None, '[') => open.push(']'),
            (None, ')' | ']') => {
                if open.pop() != Some(c) {
                    return Err(invalid_default(expr, "closes a bracket it never opened"));
                }
            }
            (None, ',') if open.is_empty() => {
                return Err(invalid_default(expr, "may not contain a top-level comma"));
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err(invalid_default(expr, "has an unterminated quote"));
    }
    if !open.is_empty() {
        return Err(invalid_default(expr, "has an unclosed bracket"));
    }
    Ok(())
}

fn has_code(errors: &ValidationErrors, code: &str) -> bool {
    errors.errors().values().any(|kind| match kind {
        ValidationErrorsKind::Field(errs) => errs.iter().any(|e| e.code == code),
        ValidationErrorsKind::Struct(inner) => has_code(inner, code),
        ValidationErrorsKind::List(items) => items.values().any(|inner| has_code(inner, code)),
    })
}

/// Map validator output onto the crate taxonomy. Identifier problems keep their
/// own variant so the CLI can give the injection-defense hint.
pub fn map_validation(context: &str, errors: ValidationErrors) -> AppError {
    let message = format!("{}: {}", context, errors.to_string().replace('\n', "; "));
    if has_code(&errors, INVALID_IDENTIFIER) {
        identifier_error(message)
    } else {
        validation_error(message)
    }
}
