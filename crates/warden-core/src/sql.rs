//! SQL text helpers for statements Warden generates itself.

use serde_json::Value;

/// Quote an identifier with double quotes, doubling embedded quotes
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal with single quotes
#[must_use]
pub fn quote_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a JSON value as a SQL literal.
///
/// Arrays and objects are stored as their JSON text.
#[must_use]
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_str(s),
        other => quote_str(&other.to_string()),
    }
}

/// Whether a statement reads rows (and therefore can be capped)
#[must_use]
pub fn is_select_like(query: &str) -> bool {
    let trimmed = query.trim_start();
    let starts = |kw: &str| {
        trimmed
            .get(..kw.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(kw))
    };
    starts("select") || starts("with")
}
