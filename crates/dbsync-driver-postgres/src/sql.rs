//! SQL text rendering helpers
//!
//! Engine-driven statements (upserts, id-list deletes, keyset predicates) are
//! rendered with literal values rather than bind parameters so that NUMERIC,
//! enum, and domain columns round-trip without per-type parameter plumbing.

use dbsync_core::Value;

/// Quote a PostgreSQL identifier
pub(crate) fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Render a value as a PostgreSQL literal
pub(crate) fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
        Value::Int16(v) => v.to_string(),
        Value::Int32(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::Float32(v) => float_literal(*v as f64),
        Value::Float64(v) => float_literal(*v),
        Value::Decimal(v) => quote_str(v),
        Value::String(v) => quote_str(v),
        Value::Bytes(v) => {
            let hex: String = v.iter().map(|b| format!("{b:02x}")).collect();
            format!("'\\x{hex}'")
        }
        Value::Uuid(v) => format!("'{v}'"),
        Value::Date(v) => format!("'{v}'"),
        Value::Time(v) => format!("'{v}'"),
        Value::DateTime(v) => format!("'{v}'"),
        Value::DateTimeUtc(v) => format!("'{}'", v.to_rfc3339()),
        Value::Json(v) => quote_str(&v.to_string()),
        Value::Array(arr) => {
            let values: Vec<String> = arr.iter().map(literal).collect();
            format!("ARRAY[{}]", values.join(", "))
        }
    }
}

/// Comma-joined literal list for `IN (...)` predicates
pub(crate) fn literal_list(values: &[Value]) -> String {
    values.iter().map(literal).collect::<Vec<_>>().join(", ")
}

fn quote_str(text: &str) -> String {
    // Standard-conforming strings: double embedded quotes, escape backslash
    // through the E'' form only when one is present.
    if text.contains('\\') {
        format!("E'{}'", text.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", text.replace('\'', "''"))
    }
}

fn float_literal(value: f64) -> String {
    if value.is_nan() {
        "'NaN'".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "'Infinity'" } else { "'-Infinity'" }.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers_with_embedded_quote() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn escapes_string_literals() {
        assert_eq!(literal(&Value::String("it's".into())), "'it''s'");
        assert_eq!(
            literal(&Value::String("a\\b".into())),
            "E'a\\\\b'"
        );
    }

    #[test]
    fn renders_null_bool_and_numbers() {
        assert_eq!(literal(&Value::Null), "NULL");
        assert_eq!(literal(&Value::Bool(true)), "TRUE");
        assert_eq!(literal(&Value::Int64(-3)), "-3");
        assert_eq!(literal(&Value::Decimal("10.50".into())), "'10.50'");
    }

    #[test]
    fn renders_bytes_as_hex() {
        assert_eq!(literal(&Value::Bytes(vec![0xde, 0xad])), "'\\xdead'");
    }

    #[test]
    fn renders_in_list() {
        let list = literal_list(&[Value::Int64(1), Value::Int64(2)]);
        assert_eq!(list, "1, 2");
    }
}
