//! Deterministic rendering of request variables into `.tfvars` text.
//!
//! Output depends only on the variable map: names are emitted in sorted order,
//! nested objects are sorted by key, and string escaping is fixed. Rendering the
//! same map twice yields byte-identical files, so re-plans without drift never
//! see a spurious input change.

use std::fmt::Write as _;

use serde_json::Value;
use thiserror::Error;

use crate::core::types::Variables;

/// Names the tool reserves inside variable blocks.
pub const RESERVED_NAMES: &[&str] = &[
    "count",
    "depends_on",
    "for_each",
    "lifecycle",
    "locals",
    "providers",
    "source",
    "version",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("variable name must not be empty")]
    EmptyName,
    #[error("variable name {0:?} is not a valid identifier")]
    InvalidName(String),
    #[error("variable name {0:?} is reserved")]
    ReservedName(String),
    #[error("variable {variable:?} contains an object with an empty key")]
    EmptyObjectKey { variable: String },
}

/// Render variables as `name = value` lines with aligned `=` and a trailing newline.
pub fn render(variables: &Variables) -> Result<String, RenderError> {
    for (name, value) in variables {
        validate_name(name)?;
        check_object_keys(name, value)?;
    }

    let width = variables.keys().map(String::len).max().unwrap_or(0);
    let mut out = String::new();
    for (name, value) in variables {
        out.push_str(name);
        for _ in name.len()..width {
            out.push(' ');
        }
        out.push_str(" = ");
        write_value(&mut out, value);
        out.push('\n');
    }
    Ok(out)
}

pub fn validate_name(name: &str) -> Result<(), RenderError> {
    if name.is_empty() {
        return Err(RenderError::EmptyName);
    }
    if !is_identifier(name) {
        return Err(RenderError::InvalidName(name.to_string()));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(RenderError::ReservedName(name.to_string()));
    }
    Ok(())
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn check_object_keys(variable: &str, value: &Value) -> Result<(), RenderError> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if key.is_empty() {
                    return Err(RenderError::EmptyObjectKey {
                        variable: variable.to_string(),
                    });
                }
                check_object_keys(variable, nested)?;
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_object_keys(variable, item)),
        _ => Ok(()),
    }
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => quote_into(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return;
            }
            // serde_json's default map is ordered by key.
            out.push_str("{ ");
            for (i, (key, nested)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                if is_identifier(key) {
                    out.push_str(key);
                } else {
                    quote_into(out, key);
                }
                out.push_str(" = ");
                write_value(out, nested);
            }
            out.push_str(" }");
        }
    }
}

/// Quote a string literal, escaping backslashes, quotes, control characters and
/// template introducers (`${`, `%{`).
fn quote_into(out: &mut String, s: &str) {
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn renders_sorted_aligned_lines() {
        let rendered = render(&vars(&[
            ("region", json!("us-east-1")),
            ("instance_type", json!("t3.micro")),
        ]))
        .expect("render");
        assert_eq!(
            rendered,
            "instance_type = \"t3.micro\"\nregion        = \"us-east-1\"\n"
        );
    }

    #[test]
    fn rendering_is_byte_identical_across_insertion_orders() {
        let mut a = Variables::new();
        a.insert("b".to_string(), json!({"z": 1, "a": [true, null]}));
        a.insert("a".to_string(), json!(2.5));
        let mut b = Variables::new();
        b.insert("a".to_string(), json!(2.5));
        b.insert("b".to_string(), json!({"a": [true, null], "z": 1}));

        let first = render(&a).expect("render a");
        assert_eq!(first, render(&b).expect("render b"));
        assert_eq!(first, render(&a).expect("render a again"));
        assert_eq!(first, "a = 2.5\nb = { a = [true, null], z = 1 }\n");
    }

    #[test]
    fn escapes_quotes_controls_and_templates() {
        let rendered = render(&vars(&[(
            "name",
            json!("a \"b\" \\ ${var.x} %{if} 100% $5\n\t\u{1}"),
        )]))
        .expect("render");
        assert_eq!(
            rendered,
            "name = \"a \\\"b\\\" \\\\ $${var.x} %%{if} 100% $5\\n\\t\\u0001\"\n"
        );
    }

    #[test]
    fn quotes_non_identifier_object_keys() {
        let rendered = render(&vars(&[("tags", json!({"Name": "web", "cost center": "42"}))]))
            .expect("render");
        assert_eq!(
            rendered,
            "tags = { Name = \"web\", \"cost center\" = \"42\" }\n"
        );
    }

    #[test]
    fn empty_map_renders_empty_file() {
        assert_eq!(render(&Variables::new()).expect("render"), "");
    }

    #[test]
    fn rejects_reserved_and_invalid_names() {
        assert_eq!(
            render(&vars(&[("count", json!(1))])),
            Err(RenderError::ReservedName("count".to_string()))
        );
        assert_eq!(
            render(&vars(&[("1st", json!(1))])),
            Err(RenderError::InvalidName("1st".to_string()))
        );
        assert_eq!(
            render(&vars(&[("a b", json!(1))])),
            Err(RenderError::InvalidName("a b".to_string()))
        );
        assert_eq!(render(&vars(&[("", json!(1))])), Err(RenderError::EmptyName));
    }

    #[test]
    fn rejects_empty_nested_keys() {
        let err = render(&vars(&[("tags", json!([{"": 1}]))])).unwrap_err();
        assert_eq!(
            err,
            RenderError::EmptyObjectKey {
                variable: "tags".to_string()
            }
        );
    }
}
