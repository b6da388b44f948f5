//! # Interpolation
//!
//! Safe shell-string templating (§4.2): values are quoted, never concatenated raw,
//! so interpolating untrusted data into a command line cannot change its argument
//! boundaries. Scalars become a single quoted token; sequences of scalars spread
//! into one token per element; a `raw` wrapper opts out of quoting entirely for
//! callers who have already done their own escaping.

use crate::error::Error;

/// A value that can be interpolated into a command line.
#[derive(Debug, Clone)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Spread as one POSIX-quoted token per element.
    Sequence(Vec<Value>),
    /// An object, or an array containing non-scalars: serialized to JSON text,
    /// then shell-quoted as a single token (§4.2: "objects/arrays-of-non-scalars
    /// → JSON then shell-quoted").
    Json(serde_json::Value),
    /// Emitted verbatim, without quoting. The caller is responsible for its
    /// safety — this exists for callers composing already-escaped fragments.
    Raw(String),
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Sequence(items.into_iter().map(Into::into).collect())
    }
}

/// Wraps `s` so it is emitted into the template without quoting.
pub fn raw(s: impl Into<String>) -> Value {
    Value::Raw(s.into())
}

/// Renders one value into zero or more shell tokens appended to `out`.
fn render(value: &Value, out: &mut Vec<String>) -> Result<(), Error> {
    match value {
        Value::String(s) => out.push(escape_shell_argument(s)),
        Value::Int(i) => out.push(i.to_string()),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(Error::Interpolation {
                    reason: format!("cannot interpolate non-finite float: {f}"),
                });
            }
            out.push(f.to_string())
        }
        Value::Bool(b) => out.push(b.to_string()),
        Value::Sequence(items) => {
            for item in items {
                render(item, out)?;
            }
        }
        Value::Json(json) => {
            let text = serde_json::to_string(json).map_err(|err| Error::Interpolation {
                reason: format!("cannot interpolate value as json: {err}"),
            })?;
            out.push(escape_shell_argument(&text));
        }
        Value::Raw(s) => out.push(s.clone()),
    }
    Ok(())
}

/// Interpolates a template made of literal fragments and values into a single
/// POSIX shell-safe command line. `fragments` has one more element than `values`
/// (the text before, between, and after each placeholder), mirroring how a tagged
/// template literal splits its strings around `${}` placeholders.
///
/// # Errors
/// Returns [`Error::Interpolation`] if a value cannot be safely rendered (e.g. a
/// non-finite float).
pub fn interpolate(fragments: &[&str], values: &[Value]) -> Result<String, Error> {
    if fragments.len() != values.len() + 1 {
        return Err(Error::Interpolation {
            reason: format!(
                "template has {} fragments but {} values; expected {} fragments",
                fragments.len(),
                values.len(),
                values.len() + 1
            ),
        });
    }
    let mut result = String::new();
    for (i, fragment) in fragments.iter().enumerate() {
        result.push_str(fragment);
        if let Some(value) = values.get(i) {
            let mut tokens = Vec::new();
            render(value, &mut tokens)?;
            result.push_str(&tokens.join(" "));
        }
    }
    Ok(result)
}

/// Quotes `arg` for safe inclusion in a POSIX shell command line using single
/// quotes, escaping embedded single quotes as `'\''`. Empty strings become `''`.
pub fn escape_shell_argument(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'='))
    {
        return arg.to_string();
    }
    let mut escaped = String::with_capacity(arg.len() + 2);
    escaped.push('\'');
    for ch in arg.chars() {
        if ch == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// Formats a long-form flag (`--name value`) or a bare boolean flag (`--name`),
/// quoting the value. Used by adapters translating structured options into argv.
pub fn format_option_flag(name: &str, value: Option<&str>) -> Vec<String> {
    match value {
        Some(v) => vec![format!("--{name}"), escape_shell_argument(v)],
        None => vec![format!("--{name}")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_are_not_quoted() {
        assert_eq!(escape_shell_argument("hello-world_1.2:3=4"), "hello-world_1.2:3=4");
    }

    #[test]
    fn arguments_with_spaces_are_single_quoted() {
        assert_eq!(escape_shell_argument("hello world"), "'hello world'");
    }

    #[test]
    fn embedded_single_quotes_are_escaped() {
        assert_eq!(escape_shell_argument("it's"), "'it'\\''s'");
    }

    #[test]
    fn empty_string_becomes_empty_quotes() {
        assert_eq!(escape_shell_argument(""), "''");
    }

    #[test]
    fn sequences_spread_into_separate_tokens() {
        let rendered = interpolate(
            &["grep ", " ", ""],
            &[Value::from("needle"), Value::from(vec!["a.txt", "b.txt"])],
        )
        .unwrap();
        assert_eq!(rendered, "grep needle a.txt b.txt");
    }

    #[test]
    fn rejects_non_finite_floats() {
        let err = interpolate(&["echo ", ""], &[Value::Float(f64::NAN)]).unwrap_err();
        assert!(matches!(err, Error::Interpolation { .. }));
    }

    #[test]
    fn objects_serialize_to_json_then_get_shell_quoted() {
        let value = Value::from(serde_json::json!({"a": 1, "b": [true, "x"]}));
        let rendered = interpolate(&["echo ", ""], &[value]).unwrap();
        assert_eq!(rendered, "echo '{\"a\":1,\"b\":[true,\"x\"]}'");
    }

    #[test]
    fn raw_values_are_not_quoted() {
        let rendered = interpolate(&["", ""], &[raw("$HOME/*")]).unwrap();
        assert_eq!(rendered, "$HOME/*");
    }

    #[test]
    fn mismatched_fragment_count_is_an_error() {
        let err = interpolate(&["a", "b", "c"], &[Value::from("x")]).unwrap_err();
        assert!(matches!(err, Error::Interpolation { .. }));
    }
}
