//! Variable interpolation over a typed scope.
//!
//! Bindings are expressions of the form `${path.to.value}` resolved against
//! the active unit's scope (`document.*`, `chunk.*`, `row.*`, `row_index`,
//! `all.<output>`, `run_id`, plus user bindings). A `${path | "default"}`
//! form supplies a fallback for missing paths, and `${join(expr, "sep")}`
//! flattens-and-joins a list. Interpolation is a single pass; resolved
//! values are never re-scanned.

use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Default cap on joined payloads, overridable via configuration.
pub const DEFAULT_JOIN_MAX_CHARS: usize = 200_000;

/// Typed variable scope for one unit-step invocation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    values: Map<String, Value>,
    /// Cap applied to joined list payloads.
    pub join_max_chars: usize,
}

impl Scope {
    /// An empty scope with the default join cap.
    pub fn new() -> Self {
        Self {
            values: Map::new(),
            join_max_chars: DEFAULT_JOIN_MAX_CHARS,
        }
    }

    /// Bind a top-level name (namespace or scalar).
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Look up a dotted path. `None` when any segment is missing.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.values.get(first)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Canonical stringification: strings as-is, scalars via display, maps and
/// lists as compact JSON, null as the empty string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn truncate_joined(mut text: String, cap: usize) -> String {
    if cap > 0 && text.len() > cap {
        let mut cut = cap;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n… [truncated]");
    }
    text
}

fn join_values(values: &[Value], sep: &str, cap: usize) -> String {
    let joined = values
        .iter()
        .map(stringify)
        .collect::<Vec<_>>()
        .join(sep);
    truncate_joined(joined, cap)
}

/// Split `path | "default"` at a top-level pipe, returning the path and the
/// unquoted default when present.
fn split_default(expr: &str) -> (String, Option<String>) {
    let mut in_quotes = false;
    for (i, ch) in expr.char_indices() {
        match ch {
            '"' | '\'' => in_quotes = !in_quotes,
            '|' if !in_quotes => {
                let path = expr[..i].trim().to_string();
                let default = unquote(expr[i + 1..].trim());
                return (path, Some(default));
            }
            _ => {}
        }
    }
    (expr.trim().to_string(), None)
}

fn split_call_args(args: &str) -> (&str, Option<&str>) {
    let mut in_quotes = false;
    for (i, ch) in args.char_indices() {
        match ch {
            '"' | '\'' => in_quotes = !in_quotes,
            ',' if !in_quotes => return (&args[..i], Some(&args[i + 1..])),
            _ => {}
        }
    }
    (args, None)
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')))
    {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw.to_string()
    }
}

/// Evaluate a binding expression against a scope.
///
/// Non-`${...}` values pass through unchanged. A missing path without a
/// default is a processing error; an unknown function is a configuration
/// error.
pub fn render_binding(expr: &Value, scope: &Scope) -> Result<Value> {
    let text = match expr {
        Value::String(s) => s,
        other => return Ok(other.clone()),
    };
    let trimmed = text.trim();
    if !(trimmed.starts_with("${") && trimmed.ends_with('}')) {
        return Ok(expr.clone());
    }
    let inner = trimmed[2..trimmed.len() - 1].trim();

    if let Some(call) = inner.strip_suffix(')') {
        if let Some((func, args)) = call.split_once('(') {
            let func = func.trim();
            if func != "join" {
                return Err(EngineError::Config(format!(
                    "unknown interpolation function: {func:?}"
                )));
            }
            // Split at the first comma outside quotes: path expressions
            // carry no commas, separators may.
            let (arg_expr, sep) = match split_call_args(args) {
                (expr, Some(sep_raw)) => (expr.trim(), unquote(sep_raw)),
                (expr, None) => (expr.trim(), "\n".to_string()),
            };
            let value = resolve_path(arg_expr, scope)?;
            let joined = match value {
                Value::Array(items) => join_values(&items, &sep, scope.join_max_chars),
                Value::String(s) if s.contains('\n') => {
                    let lines: Vec<Value> =
                        s.lines().map(|l| Value::String(l.to_string())).collect();
                    join_values(&lines, &sep, scope.join_max_chars)
                }
                other => stringify(&other),
            };
            return Ok(Value::String(joined));
        }
    }

    let (path, default) = split_default(inner);
    match scope.lookup(&path) {
        Some(Value::Array(items)) => Ok(Value::String(join_values(
            items,
            "\n",
            scope.join_max_chars,
        ))),
        Some(value) => Ok(value.clone()),
        None => match default {
            Some(fallback) => Ok(Value::String(fallback)),
            None => Err(EngineError::Processing(format!(
                "unresolved template path: {path}"
            ))),
        },
    }
}

fn resolve_path(expr: &str, scope: &Scope) -> Result<Value> {
    let (path, default) = split_default(expr);
    match scope.lookup(&path) {
        Some(value) => Ok(value.clone()),
        None => match default {
            Some(fallback) => Ok(Value::String(fallback)),
            None => Err(EngineError::Processing(format!(
                "unresolved template path: {path}"
            ))),
        },
    }
}

/// Render a prompt body against rendered input bindings and the unit scope.
///
/// Both `${...}` and `{{ name }}` placeholder styles are substituted with
/// the canonical string form. A `${...}` placeholder first matches an input
/// binding by name, then falls back to full expression evaluation against
/// the scope (paths, defaults, `join`). The scan is a single left-to-right
/// pass, so substituted values are never re-interpolated.
pub fn render_prompt(template: &str, inputs: &Map<String, Value>, scope: &Scope) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix("${") {
            if let Some(end) = stripped.find('}') {
                let name = stripped[..end].trim();
                let value = match inputs.get(name) {
                    Some(bound) => bound.clone(),
                    None => {
                        render_binding(&Value::String(format!("${{{name}}}")), scope)?
                    }
                };
                out.push_str(&stringify(&value));
                rest = &stripped[end + 1..];
                continue;
            }
        } else if let Some(stripped) = rest.strip_prefix("{{") {
            if let Some(end) = stripped.find("}}") {
                let name = stripped[..end].trim();
                if let Some(value) = inputs.get(name) {
                    out.push_str(&stringify(value));
                    rest = &stripped[end + 2..];
                    continue;
                }
            }
        }
        let ch = rest.chars().next().expect("non-empty remainder");
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        let mut s = Scope::new();
        s.bind("run_id", json!("20250101T000000Z-abcd"));
        s.bind("row", json!({"text": "hello", "id": "7"}));
        s.bind("chunk", json!({"text": "chunk text", "source_uri": "file://a"}));
        s.bind("all", json!({"summary": ["one", "two", "three"]}));
        s.bind("row_index", json!(4));
        s
    }

    #[test]
    fn test_lookup_dotted_path() {
        let s = scope();
        assert_eq!(s.lookup("row.text"), Some(&json!("hello")));
        assert_eq!(s.lookup("row.missing"), None);
        assert_eq!(s.lookup("nope.at.all"), None);
    }

    #[test]
    fn test_render_plain_value_passthrough() {
        let s = scope();
        let out = render_binding(&json!("no placeholders"), &s).unwrap();
        assert_eq!(out, json!("no placeholders"));
    }

    #[test]
    fn test_render_path() {
        let s = scope();
        let out = render_binding(&json!("${row.text}"), &s).unwrap();
        assert_eq!(out, json!("hello"));
    }

    #[test]
    fn test_render_scalar_paths() {
        let s = scope();
        assert_eq!(render_binding(&json!("${row_index}"), &s).unwrap(), json!(4));
        assert_eq!(
            render_binding(&json!("${run_id}"), &s).unwrap(),
            json!("20250101T000000Z-abcd")
        );
    }

    #[test]
    fn test_missing_path_is_error() {
        let s = scope();
        let err = render_binding(&json!("${row.nope}"), &s).unwrap_err();
        assert!(matches!(err, EngineError::Processing(_)));
    }

    #[test]
    fn test_missing_path_with_default() {
        let s = scope();
        let out = render_binding(&json!("${row.nope | \"fallback\"}"), &s).unwrap();
        assert_eq!(out, json!("fallback"));
    }

    #[test]
    fn test_list_path_joins_with_newlines() {
        let s = scope();
        let out = render_binding(&json!("${all.summary}"), &s).unwrap();
        assert_eq!(out, json!("one\ntwo\nthree"));
    }

    #[test]
    fn test_join_function_with_separator() {
        let s = scope();
        let out = render_binding(&json!("${join(all.summary, \", \")}"), &s).unwrap();
        assert_eq!(out, json!("one, two, three"));
    }

    #[test]
    fn test_join_separator_may_contain_commas() {
        let s = scope();
        let out = render_binding(&json!("${join(all.summary, \", and \")}"), &s).unwrap();
        assert_eq!(out, json!("one, and two, and three"));
    }

    #[test]
    fn test_join_function_default_separator() {
        let s = scope();
        let out = render_binding(&json!("${join(all.summary)}"), &s).unwrap();
        assert_eq!(out, json!("one\ntwo\nthree"));
    }

    #[test]
    fn test_unknown_function_is_config_error() {
        let s = scope();
        let err = render_binding(&json!("${upper(row.text)}"), &s).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_join_cap_truncates() {
        let mut s = scope();
        s.join_max_chars = 5;
        let out = render_binding(&json!("${join(all.summary, \"\")}"), &s).unwrap();
        let text = out.as_str().unwrap();
        assert!(text.ends_with("… [truncated]"));
        assert!(text.starts_with("onetw"));
    }

    #[test]
    fn test_stringify_canonical_forms() {
        assert_eq!(stringify(&json!("s")), "s");
        assert_eq!(stringify(&json!(3)), "3");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&json!(null)), "");
        assert_eq!(stringify(&json!({"a": 1})), "{\"a\":1}");
        assert_eq!(stringify(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_render_prompt_both_placeholder_styles() {
        let mut inputs = Map::new();
        inputs.insert("comment".into(), json!("fine"));
        let body = render_prompt("A ${comment} and {{ comment }}.", &inputs, &scope()).unwrap();
        assert_eq!(body, "A fine and fine.");
    }

    #[test]
    fn test_render_prompt_resolves_scope_paths() {
        let inputs = Map::new();
        let body = render_prompt("Echo: ${row.text}", &inputs, &scope()).unwrap();
        assert_eq!(body, "Echo: hello");
    }

    #[test]
    fn test_render_prompt_missing_path_fails() {
        let inputs = Map::new();
        let err = render_prompt("Echo: ${row.nothing}", &inputs, &scope()).unwrap_err();
        assert!(matches!(err, EngineError::Processing(_)));
    }

    #[test]
    fn test_single_pass_no_rescan() {
        let mut inputs = Map::new();
        inputs.insert("a".into(), json!("literal ${run_id} stays"));
        // The substituted text must not be re-interpolated.
        let body = render_prompt("value: ${a}", &inputs, &scope()).unwrap();
        assert_eq!(body, "value: literal ${run_id} stays");
    }
}
