//! `${path}` reference resolution.
//!
//! A string that is exactly `${a.b.c}` is replaced by the value at that
//! dot-separated path; objects and arrays are resolved element-wise; anything
//! else passes through. A missing key or a non-container along the way
//! resolves to `null`. Resolution never fails and never mutates its input.

use serde_json::Value;

/// Something `${...}` paths can be looked up in.
pub trait PathLookup {
    /// Value at `path`, or `None` when any segment is missing.
    fn lookup(&self, path: &[&str]) -> Option<Value>;
}

impl PathLookup for Value {
    fn lookup(&self, path: &[&str]) -> Option<Value> {
        walk(self, path).cloned()
    }
}

/// Follow `path` through nested objects and arrays (numeric segments).
pub fn walk<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// The path inside `${...}` when `s` is exactly one reference.
pub fn template_path(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    let inner = inner.trim();
    if inner.is_empty() || inner.contains(['{', '}', '$']) {
        return None;
    }
    Some(inner)
}

/// Resolve a dot-separated path, yielding `null` when absent.
pub fn resolve_path(path: &str, ctx: &impl PathLookup) -> Value {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Value::Null;
    }
    ctx.lookup(&segments).unwrap_or(Value::Null)
}

/// Resolve every `${...}` reference in `value` against `ctx`.
pub fn resolve(value: &Value, ctx: &impl PathLookup) -> Value {
    match value {
        Value::String(s) => match template_path(s) {
            Some(path) => resolve_path(path, ctx),
            None => value.clone(),
        },
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, ctx)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, ctx)).collect()),
        _ => value.clone(),
    }
}
