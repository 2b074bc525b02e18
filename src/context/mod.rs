//! Variable store and template interpolation.
//!
//! Four scopes, highest read priority first:
//!
//! 1. **runtime**: captures produced during this run
//! 2. **suite**: declared in the document plus per-run overrides
//! 3. **imported**: exports of dependency suites, nested per namespace
//! 4. **global**: engine-wide settings
//!
//! Each run owns its store; nothing here is shared across runs.
//! Interpolation is total: it logs and leaves a token in place rather than
//! fail, so a bad template shows up verbatim in the outgoing request where
//! it is easy to spot.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::errors::ErrorCode;
use crate::expr::{self, ScriptEngine};

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("valid token regex"));

#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    runtime: Map<String, Value>,
    suite: Map<String, Value>,
    imported: Map<String, Value>,
    global: Map<String, Value>,

    /// Unresolved tokens log a warning unless suppressed.
    pub warn_on_missing: bool,
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            warn_on_missing: true,
            ..Default::default()
        }
    }

    /// Store for a fresh run: suite variables overlaid with per-run
    /// overrides (overrides win), imported scope pre-seeded.
    pub fn for_run(
        suite_vars: &Map<String, Value>,
        overrides: &Map<String, Value>,
        imported: Map<String, Value>,
        warn_on_missing: bool,
    ) -> Self {
        let mut suite = suite_vars.clone();
        for (k, v) in overrides {
            suite.insert(k.clone(), v.clone());
        }
        Self {
            runtime: Map::new(),
            suite,
            imported,
            global: Map::new(),
            warn_on_missing,
        }
    }

    pub fn set_runtime(&mut self, name: impl Into<String>, value: Value) {
        self.runtime.insert(name.into(), value);
    }

    pub fn set_suite(&mut self, name: impl Into<String>, value: Value) {
        self.suite.insert(name.into(), value);
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.global.insert(name.into(), value);
    }

    /// Writes into the imported scope under a dependency namespace.
    pub fn set_imported(&mut self, namespace: &str, name: &str, value: Value) {
        let entry = self
            .imported
            .entry(namespace.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = entry {
            map.insert(name.to_string(), value);
        }
    }

    pub fn runtime_vars(&self) -> &Map<String, Value> {
        &self.runtime
    }

    pub fn suite_vars(&self) -> &Map<String, Value> {
        &self.suite
    }

    pub fn imported_vars(&self) -> &Map<String, Value> {
        &self.imported
    }

    /// Replaces the runtime scope wholesale. Used by non-isolated calls to
    /// share mutations back with the caller.
    pub fn replace_runtime(&mut self, runtime: Map<String, Value>) {
        self.runtime = runtime;
    }

    /// Walks runtime → suite → imported → global. Within a layer an exact
    /// key match wins over dotted traversal, so namespaced captures like
    /// `auth.token` shadow nested lookups. Missing and explicit null are
    /// both `None`.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        for layer in [&self.runtime, &self.suite, &self.imported, &self.global] {
            if let Some(value) = lookup_in_layer(layer, name) {
                return Some(value);
            }
        }
        None
    }

    /// All four layers flattened into one map, highest priority last write.
    /// This is the context handed to script expressions.
    pub fn merged(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for layer in [&self.global, &self.imported, &self.suite, &self.runtime] {
            for (k, v) in layer.iter() {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// Recursively expands `{{...}}` tokens in a template value. Strings
    /// are interpolated, arrays and maps traversed in order, everything
    /// else returned unchanged. Never fails.
    pub fn interpolate(&self, template: &Value, scripts: &dyn ScriptEngine) -> Value {
        match template {
            Value::String(s) => self.interpolate_str(s, scripts),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.interpolate(item, scripts))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.interpolate(v, scripts));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    /// Interpolates one string. A template that is exactly one token keeps
    /// the resolved value's type; anything else stringifies into place.
    pub fn interpolate_str(&self, template: &str, scripts: &dyn ScriptEngine) -> Value {
        let trimmed = template.trim();
        if let Some(caps) = TOKEN_RE.captures(trimmed) {
            let full = caps.get(0).expect("regex match");
            if full.start() == 0 && full.end() == trimmed.len() {
                let expr = caps.get(1).expect("token group").as_str().trim();
                return match self.resolve_token(expr, scripts) {
                    Some(value) => value,
                    None => Value::String(template.to_string()),
                };
            }
        }

        let mut out = String::new();
        let mut last = 0;
        for caps in TOKEN_RE.captures_iter(template) {
            let full = caps.get(0).expect("regex match");
            let expr = caps.get(1).expect("token group").as_str().trim();
            out.push_str(&template[last..full.start()]);
            match self.resolve_token(expr, scripts) {
                Some(value) => out.push_str(&stringify(&value)),
                None => out.push_str(full.as_str()),
            }
            last = full.end();
        }
        out.push_str(&template[last..]);
        Value::String(out)
    }

    /// Set of `{{...}}` expressions referenced anywhere in a template.
    pub fn extract_references(template: &Value) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        collect_references(template, &mut refs);
        refs
    }

    fn resolve_token(&self, expr: &str, scripts: &dyn ScriptEngine) -> Option<Value> {
        if let Some(generator) = expr
            .strip_prefix("faker.")
            .or_else(|| expr.strip_prefix("fake."))
        {
            return match expr::generate(generator) {
                // Generator output is always coerced to string.
                Ok(value) => Some(Value::String(stringify(&value))),
                Err(e) => {
                    warn!(token = %expr, error = %e, "fake-data generator failed");
                    None
                }
            };
        }

        if let Some(script) = expr.strip_prefix("js:") {
            return match scripts.eval(script.trim(), &self.merged()) {
                Ok(value) => Some(value),
                Err(e) => {
                    // The unexpanded token stays in the output, same as any
                    // other interpolation failure.
                    warn!(token = %expr, code = %ErrorCode::SCRIPT_ERROR, error = %e, "script token failed");
                    None
                }
            };
        }

        if let Some(name) = expr.strip_prefix("env.") {
            return match std::env::var(name) {
                Ok(value) => Some(Value::String(value)),
                Err(_) => {
                    if self.warn_on_missing {
                        warn!(variable = %name, code = %ErrorCode::ENV_VAR_NOT_FOUND, "environment variable not set");
                    }
                    None
                }
            };
        }

        match self.lookup(expr) {
            Some(value) => Some(value),
            None => {
                if self.warn_on_missing {
                    warn!(
                        variable = %expr,
                        code = %ErrorCode::CONTEXT_VAR_NOT_FOUND,
                        "variable not resolved, leaving token in place"
                    );
                } else {
                    debug!(variable = %expr, "variable not resolved");
                }
                None
            }
        }
    }
}

fn lookup_in_layer(layer: &Map<String, Value>, name: &str) -> Option<Value> {
    if let Some(value) = layer.get(name) {
        return non_null(value.clone());
    }
    let (head, rest) = name.split_once('.')?;
    let root = layer.get(head)?;
    let value = expr::query_path(root, rest).ok()?;
    non_null(value)
}

fn non_null(value: Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

/// String form used when a token is embedded in surrounding text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn collect_references(template: &Value, refs: &mut BTreeSet<String>) {
    match template {
        Value::String(s) => {
            for caps in TOKEN_RE.captures_iter(s) {
                refs.insert(caps.get(1).expect("token group").as_str().trim().to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, refs);
            }
        }
        Value::Object(map) => {
            for value in map.values() {
                collect_references(value, refs);
            }
        }
        _ => {}
    }
}
