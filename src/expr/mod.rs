//! Embedded expression evaluation.
//!
//! Three families live here:
//!
//! - **Path queries** over JSON-like values. Plain dotted paths are walked
//!   directly; anything containing `[`, `?` or `|` is handed to the
//!   JSONPath engine. Lookups are total: a missing path is `Null`, never an
//!   error. Only a malformed query errors.
//! - **Script expressions** (`js:` tokens, computed variables, scenario
//!   conditions). A single expression is evaluated against a context map
//!   bound as variables. The engine sits behind [`ScriptEngine`] so a
//!   stricter language can replace it; the default is rhai with an
//!   operation limit. This is not a security sandbox; suite authors are
//!   trusted, evaluation errors are not.
//! - **Fake-data generators** (`faker.*` tokens): nullary named generators
//!   whose output is coerced to a string. Deliberately unseeded.

use fake::faker::address::en::{CityName, CountryName, StreetName, ZipCode};
use fake::faker::company::en::{CompanyName, Profession};
use fake::faker::internet::en::{FreeEmail, IPv4, Password, Username};
use fake::faker::lorem::en::{Paragraph, Sentence, Word};
use fake::faker::name::en::{FirstName, LastName, Name};
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake;
use rand::Rng;
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("invalid path expression '{path}': {message}")]
    Path { path: String, message: String },
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script evaluation failed: {0}")]
    Eval(String),

    #[error("unknown generator '{0}'")]
    UnknownGenerator(String),
}

/// True when the text needs the JSONPath engine rather than a dotted walk.
fn needs_query_engine(path: &str) -> bool {
    path.contains('[') || path.contains('?') || path.contains('|')
}

/// Evaluates a path expression against a root value.
///
/// Missing fields resolve to `Null`; only a syntactically invalid JSONPath
/// query produces an error.
pub fn query_path(root: &Value, path: &str) -> Result<Value, ExprError> {
    let path = path.trim();
    if path.is_empty() || path == "$" {
        return Ok(root.clone());
    }

    if needs_query_engine(path) {
        let normalized = if path.starts_with('$') {
            path.to_string()
        } else {
            format!("$.{path}")
        };
        let matches = jsonpath_lib::select(root, &normalized).map_err(|e| ExprError::Path {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        return Ok(match matches.len() {
            0 => Value::Null,
            1 => matches[0].clone(),
            _ => Value::Array(matches.into_iter().cloned().collect()),
        });
    }

    let stripped = path.strip_prefix("$.").unwrap_or(path);
    Ok(walk_dotted(root, stripped))
}

/// Dotted traversal with numeric segments indexing into arrays.
fn walk_dotted(root: &Value, path: &str) -> Value {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// Restricted script evaluation behind a swappable seam.
pub trait ScriptEngine: Send + Sync {
    /// Evaluates a single expression with the context map bound as
    /// variables, returning the resulting value.
    fn eval(&self, expression: &str, context: &Map<String, Value>) -> Result<Value, ScriptError>;
}

/// Default [`ScriptEngine`] backed by rhai in expression-only mode.
pub struct RhaiScriptEngine {
    engine: rhai::Engine,
}

impl RhaiScriptEngine {
    pub fn new() -> Self {
        let mut engine = rhai::Engine::new();
        // Runaway expressions abort instead of hanging a worker.
        engine.set_max_operations(100_000);
        engine.set_max_expr_depths(64, 64);
        Self { engine }
    }
}

impl Default for RhaiScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for RhaiScriptEngine {
    fn eval(&self, expression: &str, context: &Map<String, Value>) -> Result<Value, ScriptError> {
        let mut scope = rhai::Scope::new();
        for (name, value) in context {
            // Keys that are not bare identifiers (namespaced captures like
            // "auth.token") cannot be bound as variables; dotted access
            // still reaches them through their parent objects.
            if !is_identifier(name) {
                continue;
            }
            let dynamic = rhai::serde::to_dynamic(value)
                .map_err(|e| ScriptError::Eval(e.to_string()))?;
            scope.push_dynamic(name.clone(), dynamic);
        }

        let result = self
            .engine
            .eval_expression_with_scope::<rhai::Dynamic>(&mut scope, expression)
            .map_err(|e| ScriptError::Eval(e.to_string()))?;

        rhai::serde::from_dynamic(&result).map_err(|e| ScriptError::Eval(e.to_string()))
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Invokes a named fake-data generator. `name` is the path after the
/// `faker.` / `fake.` prefix, case-insensitive.
pub fn generate(name: &str) -> Result<Value, ScriptError> {
    let normalized = name.trim().to_ascii_lowercase();
    let value = match normalized.as_str() {
        "person.firstname" | "name.firstname" => json!(FirstName().fake::<String>()),
        "person.lastname" | "name.lastname" => json!(LastName().fake::<String>()),
        "person.fullname" | "name.fullname" | "name" => json!(Name().fake::<String>()),
        "internet.email" | "email" => json!(FreeEmail().fake::<String>()),
        "internet.username" | "internet.user_name" => json!(Username().fake::<String>()),
        "internet.password" => json!(Password(12..20).fake::<String>()),
        "internet.ip" | "internet.ipv4" => json!(IPv4().fake::<String>()),
        "string.uuid" | "datatype.uuid" | "uuid" => json!(uuid::Uuid::new_v4().to_string()),
        "number.int" | "datatype.number" => {
            json!(rand::thread_rng().gen_range(0..=1_000_000i64))
        }
        "datatype.boolean" | "boolean" => json!(rand::thread_rng().gen_bool(0.5)),
        "date.now" | "date.iso" => json!(chrono::Utc::now().to_rfc3339()),
        "date.timestamp" => json!(chrono::Utc::now().timestamp_millis()),
        "lorem.word" => json!(Word().fake::<String>()),
        "lorem.sentence" => json!(Sentence(3..8).fake::<String>()),
        "lorem.paragraph" => json!(Paragraph(1..3).fake::<String>()),
        "address.city" | "location.city" => json!(CityName().fake::<String>()),
        "address.street" => json!(StreetName().fake::<String>()),
        "address.country" | "location.country" => json!(CountryName().fake::<String>()),
        "address.zipcode" | "location.zipcode" => json!(ZipCode().fake::<String>()),
        "company.name" => json!(CompanyName().fake::<String>()),
        "person.jobtitle" | "company.profession" => json!(Profession().fake::<String>()),
        "phone.number" | "phone_number" => json!(PhoneNumber().fake::<String>()),
        _ => return Err(ScriptError::UnknownGenerator(name.to_string())),
    };
    Ok(value)
}
