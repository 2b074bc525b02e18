//! Flow-suite document model.
//!
//! A suite is the declarative description of an ordered list of API
//! interactions: steps with assertions, captures, cross-suite calls and
//! control constructs. Documents are authored in YAML (or JSON) and
//! deserialized straight into these types; the engine never sees raw text.
//!
//! Step bodies are a tagged enum rather than a bag of optional fields, so
//! `match` coverage over step kinds is checked by the compiler and a step
//! carrying two bodies fails to parse at all.

pub mod validate;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A parsed flow-suite document. Immutable for the duration of a run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowSuite {
    /// Human-readable suite name, also the default namespace for exports.
    pub suite_name: String,

    /// Stable identifier used by `depends` references and call aliasing.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Prefix for relative step URLs.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Suite-scope variables, overridable per run.
    #[serde(default)]
    pub variables: Map<String, Value>,

    pub steps: Vec<Step>,

    /// Suites whose exported variables this suite imports.
    #[serde(default)]
    pub depends: Vec<Dependency>,

    /// Variable names published to the global registry after a successful
    /// run.
    #[serde(default)]
    pub exports: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub priority: Option<String>,
}

impl FlowSuite {
    /// Namespace under which this suite's values are imported elsewhere.
    pub fn namespace(&self) -> &str {
        self.node_id.as_deref().unwrap_or(&self.suite_name)
    }

    /// Locates a step by `step_id` first, then by name.
    pub fn find_step(&self, identifier: &str) -> Option<(usize, &Step)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.step_id.as_deref() == Some(identifier))
            .or_else(|| {
                self.steps
                    .iter()
                    .enumerate()
                    .find(|(_, s)| s.name == identifier)
            })
    }
}

/// Reference to another suite this one depends on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Dependency {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default = "default_true")]
    pub required: bool,

    /// Cache hint for external dependency resolvers. The engine itself
    /// ignores it.
    #[serde(default)]
    pub cache: Option<Value>,

    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl Dependency {
    /// Namespace the dependency's exports are imported under.
    pub fn namespace(&self) -> Option<&str> {
        self.node_id
            .as_deref()
            .or_else(|| self.path.as_deref().map(stem_of))
    }
}

fn stem_of(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().unwrap_or(name)
}

fn default_true() -> bool {
    true
}

/// One unit of work inside a suite.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Step {
    pub name: String,

    /// Optional stable id, preferred over the name for call targets and
    /// qualified identifiers.
    #[serde(default)]
    pub step_id: Option<String>,

    #[serde(default)]
    pub metadata: Option<StepMetadata>,

    /// Keep executing the suite even if this step fails. The step itself
    /// still reports FAILED.
    #[serde(default)]
    pub continue_on_failure: bool,

    #[serde(default)]
    pub skip: bool,

    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    /// Identifier used on call stacks and in qualified step ids.
    pub fn identifier(&self) -> &str {
        self.step_id.as_deref().unwrap_or(&self.name)
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.metadata.as_ref().and_then(|m| m.retry.as_ref())
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.metadata.as_ref().and_then(|m| m.timeout_ms)
    }
}

/// Step body. Exactly one per step; the externally tagged representation
/// makes a document with two bodies unparsable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Request(RequestSpec),
    Call(CallSpec),
    Input(InputSpec),
    Iterate(IterateSpec),
    Scenarios(Vec<ScenarioClause>),
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Call(_) => "call",
            Self::Input(_) => "input",
            Self::Iterate(_) => "iterate",
            Self::Scenarios(_) => "scenarios",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StepMetadata {
    #[serde(default)]
    pub priority: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Step-level retry. Assertions and captures run inside the attempt, so an
/// assertion failure triggers another attempt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    #[serde(default)]
    pub delay_ms: u64,
}

/// The seven supported HTTP verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }

    /// Whether a request body is serialized for this verb.
    pub fn carries_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP interaction step.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestSpec {
    pub method: HttpMethod,

    /// Absolute, or relative to the suite `base_url`.
    pub url: String,

    /// Header map; insertion order is preserved through to the wire.
    #[serde(default)]
    pub headers: Map<String, Value>,

    #[serde(default)]
    pub body: Option<Value>,

    /// Query parameters appended to the URL.
    #[serde(default)]
    pub params: Map<String, Value>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Declarative assertion tree (see the assertions module).
    #[serde(default)]
    pub assertions: Option<Value>,

    /// `name -> expression` extraction map.
    #[serde(default)]
    pub capture: BTreeMap<String, String>,

    /// Conditional branches evaluated against the response.
    #[serde(default)]
    pub scenarios: Vec<ScenarioClause>,
}

/// Invocation of a step in another suite.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallSpec {
    /// Target suite document, as a path relative to the calling suite (or
    /// the configured suites root).
    pub test: String,

    /// Target step, by `step_id` or name.
    pub step: String,

    /// Variables handed to the callee.
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Namespace prefix for propagated captures; defaults to the callee's
    /// node id.
    #[serde(default)]
    pub alias: Option<String>,

    /// When true, callee runtime mutations stay invisible to the caller
    /// except through propagated captures.
    #[serde(default)]
    pub isolate_context: bool,

    #[serde(default)]
    pub on_error: CallErrorMode,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorMode {
    #[default]
    Fail,
    Continue,
    Warn,
}

/// Interactive input request resolved from the run's input payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputSpec {
    pub prompt: String,

    /// Runtime variable the value is stored under.
    pub variable: String,

    #[serde(default, rename = "type")]
    pub input_type: InputType,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default = "default_true")]
    pub required: bool,

    /// Candidate values for `select` inputs.
    #[serde(default)]
    pub options: Vec<Value>,

    /// Regex the (stringified) value must match.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    Text,
    Password,
    Number,
    Email,
    Url,
    Select,
    Confirm,
    Multiline,
}

/// Repetition of an inner step over an array or numeric range.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IterateSpec {
    /// Expression resolving to an array. Mutually exclusive with `range`.
    #[serde(default)]
    pub over: Option<String>,

    /// `"start..end"` half-open range. Mutually exclusive with `over`.
    #[serde(default)]
    pub range: Option<String>,

    /// Iterator variable bound in runtime scope for each pass.
    #[serde(rename = "as")]
    pub bind: String,

    /// The wrapped step executed once per element.
    pub body: Box<Step>,
}

/// One conditional branch of a scenario list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScenarioClause {
    /// Script expression evaluated against the response context.
    pub condition: String,

    #[serde(default)]
    pub then: Option<ScenarioBranch>,

    #[serde(default, rename = "else")]
    pub otherwise: Option<ScenarioBranch>,
}

/// Actions applied when a scenario branch is taken.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScenarioBranch {
    #[serde(default)]
    pub assertions: Option<Value>,

    #[serde(default)]
    pub capture: BTreeMap<String, String>,

    /// Literal variables written into runtime scope.
    #[serde(default)]
    pub variables: Map<String, Value>,
}
