//! Structured payload contracts for every pipeline phase.
//!
//! Each [`SchemaKind`] ships a JSON Schema document (draft 2020-12) under
//! `schemas/`. Validation runs in two passes: a field walk over the document's
//! `required`/`properties` that reports one error per offending field, then the
//! full `jsonschema` check for the remaining constraints (`minLength`,
//! `minimum`, ...). Only then is the candidate deserialized into its payload
//! struct.

use std::fmt;
use std::str::FromStr;

use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
const EXTRACTED_PRICE_SCHEMA: &str = include_str!("../../schemas/extracted_price.schema.json");
const GENERATED_CODE_SCHEMA: &str = include_str!("../../schemas/generated_code.schema.json");
const CODE_REVIEW_SCHEMA: &str = include_str!("../../schemas/code_review.schema.json");
const DOCUMENTATION_SCHEMA: &str = include_str!("../../schemas/documentation.schema.json");
const PROBLEM_SOLUTION_SCHEMA: &str = include_str!("../../schemas/problem_solution.schema.json");

/// The payload contracts a worker reply can be validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    Plan,
    ExtractedPrice,
    GeneratedCode,
    CodeReview,
    Documentation,
    ProblemSolution,
}

impl SchemaKind {
    pub const ALL: [SchemaKind; 6] = [
        SchemaKind::Plan,
        SchemaKind::ExtractedPrice,
        SchemaKind::GeneratedCode,
        SchemaKind::CodeReview,
        SchemaKind::Documentation,
        SchemaKind::ProblemSolution,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SchemaKind::Plan => "plan",
            SchemaKind::ExtractedPrice => "extracted_price",
            SchemaKind::GeneratedCode => "generated_code",
            SchemaKind::CodeReview => "code_review",
            SchemaKind::Documentation => "documentation",
            SchemaKind::ProblemSolution => "problem_solution",
        }
    }

    /// Raw JSON Schema text, as restated in corrective prompts.
    pub fn document_text(self) -> &'static str {
        match self {
            SchemaKind::Plan => PLAN_SCHEMA,
            SchemaKind::ExtractedPrice => EXTRACTED_PRICE_SCHEMA,
            SchemaKind::GeneratedCode => GENERATED_CODE_SCHEMA,
            SchemaKind::CodeReview => CODE_REVIEW_SCHEMA,
            SchemaKind::Documentation => DOCUMENTATION_SCHEMA,
            SchemaKind::ProblemSolution => PROBLEM_SOLUTION_SCHEMA,
        }
    }

    /// Parsed JSON Schema document.
    pub fn document(self) -> Value {
        serde_json::from_str(self.document_text()).expect("embedded schema should be valid JSON")
    }

    /// Field set whose presence marks a reply as this schema's final answer.
    pub fn signature(self) -> &'static [&'static str] {
        match self {
            SchemaKind::Plan => &["plan"],
            SchemaKind::ExtractedPrice => &["price"],
            SchemaKind::GeneratedCode => &["description", "code"],
            SchemaKind::CodeReview => &["review_comments", "test_code"],
            SchemaKind::Documentation => &["title", "api_documentation"],
            SchemaKind::ProblemSolution => &["problem_analysis", "target_agent"],
        }
    }

    /// One concrete instance that satisfies the schema.
    pub fn example(self) -> Value {
        match self {
            SchemaKind::Plan => json!({
                "plan": ["Parse the input", "Compute the result", "Return it"],
                "data_query": null,
                "dependencies": ["requests"]
            }),
            SchemaKind::ExtractedPrice => json!({ "price": 139990 }),
            SchemaKind::GeneratedCode => json!({
                "description": "Adds two numbers",
                "code": "def add(a, b):\n    return a + b\n"
            }),
            SchemaKind::CodeReview => json!({
                "review_comments": ["Handles the basic case"],
                "test_code": "def test_add():\n    assert add(2, 3) == 5\n",
                "improvements": ["Validate argument types"]
            }),
            SchemaKind::Documentation => json!({
                "title": "add",
                "description": "Adds two numbers.",
                "usage_examples": ["add(2, 3)  # 5"],
                "api_documentation": "add(a, b) -> number"
            }),
            SchemaKind::ProblemSolution => json!({
                "problem_analysis": "The test expects add(2, 3) == 6, which is wrong.",
                "target_agent": "reviewer",
                "specific_instructions": "Change the expected value in test_add to 5.",
                "expected_outcome": "test_add passes"
            }),
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SchemaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SchemaKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = SchemaKind::ALL.iter().map(|kind| kind.name()).collect();
                format!("unknown schema `{s}` (expected one of: {})", names.join(", "))
            })
    }
}

/// A typed payload bound to its schema.
pub trait Payload: DeserializeOwned + Serialize {
    const KIND: SchemaKind;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "plan")]
    pub steps: Vec<String>,
    #[serde(default)]
    pub data_query: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Plan {
    /// Plan used when the planner never produced a valid reply.
    pub fn single_step(task: &str) -> Self {
        Self {
            steps: vec![task.trim().to_string()],
            data_query: None,
            dependencies: Vec::new(),
        }
    }

    /// The search query, if the plan actually asks for external data.
    pub fn data_query(&self) -> Option<&str> {
        self.data_query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
    }
}

impl Payload for Plan {
    const KIND: SchemaKind = SchemaKind::Plan;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedPrice {
    pub price: Option<f64>,
}

impl Payload for ExtractedPrice {
    const KIND: SchemaKind = SchemaKind::ExtractedPrice;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub description: String,
    pub code: String,
}

impl Payload for GeneratedCode {
    const KIND: SchemaKind = SchemaKind::GeneratedCode;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeReview {
    #[serde(rename = "review_comments")]
    pub comments: Vec<String>,
    pub test_code: String,
    #[serde(default)]
    pub improvements: Vec<String>,
}

impl Payload for CodeReview {
    const KIND: SchemaKind = SchemaKind::CodeReview;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Documentation {
    pub title: String,
    pub description: String,
    pub usage_examples: Vec<String>,
    pub api_documentation: String,
}

impl Documentation {
    /// Documentation assembled from the code payload alone.
    pub fn from_code(code: &GeneratedCode) -> Self {
        let description = code.description.trim();
        let title = description
            .lines()
            .next()
            .filter(|line| !line.is_empty())
            .unwrap_or("Generated program")
            .to_string();
        Self {
            title,
            description: description.to_string(),
            usage_examples: Vec::new(),
            api_documentation: String::new(),
        }
    }
}

impl Payload for Documentation {
    const KIND: SchemaKind = SchemaKind::Documentation;
}

/// Worker the arbiter assigns a correction to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetAgent {
    Coder,
    Reviewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemSolution {
    #[serde(rename = "problem_analysis")]
    pub analysis: String,
    pub target_agent: TargetAgent,
    #[serde(rename = "specific_instructions")]
    pub instructions: String,
    pub expected_outcome: String,
}

impl Payload for ProblemSolution {
    const KIND: SchemaKind = SchemaKind::ProblemSolution;
}

/// What is wrong with a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldIssue {
    Missing,
    WrongType {
        expected: String,
        found: &'static str,
    },
    NotAllowed {
        allowed: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub issue: FieldIssue,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issue {
            FieldIssue::Missing => write!(f, "`{}` is missing", self.field),
            FieldIssue::WrongType { expected, found } => {
                write!(f, "`{}` must be {expected}, found {found}", self.field)
            }
            FieldIssue::NotAllowed { allowed } => {
                write!(f, "`{}` must be one of: {}", self.field, allowed.join(", "))
            }
        }
    }
}

/// Why a parsed candidate was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("expected a JSON object, found {found}")]
    NotAnObject { found: &'static str },
    #[error("{}", join_display(.0))]
    Fields(Vec<FieldError>),
    #[error("{}", .0.join("; "))]
    Constraints(Vec<String>),
}

impl SchemaError {
    /// Offending field names, when the error is field-level.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            SchemaError::Fields(errors) => errors.iter().map(|err| err.field.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

fn join_display(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check a parsed candidate against `kind` without deserializing it.
///
/// Extra fields are ignored.
pub fn validate_value(value: &Value, kind: SchemaKind) -> Result<(), SchemaError> {
    let Some(object) = value.as_object() else {
        return Err(SchemaError::NotAnObject {
            found: json_type_name(value),
        });
    };
    let document = kind.document();

    let errors = field_errors(object, &document);
    if !errors.is_empty() {
        return Err(SchemaError::Fields(errors));
    }

    let violations = constraint_violations(value, &document);
    if !violations.is_empty() {
        return Err(SchemaError::Constraints(violations));
    }
    Ok(())
}

/// Validate a parsed candidate and deserialize it into its payload type.
pub fn validate<P: Payload>(value: &Value) -> Result<P, SchemaError> {
    validate_value(value, P::KIND)?;
    serde_json::from_value(value.clone())
        .map_err(|err| SchemaError::Constraints(vec![err.to_string()]))
}

fn field_errors(object: &Map<String, Value>, document: &Value) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for name in document
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        if !object.contains_key(name) {
            errors.push(FieldError {
                field: name.to_string(),
                issue: FieldIssue::Missing,
            });
        }
    }

    let Some(properties) = document.get("properties").and_then(Value::as_object) else {
        return errors;
    };
    for (name, spec) in properties {
        let Some(value) = object.get(name) else {
            continue;
        };
        if !matches_declared_type(value, spec) {
            errors.push(FieldError {
                field: name.clone(),
                issue: FieldIssue::WrongType {
                    expected: declared_types(spec).join(" or "),
                    found: json_type_name(value),
                },
            });
            continue;
        }
        if let Some(allowed) = spec.get("enum").and_then(Value::as_array)
            && !allowed.contains(value)
        {
            errors.push(FieldError {
                field: name.clone(),
                issue: FieldIssue::NotAllowed {
                    allowed: allowed.iter().map(ToString::to_string).collect(),
                },
            });
            continue;
        }
        if let (Some(items), Some(elements)) = (spec.get("items"), value.as_array())
            && let Some((index, element)) = elements
                .iter()
                .enumerate()
                .find(|(_, element)| !matches_declared_type(element, items))
        {
            errors.push(FieldError {
                field: format!("{name}[{index}]"),
                issue: FieldIssue::WrongType {
                    expected: declared_types(items).join(" or "),
                    found: json_type_name(element),
                },
            });
        }
    }

    errors
}

fn constraint_violations(value: &Value, document: &Value) -> Vec<String> {
    match jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(document)
    {
        Ok(compiled) => compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect(),
        Err(err) => vec![format!("compile json schema: {err}")],
    }
}

fn declared_types(spec: &Value) -> Vec<&str> {
    match spec.get("type") {
        Some(Value::String(ty)) => vec![ty.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn matches_declared_type(value: &Value, spec: &Value) -> bool {
    let types = declared_types(spec);
    types.is_empty() || types.into_iter().any(|ty| matches_type(value, ty))
}

fn matches_type(value: &Value, ty: &str) -> bool {
    match ty {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => false,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
