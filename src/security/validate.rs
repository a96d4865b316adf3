//! Request body validation against a small JSON-Schema-like definition.
//!
//! A schema names required fields and expected types. Every problem is
//! collected, so a client sees the full list in one `400` response:
//!
//! ```json
//! { "errors": ["title is required", "done must be boolean"] }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{BODY_KEY, Context};
use crate::middleware::{Guard, Outcome, Rejection};

/// JSON value types a field can be required to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    /// Any JSON number.
    Number,
    /// A number with no fractional part.
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl FieldType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Null => value.is_null(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Null => "null",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct PropertyDef {
    #[serde(rename = "type")]
    kind: FieldType,
}

// Wire shape: `{"required": [...], "properties": {"name": {"type": "string"}}}`.
#[derive(Deserialize)]
struct SchemaDef {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    properties: BTreeMap<String, PropertyDef>,
}

impl From<SchemaDef> for Schema {
    fn from(def: SchemaDef) -> Self {
        Schema {
            required: def.required,
            properties: def
                .properties
                .into_iter()
                .map(|(name, prop)| (name, prop.kind))
                .collect(),
        }
    }
}

/// Required fields plus field types.
///
/// Built in code with [`require`](Self::require) / [`field`](Self::field), or
/// deserialized from configuration; deserialized properties are checked in
/// name order.
///
/// # Examples
///
/// ```
/// use arunika::security::{FieldType, Schema};
/// use serde_json::json;
///
/// let schema = Schema::new()
///     .require("title")
///     .field("title", FieldType::String)
///     .field("done", FieldType::Boolean);
///
/// assert!(schema.validate(&json!({ "title": "milk" })).is_ok());
/// assert_eq!(
///     schema.validate(&json!({ "done": "yes" })).unwrap_err(),
///     vec!["title is required", "done must be boolean"],
/// );
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "SchemaDef")]
pub struct Schema {
    required: Vec<String>,
    properties: Vec<(String, FieldType)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldType) -> Self {
        self.properties.push((name.into(), kind));
        self
    }

    /// Checks `body`, returning every violation found.
    ///
    /// A present field satisfies `required` even when its value is `null`;
    /// type checks only apply to fields that are present.
    pub fn validate(&self, body: &Value) -> Result<(), Vec<String>> {
        let empty = Map::new();
        let fields = body.as_object().unwrap_or(&empty);
        let mut errors = Vec::new();

        for name in &self.required {
            if !fields.contains_key(name) {
                errors.push(format!("{name} is required"));
            }
        }
        for (name, kind) in &self.properties {
            if let Some(value) = fields.get(name) {
                if !kind.matches(value) {
                    errors.push(format!("{name} must be {kind}"));
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    // An empty body counts as `{}`; anything that is not a JSON object fails outright.
    fn parse_body(bytes: &[u8]) -> Result<Value, Rejection> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Object(Map::new()));
        }
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(_) => Err(Rejection::Validation(vec!["body must be a JSON object".to_owned()])),
            Err(_) => Err(Rejection::Validation(vec!["body must be valid JSON".to_owned()])),
        }
    }
}

impl Guard for Schema {
    fn check(&self, ctx: &mut Context) -> Outcome {
        let body = match Self::parse_body(ctx.request().body_bytes()) {
            Ok(body) => body,
            Err(rejection) => return rejection.into(),
        };
        match self.validate(&body) {
            Ok(()) => {
                ctx.set(BODY_KEY, body);
                Outcome::Continue
            }
            Err(errors) => {
                tracing::debug!(path = %ctx.request().path(), errors = errors.len(), "validation failed");
                Rejection::Validation(errors).into()
            }
        }
    }

    fn name(&self) -> &'static str {
        "validate"
    }
}
