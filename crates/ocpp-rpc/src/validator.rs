//! Strict-mode schema validation.
//!
//! A [`Validator`] owns the compiled JSON Schemas for one subprotocol,
//! keyed by `$id` in the `urn:<Method>.req` / `urn:<Method>.conf`
//! convention. Validation failures carry the failing keyword so the peer
//! can map them onto wire error codes.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, ErrorCode, Result};

/// Which side of a call a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// CALL params.
    Request,
    /// CALLRESULT payload.
    Response,
}

impl Direction {
    fn schema_suffix(self) -> &'static str {
        match self {
            Self::Request => "req",
            Self::Response => "conf",
        }
    }
}

/// A structured schema-validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    /// The JSON Schema keyword that failed (`required`, `type`, ...).
    pub keyword: String,
    /// JSON pointer to the offending value.
    pub instance_path: String,
    /// Human-readable failure message.
    pub message: String,
}

impl ValidationFailure {
    /// Map the failing keyword onto the wire error code.
    ///
    /// Unknown keywords fall back to `FormatViolation`. The occurrence
    /// category deliberately emits the legacy spelling.
    pub fn error_code(&self) -> ErrorCode {
        match self.keyword.as_str() {
            "exclusiveMaximum" | "exclusiveMinimum" | "multipleOf" | "maxItems" | "minItems"
            | "maxProperties" | "minProperties" | "additionalItems" | "required" => {
                ErrorCode::OccurenceConstraintViolation
            }
            "pattern" | "propertyNames" | "additionalProperties" => {
                ErrorCode::PropertyConstraintViolation
            }
            "type" => ErrorCode::TypeConstraintViolation,
            // maximum, minimum, maxLength, minLength and everything else.
            _ => ErrorCode::FormatViolation,
        }
    }
}

/// Outcome of validating one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// The payload satisfies its schema.
    Valid,
    /// The validator has no schema for this method/direction.
    NoSchema,
    /// The payload violates its schema.
    Invalid(ValidationFailure),
}

/// Compiled schema set for one subprotocol.
pub struct Validator {
    subprotocol: String,
    schemas: HashMap<String, jsonschema::Validator>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("subprotocol", &self.subprotocol)
            .field("schemas", &self.schemas.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Validator {
    /// Compile a schema set for `subprotocol`.
    ///
    /// Every schema document must carry a string `$id`; compilation failures
    /// and missing ids are configuration errors.
    pub fn new(subprotocol: impl Into<String>, schemas: Vec<Value>) -> Result<Self> {
        let subprotocol = subprotocol.into();
        let mut compiled = HashMap::with_capacity(schemas.len());
        for schema in schemas {
            let Some(id) = schema.get("$id").and_then(Value::as_str).map(String::from) else {
                return Err(Error::config(format!(
                    "Schema for subprotocol {subprotocol:?} is missing a string $id"
                )));
            };
            let validator = jsonschema::validator_for(&schema).map_err(|e| {
                Error::config(format!("Schema {id:?} failed to compile: {e}"))
            })?;
            compiled.insert(id, validator);
        }
        Ok(Self {
            subprotocol,
            schemas: compiled,
        })
    }

    /// The subprotocol this validator covers.
    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    /// Validate `payload` against the schema for `(method, direction)`.
    pub fn validate(&self, direction: Direction, method: &str, payload: &Value) -> ValidationOutcome {
        let id = format!("urn:{method}.{}", direction.schema_suffix());
        let Some(validator) = self.schemas.get(&id) else {
            return ValidationOutcome::NoSchema;
        };
        match validator.validate(payload) {
            Ok(()) => ValidationOutcome::Valid,
            Err(error) => ValidationOutcome::Invalid(ValidationFailure {
                keyword: keyword_of(&error.kind),
                instance_path: error.instance_path.to_string(),
                message: error.to_string(),
            }),
        }
    }
}

/// The JSON Schema keyword behind a `jsonschema` error kind.
fn keyword_of(kind: &jsonschema::error::ValidationErrorKind) -> String {
    use jsonschema::error::ValidationErrorKind as K;
    match kind {
        K::Maximum { .. } => "maximum",
        K::Minimum { .. } => "minimum",
        K::MaxLength { .. } => "maxLength",
        K::MinLength { .. } => "minLength",
        K::ExclusiveMaximum { .. } => "exclusiveMaximum",
        K::ExclusiveMinimum { .. } => "exclusiveMinimum",
        K::MultipleOf { .. } => "multipleOf",
        K::MaxItems { .. } => "maxItems",
        K::MinItems { .. } => "minItems",
        K::MaxProperties { .. } => "maxProperties",
        K::MinProperties { .. } => "minProperties",
        K::AdditionalItems { .. } => "additionalItems",
        K::Required { .. } => "required",
        K::Pattern { .. } => "pattern",
        K::PropertyNames { .. } => "propertyNames",
        K::AdditionalProperties { .. } => "additionalProperties",
        K::Type { .. } => "type",
        K::Enum { .. } => "enum",
        K::Format { .. } => "format",
        K::UniqueItems { .. } => "uniqueItems",
        _ => "unknown",
    }
    .to_string()
}
