//! Schema engine: per-station payload validation.
//!
//! The broker pushes schema lifecycle events (INIT with a schema version,
//! DROP) to every SDK attached to a station. This module holds the wire model
//! for those events and the compiled validators they install. Selection of
//! the validator kind happens once, when an INIT event is applied; `validate`
//! itself is a single dispatch over a closed enum.

use serde::Deserialize;

use crate::error::MemphisError;

pub(crate) mod cache;

/// A payload rejected by a station schema, with every violated constraint.
#[derive(Debug)]
pub struct SchemaValidationError {
    pub message: String,
    pub violations: Vec<String>,
}

impl SchemaValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            violations: Vec::new(),
        }
    }

    fn with_violations(message: impl Into<String>, violations: Vec<String>) -> Self {
        Self {
            message: message.into(),
            violations,
        }
    }
}

impl From<SchemaValidationError> for MemphisError {
    fn from(err: SchemaValidationError) -> Self {
        MemphisError::SchemaValidation {
            message: err.message,
            violations: err.violations,
        }
    }
}

// ============================================================================
// Wire model
// ============================================================================

/// Schema lifecycle event pushed on `$memphis_schema_updates_{station}`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SchemaUpdate {
    #[serde(rename = "UpdateType")]
    pub update_type: SchemaUpdateType,
    pub init: Option<SchemaUpdateInit>,
}

/// Update discriminator, carried as a 1-based integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub(crate) enum SchemaUpdateType {
    Init,
    Drop,
}

impl TryFrom<u8> for SchemaUpdateType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Init),
            2 => Ok(Self::Drop),
            other => Err(format!("unknown schema update type: {}", other)),
        }
    }
}

/// Payload of an INIT event: the schema to activate.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SchemaUpdateInit {
    #[serde(rename = "schema_name")]
    pub schema_name: String,
    #[serde(rename = "active_version")]
    pub active_version: SchemaVersion,
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
}

/// Schema kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub(crate) enum SchemaType {
    #[serde(rename = "")]
    NoSchema,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "protobuf")]
    Protobuf,
    #[serde(rename = "graphql")]
    GraphQl,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SchemaVersion {
    #[serde(rename = "version_number")]
    pub number: i32,
    /// Serialized `FileDescriptorSet`, only meaningful for protobuf schemas.
    pub descriptor: String,
    #[serde(rename = "schema_content")]
    pub content: String,
    #[serde(rename = "message_struct_name")]
    pub message_struct_name: String,
}

// ============================================================================
// Validators
// ============================================================================

/// The active validator for one station.
///
/// Compiled once when the INIT event is applied; validation never mutates the
/// payload, and success means the caller's bytes go out unchanged.
pub(crate) enum SchemaValidator {
    /// No schema bound: identity transform, always succeeds.
    Empty,
    Json(jsonschema::JSONSchema),
    Protobuf(prost_reflect::MessageDescriptor),
    GraphQl(apollo_compiler::validation::Valid<apollo_compiler::Schema>),
}

impl SchemaValidator {
    /// Compile the validator an INIT event describes.
    pub(crate) fn from_init(init: &SchemaUpdateInit) -> Result<Self, SchemaValidationError> {
        match init.schema_type {
            SchemaType::NoSchema => Ok(Self::Empty),
            SchemaType::Json => Self::compile_json(&init.active_version.content),
            SchemaType::Protobuf => Self::compile_protobuf(&init.schema_name, &init.active_version),
            SchemaType::GraphQl => Self::compile_graphql(&init.active_version.content),
        }
    }

    fn compile_json(content: &str) -> Result<Self, SchemaValidationError> {
        let schema: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| SchemaValidationError::new(format!("invalid JSON schema: {}", e)))?;
        let compiled = jsonschema::JSONSchema::compile(&schema)
            .map_err(|e| SchemaValidationError::new(format!("invalid JSON schema: {}", e)))?;
        Ok(Self::Json(compiled))
    }

    fn compile_protobuf(
        schema_name: &str,
        version: &SchemaVersion,
    ) -> Result<Self, SchemaValidationError> {
        let pool = prost_reflect::DescriptorPool::decode(version.descriptor.as_bytes())
            .map_err(|e| SchemaValidationError::new(format!("invalid descriptor set: {}", e)))?;

        let file_name = format!("{}_{}.proto", schema_name, version.number);
        let file = pool.get_file_by_name(&file_name).ok_or_else(|| {
            SchemaValidationError::new(format!("descriptor '{}' not found", file_name))
        })?;

        let message = file
            .messages()
            .find(|m| m.name() == version.message_struct_name)
            .ok_or_else(|| {
                SchemaValidationError::new(format!(
                    "message '{}' not found",
                    version.message_struct_name
                ))
            })?;

        Ok(Self::Protobuf(message))
    }

    fn compile_graphql(content: &str) -> Result<Self, SchemaValidationError> {
        let schema = apollo_compiler::Schema::parse_and_validate(content, "schema.graphql")
            .map_err(|e| SchemaValidationError::new(format!("invalid GraphQL schema: {}", e)))?;
        Ok(Self::GraphQl(schema))
    }

    /// Check a payload against the active schema. The payload is returned to
    /// the caller untouched on success.
    pub(crate) fn validate(&self, payload: &[u8]) -> Result<(), SchemaValidationError> {
        match self {
            Self::Empty => Ok(()),
            Self::Json(schema) => validate_json(schema, payload),
            Self::Protobuf(descriptor) => validate_protobuf(descriptor, payload),
            Self::GraphQl(schema) => validate_graphql(schema, payload),
        }
    }
}

fn validate_json(
    schema: &jsonschema::JSONSchema,
    payload: &[u8],
) -> Result<(), SchemaValidationError> {
    let value: serde_json::Value = serde_json::from_slice(payload).map_err(|e| {
        SchemaValidationError::new(format!("message does not parse as JSON: {}", e))
    })?;

    if let Err(errors) = schema.validate(&value) {
        let violations: Vec<String> = errors
            .map(|e| format!("{} - {}", e, e.instance_path))
            .collect();
        return Err(SchemaValidationError::with_violations(
            format!(
                "message does not conform to JSON schema:\n{}",
                violations.join("\n")
            ),
            violations,
        ));
    }

    Ok(())
}

fn validate_protobuf(
    descriptor: &prost_reflect::MessageDescriptor,
    payload: &[u8],
) -> Result<(), SchemaValidationError> {
    prost_reflect::DynamicMessage::decode(descriptor.clone(), payload)
        .map_err(|e| SchemaValidationError::new(format!("invalid message format: {}", e)))?;
    Ok(())
}

fn validate_graphql(
    schema: &apollo_compiler::validation::Valid<apollo_compiler::Schema>,
    payload: &[u8],
) -> Result<(), SchemaValidationError> {
    let text = std::str::from_utf8(payload).map_err(|e| {
        SchemaValidationError::new(format!("message is not valid UTF-8: {}", e))
    })?;

    match apollo_compiler::ExecutableDocument::parse_and_validate(schema, text, "message.graphql")
    {
        Ok(_) => Ok(()),
        Err(with_errors) => {
            let violations: Vec<String> = with_errors
                .errors
                .iter()
                .map(|d| d.to_string())
                .collect();
            Err(SchemaValidationError::with_violations(
                "GraphQL validation failed".to_string(),
                violations,
            ))
        }
    }
}
