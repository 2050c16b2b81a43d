//! Per-type field registry.
//!
//! Dynamic field reflection in the distilled source becomes, here, a
//! process-start-populated table keyed by a stable `typeTag` string. No
//! runtime reflection: `FieldSpec` carries the positional field names, which
//! of them are individually encrypted, which are nested entities requiring
//! their own recursive decode, and (optionally) a construction hook for
//! turning a decoded state array back into a concrete aggregate type.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use super::error::SerializerError;

/// Builds `T` from a decoded, positionally-ordered state array. Registered
/// by callers that want `decode` to hand back a concrete value instead of
/// the raw `Vec<Value>` — the external aggregate collaborator is the usual
/// caller, since this crate has no concrete aggregate types of its own.
pub type ConstructFn<T> = fn(Vec<Value>) -> Result<T, SerializerError>;

#[derive(Clone)]
pub struct FieldSpec {
    pub type_tag: &'static str,
    pub schema_version: u32,
    /// Positional field names, in encode/decode order.
    pub field_names: &'static [&'static str],
    /// Parallel to `field_names`: whether that field is individually
    /// encrypted before framing.
    pub is_encrypted: &'static [bool],
    /// Parallel to `field_names`: whether that field is itself a nested
    /// entity (a registered type's own envelope) rather than a plain JSON
    /// scalar/array. `decode` does not recurse into these automatically —
    /// it's a hint for callers walking the state array.
    pub is_nested_entity: &'static [bool],
    /// Optional hook turning the decoded `Vec<Value>` into a concrete type.
    /// `None` means callers take the raw state array themselves.
    pub construct: Option<ConstructFn<Box<dyn std::any::Any>>>,
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("type_tag", &self.type_tag)
            .field("schema_version", &self.schema_version)
            .field("field_names", &self.field_names)
            .field("is_encrypted", &self.is_encrypted)
            .field("is_nested_entity", &self.is_nested_entity)
            .field("construct", &self.construct.is_some())
            .finish()
    }
}

impl FieldSpec {
    pub fn validate(&self) -> Result<(), SerializerError> {
        if self.field_names.len() != self.is_encrypted.len() {
            return Err(SerializerError::SchemaError {
                type_tag: self.type_tag.to_string(),
                message: format!(
                    "field_names has {} entries but is_encrypted has {}",
                    self.field_names.len(),
                    self.is_encrypted.len()
                ),
            });
        }
        if self.field_names.len() != self.is_nested_entity.len() {
            return Err(SerializerError::SchemaError {
                type_tag: self.type_tag.to_string(),
                message: format!(
                    "field_names has {} entries but is_nested_entity has {}",
                    self.field_names.len(),
                    self.is_nested_entity.len()
                ),
            });
        }
        Ok(())
    }
}

/// A process-wide table of `typeTag -> FieldSpec`, populated once at
/// startup via `TypeRegistry::register`.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    specs: HashMap<&'static str, FieldSpec>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. Fails if `type_tag` is already registered or if the
    /// spec is internally inconsistent (mismatched field/encryption arity).
    pub fn register(&mut self, spec: FieldSpec) -> Result<(), SerializerError> {
        spec.validate()?;
        if self.specs.contains_key(spec.type_tag) {
            return Err(SerializerError::SchemaError {
                type_tag: spec.type_tag.to_string(),
                message: "type tag already registered".to_string(),
            });
        }
        self.specs.insert(spec.type_tag, spec);
        Ok(())
    }

    pub fn lookup(&self, type_tag: &str) -> Result<&FieldSpec, SerializerError> {
        self.specs
            .get(type_tag)
            .ok_or_else(|| SerializerError::UnknownType(type_tag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FieldSpec {
        FieldSpec {
            type_tag: "Product",
            schema_version: 1,
            field_names: &["name", "price"],
            is_encrypted: &[false, false],
            is_nested_entity: &[false, false],
            construct: None,
        }
    }

    #[test]
    fn registers_and_looks_up() {
        let mut registry = TypeRegistry::new();
        registry.register(sample()).unwrap();
        let spec = registry.lookup("Product").unwrap();
        assert_eq!(spec.schema_version, 1);
    }

    #[test]
    fn rejects_duplicate_registration() {
        let mut registry = TypeRegistry::new();
        registry.register(sample()).unwrap();
        let err = registry.register(sample()).unwrap_err();
        assert!(matches!(err, SerializerError::SchemaError { .. }));
    }

    #[test]
    fn unknown_type_tag_fails_lookup() {
        let registry = TypeRegistry::new();
        let err = registry.lookup("Ghost").unwrap_err();
        assert!(matches!(err, SerializerError::UnknownType(_)));
    }

    #[test]
    fn rejects_mismatched_arity() {
        let mut registry = TypeRegistry::new();
        let bad = FieldSpec {
            type_tag: "Bad",
            schema_version: 1,
            field_names: &["a", "b"],
            is_encrypted: &[false],
            is_nested_entity: &[false, false],
            construct: None,
        };
        assert!(registry.register(bad).is_err());
    }

    #[test]
    fn rejects_mismatched_nested_entity_arity() {
        let mut registry = TypeRegistry::new();
        let bad = FieldSpec {
            type_tag: "Bad",
            schema_version: 1,
            field_names: &["a", "b"],
            is_encrypted: &[false, false],
            is_nested_entity: &[false],
            construct: None,
        };
        assert!(registry.register(bad).is_err());
    }
}
