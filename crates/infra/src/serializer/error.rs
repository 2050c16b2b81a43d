use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializerError {
    #[error("unknown type tag: {0}")]
    UnknownType(String),
    #[error("schema error for type {type_tag}: {message}")]
    SchemaError { type_tag: String, message: String },
    #[error("integrity error: {0}")]
    IntegrityError(String),
}
