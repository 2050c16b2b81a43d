//! Encodes domain objects as `[typeTag, schemaVersion, stateArray]`, with
//! selective per-field authenticated encryption and whole-blob compression
//! above a size threshold.

pub mod codec;
pub mod compression;
pub mod crypto;
pub mod error;
pub mod registry;

pub use codec::Serializer;
pub use crypto::FieldCrypto;
pub use error::SerializerError;
pub use registry::{FieldSpec, TypeRegistry};
