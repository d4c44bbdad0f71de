//! Resource schema registry.
//!
//! Maps each resource kind to its attribute schema: types, required and
//! computed attributes, defaults, and which attributes force replacement.

mod builtin;
mod registry;

pub use registry::{AttributeSchema, AttributeType, ID_ATTRIBUTE, ResourceSchema, SchemaRegistry};
