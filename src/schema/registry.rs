//! Resource schemas and the registry that holds them.
//!
//! A schema declares, per resource kind, which attributes exist, which are
//! required, which the provider computes, and which cannot change in place.
//! The per-field mutability flags drive the update-vs-replace decision.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::Expr;
use crate::error::ConfigError;

/// The attribute every resource kind exposes: the provider-assigned identifier.
pub const ID_ATTRIBUTE: &str = "id";

/// Value type of an attribute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// A string.
    String,
    /// A number.
    Number,
    /// A boolean.
    Bool,
    /// A list.
    List,
    /// A map.
    Map,
    /// Anything.
    #[default]
    Any,
}

/// Schema of a single attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AttributeSchema {
    /// Value type.
    #[serde(rename = "type", default)]
    pub attr_type: AttributeType,
    /// Must be set by the user (unless a default exists).
    #[serde(default)]
    pub required: bool,
    /// Set by the provider; users may not set it.
    #[serde(default)]
    pub computed: bool,
    /// Value used when the user omits the attribute.
    #[serde(default)]
    pub default: Option<Value>,
    /// Changing the value requires destroying and recreating the resource.
    #[serde(default)]
    pub force_new: bool,
    /// The value names the remote object, so two live objects cannot share it.
    #[serde(default)]
    pub unique: bool,
}

/// Schema of one resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Resource kind.
    pub kind: String,
    /// Attribute schemas by name.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSchema>,
}

/// Registry of resource schemas by kind.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    /// Schemas by kind.
    schemas: BTreeMap<String, ResourceSchema>,
}

impl AttributeType {
    /// Returns true if `value` has this type. `null` matches every type.
    #[must_use]
    pub const fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _)
            | (_, Value::Null)
            | (Self::String, Value::String(_))
            | (Self::Number, Value::Number(_))
            | (Self::Bool, Value::Bool(_))
            | (Self::List, Value::Array(_))
            | (Self::Map, Value::Object(_)) => true,
            _ => false,
        }
    }
}

impl AttributeSchema {
    /// Creates an optional attribute of the given type.
    #[must_use]
    pub fn of(attr_type: AttributeType) -> Self {
        Self {
            attr_type,
            ..Self::default()
        }
    }

    /// Creates an optional string attribute.
    #[must_use]
    pub fn string() -> Self {
        Self::of(AttributeType::String)
    }

    /// Creates an optional number attribute.
    #[must_use]
    pub fn number() -> Self {
        Self::of(AttributeType::Number)
    }

    /// Creates an optional boolean attribute.
    #[must_use]
    pub fn bool() -> Self {
        Self::of(AttributeType::Bool)
    }

    /// Creates an optional list attribute.
    #[must_use]
    pub fn list() -> Self {
        Self::of(AttributeType::List)
    }

    /// Creates an optional map attribute.
    #[must_use]
    pub fn map() -> Self {
        Self::of(AttributeType::Map)
    }

    /// Marks the attribute as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the attribute as provider-computed.
    #[must_use]
    pub const fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    /// Marks the attribute as immutable in place.
    #[must_use]
    pub const fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Marks the attribute as naming the remote object.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets a default value.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

impl ResourceSchema {
    /// Creates an empty schema for a kind.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute, builder style.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }

    /// Returns the schema of an attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Returns true if other resources may reference `name` on this kind.
    #[must_use]
    pub fn has_output(&self, name: &str) -> bool {
        name == ID_ATTRIBUTE || self.attributes.contains_key(name)
    }

    /// Returns true if `name` can change without replacing the resource.
    ///
    /// Attributes missing from the schema are treated as mutable.
    #[must_use]
    pub fn is_mutable(&self, name: &str) -> bool {
        self.attribute(name).is_none_or(|a| !a.force_new)
    }

    /// Returns true if `name` identifies the remote object.
    #[must_use]
    pub fn is_unique(&self, name: &str) -> bool {
        self.attribute(name).is_some_and(|a| a.unique)
    }

    /// Fills in defaults for omitted attributes.
    pub fn apply_defaults(&self, attributes: &mut BTreeMap<String, Expr>) {
        for (name, schema) in &self.attributes {
            if let Some(default) = &schema.default
                && !attributes.contains_key(name)
            {
                attributes.insert(name.clone(), Expr::Literal(default.clone()));
            }
        }
    }

    /// Checks declared attributes against the schema.
    ///
    /// # Errors
    ///
    /// Returns a schema violation for unknown or computed-only attributes,
    /// missing required attributes, and literal type mismatches.
    pub fn validate(
        &self,
        address: &str,
        attributes: &BTreeMap<String, Expr>,
    ) -> Result<(), ConfigError> {
        for (name, expr) in attributes {
            if name == ID_ATTRIBUTE {
                return Err(ConfigError::schema(address, name, "'id' is assigned by the provider"));
            }
            let Some(schema) = self.attribute(name) else {
                return Err(ConfigError::schema(
                    address,
                    name,
                    format!("unknown attribute for kind '{}'", self.kind),
                ));
            };
            if schema.computed {
                return Err(ConfigError::schema(
                    address,
                    name,
                    "attribute is computed by the provider and cannot be set",
                ));
            }
            if let Some(value) = expr.as_literal()
                && !schema.attr_type.accepts(value)
            {
                return Err(ConfigError::schema(
                    address,
                    name,
                    format!("expected {:?}, found {value}", schema.attr_type).to_lowercase(),
                ));
            }
        }

        for (name, schema) in &self.attributes {
            if schema.required && schema.default.is_none() && !attributes.contains_key(name) {
                return Err(ConfigError::schema(address, name, "required attribute is missing"));
            }
        }

        Ok(())
    }
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in network resource kinds.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for schema in super::builtin::network_schemas() {
            registry.register(schema);
        }
        registry
    }

    /// Creates the built-in registry with `schemas` layered on top.
    #[must_use]
    pub fn with_overrides(schemas: &[ResourceSchema]) -> Self {
        let mut registry = Self::builtin();
        registry.extend(schemas.iter().cloned());
        registry
    }

    /// Registers a schema, replacing any existing schema for the same kind.
    pub fn register(&mut self, schema: ResourceSchema) {
        if self.schemas.contains_key(&schema.kind) {
            debug!(kind = %schema.kind, "overriding resource schema");
        }
        self.schemas.insert(schema.kind.clone(), schema);
    }

    /// Registers every schema in `schemas`.
    pub fn extend(&mut self, schemas: impl IntoIterator<Item = ResourceSchema>) {
        for schema in schemas {
            self.register(schema);
        }
    }

    /// Looks up the schema for a kind.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&ResourceSchema> {
        self.schemas.get(kind)
    }

    /// Returns every registered kind, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    /// Returns the number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns true if no kinds are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listener_schema() -> ResourceSchema {
        ResourceSchema::new("listener")
            .with_attribute("port", AttributeSchema::number().required().force_new())
            .with_attribute("protocol", AttributeSchema::string().with_default(json!("HTTP")))
            .with_attribute("arn", AttributeSchema::string().computed())
    }

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Expr> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Expr::parse(v).unwrap()))
            .collect()
    }

    #[test]
    fn test_mutability_table() {
        let schema = listener_schema();
        assert!(!schema.is_mutable("port"));
        assert!(schema.is_mutable("protocol"));
        assert!(schema.has_output("id"));
        assert!(schema.has_output("arn"));
        assert!(!schema.has_output("missing"));
    }

    #[test]
    fn test_validate_accepts_valid_resource() {
        let schema = listener_schema();
        let attributes = attrs(&[("port", json!(443))]);
        assert!(schema.validate("listener.https", &attributes).is_ok());
    }

    #[test]
    fn test_validate_rejects_violations() {
        let schema = listener_schema();

        let missing = attrs(&[("protocol", json!("HTTPS"))]);
        assert!(matches!(
            schema.validate("listener.a", &missing),
            Err(ConfigError::Schema { attribute, .. }) if attribute == "port"
        ));

        let computed = attrs(&[("port", json!(80)), ("arn", json!("x"))]);
        assert!(schema.validate("listener.a", &computed).is_err());

        let wrong_type = attrs(&[("port", json!("eighty"))]);
        assert!(schema.validate("listener.a", &wrong_type).is_err());

        let unknown = attrs(&[("port", json!(80)), ("colour", json!("red"))]);
        assert!(schema.validate("listener.a", &unknown).is_err());
    }

    #[test]
    fn test_defaults_applied() {
        let schema = listener_schema();
        let mut attributes = attrs(&[("port", json!(80))]);
        schema.apply_defaults(&mut attributes);
        assert_eq!(
            attributes.get("protocol").and_then(Expr::as_literal),
            Some(&json!("HTTP"))
        );
    }

    #[test]
    fn test_registry_override() {
        let mut registry = SchemaRegistry::builtin();
        assert!(registry.get("vpc").is_some());
        let before = registry.len();

        registry.register(ResourceSchema::new("vpc"));
        assert_eq!(registry.len(), before);
        assert!(registry.get("vpc").is_some_and(|s| s.attributes.is_empty()));
    }
}
