//! Attribute expressions with deferred references.
//!
//! Attribute values in a resource declaration are either literals or refer to
//! another resource's output. A reference is written `${kind.name.attribute}`:
//!
//! - `"${vpc.main.id}"` on its own takes the referenced value with its JSON type.
//! - `"arn:${vpc.main.id}/rules"` renders the referenced value into a string.
//! - `"$${literal}"` escapes to the literal text `${literal}`.
//!
//! Lists and maps nest. Resolution never fails: it yields either a known value
//! or the set of references that are still pending.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::ConfigError;
use crate::graph::ResourceAddress;

/// A reference to another resource's output attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    /// Referenced resource.
    pub address: ResourceAddress,
    /// Referenced attribute.
    pub attribute: String,
}

/// A piece of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Literal(String),
    /// A reference rendered into the string.
    Reference(Reference),
}

/// A parsed attribute expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A value with no references.
    Literal(Value),
    /// A whole-value reference.
    Reference(Reference),
    /// A string mixing literal text and references.
    Template(Vec<Segment>),
    /// A list containing at least one reference somewhere.
    List(Vec<Expr>),
    /// A map containing at least one reference somewhere.
    Map(BTreeMap<String, Expr>),
}

/// Outcome of resolving an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Every reference had a value.
    Known(Value),
    /// These references are not resolvable yet.
    Unknown(BTreeSet<Reference>),
}

impl Reference {
    /// Creates a reference.
    #[must_use]
    pub fn new(address: ResourceAddress, attribute: impl Into<String>) -> Self {
        Self {
            address,
            attribute: attribute.into(),
        }
    }

    /// Parses the inside of `${...}`, e.g. `vpc.main.id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is not `kind.name.attribute`.
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidReference {
            expression: expression.to_string(),
            message: message.to_string(),
        };

        let mut parts = expression.trim().splitn(3, '.');
        let kind = parts.next().unwrap_or_default();
        let name = parts.next().ok_or_else(|| invalid("expected kind.name.attribute"))?;
        let attribute = parts
            .next()
            .ok_or_else(|| invalid("expected kind.name.attribute"))?;

        if kind.is_empty() || name.is_empty() || attribute.is_empty() {
            return Err(invalid("empty segment"));
        }
        if !is_identifier(attribute) {
            return Err(invalid("attribute must be alphanumeric or underscore"));
        }

        Ok(Self::new(ResourceAddress::new(kind, name), attribute))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.address, self.attribute)
    }
}

impl Expr {
    /// Parses a declared JSON value into an expression.
    ///
    /// # Errors
    ///
    /// Returns an error if a `${...}` reference is malformed or unclosed.
    pub fn parse(value: &Value) -> Result<Self, ConfigError> {
        match value {
            Value::String(s) => parse_string(s),
            Value::Array(items) => {
                let exprs = items.iter().map(Self::parse).collect::<Result<Vec<_>, _>>()?;
                if exprs.iter().all(Self::is_literal) {
                    Ok(Self::Literal(Value::Array(
                        exprs.into_iter().filter_map(Self::into_literal).collect(),
                    )))
                } else {
                    Ok(Self::List(exprs))
                }
            }
            Value::Object(map) => {
                let exprs = map
                    .iter()
                    .map(|(k, v)| Self::parse(v).map(|e| (k.clone(), e)))
                    .collect::<Result<BTreeMap<_, _>, _>>()?;
                if exprs.values().all(Self::is_literal) {
                    Ok(Self::Literal(Value::Object(
                        exprs
                            .into_iter()
                            .filter_map(|(k, e)| e.into_literal().map(|v| (k, v)))
                            .collect(),
                    )))
                } else {
                    Ok(Self::Map(exprs))
                }
            }
            _ => Ok(Self::Literal(value.clone())),
        }
    }

    /// Returns true if the expression holds no references.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Returns the literal value, if this expression has no references.
    #[must_use]
    pub const fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Unwraps a literal, with any `$${` escapes already removed.
    fn into_literal(self) -> Option<Value> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Returns true if the expression holds at least one reference.
    #[must_use]
    pub fn has_references(&self) -> bool {
        !self.references().is_empty()
    }

    /// Collects every reference in the expression.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::Template(segments) => {
                for segment in segments {
                    if let Segment::Reference(r) = segment {
                        out.push(r);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for item in map.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Resolves the expression using `lookup` for referenced values.
    pub fn resolve<F>(&self, lookup: &F) -> Resolution
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Self::Literal(v) => Resolution::Known(v.clone()),
            Self::Reference(r) => lookup(r).map_or_else(
                || Resolution::Unknown(BTreeSet::from([r.clone()])),
                Resolution::Known,
            ),
            Self::Template(segments) => {
                let mut rendered = String::new();
                let mut missing = BTreeSet::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(text) => rendered.push_str(text),
                        Segment::Reference(r) => match lookup(r) {
                            Some(v) => rendered.push_str(&render_scalar(&v)),
                            None => {
                                missing.insert(r.clone());
                            }
                        },
                    }
                }
                if missing.is_empty() {
                    Resolution::Known(Value::String(rendered))
                } else {
                    Resolution::Unknown(missing)
                }
            }
            Self::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                let mut missing = BTreeSet::new();
                for item in items {
                    match item.resolve(lookup) {
                        Resolution::Known(v) => values.push(v),
                        Resolution::Unknown(refs) => missing.extend(refs),
                    }
                }
                if missing.is_empty() {
                    Resolution::Known(Value::Array(values))
                } else {
                    Resolution::Unknown(missing)
                }
            }
            Self::Map(map) => {
                let mut values = serde_json::Map::new();
                let mut missing = BTreeSet::new();
                for (key, item) in map {
                    match item.resolve(lookup) {
                        Resolution::Known(v) => {
                            values.insert(key.clone(), v);
                        }
                        Resolution::Unknown(refs) => missing.extend(refs),
                    }
                }
                if missing.is_empty() {
                    Resolution::Known(Value::Object(values))
                } else {
                    Resolution::Unknown(missing)
                }
            }
        }
    }

    /// Renders the expression back to its declared form, for display.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Reference(r) => Value::String(format!("${{{r}}}")),
            Self::Template(segments) => {
                let text: String = segments
                    .iter()
                    .map(|s| match s {
                        Segment::Literal(t) => t.replace("${", "$${"),
                        Segment::Reference(r) => format!("${{{r}}}"),
                    })
                    .collect();
                Value::String(text)
            }
            Self::List(items) => Value::Array(items.iter().map(Self::to_value).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }
}

impl Resolution {
    /// Returns the value if known.
    #[must_use]
    pub fn known(self) -> Option<Value> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown(_) => None,
        }
    }
}

/// Parses a string, splitting out `${...}` references.
fn parse_string(s: &str) -> Result<Expr, ConfigError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = s;

    while let Some(pos) = rest.find("${") {
        // `$${` is an escaped literal `${`
        if rest[..pos].ends_with('$') {
            literal.push_str(&rest[..pos - 1]);
            literal.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }

        literal.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let end = after.find('}').ok_or_else(|| ConfigError::InvalidReference {
            expression: s.to_string(),
            message: String::from("unclosed '${'"),
        })?;

        let reference = Reference::parse(&after[..end])?;
        if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }
        segments.push(Segment::Reference(reference));
        rest = &after[end + 1..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    match segments.len() {
        0 => Ok(Expr::Literal(Value::String(String::new()))),
        1 => match segments.remove(0) {
            Segment::Literal(text) => Ok(Expr::Literal(Value::String(text))),
            Segment::Reference(r) => Ok(Expr::Reference(r)),
        },
        _ => Ok(Expr::Template(segments)),
    }
}

/// Renders a value for string interpolation.
fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_identifier(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
