//! Resource addresses: the stable `kind.name` identifier of a resource.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a resource, rendered `kind.name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceAddress {
    /// Resource kind.
    pub kind: String,
    /// Logical name.
    pub name: String,
}

impl ResourceAddress {
    /// Creates an address.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl FromStr for ResourceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() && !name.contains('.') => {
                Ok(Self::new(kind, name))
            }
            _ => Err(format!("Invalid resource address: {s}. Expected format: kind.name")),
        }
    }
}

impl Serialize for ResourceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let address: ResourceAddress = "load_balancer.web".parse().unwrap();
        assert_eq!(address.kind, "load_balancer");
        assert_eq!(address.name, "web");
        assert_eq!(address.to_string(), "load_balancer.web");
    }

    #[test]
    fn test_invalid_address() {
        assert!("nodot".parse::<ResourceAddress>().is_err());
        assert!(".name".parse::<ResourceAddress>().is_err());
        assert!("a.b.c".parse::<ResourceAddress>().is_err());
    }

    #[test]
    fn test_serializes_as_string() {
        let address = ResourceAddress::new("vpc", "main");
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"vpc.main\"");
        let back: ResourceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }
}
