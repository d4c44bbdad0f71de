//! Built-in schemas for the network topology kinds.

use serde_json::json;

use super::registry::{AttributeSchema, ResourceSchema};

/// Returns the schemas registered by [`super::SchemaRegistry::builtin`].
pub(super) fn network_schemas() -> Vec<ResourceSchema> {
    vec![
        vpc(),
        subnet(),
        route_table(),
        security_group(),
        load_balancer(),
        dns_record(),
        certificate(),
    ]
}

fn vpc() -> ResourceSchema {
    ResourceSchema::new("vpc")
        .with_attribute("cidr_block", AttributeSchema::string().required().force_new())
        .with_attribute("enable_dns", AttributeSchema::bool().with_default(json!(true)))
        .with_attribute("tags", AttributeSchema::map())
        .with_attribute("arn", AttributeSchema::string().computed())
}

fn subnet() -> ResourceSchema {
    ResourceSchema::new("subnet")
        .with_attribute("vpc_id", AttributeSchema::string().required().force_new())
        .with_attribute("cidr_block", AttributeSchema::string().required().force_new())
        .with_attribute("availability_zone", AttributeSchema::string().force_new())
        .with_attribute("public", AttributeSchema::bool().with_default(json!(false)))
        .with_attribute("tags", AttributeSchema::map())
        .with_attribute("arn", AttributeSchema::string().computed())
}

fn route_table() -> ResourceSchema {
    ResourceSchema::new("route_table")
        .with_attribute("vpc_id", AttributeSchema::string().required().force_new())
        .with_attribute("routes", AttributeSchema::list().with_default(json!([])))
        .with_attribute("subnet_ids", AttributeSchema::list().with_default(json!([])))
        .with_attribute("tags", AttributeSchema::map())
        .with_attribute("arn", AttributeSchema::string().computed())
}

fn security_group() -> ResourceSchema {
    ResourceSchema::new("security_group")
        .with_attribute(
            "name",
            AttributeSchema::string().required().force_new().unique(),
        )
        .with_attribute("vpc_id", AttributeSchema::string().required().force_new())
        .with_attribute(
            "description",
            AttributeSchema::string()
                .force_new()
                .with_default(json!("Managed by gantry")),
        )
        .with_attribute("ingress", AttributeSchema::list().with_default(json!([])))
        .with_attribute("egress", AttributeSchema::list().with_default(json!([])))
        .with_attribute("tags", AttributeSchema::map())
        .with_attribute("arn", AttributeSchema::string().computed())
}

fn load_balancer() -> ResourceSchema {
    ResourceSchema::new("load_balancer")
        .with_attribute(
            "name",
            AttributeSchema::string().required().force_new().unique(),
        )
        .with_attribute("subnet_ids", AttributeSchema::list().required())
        .with_attribute(
            "security_group_ids",
            AttributeSchema::list().with_default(json!([])),
        )
        .with_attribute(
            "internal",
            AttributeSchema::bool().force_new().with_default(json!(false)),
        )
        .with_attribute("listeners", AttributeSchema::list().with_default(json!([])))
        .with_attribute("certificate_arn", AttributeSchema::string())
        .with_attribute("tags", AttributeSchema::map())
        .with_attribute("arn", AttributeSchema::string().computed())
        .with_attribute("dns_name", AttributeSchema::string().computed())
        .with_attribute("zone_id", AttributeSchema::string().computed())
}

fn dns_record() -> ResourceSchema {
    ResourceSchema::new("dns_record")
        .with_attribute("zone", AttributeSchema::string().required().force_new())
        .with_attribute(
            "name",
            AttributeSchema::string().required().force_new().unique(),
        )
        .with_attribute("type", AttributeSchema::string().required().force_new())
        .with_attribute("ttl", AttributeSchema::number().with_default(json!(300)))
        .with_attribute("records", AttributeSchema::list().required())
        .with_attribute("fqdn", AttributeSchema::string().computed())
}

fn certificate() -> ResourceSchema {
    ResourceSchema::new("certificate")
        .with_attribute(
            "domain_name",
            AttributeSchema::string().required().force_new().unique(),
        )
        .with_attribute(
            "subject_alternative_names",
            AttributeSchema::list().force_new().with_default(json!([])),
        )
        .with_attribute(
            "validation_method",
            AttributeSchema::string()
                .force_new()
                .with_default(json!("DNS")),
        )
        .with_attribute("tags", AttributeSchema::map())
        .with_attribute("arn", AttributeSchema::string().computed())
        .with_attribute("status", AttributeSchema::string().computed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_are_unique() {
        let schemas = network_schemas();
        let mut kinds: Vec<_> = schemas.iter().map(|s| s.kind.as_str()).collect();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), schemas.len());
    }

    #[test]
    fn test_computed_attributes_have_no_defaults() {
        for schema in network_schemas() {
            for (name, attr) in &schema.attributes {
                assert!(
                    !(attr.computed && (attr.required || attr.default.is_some())),
                    "{}.{name} is computed but user-settable",
                    schema.kind
                );
            }
        }
    }
}
