//! Dependency graph construction and ordering.
//!
//! Every `${kind.name.attr}` reference in a resource's attributes becomes an
//! edge from the referenced resource to the referencing one, so edges always
//! point from dependency to dependent.

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

use super::{ResourceAddress, ResourceNode};
use crate::config::{Expr, InfraConfig};
use crate::error::ConfigError;
use crate::schema::SchemaRegistry;

/// Directed acyclic graph of declared resources.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Underlying graph; edges run dependency -> dependent.
    graph: DiGraph<ResourceNode, ()>,
    /// Node index by address.
    indices: BTreeMap<ResourceAddress, NodeIndex>,
}

impl DependencyGraph {
    /// Builds and validates the graph for a configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for duplicate addresses, unknown kinds, schema
    /// violations, malformed or unknown references, and reference cycles.
    pub fn build(config: &InfraConfig, registry: &SchemaRegistry) -> Result<Self, ConfigError> {
        let mut graph = DiGraph::new();
        let mut indices = BTreeMap::new();

        // First pass: validated nodes
        for resource in &config.resources {
            let address = ResourceAddress::new(&resource.kind, &resource.name);
            if indices.contains_key(&address) {
                return Err(ConfigError::DuplicateResource {
                    address: address.to_string(),
                });
            }

            let schema = registry
                .get(&resource.kind)
                .ok_or_else(|| ConfigError::UnknownKind {
                    kind: resource.kind.clone(),
                    address: address.to_string(),
                })?;

            let mut desired = resource
                .attributes
                .iter()
                .map(|(name, value)| Expr::parse(value).map(|expr| (name.clone(), expr)))
                .collect::<Result<BTreeMap<_, _>, _>>()?;

            schema.validate(&address.to_string(), &desired)?;
            schema.apply_defaults(&mut desired);

            let idx = graph.add_node(ResourceNode::new(address.clone(), desired));
            indices.insert(address, idx);
        }

        // Second pass: reference edges
        let mut edges = BTreeSet::new();
        for (address, &idx) in &indices {
            for (attribute, expr) in &graph[idx].desired {
                for reference in expr.references() {
                    let unknown = || ConfigError::UnknownReference {
                        address: address.to_string(),
                        attribute: attribute.clone(),
                        reference: reference.to_string(),
                    };
                    let &target = indices.get(&reference.address).ok_or_else(unknown)?;
                    let has_output = registry
                        .get(&reference.address.kind)
                        .is_some_and(|s| s.has_output(&reference.attribute));
                    if !has_output {
                        return Err(unknown());
                    }
                    edges.insert((target, idx));
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        let dag = Self { graph, indices };
        dag.verify_acyclic()?;

        debug!(
            nodes = dag.graph.node_count(),
            edges = dag.graph.edge_count(),
            "built dependency graph"
        );
        Ok(dag)
    }

    /// Fails with the first cycle found, rendered `a -> b -> a` where each
    /// arrow reads "references".
    fn verify_acyclic(&self) -> Result<(), ConfigError> {
        let mut cycles: Vec<Vec<ResourceAddress>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .map(|scc| self.cycle_path(&scc))
            .collect();
        cycles.sort();

        match cycles.into_iter().next() {
            None => Ok(()),
            Some(path) => Err(ConfigError::Cycle {
                cycle: path
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" -> "),
            }),
        }
    }

    /// Finds a concrete cycle inside a strongly connected component, starting
    /// and ending at its smallest address.
    fn cycle_path(&self, scc: &[NodeIndex]) -> Vec<ResourceAddress> {
        let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
        let Some(&start) = scc.iter().min_by_key(|&&idx| &self.graph[idx].address) else {
            return Vec::new();
        };

        // Breadth-first along "references" edges until we get back to start
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut last = start;
        'search: while let Some(current) = queue.pop_front() {
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .filter(|n| members.contains(n))
                .collect();
            next.sort_by_key(|&n| &self.graph[n].address);
            for n in next {
                if n == start {
                    last = current;
                    break 'search;
                }
                if let Entry::Vacant(e) = parent.entry(n) {
                    e.insert(current);
                    queue.push_back(n);
                }
            }
        }

        let mut path = vec![self.graph[start].address.clone()];
        let mut tail = Vec::new();
        let mut cursor = last;
        while cursor != start {
            tail.push(self.graph[cursor].address.clone());
            cursor = parent[&cursor];
        }
        tail.reverse();
        path.extend(tail);
        path.push(self.graph[start].address.clone());
        path
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if there are no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns true if the address is declared.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.indices.contains_key(address)
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, address: &ResourceAddress) -> Option<&ResourceNode> {
        self.indices.get(address).map(|&idx| &self.graph[idx])
    }

    /// Iterates nodes in address order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.indices.values().map(|&idx| &self.graph[idx])
    }

    /// Resources that `address` references directly.
    #[must_use]
    pub fn dependencies(&self, address: &ResourceAddress) -> BTreeSet<ResourceAddress> {
        self.neighbors(address, Direction::Incoming)
    }

    /// Resources that reference `address` directly.
    #[must_use]
    pub fn dependents(&self, address: &ResourceAddress) -> BTreeSet<ResourceAddress> {
        self.neighbors(address, Direction::Outgoing)
    }

    /// Every resource that depends on `address`, directly or not.
    #[must_use]
    pub fn transitive_dependents(&self, address: &ResourceAddress) -> BTreeSet<ResourceAddress> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<ResourceAddress> = self.dependents(address).into_iter().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(&next));
            }
        }
        seen
    }

    fn neighbors(&self, address: &ResourceAddress, dir: Direction) -> BTreeSet<ResourceAddress> {
        self.indices
            .get(address)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, dir)
                    .map(|n| self.graph[n].address.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Dependencies before dependents, ties broken by address.
    #[must_use]
    pub fn topological_order(&self) -> Vec<ResourceAddress> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let degree = self.graph.neighbors_directed(idx, Direction::Incoming).count();
                (idx, degree)
            })
            .collect();

        let mut ready: BTreeSet<(&ResourceAddress, NodeIndex)> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&idx, _)| (&self.graph[idx].address, idx))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some((address, idx)) = ready.pop_first() {
            order.push(address.clone());
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((&self.graph[next].address, next));
                    }
                }
            }
        }
        order
    }

    /// Longest-path level of each resource: roots are 0, every other node is
    /// one more than its deepest dependency.
    #[must_use]
    pub fn ranks(&self) -> BTreeMap<ResourceAddress, usize> {
        let mut ranks: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
        for address in self.topological_order() {
            let rank = self
                .dependencies(&address)
                .iter()
                .filter_map(|dep| ranks.get(dep))
                .map(|r| r + 1)
                .max()
                .unwrap_or(0);
            ranks.insert(address, rank);
        }
        ranks
    }

    /// Dependents before dependencies.
    #[must_use]
    pub fn destroy_order(&self) -> Vec<ResourceAddress> {
        let mut order = self.topological_order();
        order.reverse();
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::schema::{AttributeSchema, ResourceSchema};
    use serde_json::json;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    fn node_schema() -> ResourceSchema {
        ResourceSchema::new("node")
            .with_attribute("ref", AttributeSchema::string())
            .with_attribute("refs", AttributeSchema::list())
            .with_attribute("port", AttributeSchema::number().force_new())
            .with_attribute("host", AttributeSchema::string().computed())
    }

    fn registry() -> SchemaRegistry {
        SchemaRegistry::with_overrides(&[node_schema()])
    }

    fn node(name: &str) -> ResourceConfig {
        ResourceConfig::new("node", name)
    }

    fn build(resources: Vec<ResourceConfig>) -> Result<DependencyGraph, ConfigError> {
        let mut config = InfraConfig::new("test");
        config.resources = resources;
        DependencyGraph::build(&config, &registry())
    }

    #[test]
    fn test_topological_order_respects_references() {
        let graph = build(vec![
            node("a").with_attribute("ref", json!("${node.b.id}")),
            node("b").with_attribute("ref", json!("${node.c.host}")),
            node("c"),
        ])
        .unwrap();

        assert_eq!(
            graph.topological_order(),
            vec![addr("node.c"), addr("node.b"), addr("node.a")]
        );
        assert_eq!(graph.dependencies(&addr("node.a")), BTreeSet::from([addr("node.b")]));
        assert_eq!(graph.dependents(&addr("node.c")), BTreeSet::from([addr("node.b")]));
        assert_eq!(
            graph.transitive_dependents(&addr("node.c")),
            BTreeSet::from([addr("node.a"), addr("node.b")])
        );
        assert_eq!(
            graph.destroy_order(),
            vec![addr("node.a"), addr("node.b"), addr("node.c")]
        );
    }

    #[test]
    fn test_ranks_and_tie_break() {
        let graph = build(vec![
            node("z"),
            node("y"),
            node("x").with_attribute("refs", json!(["${node.z.id}", "${node.y.id}"])),
            node("w").with_attribute("ref", json!("${node.x.id}")),
        ])
        .unwrap();

        assert_eq!(
            graph.topological_order(),
            vec![addr("node.y"), addr("node.z"), addr("node.x"), addr("node.w")]
        );
        let ranks = graph.ranks();
        assert_eq!(ranks[&addr("node.y")], 0);
        assert_eq!(ranks[&addr("node.x")], 1);
        assert_eq!(ranks[&addr("node.w")], 2);
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let err = build(vec![
            node("a").with_attribute("ref", json!("${node.b.id}")),
            node("b").with_attribute("ref", json!("${node.a.id}")),
        ])
        .unwrap_err();

        match err {
            ConfigError::Cycle { cycle } => assert_eq!(cycle, "node.a -> node.b -> node.a"),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let err = build(vec![node("a").with_attribute("ref", json!("${node.a.id}"))]).unwrap_err();
        assert!(matches!(err, ConfigError::Cycle { cycle } if cycle == "node.a -> node.a"));
    }

    #[test]
    fn test_unknown_reference() {
        let missing_resource =
            build(vec![node("a").with_attribute("ref", json!("${node.ghost.id}"))]).unwrap_err();
        assert!(matches!(
            missing_resource,
            ConfigError::UnknownReference { reference, .. } if reference == "node.ghost.id"
        ));

        let missing_attribute = build(vec![
            node("a").with_attribute("ref", json!("${node.b.nope}")),
            node("b"),
        ])
        .unwrap_err();
        assert!(matches!(missing_attribute, ConfigError::UnknownReference { .. }));
    }

    #[test]
    fn test_duplicate_and_unknown_kind() {
        let dup = build(vec![node("a"), node("a")]).unwrap_err();
        assert!(matches!(dup, ConfigError::DuplicateResource { .. }));

        let unknown = build(vec![ResourceConfig::new("teleporter", "t")]).unwrap_err();
        assert!(matches!(unknown, ConfigError::UnknownKind { .. }));
    }

    #[test]
    fn test_builtin_topology() {
        let config = InfraConfig::new("net")
            .with_resource(
                ResourceConfig::new("vpc", "main").with_attribute("cidr_block", json!("10.0.0.0/16")),
            )
            .with_resource(
                ResourceConfig::new("subnet", "public")
                    .with_attribute("vpc_id", json!("${vpc.main.id}"))
                    .with_attribute("cidr_block", json!("10.0.1.0/24")),
            )
            .with_resource(
                ResourceConfig::new("load_balancer", "web")
                    .with_attribute("name", json!("web"))
                    .with_attribute("subnet_ids", json!(["${subnet.public.id}"])),
            );

        let graph = DependencyGraph::build(&config, &SchemaRegistry::builtin()).unwrap();
        assert_eq!(
            graph.topological_order(),
            vec![addr("vpc.main"), addr("subnet.public"), addr("load_balancer.web")]
        );
        let subnet = graph.node(&addr("subnet.public")).unwrap();
        assert_eq!(subnet.desired["public"], Expr::Literal(json!(false)));
    }
}
