//! Output propagation between plan entries.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::plan::Plan;
use crate::config::{Expr, Reference, Resolution};
use crate::graph::ResourceAddress;
use crate::provider::Attributes;

/// Tracks completed outputs and which entries are ready to run.
///
/// Each entry has a counter of unfinished dependencies. Completing an
/// entry records its outputs and decrements its dependents; those reaching
/// zero are returned as ready, and their expressions resolve in a single
/// pass against the recorded outputs.
#[derive(Debug, Clone, Default)]
pub struct OutputResolver {
    outputs: BTreeMap<ResourceAddress, Attributes>,
    waiting: BTreeMap<ResourceAddress, usize>,
    dependents: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
}

impl OutputResolver {
    /// Creates a resolver for the entries of `plan`.
    #[must_use]
    pub fn for_plan(plan: &Plan) -> Self {
        let mut resolver = Self::default();
        for entry in &plan.entries {
            resolver
                .waiting
                .insert(entry.address.clone(), entry.dependencies.len());
            for dependency in &entry.dependencies {
                resolver
                    .dependents
                    .entry(dependency.clone())
                    .or_default()
                    .insert(entry.address.clone());
            }
        }
        resolver
    }

    /// Entries with no dependencies.
    #[must_use]
    pub fn initially_ready(&self) -> BTreeSet<ResourceAddress> {
        self.waiting
            .iter()
            .filter(|&(_, &n)| n == 0)
            .map(|(a, _)| a.clone())
            .collect()
    }

    /// Records a completed entry and returns the dependents that became ready.
    ///
    /// `outputs` is `None` for deletes.
    pub fn complete(
        &mut self,
        address: &ResourceAddress,
        outputs: Option<Attributes>,
    ) -> Vec<ResourceAddress> {
        match outputs {
            Some(outputs) => {
                self.outputs.insert(address.clone(), outputs);
            }
            None => {
                self.outputs.remove(address);
            }
        }

        let mut ready = Vec::new();
        for dependent in self.dependents.get(address).into_iter().flatten() {
            if let Some(count) = self.waiting.get_mut(dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push(dependent.clone());
                }
            }
        }
        ready
    }

    /// Every entry downstream of `address`.
    #[must_use]
    pub fn downstream(&self, address: &ResourceAddress) -> BTreeSet<ResourceAddress> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![address];
        while let Some(current) = stack.pop() {
            for next in self.dependents.get(current).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    stack.push(next);
                }
            }
        }
        seen
    }

    /// Recorded outputs of a completed entry.
    #[must_use]
    pub fn outputs(&self, address: &ResourceAddress) -> Option<&Attributes> {
        self.outputs.get(address)
    }

    /// Looks up one referenced value.
    #[must_use]
    pub fn lookup(&self, reference: &Reference) -> Option<Value> {
        self.outputs
            .get(&reference.address)
            .and_then(|o| o.get(&reference.attribute))
            .cloned()
    }

    /// Resolves desired expressions against recorded outputs.
    ///
    /// # Errors
    ///
    /// Returns every reference that has no value yet.
    pub fn resolve(
        &self,
        desired: &BTreeMap<String, Expr>,
    ) -> Result<Attributes, BTreeSet<Reference>> {
        let lookup = |r: &Reference| self.lookup(r);
        let mut resolved = Attributes::new();
        let mut missing = BTreeSet::new();
        for (name, expr) in desired {
            match expr.resolve(&lookup) {
                Resolution::Known(value) => {
                    resolved.insert(name.clone(), value);
                }
                Resolution::Unknown(refs) => missing.extend(refs),
            }
        }
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(missing)
        }
    }
}
