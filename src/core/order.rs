//! Execution order resolution.
//!
//! The order is built in layers:
//!
//! 1. ids listed in `plugin_order` come first, as listed;
//! 2. the rest follow by priority, then tag phase, then id;
//! 3. `requires` edges are enforced on top with a topological sort that
//!    always picks the lowest-ranked ready plugin.
//!
//! Dependency cycles never fail the resolution: the edges inside each cycle
//! are dropped, the cycle is reported, and its members keep their base
//! order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;

use serde::Serialize;

use super::Phase;
use crate::plugin::PluginRegistry;

/// A non-fatal problem found while ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderingWarning {
    /// Plugins whose `requires` edges form a cycle.
    Cycle { members: Vec<String> },
    /// A dependency that is not an enabled plugin.
    MissingDependency { plugin: String, dependency: String },
    /// `plugin_order` names an id that is not an enabled plugin.
    UnknownOrderEntry { id: String },
}

impl fmt::Display for OrderingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle { members } => {
                write!(f, "dependency cycle between {}; using priority order", members.join(", "))
            }
            Self::MissingDependency { plugin, dependency } => {
                write!(f, "'{plugin}' requires '{dependency}', which is not enabled; ignoring")
            }
            Self::UnknownOrderEntry { id } => {
                write!(f, "plugin_order names unknown or disabled plugin '{id}'")
            }
        }
    }
}

/// The resolved order and what was learned computing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedOrder {
    /// Plugin ids in execution order.
    pub order: Vec<String>,
    pub warnings: Vec<OrderingWarning>,
    /// Enforced dependencies: plugin id to the ids it waits for.
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl ResolvedOrder {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position of a plugin in the order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }

    /// Enforced dependencies of a plugin.
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependencies.get(id).into_iter().flatten().map(String::as_str)
    }
}

/// Computes the execution order of the enabled plugins in a registry.
pub struct OrderResolver<'a> {
    registry: &'a PluginRegistry,
    plugin_order: &'a [String],
}

impl<'a> OrderResolver<'a> {
    pub fn new(registry: &'a PluginRegistry, plugin_order: &'a [String]) -> Self {
        Self { registry, plugin_order }
    }

    pub fn resolve(&self) -> ResolvedOrder {
        let mut warnings = Vec::new();
        let base = self.base_order(&mut warnings);
        let rank: BTreeMap<&str, usize> =
            base.iter().enumerate().map(|(idx, id)| (id.as_str(), idx)).collect();

        // Dependency edges among enabled plugins.
        let mut deps: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for id in &base {
            let entry = deps.entry(id.as_str()).or_default();
            if let Some(record) = self.registry.get(id) {
                for dep in &record.requires {
                    if dep == id {
                        warnings.push(OrderingWarning::Cycle { members: vec![id.clone()] });
                    } else if rank.contains_key(dep.as_str()) {
                        entry.insert(dep.as_str());
                    } else {
                        warnings.push(OrderingWarning::MissingDependency {
                            plugin: id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }

        // Drop edges inside strongly connected components.
        for component in strongly_connected(&deps) {
            if component.len() < 2 {
                continue;
            }
            let members: BTreeSet<&str> = component.iter().copied().collect();
            for id in &members {
                if let Some(edges) = deps.get_mut(id) {
                    edges.retain(|dep| !members.contains(dep));
                }
            }
            warnings.push(OrderingWarning::Cycle {
                members: members.iter().map(|s| (*s).to_string()).collect(),
            });
        }

        for warning in &warnings {
            tracing::warn!(%warning, "Plugin ordering");
        }

        // Kahn's algorithm, lowest base rank first.
        let mut remaining: BTreeMap<&str, usize> =
            deps.iter().map(|(id, d)| (*id, d.len())).collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, d) in &deps {
            for &dep in d {
                dependents.entry(dep).or_default().push(*id);
            }
        }

        let mut ready: BinaryHeap<Reverse<(usize, &str)>> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| Reverse((rank[id], *id)))
            .collect();

        let mut order = Vec::with_capacity(base.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id.to_string());
            for &dependent in dependents.get(id).into_iter().flatten() {
                if let Some(n) = remaining.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(Reverse((rank[dependent], dependent)));
                    }
                }
            }
        }

        // Unreachable once cycles are cut, kept as a guard against a
        // truncated order.
        if order.len() < base.len() {
            let placed: BTreeSet<String> = order.iter().cloned().collect();
            order.extend(base.iter().filter(|id| !placed.contains(*id)).cloned());
        }

        let dependencies = deps
            .into_iter()
            .filter(|(_, d)| !d.is_empty())
            .map(|(id, d)| (id.to_string(), d.into_iter().map(str::to_string).collect()))
            .collect();

        ResolvedOrder { order, warnings, dependencies }
    }

    /// Explicit order first, then priority, phase and id.
    fn base_order(&self, warnings: &mut Vec<OrderingWarning>) -> Vec<String> {
        let mut placed = BTreeSet::new();
        let mut base = Vec::new();

        for id in self.plugin_order {
            let id = id.trim();
            if placed.contains(id) {
                continue;
            }
            match self.registry.get(id) {
                Some(record) if record.enabled => {
                    placed.insert(id.to_string());
                    base.push(id.to_string());
                }
                _ => warnings.push(OrderingWarning::UnknownOrderEntry { id: id.to_string() }),
            }
        }

        let mut rest: Vec<(i32, Phase, &str)> = self
            .registry
            .enabled()
            .filter(|r| !placed.contains(r.id()))
            .map(|r| (r.priority, Phase::for_tags(r.metadata().tags()), r.id()))
            .collect();
        rest.sort_unstable();

        base.extend(rest.into_iter().map(|(_, _, id)| id.to_string()));
        base
    }
}

/// Tarjan's strongly connected components, iterating nodes in key order.
fn strongly_connected<'a>(graph: &BTreeMap<&'a str, BTreeSet<&'a str>>) -> Vec<Vec<&'a str>> {
    struct State<'a> {
        index: usize,
        indices: BTreeMap<&'a str, usize>,
        lowlink: BTreeMap<&'a str, usize>,
        stack: Vec<&'a str>,
        on_stack: BTreeSet<&'a str>,
        components: Vec<Vec<&'a str>>,
    }

    fn visit<'a>(node: &'a str, graph: &BTreeMap<&'a str, BTreeSet<&'a str>>, st: &mut State<'a>) {
        st.indices.insert(node, st.index);
        st.lowlink.insert(node, st.index);
        st.index += 1;
        st.stack.push(node);
        st.on_stack.insert(node);

        for &next in graph.get(node).into_iter().flatten() {
            if !st.indices.contains_key(next) {
                visit(next, graph, st);
                let low = st.lowlink[node].min(st.lowlink[next]);
                st.lowlink.insert(node, low);
            } else if st.on_stack.contains(next) {
                let low = st.lowlink[node].min(st.indices[next]);
                st.lowlink.insert(node, low);
            }
        }

        if st.lowlink[node] == st.indices[node] {
            let mut component = Vec::new();
            while let Some(member) = st.stack.pop() {
                st.on_stack.remove(member);
                component.push(member);
                if member == node {
                    break;
                }
            }
            st.components.push(component);
        }
    }

    let mut st = State {
        index: 0,
        indices: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        components: Vec::new(),
    };
    for &node in graph.keys() {
        if !st.indices.contains_key(node) {
            visit(node, graph, &mut st);
        }
    }
    st.components
}
