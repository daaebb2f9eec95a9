//! Execution planning: from item-level produce/consume declarations to a
//! step-level graph, and from that graph to ordered waves.
//!
//! Every edge points from a producer to one of its consumers. The waves are the
//! successive batches of Kahn's algorithm: wave 0 holds every step without
//! included producers, wave 1 every step whose producers all sit in wave 0, and
//! so on. Steps inside a wave never depend on each other, so they can run in
//! parallel, and a producer always sits in a strictly earlier wave than any of
//! its consumers.

mod manifest;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::chain::Producers;
use crate::core::{Hash32, StepId};
use crate::error::{CycleLink, GraphError};
use crate::item::{ItemId, Strength};
use crate::step::StepDescriptor;

pub use manifest::{ConsumeManifest, ItemManifest, PlanManifest, ProduceManifest, StepManifest};

/// Why one step has to run before another.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Edge {
    pub item: ItemId,
    pub strength: Strength,
}

/// One batch of mutually independent steps.
#[derive(Debug, Clone, Default)]
pub(crate) struct Wave {
    pub nodes: Vec<NodeIndex>,
}

/// The validated, pruned and layered result of
/// [`ChainBuilder::build`](crate::ChainBuilder::build).
///
/// A plan holds no per-run state. It can be run any number of times, each run
/// getting a fresh artifact store.
pub struct ExecutionPlan {
    pub(crate) graph: DiGraph<Arc<StepDescriptor>, Edge>,
    pub(crate) waves: Vec<Wave>,
    pub(crate) finals: Vec<ItemId>,
    pub(crate) initials: Vec<ItemId>,
}

impl ExecutionPlan {
    /// Step ids per wave, in execution order. Ids inside a wave are sorted.
    pub fn waves(&self) -> Vec<Vec<&StepId>> {
        self.waves
            .iter()
            .map(|wave| wave.nodes.iter().map(|&n| self.graph[n].id()).collect())
            .collect()
    }

    /// Every included step, in registration order.
    pub fn steps(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.graph.node_weights().map(|step| &**step)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps().any(|step| step.id().as_str() == id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn finals(&self) -> &[ItemId] {
        &self.finals
    }

    pub fn initials(&self) -> &[ItemId] {
        &self.initials
    }

    /// Ids of the steps `id` has to wait for.
    pub fn dependencies_of(&self, id: &str) -> Vec<&StepId> {
        let Some(node) = self.node(id) else {
            return vec![];
        };

        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|n| self.graph[n].id())
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    pub fn manifest(&self) -> PlanManifest {
        PlanManifest::from_plan(self)
    }

    /// Fingerprint of the step declarations and wave layout, see
    /// [`PlanManifest::fingerprint`].
    pub fn fingerprint(&self) -> Hash32 {
        self.manifest().fingerprint()
    }

    /// Renders the plan as a Graphviz graph, producers pointing at consumers.
    pub fn to_dot(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "digraph {{");
        let _ = writeln!(out, "    node [shape=rectangle];");
        let _ = writeln!(out, "    rankdir=LR;");
        let _ = writeln!(out);

        for (index, wave) in self.waves.iter().enumerate() {
            let _ = write!(out, "    {{ rank = same; ");
            for &node in &wave.nodes {
                let _ = write!(out, "{}; ", quote(self.graph[node].id().as_str()));
            }
            let _ = writeln!(out, "}}; // wave {index}");
        }

        let _ = writeln!(out);

        for edge in self.graph.raw_edges() {
            let source = self.graph[edge.source()].id();
            let target = self.graph[edge.target()].id();
            let _ = writeln!(
                out,
                "    {} -> {} [label={}{}];",
                quote(source.as_str()),
                quote(target.as_str()),
                quote(edge.weight.item.name()),
                match edge.weight.strength {
                    Strength::Weak => ", style=dashed",
                    _ => "",
                }
            );
        }

        let _ = writeln!(out, "}}");
        out
    }

    fn node(&self, id: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&n| self.graph[n].id().as_str() == id)
    }
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("waves", &self.waves())
            .field("finals", &self.finals)
            .field("initials", &self.initials)
            .finish()
    }
}

/// Mermaid flowchart, one subgraph per wave.
impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, wave) in self.waves.iter().enumerate() {
            writeln!(f, "    subgraph wave{index}")?;
            for &node in &wave.nodes {
                let name = self.graph[node].id().as_str().replace('"', "\\\"");
                writeln!(f, "        {}[\"{}\"]", node.index(), name)?;
            }
            writeln!(f, "    end")?;
        }

        let mut has_final = false;
        for node in self.graph.node_indices() {
            let step = &self.graph[node];
            if step.produces().iter().any(|p| self.finals.contains(&p.item)) {
                writeln!(f, "    {} --> Final", node.index())?;
                has_final = true;
            }
        }

        if has_final {
            writeln!(f, "    Final[Final]")?;
        }

        for edge in self.graph.raw_edges() {
            let name = edge
                .weight
                .item
                .name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            let (open, close) = match edge.weight.strength {
                Strength::Weak => ("-.", ".->"),
                _ => ("--", "-->"),
            };
            writeln!(
                f,
                "    {} {open} \"{name}\" {close} {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

fn quote(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\\\""))
}

/// Builds the step graph over the included steps and layers it into waves.
pub(crate) fn partition(
    steps: &[StepDescriptor],
    included: &[bool],
    producers: &Producers,
    finals: &[ItemId],
    initials: &[ItemId],
) -> Result<ExecutionPlan, GraphError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for (index, step) in steps.iter().enumerate() {
        if included[index] {
            let overridden = producers.overridden.get(&index).map_or(&[][..], Vec::as_slice);
            let step = step.clone().with_overridden(overridden);
            nodes.insert(index, graph.add_node(Arc::new(step)));
        }
    }

    for (index, step) in steps.iter().enumerate() {
        let Some(&consumer) = nodes.get(&index) else {
            continue;
        };

        for consume in step.consumes() {
            // Weak edges only survive when the producer was included for some
            // other reason, which is exactly when it has a node.
            for producer in producers.effective.get(&consume.item).into_iter().flatten() {
                if let Some(&producer) = nodes.get(producer) {
                    let edge = Edge {
                        item: consume.item,
                        strength: consume.strength,
                    };
                    graph.add_edge(producer, consumer, edge);
                }
            }
        }
    }

    let waves = layer(&graph)?;

    tracing::debug!(
        steps = graph.node_count(),
        edges = graph.edge_count(),
        waves = waves.len(),
        "planned build chain"
    );

    Ok(ExecutionPlan {
        graph,
        waves,
        finals: finals.to_vec(),
        initials: initials.to_vec(),
    })
}

/// Kahn's algorithm, keeping every batch of zero in-degree nodes as a wave.
fn layer(graph: &DiGraph<Arc<StepDescriptor>, Edge>) -> Result<Vec<Wave>, GraphError> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut current: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .collect();

    let mut waves = Vec::new();
    let mut placed = 0;

    while !current.is_empty() {
        current.sort_by(|a, b| graph[*a].id().cmp(graph[*b].id()));

        let mut next = Vec::new();
        for &node in &current {
            for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
                let degree = &mut in_degree[dependent.index()];
                *degree -= 1;
                if *degree == 0 {
                    next.push(dependent);
                }
            }
        }

        placed += current.len();
        waves.push(Wave { nodes: current });
        current = next;
    }

    if placed < graph.node_count() {
        return Err(cycle(graph));
    }

    Ok(waves)
}

/// Steps sitting on a cycle: members of a non-trivial strongly connected
/// component, or steps consuming their own output. Links are the edges
/// between members of the same component.
fn cycle(graph: &DiGraph<Arc<StepDescriptor>, Edge>) -> GraphError {
    let mut component = vec![None; graph.node_count()];

    for (index, scc) in petgraph::algo::tarjan_scc(graph).into_iter().enumerate() {
        if scc.len() > 1 || graph.contains_edge(scc[0], scc[0]) {
            for node in scc {
                component[node.index()] = Some(index);
            }
        }
    }

    let mut steps: Vec<StepId> = graph
        .node_indices()
        .filter(|n| component[n.index()].is_some())
        .map(|n| graph[n].id().clone())
        .collect();
    steps.sort();

    let mut links: Vec<CycleLink> = graph
        .raw_edges()
        .iter()
        .filter(|edge| {
            let source = component[edge.source().index()];
            source.is_some() && source == component[edge.target().index()]
        })
        .map(|edge| CycleLink {
            producer: graph[edge.source()].id().clone(),
            item: edge.weight.item,
            consumer: graph[edge.target()].id().clone(),
        })
        .collect();
    links.sort_by(|a, b| {
        (&a.producer, &a.consumer, a.item.name()).cmp(&(&b.producer, &b.consumer, b.item.name()))
    });

    GraphError::CyclicDependency { steps, links }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Consume, Produce, SimpleItem};

    struct A;
    impl SimpleItem for A {}
    struct B;
    impl SimpleItem for B {}
    struct C;
    impl SimpleItem for C {}

    fn step(id: &str, produces: &[ItemId], consumes: &[(ItemId, Strength)]) -> StepDescriptor {
        StepDescriptor::new(
            id,
            produces.iter().map(|&item| Produce {
                item,
                overridable: false,
                weak: false,
            }),
            consumes
                .iter()
                .map(|&(item, strength)| Consume { item, strength }),
            false,
            |_| Ok(()),
        )
    }

    fn producers(steps: &[StepDescriptor]) -> Producers {
        let mut effective: HashMap<ItemId, Vec<usize>> = HashMap::new();
        for (i, s) in steps.iter().enumerate() {
            for p in s.produces() {
                effective.entry(p.item).or_default().push(i);
            }
        }
        Producers {
            effective,
            ..Producers::default()
        }
    }

    fn ids(plan: &ExecutionPlan) -> Vec<Vec<&str>> {
        plan.waves()
            .into_iter()
            .map(|w| w.into_iter().map(StepId::as_str).collect())
            .collect()
    }

    #[test]
    fn diamond_is_layered() {
        let (a, b, c) = (ItemId::simple::<A>(), ItemId::simple::<B>(), ItemId::simple::<C>());
        let r = Strength::Required;
        let steps = vec![
            step("join", &[], &[(b, r), (c, r)]),
            step("left", &[b], &[(a, r)]),
            step("right", &[c], &[(a, r)]),
            step("root", &[a], &[]),
        ];

        let plan = partition(&steps, &[true; 4], &producers(&steps), &[], &[]).unwrap();
        assert_eq!(ids(&plan), vec![vec!["root"], vec!["left", "right"], vec!["join"]]);

        let deps: Vec<_> = plan.dependencies_of("join").into_iter().map(StepId::as_str).collect();
        assert_eq!(deps, ["left", "right"]);
    }

    #[test]
    fn excluded_producers_leave_no_edges() {
        let a = ItemId::simple::<A>();
        let steps = vec![step("root", &[a], &[]), step("weak", &[], &[(a, Strength::Weak)])];

        let plan = partition(&steps, &[false, true], &producers(&steps), &[], &[]).unwrap();
        assert_eq!(ids(&plan), vec![vec!["weak"]]);
    }

    #[test]
    fn cycles_name_only_their_members() {
        let (a, b, c) = (ItemId::simple::<A>(), ItemId::simple::<B>(), ItemId::simple::<C>());
        let r = Strength::Required;
        let steps = vec![
            step("ping", &[a], &[(b, r)]),
            step("pong", &[b], &[(a, Strength::Weak)]),
            step("after", &[c], &[(a, r)]),
        ];

        match partition(&steps, &[true; 3], &producers(&steps), &[], &[]) {
            Err(GraphError::CyclicDependency { steps, links }) => {
                let steps: Vec<_> = steps.iter().map(StepId::as_str).collect();
                assert_eq!(steps, ["ping", "pong"]);

                let links: Vec<_> = links
                    .iter()
                    .map(|l| (l.producer.as_str(), l.item, l.consumer.as_str()))
                    .collect();
                assert_eq!(links, [("ping", a, "pong"), ("pong", b, "ping")]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_consumption_is_a_cycle() {
        let a = ItemId::simple::<A>();
        let steps = vec![step("selfish", &[a], &[(a, Strength::Optional)])];

        let err = partition(&steps, &[true], &producers(&steps), &[], &[]).unwrap_err();
        assert!(matches!(
            err,
            GraphError::CyclicDependency { steps, links } if steps.len() == 1 && links.len() == 1
        ));
    }

    #[test]
    fn renders_mermaid_and_dot() {
        let a = ItemId::simple::<A>();
        let steps = vec![
            step("root", &[a], &[]),
            step("leaf", &[], &[(a, Strength::Required)]),
        ];

        let plan = partition(&steps, &[true; 2], &producers(&steps), &[a], &[]).unwrap();

        let mermaid = plan.to_string();
        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("subgraph wave0"));
        assert!(mermaid.contains("0 --> Final"));

        let dot = plan.to_dot();
        assert!(dot.contains("\"root\" -> \"leaf\""));
    }
}
