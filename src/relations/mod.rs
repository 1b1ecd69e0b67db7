// src/relations/mod.rs

//! Relation graphs over tasks and event generators.
//!
//! Each relation is a typed directed graph ([`RelationGraph`], backed by a
//! `petgraph` `DiGraphMap`) whose edges may carry information:
//! - event relations (signal, forwarding, causal link) over generators;
//! - the dependency relation (parent -> child, carrying [`DependencyInfo`]);
//! - the planning relation (planned task -> planning task).

pub mod dependency;
pub mod events;
pub mod planning;
pub mod predicate;

use std::collections::{BTreeSet, VecDeque};

use petgraph::graphmap::{DiGraphMap, NodeTrait};
use petgraph::Direction;

use crate::types::{EventRelation, GeneratorId, TaskId};

pub use dependency::{DependencyInfo, DependencyOptions, ModelConstraint};
pub use predicate::{Evaluation, Explanation, Predicate};

#[derive(Debug, Clone)]
pub struct RelationGraph<N: NodeTrait, E> {
    graph: DiGraphMap<N, E>,
}

impl<N: NodeTrait, E> Default for RelationGraph<N, E> {
    fn default() -> Self {
        Self {
            graph: DiGraphMap::new(),
        }
    }
}

impl<N: NodeTrait, E> RelationGraph<N, E> {
    /// Add or replace the edge, returning the previous edge info.
    pub fn add_edge(&mut self, from: N, to: N, info: E) -> Option<E> {
        self.graph.add_edge(from, to, info)
    }

    pub fn remove_edge(&mut self, from: N, to: N) -> Option<E> {
        self.graph.remove_edge(from, to)
    }

    pub fn contains_edge(&self, from: N, to: N) -> bool {
        self.graph.contains_edge(from, to)
    }

    pub fn edge(&self, from: N, to: N) -> Option<&E> {
        self.graph.edge_weight(from, to)
    }

    pub fn edge_mut(&mut self, from: N, to: N) -> Option<&mut E> {
        self.graph.edge_weight_mut(from, to)
    }

    pub fn children(&self, node: N) -> Vec<N> {
        if !self.graph.contains_node(node) {
            return Vec::new();
        }
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect()
    }

    pub fn parents(&self, node: N) -> Vec<N> {
        if !self.graph.contains_node(node) {
            return Vec::new();
        }
        self.graph
            .neighbors_directed(node, Direction::Incoming)
            .collect()
    }

    pub fn has_edges(&self, node: N) -> bool {
        !self.children(node).is_empty() || !self.parents(node).is_empty()
    }

    pub fn edges(&self) -> Vec<(N, N, &E)> {
        self.graph.all_edges().collect()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn remove_node(&mut self, node: N) {
        self.graph.remove_node(node);
    }

    /// True if `to` can be reached from `from` following edges.
    pub fn reaches(&self, from: N, to: N) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            if node == to {
                return true;
            }
            if seen.insert(node) {
                queue.extend(self.children(node));
            }
        }
        false
    }
}

/// All relation graphs of a plan.
#[derive(Debug, Clone, Default)]
pub struct Relations {
    pub(crate) signal: RelationGraph<GeneratorId, ()>,
    pub(crate) forwarding: RelationGraph<GeneratorId, ()>,
    pub(crate) causal_link: RelationGraph<GeneratorId, ()>,
    pub(crate) dependency: RelationGraph<TaskId, DependencyInfo>,
    pub(crate) planning: RelationGraph<TaskId, ()>,
}

impl Relations {
    pub fn event_graph(&self, relation: EventRelation) -> &RelationGraph<GeneratorId, ()> {
        match relation {
            EventRelation::Signal => &self.signal,
            EventRelation::Forwarding => &self.forwarding,
            EventRelation::CausalLink => &self.causal_link,
        }
    }

    pub(crate) fn event_graph_mut(
        &mut self,
        relation: EventRelation,
    ) -> &mut RelationGraph<GeneratorId, ()> {
        match relation {
            EventRelation::Signal => &mut self.signal,
            EventRelation::Forwarding => &mut self.forwarding,
            EventRelation::CausalLink => &mut self.causal_link,
        }
    }

    pub fn dependency(&self) -> &RelationGraph<TaskId, DependencyInfo> {
        &self.dependency
    }

    pub fn planning(&self) -> &RelationGraph<TaskId, ()> {
        &self.planning
    }

    /// True if the generator has an edge in any event relation.
    pub fn has_event_edges(&self, generator: GeneratorId) -> bool {
        self.signal.has_edges(generator)
            || self.forwarding.has_edges(generator)
            || self.causal_link.has_edges(generator)
    }

    /// Successors through all event relations.
    pub fn event_successors(&self, generator: GeneratorId) -> Vec<GeneratorId> {
        let mut result = self.signal.children(generator);
        for g in self
            .forwarding
            .children(generator)
            .into_iter()
            .chain(self.causal_link.children(generator))
        {
            if !result.contains(&g) {
                result.push(g);
            }
        }
        result
    }

    /// True if an emission of `from` can lead to one of `to` through
    /// signals, forwardings or causal links.
    pub fn propagates_to(&self, from: GeneratorId, to: GeneratorId) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<GeneratorId> = self.event_successors(from).into();
        while let Some(node) = queue.pop_front() {
            if node == to {
                return true;
            }
            if seen.insert(node) {
                queue.extend(self.event_successors(node));
            }
        }
        false
    }

    pub(crate) fn remove_generator(&mut self, generator: GeneratorId) {
        self.signal.remove_node(generator);
        self.forwarding.remove_node(generator);
        self.causal_link.remove_node(generator);
    }

    pub(crate) fn remove_task(&mut self, task: TaskId) {
        self.dependency.remove_node(task);
        self.planning.remove_node(task);
    }
}
