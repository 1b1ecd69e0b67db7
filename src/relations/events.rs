// src/relations/events.rs

//! Signal, forwarding and causal-link edges between generators.
//!
//! Edges inside a task keep the task's terminal classification consistent:
//! a new edge into a terminal event makes its source terminal, and an edge
//! from a terminal event to a non-terminal one is refused.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::errors::{PlanError, Result};
use crate::plan::model::terminal_closure;
use crate::plan::Plan;
use crate::types::{EventRelation, GeneratorId, TaskId, TerminalKind, FAILED, SUCCESS};

impl Plan {
    /// Emission of `from` calls `to`.
    pub fn add_signal(&mut self, from: GeneratorId, to: GeneratorId) -> Result<()> {
        self.add_event_relation(EventRelation::Signal, from, to)
    }

    /// Emission of `from` emits `to`.
    pub fn add_forwarding(&mut self, from: GeneratorId, to: GeneratorId) -> Result<()> {
        self.add_event_relation(EventRelation::Forwarding, from, to)
    }

    pub fn add_causal_link(&mut self, from: GeneratorId, to: GeneratorId) -> Result<()> {
        self.add_event_relation(EventRelation::CausalLink, from, to)
    }

    pub fn add_event_relation(
        &mut self,
        relation: EventRelation,
        from: GeneratorId,
        to: GeneratorId,
    ) -> Result<()> {
        let source_task = self.generator_or_err(from)?.task;
        let target = self.generator_or_err(to)?;
        if relation == EventRelation::Signal && !target.is_controllable() {
            return Err(PlanError::Argument(format!(
                "cannot signal {to}: it is not controllable"
            )));
        }
        let target_task = target.task;

        if self
            .relations
            .event_graph_mut(relation)
            .add_edge(from, to, ())
            .is_some()
        {
            return Ok(());
        }

        let same_task = match (source_task, target_task) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        };
        if let Some(task) = same_task.filter(|_| relation != EventRelation::CausalLink) {
            if let Err(e) = self.refresh_terminal_flags(task) {
                self.relations.event_graph_mut(relation).remove_edge(from, to);
                // Restore the classification computed without the new edge.
                if let Err(rollback) = self.refresh_terminal_flags(task) {
                    warn!(%task, error = %rollback, "could not restore terminal flags");
                }
                return Err(e);
            }
        }
        debug!(%relation, %from, %to, "added event relation");
        Ok(())
    }

    pub fn remove_event_relation(
        &mut self,
        relation: EventRelation,
        from: GeneratorId,
        to: GeneratorId,
    ) -> bool {
        let removed = self
            .relations
            .event_graph_mut(relation)
            .remove_edge(from, to)
            .is_some();
        if removed && relation != EventRelation::CausalLink {
            let tasks: BTreeSet<TaskId> = [from, to]
                .iter()
                .filter_map(|g| self.generators.get(g).and_then(|g| g.task))
                .collect();
            for task in tasks {
                if let Err(e) = self.refresh_terminal_flags(task) {
                    warn!(%task, error = %e, "could not refresh terminal flags");
                }
            }
        }
        removed
    }

    pub fn has_event_relation(
        &self,
        relation: EventRelation,
        from: GeneratorId,
        to: GeneratorId,
    ) -> bool {
        self.relations.event_graph(relation).contains_edge(from, to)
    }

    pub fn event_children(&self, relation: EventRelation, generator: GeneratorId) -> Vec<GeneratorId> {
        self.relations.event_graph(relation).children(generator)
    }

    pub fn event_parents(&self, relation: EventRelation, generator: GeneratorId) -> Vec<GeneratorId> {
        self.relations.event_graph(relation).parents(generator)
    }

    /// Recompute the terminal classification of `task`'s generators from
    /// the model flags and the forwarding/signal edges between them.
    pub(crate) fn refresh_terminal_flags(&mut self, task: TaskId) -> Result<()> {
        let Some(t) = self.tasks.get(&task) else {
            return Ok(());
        };
        let names: Vec<String> = t.events.iter().map(|(n, _)| n.clone()).collect();
        let by_id = |id: GeneratorId| {
            t.events
                .iter()
                .find(|(_, g)| *g == id)
                .map(|(n, _)| n.clone())
        };

        let mut edges = Vec::new();
        for (name, id) in &t.events {
            for relation in [EventRelation::Forwarding, EventRelation::Signal] {
                for child in self.relations.event_graph(relation).children(*id) {
                    if let Some(child_name) = by_id(child) {
                        edges.push((name.clone(), child_name));
                    }
                }
            }
        }

        let seed_of = |kind: Option<TerminalKind>| -> BTreeSet<String> {
            t.events
                .iter()
                .filter(|(_, g)| {
                    self.generators
                        .get(g)
                        .is_some_and(|g| match kind {
                            None => g.model_terminal.is_some(),
                            Some(k) => g.model_terminal == Some(k),
                        })
                })
                .map(|(n, _)| n.clone())
                .collect()
        };

        let terminal = terminal_closure(&names, seed_of(None), &edges);
        for (from, to) in &edges {
            if terminal.contains(from) && !terminal.contains(to) {
                return Err(PlanError::Argument(format!(
                    "{task}: terminal event '{from}' cannot lead to non-terminal event '{to}'"
                )));
            }
        }
        let mut success_seed = seed_of(Some(TerminalKind::Success));
        success_seed.insert(SUCCESS.to_string());
        let mut failure_seed = seed_of(Some(TerminalKind::Failure));
        failure_seed.insert(FAILED.to_string());
        let success = terminal_closure(&names, success_seed, &edges);
        let failure = terminal_closure(&names, failure_seed, &edges);

        let updates: Vec<(GeneratorId, Option<TerminalKind>)> = t
            .events
            .iter()
            .map(|(name, id)| {
                let kind = if success.contains(name) {
                    Some(TerminalKind::Success)
                } else if failure.contains(name) {
                    Some(TerminalKind::Failure)
                } else if terminal.contains(name) {
                    Some(TerminalKind::Stop)
                } else {
                    None
                };
                (*id, kind)
            })
            .collect();

        for (id, kind) in updates {
            if let Some(g) = self.generators.get_mut(&id) {
                g.terminal = kind;
            }
        }
        Ok(())
    }
}
