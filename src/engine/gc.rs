// src/engine/gc.rs

//! Garbage collection of plan objects nobody needs anymore.
//!
//! A task is useful if it is a mission, a permanent task, or reachable from
//! one through dependency edges (parent to child) or planning edges
//! (planned task to planner). Useless tasks that are pending or finished
//! are removed; useless running tasks are asked to stop and removed once
//! they finished. Free events are removed when they are neither permanent,
//! pending, nor related to anything.
//!
//! Collection runs to a fixed point: removing one object can make others
//! useless.

use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, info, warn};

use crate::errors::{LocalizedError, PlanError, Result};
use crate::plan::{Plan, UnreachableReason};
use crate::types::{GeneratorId, TaskId, STOP};

#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub removed_tasks: Vec<TaskId>,
    pub removed_events: Vec<GeneratorId>,
    pub removed_dependencies: Vec<(TaskId, TaskId)>,
    /// Running tasks asked to stop during this collection.
    pub stopping: Vec<TaskId>,
    pub fatal: Vec<LocalizedError>,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.removed_tasks.is_empty()
            && self.removed_events.is_empty()
            && self.removed_dependencies.is_empty()
            && self.stopping.is_empty()
    }
}

impl Plan {
    /// Tasks reachable from missions and permanent tasks.
    pub fn useful_tasks(&self) -> BTreeSet<TaskId> {
        let mut useful = BTreeSet::new();
        let mut queue: VecDeque<TaskId> = self
            .missions
            .iter()
            .chain(&self.permanent_tasks)
            .copied()
            .collect();
        while let Some(task) = queue.pop_front() {
            if !self.tasks.contains_key(&task) || !useful.insert(task) {
                continue;
            }
            queue.extend(self.relations.dependency.children(task));
            queue.extend(self.relations.planning.children(task));
        }
        useful
    }

    pub fn garbage_collect(&mut self) -> Result<GcReport> {
        if self.is_propagating() {
            return Err(PlanError::PhaseMismatch(
                "cannot garbage collect during propagation".to_string(),
            ));
        }
        let mut report = GcReport::default();

        for (parent, child) in std::mem::take(&mut self.completed_dependencies) {
            if self.relations.dependency.remove_edge(parent, child).is_some() {
                debug!(%parent, %child, "removed completed dependency");
                report.removed_dependencies.push((parent, child));
            }
        }

        loop {
            let useful = self.useful_tasks();
            let candidates: Vec<TaskId> = self
                .tasks
                .keys()
                .copied()
                .filter(|t| !useful.contains(t))
                .collect();

            let mut changed = false;
            for task in candidates {
                let Some(status) = self.status(task) else {
                    continue;
                };
                if status.pending() || status.finished() {
                    let (result, fatal) = self.propagate_collect(|plan| {
                        plan.remove_task_internal(task);
                        Ok(())
                    });
                    if let Err(e) = result {
                        warn!(%task, error = %e, "failed to remove task");
                    }
                    report.fatal.extend(fatal);
                    info!(%task, "garbage collected task");
                    report.removed_tasks.push(task);
                    changed = true;
                } else if status.running() && !self.gc_stopping.contains(&task) {
                    self.gc_stopping.insert(task);
                    report.stopping.push(task);
                    report.fatal.extend(self.gc_stop(task));
                    changed = true;
                }
            }

            let free: Vec<GeneratorId> = self
                .generators
                .values()
                .filter(|g| {
                    g.task.is_none()
                        && !g.pending
                        && !self.permanent_events.contains(&g.id)
                        && !self.relations.has_event_edges(g.id)
                })
                .map(|g| g.id)
                .collect();
            for generator in free {
                let (_, fatal) = self.propagate_collect(|plan| {
                    plan.remove_generator_internal(generator);
                    Ok(())
                });
                report.fatal.extend(fatal);
                debug!(%generator, "garbage collected free event");
                report.removed_events.push(generator);
                changed = true;
            }

            if !changed {
                break;
            }
        }
        Ok(report)
    }

    fn gc_stop(&mut self, task: TaskId) -> Vec<LocalizedError> {
        let stop = self
            .task_event(task, STOP)
            .ok()
            .filter(|g| self.generator(*g).is_some_and(|g| g.is_controllable()));
        let Some(stop) = stop else {
            warn!(%task, "useless task cannot be stopped, waiting for it to finish");
            return Vec::new();
        };
        if self.generator(stop).is_some_and(|g| g.is_pending()) {
            return Vec::new();
        }
        info!(%task, "stopping useless task");
        let (result, fatal) = self.propagate_collect(|plan| plan.call(stop, Vec::new()));
        if let Err(e) = result {
            warn!(%task, error = %e, "failed to stop useless task");
        }
        fatal
    }

    /// Remove `task` from the plan. Its generators become unreachable and
    /// its finalization handlers run.
    pub fn remove_task(&mut self, task: TaskId) -> Result<()> {
        if self.is_propagating() {
            return Err(PlanError::PhaseMismatch(
                "cannot remove a task during propagation".to_string(),
            ));
        }
        self.task_or_err(task)?;
        self.propagate(|plan| {
            plan.remove_task_internal(task);
            Ok(())
        })
    }

    /// Remove the free event `generator` from the plan.
    pub fn remove_free_event(&mut self, generator: GeneratorId) -> Result<()> {
        if self.is_propagating() {
            return Err(PlanError::PhaseMismatch(
                "cannot remove an event during propagation".to_string(),
            ));
        }
        if self.generator_or_err(generator)?.task.is_some() {
            return Err(PlanError::Argument(format!(
                "{generator} belongs to a task, remove the task instead"
            )));
        }
        self.propagate(|plan| {
            plan.remove_generator_internal(generator);
            Ok(())
        })
    }

    pub(crate) fn remove_task_internal(&mut self, task: TaskId) {
        let handlers = self
            .tasks
            .get(&task)
            .map(|t| t.finalization_handlers.clone())
            .unwrap_or_default();
        for handler in handlers {
            (handler.callback)(self, task);
        }

        self.mark_task_unreachable(task, UnreachableReason::Removed);
        let Some(removed) = self.tasks.remove(&task) else {
            return;
        };
        for (_, generator) in &removed.events {
            self.generators.remove(generator);
            self.relations.remove_generator(*generator);
        }
        self.events.retain(|_, e| e.task != Some(task));
        self.relations.remove_task(task);
        self.missions.remove(&task);
        self.permanent_tasks.remove(&task);
        self.gc_stopping.remove(&task);
        self.completed_dependencies
            .retain(|(parent, child)| *parent != task && *child != task);
    }

    fn remove_generator_internal(&mut self, generator: GeneratorId) {
        self.mark_unreachable(generator, UnreachableReason::Removed);
        self.generators.remove(&generator);
        self.relations.remove_generator(generator);
        self.permanent_events.remove(&generator);
        self.events.retain(|_, e| e.generator != generator);
    }
}
