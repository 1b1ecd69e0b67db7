// src/engine/replace.rs

//! Task replacement.
//!
//! `replace(old, new)` makes `new` take the place of `old` in the plan:
//! the dependencies on `old` move to `new`, and so do its planner and its
//! mission/permanent status. Handlers registered with
//! [`ReplacePolicy::Copy`] are copied onto `new`; the others stay with
//! `old`. Either everything moves or nothing does.

use tracing::info;

use crate::errors::{PlanError, Result};
use crate::plan::Plan;
use crate::relations::dependency::DependencyOptions;
use crate::types::{ReplacePolicy, TaskId};

impl Plan {
    pub fn replace(&mut self, old: TaskId, new: TaskId) -> Result<()> {
        if self.is_propagating() {
            return Err(PlanError::PhaseMismatch(
                "cannot replace a task during propagation".to_string(),
            ));
        }
        self.task_or_err(old)?;
        self.task_or_err(new)?;
        let invalid = |reason: String| PlanError::InvalidReplace {
            from: old,
            to: new,
            reason,
        };
        if old == new {
            return Err(invalid("a task cannot replace itself".to_string()));
        }

        let required = self.fullfilled_model(old).map_err(|e| invalid(e.to_string()))?;
        self.validate_fulfillment(new, &required)
            .map_err(|e| invalid(e.to_string()))?;

        // Work on a copy so that a failure half-way leaves the plan untouched.
        let mut next = self.clone();
        next.move_relations(old, new).map_err(|e| invalid(e.to_string()))?;
        next.copy_handlers(old, new);

        *self = next;
        info!(%old, %new, "replaced task");
        Ok(())
    }

    fn move_relations(&mut self, old: TaskId, new: TaskId) -> Result<()> {
        for parent in self.parents(old) {
            let Some(info) = self.remove_dependency(parent, old) else {
                continue;
            };
            self.depends_on(parent, new, DependencyOptions::from_info(&info))?;
        }

        if let Some(planner) = self.planning_task(old) {
            self.remove_planning(old, planner);
            if self.planning_task(new).is_none() && planner != new {
                self.planned_by(new, planner)?;
            }
        }

        if self.missions.remove(&old) {
            self.missions.insert(new);
        }
        if self.permanent_tasks.remove(&old) {
            self.permanent_tasks.insert(new);
        }
        Ok(())
    }

    fn copy_handlers(&mut self, old: TaskId, new: TaskId) {
        let Some(old_task) = self.tasks.get(&old) else {
            return;
        };
        let copy = |policy: ReplacePolicy| policy == ReplacePolicy::Copy;

        let polls: Vec<_> = old_task
            .poll_handlers
            .iter()
            .filter(|h| copy(h.on_replace))
            .cloned()
            .collect();
        let finalization: Vec<_> = old_task
            .finalization_handlers
            .iter()
            .filter(|h| copy(h.on_replace))
            .cloned()
            .collect();
        let exceptions: Vec<_> = old_task
            .exception_handlers
            .iter()
            .filter(|h| copy(h.on_replace))
            .cloned()
            .collect();
        let event_handlers: Vec<_> = old_task
            .events
            .iter()
            .filter_map(|(symbol, g)| {
                let handlers: Vec<_> = self
                    .generators
                    .get(g)?
                    .handlers
                    .iter()
                    .filter(|h| copy(h.on_replace))
                    .cloned()
                    .collect();
                Some((symbol.clone(), handlers))
            })
            .collect();

        for (symbol, handlers) in event_handlers {
            let target = self.tasks.get(&new).and_then(|t| t.event(&symbol));
            if let Some(g) = target.and_then(|g| self.generators.get_mut(&g)) {
                g.handlers.extend(handlers);
            }
        }
        if let Some(t) = self.tasks.get_mut(&new) {
            t.poll_handlers.extend(polls);
            t.finalization_handlers.extend(finalization);
            t.exception_handlers.extend(exceptions);
        }
    }
}
