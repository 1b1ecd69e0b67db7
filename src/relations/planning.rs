// src/relations/planning.rs

//! The planning relation: a planning task produces (part of) the plan of
//! another task. Edges go from the planned task to its planner.

use tracing::debug;

use crate::engine::exceptions::DecisionControl;
use crate::engine::structure::StructureError;
use crate::errors::{ErrorKind, FailurePoint, PlanError, Result};
use crate::plan::Plan;
use crate::types::TaskId;

impl Plan {
    pub fn planned_by(&mut self, planned: TaskId, planner: TaskId) -> Result<()> {
        self.task_or_err(planned)?;
        self.task_or_err(planner)?;
        if planned == planner {
            return Err(PlanError::RelationCycle(format!(
                "{planned} cannot plan itself"
            )));
        }
        if self.relations.planning.reaches(planner, planned) {
            return Err(PlanError::RelationCycle(format!(
                "{planner} is already planned by {planned}"
            )));
        }
        self.relations.planning.add_edge(planned, planner, ());
        debug!(%planned, %planner, "added planning relation");
        Ok(())
    }

    pub fn remove_planning(&mut self, planned: TaskId, planner: TaskId) -> bool {
        self.relations.planning.remove_edge(planned, planner).is_some()
    }

    pub fn planning_task(&self, planned: TaskId) -> Option<TaskId> {
        self.relations.planning.children(planned).into_iter().next()
    }

    pub fn planned_tasks(&self, planner: TaskId) -> Vec<TaskId> {
        self.relations.planning.parents(planner)
    }
}

/// Reports planners that finished without success while the task they
/// plan has not finished.
pub(crate) fn check_planning(plan: &Plan, _control: &mut dyn DecisionControl) -> Vec<StructureError> {
    let mut errors = Vec::new();
    for (planned, planner, _) in plan.relations.planning.edges() {
        let Some(planner_status) = plan.status(planner) else {
            continue;
        };
        if !planner_status.finished() || planner_status.success() {
            continue;
        }
        if plan.status(planned).is_some_and(|s| s.finished()) {
            continue;
        }
        let point = plan
            .task(planner)
            .and_then(|t| t.failure_event.or(t.terminal_event))
            .map(FailurePoint::Event)
            .unwrap_or(FailurePoint::Task(planner));
        errors.push(StructureError {
            error: plan.localize(ErrorKind::PlanningFailed { planned }, point),
            involved: vec![planner, planned],
        });
    }
    errors
}
