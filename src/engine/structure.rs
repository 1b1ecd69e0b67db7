// src/engine/structure.rs

//! Structure checks: plan-wide invariants evaluated once per cycle.
//!
//! Each check inspects the plan and reports [`StructureError`]s. The
//! built-in checks cover dependencies, missions and planning tasks; more
//! can be registered with [`Plan::add_structure_check`].

use std::rc::Rc;

use crate::engine::exceptions::{DecisionControl, DefaultDecisionControl};
use crate::errors::{ErrorKind, FailurePoint, LocalizedError};
use crate::plan::Plan;
use crate::relations::dependency::{check_dependencies, completed_dependencies};
use crate::relations::planning::check_planning;
use crate::types::TaskId;

pub type StructureCheck = Rc<dyn Fn(&Plan, &mut dyn DecisionControl) -> Vec<StructureError>>;

/// A fault found by a structure check, with the tasks it involves (the
/// first one is where exception propagation starts).
#[derive(Debug, Clone)]
pub struct StructureError {
    pub error: LocalizedError,
    pub involved: Vec<TaskId>,
}

pub(crate) fn default_structure_checks() -> Vec<(String, StructureCheck)> {
    vec![
        ("dependency".to_string(), Rc::new(check_dependencies) as StructureCheck),
        ("missions".to_string(), Rc::new(check_missions) as StructureCheck),
        ("planning".to_string(), Rc::new(check_planning) as StructureCheck),
    ]
}

/// Reports missions that finished without success.
fn check_missions(plan: &Plan, _control: &mut dyn DecisionControl) -> Vec<StructureError> {
    plan.missions
        .iter()
        .copied()
        .filter(|m| plan.status(*m).is_some_and(|s| s.finished() && !s.success()))
        .map(|mission| {
            let point = plan
                .task(mission)
                .and_then(|t| t.failure_event.or(t.terminal_event))
                .map(FailurePoint::Event)
                .unwrap_or(FailurePoint::Task(mission));
            StructureError {
                error: plan.localize(ErrorKind::MissionFailed, point),
                involved: vec![mission],
            }
        })
        .collect()
}

impl Plan {
    pub fn add_structure_check(&mut self, name: impl Into<String>, check: StructureCheck) {
        self.structure_checks.push((name.into(), check));
    }

    pub fn structure_check_names(&self) -> Vec<&str> {
        self.structure_checks.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Run all structure checks with the default decision policy.
    pub fn check_structure(&mut self) -> Vec<StructureError> {
        self.check_structure_with(&mut DefaultDecisionControl)
    }

    /// Run all structure checks. Dependencies found completed are scheduled
    /// for removal at the next garbage collection.
    pub fn check_structure_with(&mut self, control: &mut dyn DecisionControl) -> Vec<StructureError> {
        let done = completed_dependencies(self);
        self.completed_dependencies.extend(done);

        let checks = self.structure_checks.clone();
        checks
            .iter()
            .flat_map(|(_, check)| check(self, control))
            .collect()
    }
}
