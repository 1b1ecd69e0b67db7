// src/engine/scheduler.rs

//! Scheduling policies: which pending tasks get started.
//!
//! The engine calls every registered [`Scheduler`] once per cycle, after
//! garbage collection. Schedulers act on the plan only through the public
//! call/emit API.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::plan::Plan;
use crate::types::{TaskId, START};

pub trait Scheduler {
    fn name(&self) -> &str;

    fn schedule(&mut self, plan: &mut Plan) -> anyhow::Result<()>;
}

/// Starts pending, executable tasks whose `start` is controllable and that
/// are either:
/// - missions or permanent tasks without parents,
/// - first children of a running parent,
/// - planners of a task that is still pending.
#[derive(Debug, Default, Clone)]
pub struct BasicScheduler;

impl BasicScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Tasks this scheduler would start right now.
    pub fn candidates(&self, plan: &Plan) -> Vec<TaskId> {
        let mut result = BTreeSet::new();

        for task in plan.missions().chain(plan.permanent_tasks.iter().copied()) {
            if plan.parents(task).is_empty() {
                result.insert(task);
            }
        }
        for task in plan.task_ids() {
            if plan.status(task).is_some_and(|s| s.running()) {
                result.extend(plan.first_children(task));
            }
            if plan.status(task).is_some_and(|s| s.pending()) {
                result.extend(plan.planning_task(task));
            }
        }

        result
            .into_iter()
            .filter(|task| is_startable(plan, *task))
            .collect()
    }
}

fn is_startable(plan: &Plan, task: TaskId) -> bool {
    if !plan.status(task).is_some_and(|s| s.pending()) || !plan.is_executable(task) {
        return false;
    }
    plan.task_event(task, START)
        .ok()
        .and_then(|g| plan.generator(g))
        .is_some_and(|g| g.is_controllable() && !g.is_unreachable())
}

impl Scheduler for BasicScheduler {
    fn name(&self) -> &str {
        "basic"
    }

    fn schedule(&mut self, plan: &mut Plan) -> anyhow::Result<()> {
        for task in self.candidates(plan) {
            debug!(%task, "scheduler starting task");
            if let Err(e) = plan.call_event(task, START) {
                warn!(%task, error = %e, "scheduler could not start task");
            }
        }
        Ok(())
    }
}
