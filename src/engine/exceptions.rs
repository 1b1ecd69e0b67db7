// src/engine/exceptions.rs

//! Exception handling.
//!
//! Every fault produced by a structure check becomes an execution
//! exception that travels up the dependency graph, starting at the tasks
//! it involves. Exception handlers registered on the tasks along the way
//! get a chance to handle it; what nobody handles goes to the
//! [`DecisionControl`] policy, which decides to ignore it, kill the
//! tasks it traveled through, or escalate it as fatal.

use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::engine::structure::StructureError;
use crate::errors::{ErrorKind, FailurePoint, LocalizedError, Result};
use crate::plan::Plan;
use crate::types::{ReplacePolicy, TaskId, STOP};

/// Policy consulted for decisions the engine cannot take alone.
pub trait DecisionControl {
    /// A dependency of a pending parent failed. Return `true` to report it
    /// now, `false` to ignore it.
    fn pending_dependency_failed(
        &mut self,
        plan: &Plan,
        parent: TaskId,
        child: TaskId,
        reason: &LocalizedError,
    ) -> bool {
        let _ = (plan, parent, child, reason);
        true
    }

    /// Nobody handled `exception`.
    fn unhandled_exception(&mut self, plan: &Plan, exception: &ExecutionException) -> ErrorDecision {
        let _ = (plan, exception);
        ErrorDecision::KillSubtree
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecisionControl;

impl DecisionControl for DefaultDecisionControl {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    Ignore,
    /// Stop every task the exception traveled through and drop their
    /// mission/permanent status.
    KillSubtree,
    /// Make the error fatal: the current cycle aborts.
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionAction {
    Handled,
    /// Let the next handler (or the next task up) have a go.
    Pass,
}

pub type ExceptionCallback =
    Rc<dyn Fn(&mut Plan, TaskId, &LocalizedError) -> anyhow::Result<ExceptionAction>>;

/// Which errors an exception handler is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorFilter {
    Any,
    /// Errors whose kind has this name (see [`ErrorKind::name`]).
    Kind(String),
}

impl ErrorFilter {
    pub fn kind(name: impl Into<String>) -> Self {
        ErrorFilter::Kind(name.into())
    }

    pub fn matches(&self, error: &LocalizedError) -> bool {
        match self {
            ErrorFilter::Any => true,
            ErrorFilter::Kind(name) => error.kind().name() == name,
        }
    }
}

#[derive(Clone)]
pub struct ExceptionHandler {
    pub(crate) filter: ErrorFilter,
    pub(crate) callback: ExceptionCallback,
    pub(crate) on_replace: ReplacePolicy,
}

#[derive(Debug, Clone)]
pub struct ExecutionException {
    pub error: LocalizedError,
    /// Tasks the exception traveled through, in order.
    pub trace: Vec<TaskId>,
    pub handled_by: Option<TaskId>,
}

#[derive(Debug, Clone, Default)]
pub struct ExceptionOutcome {
    pub handled: Vec<ExecutionException>,
    pub unhandled: Vec<ExecutionException>,
    pub killed: Vec<TaskId>,
    pub fatal: Vec<LocalizedError>,
}

impl Plan {
    /// Register an exception handler on `task`.
    pub fn on_exception(
        &mut self,
        task: TaskId,
        filter: ErrorFilter,
        policy: Option<ReplacePolicy>,
        callback: ExceptionCallback,
    ) -> Result<()> {
        let on_replace = policy.unwrap_or_else(|| self.default_replace_policy(task));
        self.task_mut_or_err(task)?
            .exception_handlers
            .push(ExceptionHandler {
                filter,
                callback,
                on_replace,
            });
        Ok(())
    }
}

/// Tasks involved in `error`, then their ancestors breadth-first.
pub fn exception_trace(plan: &Plan, error: &StructureError) -> Vec<TaskId> {
    let mut seen = BTreeSet::new();
    let mut trace = Vec::new();
    let mut queue: VecDeque<TaskId> = error.error.failed_task().into_iter().collect();
    queue.extend(error.involved.iter().copied());

    while let Some(task) = queue.pop_front() {
        if !plan.contains_task(task) || !seen.insert(task) {
            continue;
        }
        trace.push(task);
        queue.extend(plan.parents(task));
    }
    trace
}

pub fn handle_exceptions(
    plan: &mut Plan,
    control: &mut dyn DecisionControl,
    errors: Vec<StructureError>,
) -> ExceptionOutcome {
    let mut outcome = ExceptionOutcome::default();
    let mut queue: VecDeque<StructureError> = errors.into();

    while let Some(structure_error) = queue.pop_front() {
        let mut exception = ExecutionException {
            error: structure_error.error.clone(),
            trace: exception_trace(plan, &structure_error),
            handled_by: None,
        };

        'trace: for task in exception.trace.clone() {
            let handlers = plan
                .task(task)
                .map(|t| t.exception_handlers.clone())
                .unwrap_or_default();
            for handler in handlers.iter().filter(|h| h.filter.matches(&exception.error)) {
                match (handler.callback)(plan, task, &exception.error) {
                    Ok(ExceptionAction::Handled) => {
                        exception.handled_by = Some(task);
                        break 'trace;
                    }
                    Ok(ExceptionAction::Pass) => {}
                    Err(e) => {
                        let failed = plan.localize(
                            ErrorKind::FailedExceptionHandler {
                                error: Arc::new(e),
                                handled: Box::new(exception.error.clone()),
                            },
                            FailurePoint::Task(task),
                        );
                        warn!(%failed, "exception handler failed");
                        queue.push_back(StructureError {
                            error: failed,
                            involved: vec![task],
                        });
                    }
                }
            }
        }

        if let Some(task) = exception.handled_by {
            info!(%task, error = %exception.error, "exception handled");
            outcome.handled.push(exception);
            continue;
        }

        match control.unhandled_exception(plan, &exception) {
            ErrorDecision::Ignore => {
                warn!(error = %exception.error, "ignoring unhandled exception");
            }
            ErrorDecision::KillSubtree => {
                warn!(error = %exception.error, trace = ?exception.trace, "unhandled exception, killing tasks");
                let (killed, fatal) = kill_tasks(plan, &exception.trace);
                outcome.killed.extend(killed);
                outcome.fatal.extend(fatal);
            }
            ErrorDecision::Escalate => {
                error!(error = %exception.error, "unhandled exception escalated as fatal");
                outcome.fatal.push(exception.error.clone());
            }
        }
        outcome.unhandled.push(exception);
    }
    outcome
}

/// Drop mission/permanent status of `tasks` and stop the running ones.
fn kill_tasks(plan: &mut Plan, tasks: &[TaskId]) -> (Vec<TaskId>, Vec<LocalizedError>) {
    let mut killed = Vec::new();
    let mut fatal = Vec::new();
    for &task in tasks {
        plan.unmark_mission(task);
        plan.unmark_permanent(task);

        let Some(status) = plan.status(task) else {
            continue;
        };
        if !status.running() {
            continue;
        }
        let stop = match plan.task_event(task, STOP) {
            Ok(stop) => stop,
            Err(_) => continue,
        };
        if plan.generator(stop).is_some_and(|g| g.is_pending()) {
            continue;
        }
        if !plan.generator(stop).is_some_and(|g| g.is_controllable()) {
            warn!(%task, "cannot stop task: stop is not controllable");
            continue;
        }
        let (result, errors) = plan.propagate_collect(|p| p.call(stop, Vec::new()));
        if let Err(e) = result {
            warn!(%task, error = %e, "failed to stop task");
        }
        fatal.extend(errors);
        killed.push(task);
    }
    (killed, fatal)
}
