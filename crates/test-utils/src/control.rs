use std::cell::RefCell;
use std::rc::Rc;

use planloop::engine::{DecisionControl, ErrorDecision, ExecutionException};
use planloop::errors::LocalizedError;
use planloop::plan::Plan;
use planloop::types::TaskId;

/// Decision control with fixed answers that records what it was asked.
///
/// Clones share the same log, so a test can keep one and hand the other
/// to the engine.
#[derive(Debug, Clone)]
pub struct ScriptedControl {
    pub report_pending_failures: bool,
    pub decision: ErrorDecision,
    unhandled: Rc<RefCell<Vec<String>>>,
    pending_failures: Rc<RefCell<Vec<(TaskId, TaskId)>>>,
}

impl ScriptedControl {
    pub fn new(decision: ErrorDecision) -> Self {
        Self {
            report_pending_failures: true,
            decision,
            unhandled: Rc::new(RefCell::new(Vec::new())),
            pending_failures: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn ignoring_pending_failures(mut self) -> Self {
        self.report_pending_failures = false;
        self
    }

    /// Kind names of the unhandled exceptions seen so far.
    pub fn unhandled_kinds(&self) -> Vec<String> {
        self.unhandled.borrow().clone()
    }

    /// (parent, child) pairs of dependency failures on pending parents.
    pub fn pending_failures(&self) -> Vec<(TaskId, TaskId)> {
        self.pending_failures.borrow().clone()
    }
}

impl DecisionControl for ScriptedControl {
    fn pending_dependency_failed(
        &mut self,
        _plan: &Plan,
        parent: TaskId,
        child: TaskId,
        _reason: &LocalizedError,
    ) -> bool {
        self.pending_failures.borrow_mut().push((parent, child));
        self.report_pending_failures
    }

    fn unhandled_exception(&mut self, _plan: &Plan, exception: &ExecutionException) -> ErrorDecision {
        self.unhandled
            .borrow_mut()
            .push(exception.error.kind().name().to_string());
        self.decision
    }
}
