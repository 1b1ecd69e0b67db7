// src/plan/task.rs

//! Tasks and their lifecycle.

use std::fmt;
use std::rc::Rc;

use crate::engine::exceptions::ExceptionHandler;
use crate::errors::LocalizedError;
use crate::plan::arguments::TaskArguments;
use crate::plan::model::TaskModel;
use crate::plan::Plan;
use crate::types::{EventId, GeneratorId, ReplacePolicy, TaskId};

/// Periodic handler run once per engine cycle while the task is running.
pub type PollCallback = Rc<dyn Fn(&mut Plan, TaskId) -> anyhow::Result<()>>;

/// Handler run when the task is removed from its plan.
pub type FinalizationCallback = Rc<dyn Fn(&Plan, TaskId)>;

#[derive(Clone)]
pub struct PollHandler {
    pub(crate) callback: PollCallback,
    pub(crate) on_replace: ReplacePolicy,
}

#[derive(Clone)]
pub struct FinalizationHandler {
    pub(crate) callback: FinalizationCallback,
    pub(crate) on_replace: ReplacePolicy,
}

#[derive(Clone)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) model: Rc<TaskModel>,
    pub(crate) events: Vec<(String, GeneratorId)>,
    pub(crate) arguments: TaskArguments,
    pub(crate) executable: Option<bool>,
    pub(crate) started: bool,
    pub(crate) finished: bool,
    pub(crate) failed_to_start: bool,
    pub(crate) success: Option<bool>,
    pub(crate) terminal_event: Option<EventId>,
    pub(crate) failure_event: Option<EventId>,
    pub(crate) failure_reason: Option<LocalizedError>,
    pub(crate) poll_handlers: Vec<PollHandler>,
    pub(crate) finalization_handlers: Vec<FinalizationHandler>,
    pub(crate) exception_handlers: Vec<ExceptionHandler>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn model(&self) -> &TaskModel {
        &self.model
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn is_abstract(&self) -> bool {
        self.model.is_abstract()
    }

    /// Generator bound to the event named `symbol`.
    pub fn event(&self, symbol: &str) -> Option<GeneratorId> {
        self.events
            .iter()
            .find(|(name, _)| name == symbol)
            .map(|(_, id)| *id)
    }

    pub fn events(&self) -> impl Iterator<Item = (&str, GeneratorId)> {
        self.events.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn arguments(&self) -> &TaskArguments {
        &self.arguments
    }

    /// First terminal event emitted by the task.
    pub fn terminal_event(&self) -> Option<EventId> {
        self.terminal_event
    }

    /// First failure event emitted by the task.
    pub fn failure_event(&self) -> Option<EventId> {
        self.failure_event
    }

    pub fn failure_reason(&self) -> Option<&LocalizedError> {
        self.failure_reason.as_ref()
    }

    pub fn poll_handler_count(&self) -> usize {
        self.poll_handlers.len()
    }

    pub fn finalization_handler_count(&self) -> usize {
        self.finalization_handlers.len()
    }

    pub fn exception_handler_count(&self) -> usize {
        self.exception_handlers.len()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("model", &self.model.name())
            .field("arguments", &self.arguments)
            .field("started", &self.started)
            .field("finished", &self.finished)
            .field("failed_to_start", &self.failed_to_start)
            .field("success", &self.success)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    /// `start` called but not emitted yet.
    Starting,
    Running,
    /// A terminal event was called or emitted, `stop` not emitted yet.
    Finishing,
    Finished,
}

/// Snapshot of a task's execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatus {
    pub lifecycle: Lifecycle,
    pub success: Option<bool>,
    pub failed_to_start: bool,
}

impl TaskStatus {
    pub fn pending(&self) -> bool {
        self.lifecycle == Lifecycle::Pending
    }

    pub fn starting(&self) -> bool {
        self.lifecycle == Lifecycle::Starting
    }

    pub fn running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running | Lifecycle::Finishing)
    }

    pub fn finishing(&self) -> bool {
        self.lifecycle == Lifecycle::Finishing
    }

    pub fn finished(&self) -> bool {
        self.lifecycle == Lifecycle::Finished
    }

    pub fn started(&self) -> bool {
        self.running() || (self.finished() && !self.failed_to_start)
    }

    pub fn success(&self) -> bool {
        self.success == Some(true)
    }

    pub fn failed(&self) -> bool {
        self.success == Some(false)
    }
}

impl Plan {
    pub fn status(&self, task: TaskId) -> Option<TaskStatus> {
        let t = self.tasks.get(&task)?;
        let pending = |symbol: &str| {
            t.event(symbol)
                .and_then(|g| self.generators.get(&g))
                .is_some_and(|g| g.pending)
        };

        let lifecycle = if t.finished || t.failed_to_start {
            Lifecycle::Finished
        } else if t.started {
            if self.is_terminating(task) {
                Lifecycle::Finishing
            } else {
                Lifecycle::Running
            }
        } else if pending(crate::types::START) {
            Lifecycle::Starting
        } else {
            Lifecycle::Pending
        };

        Some(TaskStatus {
            lifecycle,
            success: t.success,
            failed_to_start: t.failed_to_start,
        })
    }

    /// Handler run once per engine cycle while `task` runs. A failing poll
    /// reports `PollingFailed` on the task.
    pub fn poll(
        &mut self,
        task: TaskId,
        policy: Option<ReplacePolicy>,
        callback: PollCallback,
    ) -> crate::errors::Result<()> {
        let on_replace = policy.unwrap_or_else(|| self.default_replace_policy(task));
        self.task_mut_or_err(task)?
            .poll_handlers
            .push(PollHandler {
                callback,
                on_replace,
            });
        Ok(())
    }

    /// Handler run when `task` is removed from the plan.
    pub fn when_finalized(
        &mut self,
        task: TaskId,
        policy: Option<ReplacePolicy>,
        callback: FinalizationCallback,
    ) -> crate::errors::Result<()> {
        let on_replace = policy.unwrap_or_else(|| self.default_replace_policy(task));
        self.task_mut_or_err(task)?
            .finalization_handlers
            .push(FinalizationHandler {
                callback,
                on_replace,
            });
        Ok(())
    }

    pub(crate) fn default_replace_policy(&self, task: TaskId) -> ReplacePolicy {
        match self.tasks.get(&task) {
            Some(t) if t.is_abstract() => ReplacePolicy::Copy,
            _ => ReplacePolicy::Drop,
        }
    }

    /// True while a terminal event of `task` is pending or has been emitted.
    pub fn is_terminating(&self, task: TaskId) -> bool {
        let Some(t) = self.tasks.get(&task) else {
            return false;
        };
        t.terminal_event.is_some()
            || t.events.iter().any(|(_, g)| {
                self.generators
                    .get(g)
                    .is_some_and(|g| g.pending && g.is_terminal())
            })
    }
}
