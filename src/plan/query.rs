// src/plan/query.rs

//! Task queries over a plan.

use regex::Regex;

use crate::errors::{PlanError, Result};
use crate::plan::{Plan, TaskStatus};
use crate::types::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateFilter {
    Pending,
    Running,
    Finished,
    Succeeded,
    Failed,
}

impl StateFilter {
    fn matches(self, status: &TaskStatus) -> bool {
        match self {
            StateFilter::Pending => status.pending(),
            StateFilter::Running => status.running(),
            StateFilter::Finished => status.finished(),
            StateFilter::Succeeded => status.success(),
            StateFilter::Failed => status.failed(),
        }
    }
}

/// Filter over the tasks of a plan, built with [`Plan::find_tasks`].
#[derive(Debug, Clone)]
pub struct TaskQuery<'a> {
    plan: &'a Plan,
    models: Vec<String>,
    name_pattern: Option<Regex>,
    states: Vec<StateFilter>,
    missions_only: bool,
}

impl Plan {
    pub fn find_tasks(&self) -> TaskQuery<'_> {
        TaskQuery {
            plan: self,
            models: Vec::new(),
            name_pattern: None,
            states: Vec::new(),
            missions_only: false,
        }
    }
}

impl<'a> TaskQuery<'a> {
    /// Tasks whose model fulfills `model` (a model name or a tag).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.push(model.into());
        self
    }

    /// Tasks whose model name matches `pattern`.
    pub fn model_matching(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| PlanError::Argument(format!("invalid model pattern '{pattern}': {e}")))?;
        self.name_pattern = Some(regex);
        Ok(self)
    }

    pub fn pending(mut self) -> Self {
        self.states.push(StateFilter::Pending);
        self
    }

    pub fn running(mut self) -> Self {
        self.states.push(StateFilter::Running);
        self
    }

    pub fn finished(mut self) -> Self {
        self.states.push(StateFilter::Finished);
        self
    }

    pub fn succeeded(mut self) -> Self {
        self.states.push(StateFilter::Succeeded);
        self
    }

    pub fn failed(mut self) -> Self {
        self.states.push(StateFilter::Failed);
        self
    }

    pub fn missions(mut self) -> Self {
        self.missions_only = true;
        self
    }

    pub fn to_vec(&self) -> Vec<TaskId> {
        self.plan
            .tasks
            .values()
            .filter(|task| self.models.iter().all(|m| task.model.fullfills(m)))
            .filter(|task| {
                self.name_pattern
                    .as_ref()
                    .is_none_or(|re| re.is_match(task.model_name()))
            })
            .filter(|task| !self.missions_only || self.plan.missions.contains(&task.id))
            .filter(|task| match self.plan.status(task.id) {
                Some(status) => self.states.iter().all(|s| s.matches(&status)),
                None => false,
            })
            .map(|task| task.id)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.to_vec().len()
    }

    pub fn first(&self) -> Option<TaskId> {
        self.to_vec().into_iter().next()
    }
}
