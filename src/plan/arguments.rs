// src/plan/arguments.rs

//! Task arguments.
//!
//! Arguments are set once: a value cannot be changed after it has been
//! assigned. Arguments without a value may be covered by a model default
//! (a plain value, an explicit "nil", or a delayed argument resolved from
//! the plan). Delayed values are frozen into plain values when the task
//! starts.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::errors::{PlanError, Result};
use crate::plan::Plan;
use crate::types::{TaskId, Value};

/// Argument value computed from the plan when needed.
#[derive(Clone)]
pub struct DelayedArgument(Rc<dyn Fn(&Plan, TaskId) -> Option<Value>>);

impl DelayedArgument {
    pub fn new(resolve: impl Fn(&Plan, TaskId) -> Option<Value> + 'static) -> Self {
        Self(Rc::new(resolve))
    }

    /// Value of argument `name` on the task that plans this one.
    pub fn from_planned_task(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move |plan, task| {
            plan.planned_tasks(task)
                .into_iter()
                .find_map(|planned| plan.static_argument(planned, &name))
        })
    }

    pub(crate) fn resolve(&self, plan: &Plan, task: TaskId) -> Option<Value> {
        (self.0)(plan, task)
    }
}

impl fmt::Debug for DelayedArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DelayedArgument(..)")
    }
}

/// Model-level default of an argument.
#[derive(Debug, Clone)]
pub enum ArgumentDefault {
    /// The argument may stay unset.
    Nil,
    Value(Value),
    Delayed(DelayedArgument),
}

#[derive(Debug, Clone)]
pub struct ArgumentSpec {
    pub(crate) name: String,
    pub(crate) default: Option<ArgumentDefault>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskArguments {
    pub(crate) values: BTreeMap<String, Value>,
    pub(crate) delayed: BTreeMap<String, DelayedArgument>,
}

impl TaskArguments {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn has_delayed(&self, name: &str) -> bool {
        self.delayed.contains_key(name)
    }
}

impl Plan {
    /// Plain value assigned to `name`, ignoring delayed values and defaults.
    pub fn static_argument(&self, task: TaskId, name: &str) -> Option<Value> {
        self.tasks.get(&task)?.arguments.values.get(name).cloned()
    }

    /// Value of argument `name`: assigned value first, then explicit delayed
    /// value, then the model default.
    pub fn argument(&self, task: TaskId, name: &str) -> Option<Value> {
        let t = self.tasks.get(&task)?;
        if let Some(value) = t.arguments.values.get(name) {
            return Some(value.clone());
        }
        if let Some(delayed) = t.arguments.delayed.get(name) {
            return delayed.resolve(self, task);
        }
        let spec = t.model.arguments.iter().find(|a| a.name == name)?;
        match spec.default.as_ref()? {
            ArgumentDefault::Nil => None,
            ArgumentDefault::Value(v) => Some(v.clone()),
            ArgumentDefault::Delayed(d) => d.resolve(self, task),
        }
    }

    fn argument_available(&self, task: TaskId, name: &str) -> bool {
        let Some(t) = self.tasks.get(&task) else {
            return false;
        };
        if t.arguments.values.contains_key(name) {
            return true;
        }
        if let Some(delayed) = t.arguments.delayed.get(name) {
            return delayed.resolve(self, task).is_some();
        }
        match t
            .model
            .arguments
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.default.as_ref())
        {
            Some(ArgumentDefault::Nil) | Some(ArgumentDefault::Value(_)) => true,
            Some(ArgumentDefault::Delayed(d)) => d.resolve(self, task).is_some(),
            None => false,
        }
    }

    /// Declared arguments that have neither a value nor a usable default.
    pub fn missing_arguments(&self, task: TaskId) -> Vec<String> {
        let Some(t) = self.tasks.get(&task) else {
            return Vec::new();
        };
        t.model
            .arguments
            .iter()
            .filter(|a| !self.argument_available(task, &a.name))
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn fully_instantiated(&self, task: TaskId) -> bool {
        self.missing_arguments(task).is_empty()
    }

    /// Assigned arguments that are declared by the task model.
    pub fn meaningful_arguments(&self, task: TaskId) -> BTreeMap<String, Value> {
        let Some(t) = self.tasks.get(&task) else {
            return BTreeMap::new();
        };
        t.arguments
            .values
            .iter()
            .filter(|(name, _)| t.model.arguments.iter().any(|a| &a.name == *name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Assign argument `name`. Re-assigning the same value is a no-op;
    /// changing it is an error.
    pub fn set_argument(&mut self, task: TaskId, name: &str, value: Value) -> Result<()> {
        let t = self.task_mut_or_err(task)?;
        match t.arguments.values.get(name) {
            Some(existing) if *existing == value => Ok(()),
            Some(existing) => Err(PlanError::Argument(format!(
                "cannot override argument '{name}' of {task}: already set to {existing}"
            ))),
            None => {
                t.arguments.delayed.remove(name);
                t.arguments.values.insert(name.to_string(), value);
                Ok(())
            }
        }
    }

    pub fn set_delayed_argument(
        &mut self,
        task: TaskId,
        name: &str,
        delayed: DelayedArgument,
    ) -> Result<()> {
        let t = self.task_mut_or_err(task)?;
        if t.arguments.values.contains_key(name) {
            return Err(PlanError::Argument(format!(
                "cannot override argument '{name}' of {task}: already set"
            )));
        }
        t.arguments.delayed.insert(name.to_string(), delayed);
        Ok(())
    }

    /// Resolve delayed values and defaults into plain values.
    pub(crate) fn freeze_arguments(&mut self, task: TaskId) {
        let Some(t) = self.tasks.get(&task) else {
            return;
        };
        let mut names: Vec<String> = t.arguments.delayed.keys().cloned().collect();
        names.extend(t.model.arguments.iter().map(|a| a.name.clone()));

        let resolved: Vec<(String, Value)> = names
            .into_iter()
            .filter(|name| !t.arguments.values.contains_key(name))
            .filter_map(|name| self.argument(task, &name).map(|v| (name, v)))
            .collect();

        if let Some(t) = self.tasks.get_mut(&task) {
            t.arguments.delayed.clear();
            for (name, value) in resolved {
                debug!(%task, argument = %name, %value, "froze argument");
                t.arguments.values.insert(name, value);
            }
        }
    }
}
