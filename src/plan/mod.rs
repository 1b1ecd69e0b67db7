// src/plan/mod.rs

//! The plan: the set of tasks, free events and relations being executed.
//!
//! The plan is an arena. Tasks, generators and emitted events are stored in
//! ordered maps keyed by their ids, relations are stored as graphs over
//! those ids (see [`crate::relations`]). Everything that changes execution
//! state (calls, emissions, unreachability) goes through the propagation
//! code in [`crate::engine::propagation`].

pub mod arguments;
pub mod event;
pub mod generator;
pub mod model;
pub mod query;
pub mod task;

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::{debug, info};

use crate::engine::propagation::PropagationState;
use crate::engine::structure::{default_structure_checks, StructureCheck};
use crate::errors::{ErrorKind, FailurePoint, LocalizedError, PlanError, Result};
use crate::relations::Relations;
use crate::types::{EventId, GeneratorId, ReplacePolicy, TaskId, Value, START};

pub use arguments::{ArgumentDefault, DelayedArgument, TaskArguments};
pub use event::Event;
pub use generator::{
    call_sibling, emit_command, emit_sibling, noop_command, Command, CommandContext,
    EventCallback, EventGenerator, PreconditionCheck, UnreachableCallback, UnreachableReason,
};
pub use model::{EventSpec, ModelRegistry, TaskModel, TaskModelBuilder, ROOT_MODEL, SIMPLE_MODEL};
pub use query::TaskQuery;
pub use task::{
    FinalizationCallback, Lifecycle, PollCallback, Task, TaskStatus,
};

#[derive(Clone)]
pub struct Plan {
    pub(crate) models: ModelRegistry,
    pub(crate) tasks: BTreeMap<TaskId, Task>,
    pub(crate) generators: BTreeMap<GeneratorId, EventGenerator>,
    pub(crate) events: BTreeMap<EventId, Event>,
    pub(crate) relations: Relations,
    pub(crate) missions: BTreeSet<TaskId>,
    pub(crate) permanent_tasks: BTreeSet<TaskId>,
    pub(crate) permanent_events: BTreeSet<GeneratorId>,
    pub(crate) structure_checks: Vec<(String, StructureCheck)>,
    pub(crate) completed_dependencies: BTreeSet<(TaskId, TaskId)>,
    pub(crate) gc_stopping: BTreeSet<TaskId>,
    pub(crate) propagation: PropagationState,
    pub(crate) executable: bool,
    next_id: u64,
}

/// Ids reserved for a task and its generators, in model event order.
#[derive(Debug, Clone)]
pub(crate) struct TaskIds {
    pub(crate) task: TaskId,
    pub(crate) events: Vec<GeneratorId>,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("tasks", &self.tasks.len())
            .field("generators", &self.generators.len())
            .field("events", &self.events.len())
            .field("missions", &self.missions)
            .field("permanent_tasks", &self.permanent_tasks)
            .field("executable", &self.executable)
            .finish_non_exhaustive()
    }
}

impl Plan {
    /// Executable plan with the built-in models only.
    pub fn new() -> Self {
        Self::with_models(ModelRegistry::new())
    }

    pub fn with_models(models: ModelRegistry) -> Self {
        Self {
            models,
            tasks: BTreeMap::new(),
            generators: BTreeMap::new(),
            events: BTreeMap::new(),
            relations: Relations::default(),
            missions: BTreeSet::new(),
            permanent_tasks: BTreeSet::new(),
            permanent_events: BTreeSet::new(),
            structure_checks: default_structure_checks(),
            completed_dependencies: BTreeSet::new(),
            gc_stopping: BTreeSet::new(),
            propagation: PropagationState::default(),
            executable: true,
            next_id: 1,
        }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut ModelRegistry {
        &mut self.models
    }

    pub fn is_executable_plan(&self) -> bool {
        self.executable
    }

    /// A non-executable plan accepts edits but refuses every call and
    /// emission.
    pub fn set_plan_executable(&mut self, executable: bool) {
        self.executable = executable;
    }

    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// The id the next allocation would return.
    pub(crate) fn peek_next_id(&self) -> u64 {
        self.next_id
    }

    /// Make sure ids below `next` are never allocated.
    pub(crate) fn reserve_ids(&mut self, next: u64) {
        self.next_id = self.next_id.max(next);
    }

    pub(crate) fn allocate_task_ids(&mut self, model: &TaskModel) -> TaskIds {
        let task = TaskId(self.allocate_id());
        let events = model
            .events
            .iter()
            .map(|_| GeneratorId(self.allocate_id()))
            .collect();
        TaskIds { task, events }
    }

    /// Add a task of `model` without arguments.
    pub fn add_task(&mut self, model: &str) -> Result<TaskId> {
        self.add_task_with(model, std::iter::empty::<(String, Value)>())
    }

    pub fn add_task_with<K, I>(&mut self, model: &str, arguments: I) -> Result<TaskId>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let model = self.models.get_or_err(model)?;
        let arguments: BTreeMap<String, Value> =
            arguments.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let model_name = model.name().to_string();
        let ids = self.allocate_task_ids(&model);
        let id = self.instantiate_task(model, arguments, ids)?;
        debug!(task = %id, model = %model_name, "added task");
        Ok(id)
    }

    pub fn add_mission(&mut self, model: &str) -> Result<TaskId> {
        let id = self.add_task(model)?;
        self.missions.insert(id);
        Ok(id)
    }

    pub fn add_permanent(&mut self, model: &str) -> Result<TaskId> {
        let id = self.add_task(model)?;
        self.permanent_tasks.insert(id);
        Ok(id)
    }

    pub(crate) fn instantiate_task(
        &mut self,
        model: Rc<TaskModel>,
        arguments: BTreeMap<String, Value>,
        ids: TaskIds,
    ) -> Result<TaskId> {
        if ids.events.len() != model.events.len() || self.tasks.contains_key(&ids.task) {
            return Err(PlanError::Ownership(format!(
                "cannot instantiate {} with the given ids",
                model.name()
            )));
        }

        let task_id = ids.task;
        let mut events = Vec::with_capacity(model.events.len());
        for (event, gid) in model.events.iter().zip(&ids.events) {
            // Model handlers come with the model; the replacing task has its own.
            let on_replace = ReplacePolicy::Drop;
            let handlers = model
                .handlers
                .iter()
                .filter(|(name, _)| *name == event.name)
                .map(|(_, callback)| generator::EventHandler {
                    callback: callback.clone(),
                    on_replace,
                })
                .collect();
            let generator = EventGenerator {
                id: *gid,
                task: Some(task_id),
                symbol: Some(event.name.clone()),
                command: event.command.clone(),
                model_terminal: event.terminal,
                terminal: event.terminal,
                executable: None,
                pending: false,
                history: Vec::new(),
                unreachable: None,
                handlers,
                unreachable_handlers: Vec::new(),
                preconditions: Vec::new(),
            };
            self.generators.insert(*gid, generator);
            events.push((event.name.clone(), *gid));
        }

        let lookup = |name: &str| {
            events
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
        };
        for (from, to) in &model.signals {
            if let (Some(a), Some(b)) = (lookup(from), lookup(to)) {
                self.relations.signal.add_edge(a, b, ());
            }
        }
        for (from, to) in &model.forwards {
            if let (Some(a), Some(b)) = (lookup(from), lookup(to)) {
                self.relations.forwarding.add_edge(a, b, ());
            }
        }
        for (from, to) in &model.causal_links {
            if let (Some(a), Some(b)) = (lookup(from), lookup(to)) {
                self.relations.causal_link.add_edge(a, b, ());
            }
        }

        let poll_handlers = model
            .polls
            .iter()
            .map(|callback| task::PollHandler {
                callback: callback.clone(),
                on_replace: ReplacePolicy::Drop,
            })
            .collect();

        let task = Task {
            id: task_id,
            model,
            events,
            arguments: TaskArguments {
                values: arguments,
                delayed: BTreeMap::new(),
            },
            executable: None,
            started: false,
            finished: false,
            failed_to_start: false,
            success: None,
            terminal_event: None,
            failure_event: None,
            failure_reason: None,
            poll_handlers,
            finalization_handlers: Vec::new(),
            exception_handlers: Vec::new(),
        };
        self.tasks.insert(task_id, task);
        Ok(task_id)
    }

    /// Add a free event (not bound to a task).
    pub fn add_free_event(&mut self, command: Option<Command>) -> GeneratorId {
        let id = GeneratorId(self.allocate_id());
        self.generators.insert(id, EventGenerator::free(id, command));
        debug!(generator = %id, "added free event");
        id
    }

    /// Add a free controllable event whose command emits it.
    pub fn add_controllable_event(&mut self) -> GeneratorId {
        self.add_free_event(Some(emit_command()))
    }

    pub fn add_permanent_event(&mut self, command: Option<Command>) -> GeneratorId {
        let id = self.add_free_event(command);
        self.permanent_events.insert(id);
        id
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.keys().copied().collect()
    }

    pub fn contains_task(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn contains_generator(&self, id: GeneratorId) -> bool {
        self.generators.contains_key(&id)
    }

    pub(crate) fn task_or_err(&self, id: TaskId) -> Result<&Task> {
        self.tasks
            .get(&id)
            .ok_or_else(|| PlanError::Ownership(format!("{id} is not included in this plan")))
    }

    pub(crate) fn task_mut_or_err(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| PlanError::Ownership(format!("{id} is not included in this plan")))
    }

    /// Generator of `task` named `symbol`.
    pub fn task_event(&self, task: TaskId, symbol: &str) -> Result<GeneratorId> {
        let t = self.task_or_err(task)?;
        t.event(symbol).ok_or_else(|| {
            PlanError::Argument(format!(
                "{task} ({}) has no event '{symbol}'",
                t.model_name()
            ))
        })
    }

    pub fn missions(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.missions.iter().copied()
    }

    pub fn is_mission(&self, task: TaskId) -> bool {
        self.missions.contains(&task)
    }

    pub fn add_mission_task(&mut self, task: TaskId) -> Result<()> {
        self.task_or_err(task)?;
        if self.missions.insert(task) {
            info!(%task, "task marked as mission");
        }
        Ok(())
    }

    pub fn unmark_mission(&mut self, task: TaskId) {
        self.missions.remove(&task);
    }

    pub fn is_permanent(&self, task: TaskId) -> bool {
        self.permanent_tasks.contains(&task)
    }

    pub fn add_permanent_task(&mut self, task: TaskId) -> Result<()> {
        self.task_or_err(task)?;
        self.permanent_tasks.insert(task);
        Ok(())
    }

    pub fn unmark_permanent(&mut self, task: TaskId) {
        self.permanent_tasks.remove(&task);
    }

    pub fn is_permanent_event(&self, generator: GeneratorId) -> bool {
        self.permanent_events.contains(&generator)
    }

    pub fn unmark_permanent_event(&mut self, generator: GeneratorId) {
        self.permanent_events.remove(&generator);
    }

    /// Override executability of a task. `Some(false)` prevents every call
    /// and emission on its events.
    pub fn set_executable(&mut self, task: TaskId, executable: Option<bool>) -> Result<()> {
        if self.status(task).is_some_and(|s| s.running()) {
            return Err(PlanError::ModelViolation(format!(
                "cannot change the executable flag of {task} while it runs"
            )));
        }
        self.task_mut_or_err(task)?.executable = executable;
        Ok(())
    }

    /// Why `task` cannot execute, if it cannot.
    pub fn non_executable_cause(&self, task: TaskId) -> Option<String> {
        let t = self.tasks.get(&task)?;
        if !self.executable {
            return Some("the plan is not executable".to_string());
        }
        if t.executable == Some(false) {
            return Some("the task has been marked as non-executable".to_string());
        }
        if t.model.is_abstract() {
            return Some(format!("model {} is abstract", t.model_name()));
        }
        let missing = self.missing_arguments(task);
        if !missing.is_empty() {
            return Some(format!(
                "the task is partially instantiated (missing arguments: {})",
                missing.join(", ")
            ));
        }
        None
    }

    pub fn is_executable(&self, task: TaskId) -> bool {
        self.tasks.contains_key(&task) && self.non_executable_cause(task).is_none()
    }

    /// Fails with `TaskNotExecutable` when `task` cannot execute.
    pub fn ensure_executable(&self, task: TaskId) -> Result<()> {
        self.task_or_err(task)?;
        match self.non_executable_cause(task) {
            None => Ok(()),
            Some(cause) => Err(self
                .localize(ErrorKind::TaskNotExecutable, FailurePoint::Task(task))
                .with_message(cause)
                .into()),
        }
    }

    /// Deduce (event, generator, task) from a failure point.
    pub fn resolve_failure_point(
        &self,
        point: &FailurePoint,
    ) -> (Option<EventId>, Option<GeneratorId>, Option<TaskId>) {
        match point {
            FailurePoint::Event(id) => match self.events.get(id) {
                Some(event) => (Some(*id), Some(event.generator), event.task),
                None => (Some(*id), None, None),
            },
            FailurePoint::Generator(id) => {
                let task = self.generators.get(id).and_then(|g| g.task);
                let generator = self.generators.contains_key(id).then_some(*id);
                (None, generator, task)
            }
            FailurePoint::Task(id) => (None, None, self.tasks.contains_key(id).then_some(*id)),
        }
    }

    /// Build a localized error, deducing what can be deduced from the plan.
    pub(crate) fn localize(&self, kind: ErrorKind, point: FailurePoint) -> LocalizedError {
        let (event, generator, task) = match &point {
            FailurePoint::Generator(id) => (
                None,
                Some(*id),
                self.generators.get(id).and_then(|g| g.task),
            ),
            FailurePoint::Task(id) => (None, None, Some(*id)),
            FailurePoint::Event(_) => self.resolve_failure_point(&point),
        };
        LocalizedError::from_parts(kind, point, event, generator, task)
    }

    pub(crate) fn start_event_of(&self, task: TaskId) -> Option<GeneratorId> {
        self.tasks.get(&task).and_then(|t| t.event(START))
    }
}
