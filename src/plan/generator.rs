// src/plan/generator.rs

//! Event generators: the state machines that can be called and emitted.

use std::fmt;
use std::rc::Rc;

use anyhow::anyhow;

use crate::errors::LocalizedError;
use crate::plan::{Event, Plan};
use crate::types::{EventId, GeneratorId, ReplacePolicy, TaskId, TerminalKind, Value};

/// Command run when a controllable generator is called.
///
/// The command is expected to emit the generator (now or later), call other
/// events, or return an error.
pub type Command = Rc<dyn Fn(&mut Plan, &CommandContext) -> anyhow::Result<()>>;

/// Handler run after each emission of a generator.
pub type EventCallback = Rc<dyn Fn(&mut Plan, &Event) -> anyhow::Result<()>>;

/// Handler run when a generator becomes unreachable.
pub type UnreachableCallback =
    Rc<dyn Fn(&mut Plan, GeneratorId, &UnreachableReason) -> anyhow::Result<()>>;

/// Guard evaluated before a command runs.
pub type PreconditionCheck = Rc<dyn Fn(&Plan, &[Value]) -> bool>;

#[derive(Debug, Clone)]
pub struct CommandContext {
    pub generator: GeneratorId,
    pub task: Option<TaskId>,
    pub context: Vec<Value>,
}

/// Why a generator can no longer be emitted.
#[derive(Debug, Clone)]
pub enum UnreachableReason {
    /// An event made it unreachable (typically the task's terminal event).
    Event(EventId),
    /// A generator that never got emitted (e.g. `start` of a task that
    /// failed to start without an error).
    Generator(GeneratorId),
    Error(Box<LocalizedError>),
    /// The generator was removed from its plan.
    Removed,
}

impl fmt::Display for UnreachableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnreachableReason::Event(id) => write!(f, "{id}"),
            UnreachableReason::Generator(id) => write!(f, "{id}"),
            UnreachableReason::Error(e) => write!(f, "{e}"),
            UnreachableReason::Removed => f.write_str("removed from plan"),
        }
    }
}

#[derive(Clone)]
pub struct EventHandler {
    pub(crate) callback: EventCallback,
    pub(crate) on_replace: ReplacePolicy,
}

#[derive(Clone)]
pub(crate) struct UnreachableHandler {
    pub(crate) callback: UnreachableCallback,
    pub(crate) cancel_at_emission: bool,
}

#[derive(Clone)]
pub(crate) struct Precondition {
    pub(crate) reason: String,
    pub(crate) check: PreconditionCheck,
}

#[derive(Clone)]
pub struct EventGenerator {
    pub(crate) id: GeneratorId,
    pub(crate) task: Option<TaskId>,
    pub(crate) symbol: Option<String>,
    pub(crate) command: Option<Command>,
    pub(crate) model_terminal: Option<TerminalKind>,
    pub(crate) terminal: Option<TerminalKind>,
    pub(crate) executable: Option<bool>,
    pub(crate) pending: bool,
    pub(crate) history: Vec<EventId>,
    pub(crate) unreachable: Option<UnreachableReason>,
    pub(crate) handlers: Vec<EventHandler>,
    pub(crate) unreachable_handlers: Vec<UnreachableHandler>,
    pub(crate) preconditions: Vec<Precondition>,
}

impl EventGenerator {
    pub(crate) fn free(id: GeneratorId, command: Option<Command>) -> Self {
        Self {
            id,
            task: None,
            symbol: None,
            command,
            model_terminal: None,
            terminal: None,
            executable: None,
            pending: false,
            history: Vec::new(),
            unreachable: None,
            handlers: Vec::new(),
            unreachable_handlers: Vec::new(),
            preconditions: Vec::new(),
        }
    }

    pub fn id(&self) -> GeneratorId {
        self.id
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    /// Event name within its task (`None` for free events).
    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    pub fn is_controllable(&self) -> bool {
        self.command.is_some()
    }

    /// Terminal for this generator instance (model flag plus edges added
    /// on the instance).
    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        self.terminal
    }

    /// Terminal as declared by the task model.
    pub fn is_model_terminal(&self) -> bool {
        self.model_terminal.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.terminal == Some(TerminalKind::Success)
    }

    pub fn is_failure(&self) -> bool {
        self.terminal == Some(TerminalKind::Failure)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn happened(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn history(&self) -> &[EventId] {
        &self.history
    }

    pub fn last(&self) -> Option<EventId> {
        self.history.last().copied()
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.is_some()
    }

    pub fn unreachability_reason(&self) -> Option<&UnreachableReason> {
        self.unreachable.as_ref()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn unreachable_handler_count(&self) -> usize {
        self.unreachable_handlers.len()
    }
}

impl fmt::Debug for EventGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGenerator")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("symbol", &self.symbol)
            .field("controllable", &self.is_controllable())
            .field("terminal", &self.terminal)
            .field("pending", &self.pending)
            .field("history", &self.history)
            .field("unreachable", &self.unreachable)
            .finish_non_exhaustive()
    }
}

/// Command that emits the called generator with the call context.
pub fn emit_command() -> Command {
    Rc::new(|plan: &mut Plan, ctx: &CommandContext| -> anyhow::Result<()> {
        plan.emit(ctx.generator, ctx.context.clone())?;
        Ok(())
    })
}

/// Command that calls another event of the same task.
pub fn call_sibling(symbol: &'static str) -> Command {
    Rc::new(move |plan: &mut Plan, ctx: &CommandContext| -> anyhow::Result<()> {
        let task = ctx
            .task
            .ok_or_else(|| anyhow!("{} is not a task event", ctx.generator))?;
        let target = plan.task_event(task, symbol)?;
        plan.call(target, ctx.context.clone())?;
        Ok(())
    })
}

/// Command that emits another event of the same task.
pub fn emit_sibling(symbol: &'static str) -> Command {
    Rc::new(move |plan: &mut Plan, ctx: &CommandContext| -> anyhow::Result<()> {
        let task = ctx
            .task
            .ok_or_else(|| anyhow!("{} is not a task event", ctx.generator))?;
        let target = plan.task_event(task, symbol)?;
        plan.emit(target, ctx.context.clone())?;
        Ok(())
    })
}

/// Command that does nothing; the generator has to be emitted elsewhere.
pub fn noop_command() -> Command {
    Rc::new(|_: &mut Plan, _: &CommandContext| -> anyhow::Result<()> { Ok(()) })
}

impl Plan {
    pub fn generator(&self, id: GeneratorId) -> Option<&EventGenerator> {
        self.generators.get(&id)
    }

    pub fn generators(&self) -> impl Iterator<Item = &EventGenerator> {
        self.generators.values()
    }

    pub(crate) fn generator_or_err(&self, id: GeneratorId) -> crate::errors::Result<&EventGenerator> {
        self.generators.get(&id).ok_or_else(|| {
            crate::errors::PlanError::Ownership(format!("{id} is not included in this plan"))
        })
    }

    pub(crate) fn generator_mut_or_err(
        &mut self,
        id: GeneratorId,
    ) -> crate::errors::Result<&mut EventGenerator> {
        self.generators.get_mut(&id).ok_or_else(|| {
            crate::errors::PlanError::Ownership(format!("{id} is not included in this plan"))
        })
    }

    /// Attach a handler run after each emission of `generator`.
    ///
    /// Without an explicit policy, handlers on events of abstract tasks are
    /// copied on replacement and others are dropped.
    pub fn on_event(
        &mut self,
        generator: GeneratorId,
        policy: Option<ReplacePolicy>,
        callback: EventCallback,
    ) -> crate::errors::Result<()> {
        let on_replace = policy.unwrap_or_else(|| self.default_replace_policy_for(generator));
        let g = self.generator_mut_or_err(generator)?;
        g.handlers.push(EventHandler {
            callback,
            on_replace,
        });
        Ok(())
    }

    /// Attach a handler run when `generator` becomes unreachable.
    ///
    /// With `cancel_at_emission`, the handler is discarded as soon as the
    /// generator is emitted.
    pub fn if_unreachable(
        &mut self,
        generator: GeneratorId,
        cancel_at_emission: bool,
        callback: UnreachableCallback,
    ) -> crate::errors::Result<()> {
        let g = self.generator_mut_or_err(generator)?;
        g.unreachable_handlers.push(UnreachableHandler {
            callback,
            cancel_at_emission,
        });
        Ok(())
    }

    /// Add a guard checked before each call of `generator`. A failing
    /// guard reports `EventPreconditionFailed` and the command is not run.
    pub fn add_precondition(
        &mut self,
        generator: GeneratorId,
        reason: impl Into<String>,
        check: PreconditionCheck,
    ) -> crate::errors::Result<()> {
        let g = self.generator_mut_or_err(generator)?;
        g.preconditions.push(Precondition {
            reason: reason.into(),
            check,
        });
        Ok(())
    }

    /// Override executability of a free event.
    pub fn set_event_executable(
        &mut self,
        generator: GeneratorId,
        executable: bool,
    ) -> crate::errors::Result<()> {
        let g = self.generator_mut_or_err(generator)?;
        g.executable = Some(executable);
        Ok(())
    }

    pub(crate) fn default_replace_policy_for(&self, generator: GeneratorId) -> ReplacePolicy {
        let task = self.generators.get(&generator).and_then(|g| g.task);
        match task {
            Some(task) => self.default_replace_policy(task),
            None => ReplacePolicy::Drop,
        }
    }
}
