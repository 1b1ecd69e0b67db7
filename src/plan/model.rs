// src/plan/model.rs

//! Task models.
//!
//! A [`TaskModel`] describes the events of a task (controllable or not,
//! terminal or not), the relations between them, the arguments the task
//! takes and the handlers every instance gets. Models form a single
//! inheritance tree rooted at [`ROOT_MODEL`] and can additionally provide
//! tags.
//!
//! Terminal classification is computed when a model is registered:
//! - an event is terminal if it is declared terminal, is `stop`, or
//!   forwards/signals to a terminal event of the same model;
//! - a terminal event is a success event if it leads to `success`, a
//!   failure event if it leads to `failed`;
//! - declared terminal events that lead to no other terminal event get an
//!   implicit forward to `stop`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::errors::{PlanError, Result};
use crate::plan::arguments::{ArgumentDefault, ArgumentSpec};
use crate::plan::generator::{call_sibling, emit_command, Command, EventCallback};
use crate::plan::task::PollCallback;
use crate::types::{
    TerminalKind, ABORTED, FAILED, INTERNAL_ERROR, START, STOP, SUCCESS,
};

/// Abstract root of all task models.
pub const ROOT_MODEL: &str = "Task";
/// Concrete model whose tasks can be started and stopped directly.
pub const SIMPLE_MODEL: &str = "Simple";

/// Declaration of one event in a model builder.
#[derive(Clone, Default)]
pub struct EventSpec {
    controllable: bool,
    terminal: bool,
    command: Option<Command>,
}

impl EventSpec {
    /// A contingent event: it can only be emitted, never called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A controllable event whose command emits it.
    pub fn controllable() -> Self {
        Self {
            controllable: true,
            terminal: false,
            command: None,
        }
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn command(mut self, command: Command) -> Self {
        self.controllable = true;
        self.command = Some(command);
        self
    }

    fn resolved_command(&self) -> Option<Command> {
        match (&self.command, self.controllable) {
            (Some(c), _) => Some(c.clone()),
            (None, true) => Some(emit_command()),
            (None, false) => None,
        }
    }
}

#[derive(Clone)]
pub struct EventModel {
    pub(crate) name: String,
    pub(crate) command: Option<Command>,
    pub(crate) declared_terminal: bool,
    pub(crate) terminal: Option<TerminalKind>,
}

impl EventModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_controllable(&self) -> bool {
        self.command.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        self.terminal
    }
}

impl fmt::Debug for EventModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventModel")
            .field("name", &self.name)
            .field("controllable", &self.is_controllable())
            .field("terminal", &self.terminal)
            .finish()
    }
}

#[derive(Clone)]
pub struct TaskModel {
    name: String,
    parent: Option<String>,
    ancestors: Vec<String>,
    tags: BTreeSet<String>,
    is_abstract: bool,
    pub(crate) events: Vec<EventModel>,
    pub(crate) signals: Vec<(String, String)>,
    pub(crate) forwards: Vec<(String, String)>,
    pub(crate) causal_links: Vec<(String, String)>,
    pub(crate) arguments: Vec<ArgumentSpec>,
    pub(crate) handlers: Vec<(String, EventCallback)>,
    pub(crate) polls: Vec<PollCallback>,
}

impl TaskModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// This model followed by its ancestors, most specific first.
    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// True if instances of this model can stand for `name` (a model or a tag).
    pub fn fullfills(&self, name: &str) -> bool {
        self.ancestors.iter().any(|a| a == name) || self.tags.contains(name)
    }

    pub fn event(&self, name: &str) -> Option<&EventModel> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn events(&self) -> &[EventModel] {
        &self.events
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.event(name).is_some_and(|e| e.is_terminal())
    }

    pub fn arguments(&self) -> impl Iterator<Item = &str> {
        self.arguments.iter().map(|a| a.name.as_str())
    }

    pub fn forwards(&self) -> &[(String, String)] {
        &self.forwards
    }

    pub fn signals(&self) -> &[(String, String)] {
        &self.signals
    }

    pub fn causal_links(&self) -> &[(String, String)] {
        &self.causal_links
    }
}

impl fmt::Debug for TaskModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskModel")
            .field("name", &self.name)
            .field("ancestors", &self.ancestors)
            .field("tags", &self.tags)
            .field("abstract", &self.is_abstract)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Builder for a new task model, registered with [`ModelRegistry::register`].
#[derive(Clone)]
pub struct TaskModelBuilder {
    name: String,
    parent: Option<String>,
    is_abstract: bool,
    tags: Vec<String>,
    events: Vec<(String, EventSpec)>,
    signals: Vec<(String, String)>,
    forwards: Vec<(String, String)>,
    causal_links: Vec<(String, String)>,
    arguments: Vec<ArgumentSpec>,
    handlers: Vec<(String, EventCallback)>,
    polls: Vec<PollCallback>,
}

impl TaskModelBuilder {
    /// New model deriving from [`ROOT_MODEL`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Some(ROOT_MODEL.to_string()),
            is_abstract: false,
            tags: Vec::new(),
            events: Vec::new(),
            signals: Vec::new(),
            forwards: Vec::new(),
            causal_links: Vec::new(),
            arguments: Vec::new(),
            handlers: Vec::new(),
            polls: Vec::new(),
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn abstract_model(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Declare an argument without default: tasks are only executable once
    /// it is set.
    pub fn argument(mut self, name: impl Into<String>) -> Self {
        self.arguments.push(ArgumentSpec {
            name: name.into(),
            default: None,
        });
        self
    }

    pub fn argument_with_default(mut self, name: impl Into<String>, default: ArgumentDefault) -> Self {
        self.arguments.push(ArgumentSpec {
            name: name.into(),
            default: Some(default),
        });
        self
    }

    /// Declare or override an event.
    pub fn event(mut self, name: impl Into<String>, spec: EventSpec) -> Self {
        self.events.push((name.into(), spec));
        self
    }

    pub fn signal(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.signals.push((from.into(), to.into()));
        self
    }

    pub fn forward(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.forwards.push((from.into(), to.into()));
        self
    }

    pub fn causal_link(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.causal_links.push((from.into(), to.into()));
        self
    }

    /// Handler installed on `event` of every instance.
    pub fn on(mut self, event: impl Into<String>, callback: EventCallback) -> Self {
        self.handlers.push((event.into(), callback));
        self
    }

    pub fn poll(mut self, callback: PollCallback) -> Self {
        self.polls.push(callback);
        self
    }

    /// Make the task stoppable: `failed` becomes controllable and `stop`
    /// calls it.
    pub fn terminates(self) -> Self {
        self.event(FAILED, EventSpec::controllable().terminal())
            .event(STOP, EventSpec::new().command(call_sibling(FAILED)))
    }
}

/// Registry of task models and tags, keyed by name.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: BTreeMap<String, Rc<TaskModel>>,
    tags: BTreeSet<String>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// Registry holding the two built-in models.
    pub fn new() -> Self {
        let mut registry = Self {
            models: BTreeMap::new(),
            tags: BTreeSet::new(),
        };

        let root = TaskModelBuilder::new(ROOT_MODEL)
            .abstract_model()
            .event(START, EventSpec::controllable())
            .event(SUCCESS, EventSpec::new().terminal())
            .event(FAILED, EventSpec::new().terminal())
            .event(STOP, EventSpec::new().terminal())
            .event(ABORTED, EventSpec::new())
            .event(INTERNAL_ERROR, EventSpec::new())
            .forward(SUCCESS, STOP)
            .forward(FAILED, STOP)
            .forward(ABORTED, FAILED)
            .forward(INTERNAL_ERROR, FAILED);
        let root = TaskModelBuilder {
            parent: None,
            ..root
        };
        let simple = TaskModelBuilder::new(SIMPLE_MODEL)
            .event(SUCCESS, EventSpec::controllable().terminal())
            .terminates();

        // Built-ins are well-formed; registering them cannot fail.
        for builder in [root, simple] {
            if let Ok(model) = build_model(&registry, builder) {
                registry.models.insert(model.name.clone(), Rc::new(model));
            }
        }
        registry
    }

    pub fn define_tag(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.models.contains_key(&name) {
            return Err(PlanError::Argument(format!(
                "'{name}' is already a task model"
            )));
        }
        self.tags.insert(name);
        Ok(())
    }

    pub fn is_tag(&self, name: &str) -> bool {
        self.tags.contains(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name) || self.tags.contains(name)
    }

    pub fn get(&self, name: &str) -> Option<Rc<TaskModel>> {
        self.models.get(name).cloned()
    }

    pub fn get_or_err(&self, name: &str) -> Result<Rc<TaskModel>> {
        self.get(name)
            .ok_or_else(|| PlanError::Argument(format!("unknown task model '{name}'")))
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// True if `model` is `ancestor` or derives from it.
    pub fn is_subclass(&self, model: &str, ancestor: &str) -> bool {
        self.models
            .get(model)
            .is_some_and(|m| m.ancestors.iter().any(|a| a == ancestor))
    }

    pub fn register(&mut self, builder: TaskModelBuilder) -> Result<Rc<TaskModel>> {
        if self.contains(&builder.name) {
            return Err(PlanError::Argument(format!(
                "task model or tag '{}' is already defined",
                builder.name
            )));
        }
        let model = Rc::new(build_model(self, builder)?);
        debug!(model = %model.name, parent = ?model.parent, "registered task model");
        self.models.insert(model.name.clone(), model.clone());
        Ok(model)
    }
}

fn build_model(registry: &ModelRegistry, builder: TaskModelBuilder) -> Result<TaskModel> {
    let mut model = match &builder.parent {
        Some(parent) => {
            let parent_model = registry.get_or_err(parent)?;
            let mut model = (*parent_model).clone();
            model.ancestors.insert(0, builder.name.clone());
            model
        }
        None => TaskModel {
            name: builder.name.clone(),
            parent: None,
            ancestors: vec![builder.name.clone()],
            tags: BTreeSet::new(),
            is_abstract: false,
            events: Vec::new(),
            signals: Vec::new(),
            forwards: Vec::new(),
            causal_links: Vec::new(),
            arguments: Vec::new(),
            handlers: Vec::new(),
            polls: Vec::new(),
        },
    };
    model.name = builder.name.clone();
    model.parent = builder.parent.clone();
    model.is_abstract = builder.is_abstract;

    for tag in &builder.tags {
        if !registry.is_tag(tag) {
            return Err(PlanError::Argument(format!(
                "model '{}' provides unknown tag '{tag}'",
                builder.name
            )));
        }
        model.tags.insert(tag.clone());
    }

    for (name, spec) in &builder.events {
        match model.events.iter_mut().find(|e| &e.name == name) {
            Some(existing) => {
                if spec.controllable {
                    existing.command = spec.resolved_command();
                }
                existing.declared_terminal |= spec.terminal;
            }
            None => model.events.push(EventModel {
                name: name.clone(),
                command: spec.resolved_command(),
                declared_terminal: spec.terminal || name == STOP,
                terminal: None,
            }),
        }
    }

    let known = |name: &str| model.events.iter().any(|e| e.name == name);
    for (from, to) in builder
        .signals
        .iter()
        .chain(&builder.forwards)
        .chain(&builder.causal_links)
    {
        for name in [from, to] {
            if !known(name) {
                return Err(PlanError::Argument(format!(
                    "model '{}' has no event '{name}'",
                    builder.name
                )));
            }
        }
    }
    for (from, to) in &builder.signals {
        let controllable = model.event(to).is_some_and(|e| e.is_controllable());
        if !controllable {
            return Err(PlanError::Argument(format!(
                "cannot signal '{to}' from '{from}' in model '{}': '{to}' is not controllable",
                builder.name
            )));
        }
    }
    push_unique(&mut model.signals, &builder.signals);
    push_unique(&mut model.forwards, &builder.forwards);
    push_unique(&mut model.causal_links, &builder.causal_links);

    classify_terminal_events(&mut model)?;

    for arg in builder.arguments {
        match model.arguments.iter_mut().find(|a| a.name == arg.name) {
            Some(existing) => *existing = arg,
            None => model.arguments.push(arg),
        }
    }
    for (event, callback) in builder.handlers {
        if !model.events.iter().any(|e| e.name == event) {
            return Err(PlanError::Argument(format!(
                "model '{}' has no event '{event}'",
                model.name
            )));
        }
        model.handlers.push((event, callback));
    }
    model.polls.extend(builder.polls);

    Ok(model)
}

fn push_unique(target: &mut Vec<(String, String)>, edges: &[(String, String)]) {
    for edge in edges {
        if !target.contains(edge) {
            target.push(edge.clone());
        }
    }
}

fn classify_terminal_events(model: &mut TaskModel) -> Result<()> {
    let names: Vec<String> = model.events.iter().map(|e| e.name.clone()).collect();
    let mut edges: Vec<(String, String)> = model.forwards.clone();
    edges.extend(model.signals.iter().cloned());

    let declared: BTreeSet<String> = model
        .events
        .iter()
        .filter(|e| e.declared_terminal)
        .map(|e| e.name.clone())
        .collect();
    let terminal = terminal_closure(&names, declared, &edges);

    for (from, to) in &edges {
        if terminal.contains(from) && !terminal.contains(to) {
            return Err(PlanError::Argument(format!(
                "model '{}': terminal event '{from}' cannot lead to non-terminal event '{to}'",
                model.name
            )));
        }
    }

    // Declared terminal events that do not end the task through another
    // terminal event end it by forwarding to stop.
    for name in &names {
        if name == STOP || !terminal.contains(name) {
            continue;
        }
        let leads_somewhere = edges
            .iter()
            .any(|(from, to)| from == name && terminal.contains(to));
        if !leads_somewhere {
            let edge = (name.clone(), STOP.to_string());
            if model.event(STOP).is_some() && !model.forwards.contains(&edge) {
                model.forwards.push(edge.clone());
                edges.push(edge);
            }
        }
    }

    let success = terminal_closure(&names, BTreeSet::from([SUCCESS.to_string()]), &edges);
    let failure = terminal_closure(&names, BTreeSet::from([FAILED.to_string()]), &edges);
    for event in &mut model.events {
        event.terminal = if success.contains(&event.name) {
            Some(TerminalKind::Success)
        } else if failure.contains(&event.name) {
            Some(TerminalKind::Failure)
        } else if terminal.contains(&event.name) {
            Some(TerminalKind::Stop)
        } else {
            None
        };
    }
    Ok(())
}

/// Smallest set containing `seed` and every event with an edge into it.
/// `start` never ends a task and is left out.
pub(crate) fn terminal_closure(
    names: &[String],
    seed: BTreeSet<String>,
    edges: &[(String, String)],
) -> BTreeSet<String> {
    let mut set: BTreeSet<String> = seed
        .into_iter()
        .filter(|n| names.contains(n))
        .collect();
    loop {
        let before = set.len();
        for (from, to) in edges {
            if set.contains(to) && from != START {
                set.insert(from.clone());
            }
        }
        if set.len() == before {
            return set;
        }
    }
}
