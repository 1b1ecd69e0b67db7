// src/engine/propagation.rs

//! Event propagation.
//!
//! A propagation pass drains a queue of call and emission requests to a
//! fixed point, one generation at a time:
//! 1. all emission requests of the generation are processed (requests for
//!    the same generator are merged), then all call requests. An emission
//!    that another pending request can still reach waits for the next
//!    generation, so that one trigger emits it only once;
//! 2. each emission follows its signals (new call requests) and its
//!    forwardings/causal links (new emission requests), then runs the
//!    generator's handlers;
//! 3. whatever was queued while doing so forms the next generation.
//!
//! Calls and emissions made from outside a pass are validated immediately
//! and start a new pass. Calls and emissions made from inside a pass
//! (commands, handlers) are only queued; validity errors they hit later are
//! reported through the error routing below instead of being returned.
//!
//! Errors raised by user code are attributed to a task:
//! - finished tasks: reported only;
//! - tasks that did not start: they fail to start;
//! - tasks already terminating: `TaskEmergencyTermination`, which is fatal;
//! - running tasks: the error becomes the failure reason and
//!   `internal_error` is emitted.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::errors::{Canceled, ErrorKind, FailurePoint, LocalizedError, PlanError, Result};
use crate::plan::{CommandContext, Event, Plan, UnreachableReason};
use crate::types::{EventId, GeneratorId, TaskId, TerminalKind, Value, INTERNAL_ERROR, START, STOP};

/// Upper bound on the number of generations of a single pass.
pub const MAX_GENERATIONS: u64 = 10_000;

#[derive(Debug, Clone)]
struct Request {
    generator: GeneratorId,
    context: Vec<Value>,
    sources: Vec<EventId>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PropagationState {
    pub(crate) active: bool,
    pub(crate) pass: u64,
    generation: u64,
    calls: Vec<Request>,
    emissions: Vec<Request>,
    sources: Vec<Vec<EventId>>,
    pub(crate) handled: Vec<LocalizedError>,
    pub(crate) fatal: Vec<LocalizedError>,
}

impl PropagationState {
    fn current_sources(&self) -> Vec<EventId> {
        self.sources.last().cloned().unwrap_or_default()
    }

    fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.emissions.is_empty()
    }
}

impl Plan {
    pub fn is_propagating(&self) -> bool {
        self.propagation.active
    }

    /// Number of propagation passes run so far.
    pub fn propagation_pass(&self) -> u64 {
        self.propagation.pass
    }

    /// Non-fatal errors reported by propagation since the last call.
    pub fn take_handled_errors(&mut self) -> Vec<LocalizedError> {
        std::mem::take(&mut self.propagation.handled)
    }

    /// Request a call of `generator`.
    pub fn call(&mut self, generator: GeneratorId, context: Vec<Value>) -> Result<()> {
        self.check_callable(generator)?;
        self.queue_request(generator, context, true)
    }

    /// Request an emission of `generator`.
    pub fn emit(&mut self, generator: GeneratorId, context: Vec<Value>) -> Result<()> {
        self.check_emittable(generator)?;
        self.queue_request(generator, context, false)
    }

    /// Call the event named `symbol` of `task`.
    pub fn call_event(&mut self, task: TaskId, symbol: &str) -> Result<()> {
        let generator = self.task_event(task, symbol)?;
        self.call(generator, Vec::new())
    }

    /// Emit the event named `symbol` of `task`.
    pub fn emit_event(&mut self, task: TaskId, symbol: &str) -> Result<()> {
        let generator = self.task_event(task, symbol)?;
        self.emit(generator, Vec::new())
    }

    /// Report that `generator` could not be emitted. The owning task fails
    /// (or fails to start) with `EmissionFailed`.
    pub fn emit_failed(&mut self, generator: GeneratorId, reason: Option<anyhow::Error>) -> Result<()> {
        let task = self.generator_or_err(generator)?.task;
        let error = self.localize(
            ErrorKind::EmissionFailed(reason.map(Arc::new)),
            FailurePoint::Generator(generator),
        );
        if let Some(g) = self.generators.get_mut(&generator) {
            g.pending = false;
        }
        if task.is_none() {
            return Err(error.into());
        }
        self.propagate(|plan| {
            plan.route_error(error);
            Ok(())
        })
    }

    /// Mark `task` as failed to start.
    pub fn failed_to_start(&mut self, task: TaskId, reason: Option<LocalizedError>) -> Result<()> {
        let status = self
            .status(task)
            .ok_or_else(|| PlanError::Ownership(format!("{task} is not included in this plan")))?;
        if status.started() || status.finished() {
            return Err(PlanError::ModelViolation(format!(
                "{task} has already started"
            )));
        }
        self.propagate(|plan| {
            plan.fail_to_start(task, reason);
            Ok(())
        })
    }

    /// Stop `task` without going through its commands: pending calls are
    /// dropped and `stop` is emitted.
    pub fn forcefully_terminate(&mut self, task: TaskId) -> Result<()> {
        let status = self
            .status(task)
            .ok_or_else(|| PlanError::Ownership(format!("{task} is not included in this plan")))?;
        if status.finished() {
            return Ok(());
        }
        if !status.started() {
            return self.propagate(|plan| {
                plan.fail_to_start(task, None);
                Ok(())
            });
        }

        let generators: Vec<GeneratorId> = self
            .tasks
            .get(&task)
            .map(|t| t.events.iter().map(|(_, g)| *g).collect())
            .unwrap_or_default();
        for g in &generators {
            if let Some(g) = self.generators.get_mut(g) {
                g.pending = false;
            }
        }
        let stop = self.task_event(task, STOP)?;
        warn!(%task, "forcefully terminating task");
        self.propagate(|plan| {
            plan.propagation.emissions.push(Request {
                generator: stop,
                context: Vec::new(),
                sources: Vec::new(),
            });
            Ok(())
        })
    }

    /// Run `seed` inside a propagation pass and propagate what it queued.
    /// Fatal errors raised during the pass are returned as the error.
    pub fn propagate<R>(&mut self, seed: impl FnOnce(&mut Plan) -> Result<R>) -> Result<R> {
        let (result, mut fatal) = self.propagate_collect(seed);
        match fatal.len() {
            0 => result,
            1 => Err(PlanError::Localized(fatal.remove(0))),
            _ => Err(PlanError::Aborting(crate::errors::Aborting::new(fatal))),
        }
    }

    /// Like [`Plan::propagate`], but hands fatal errors back separately.
    /// Nested invocations run `seed` in the enclosing pass.
    pub(crate) fn propagate_collect<R>(
        &mut self,
        seed: impl FnOnce(&mut Plan) -> Result<R>,
    ) -> (Result<R>, Vec<LocalizedError>) {
        if self.propagation.active {
            return (seed(self), Vec::new());
        }

        self.propagation.active = true;
        self.propagation.pass += 1;
        self.propagation.generation = 0;
        trace!(pass = self.propagation.pass, "propagation pass started");

        let result = seed(self);
        self.run_generations();

        self.propagation.active = false;
        let fatal = std::mem::take(&mut self.propagation.fatal);
        (result, fatal)
    }

    fn queue_request(&mut self, generator: GeneratorId, context: Vec<Value>, call: bool) -> Result<()> {
        let push = |plan: &mut Plan| {
            let request = Request {
                generator,
                context,
                sources: plan.propagation.current_sources(),
            };
            if call {
                plan.propagation.calls.push(request);
            } else {
                plan.propagation.emissions.push(request);
            }
            Ok(())
        };
        if self.propagation.active {
            push(self)
        } else {
            self.propagate(push)
        }
    }

    fn run_generations(&mut self) {
        while !self.propagation.is_empty() {
            self.propagation.generation += 1;
            if self.propagation.generation > MAX_GENERATIONS {
                let last = self
                    .propagation
                    .emissions
                    .first()
                    .or(self.propagation.calls.first())
                    .map(|r| r.generator);
                self.propagation.calls.clear();
                self.propagation.emissions.clear();
                if let Some(generator) = last {
                    let err = self.localize(ErrorKind::PropagationLoop, FailurePoint::Generator(generator));
                    error!(%err, "propagation did not reach a fixed point");
                    self.propagation.fatal.push(err);
                }
                return;
            }

            let pending = merge_requests(std::mem::take(&mut self.propagation.emissions));
            let calls = merge_requests(std::mem::take(&mut self.propagation.calls));
            let (emissions, delayed) = self.split_ready(pending, &calls);
            trace!(
                generation = self.propagation.generation,
                emissions = emissions.len(),
                delayed = delayed.len(),
                calls = calls.len(),
                "processing generation"
            );
            self.propagation.emissions = delayed;
            for request in emissions {
                self.process_emission(request);
            }
            for request in calls {
                self.process_call(request);
            }
        }
    }

    /// Split pending emissions into those that can be emitted now and those
    /// that another pending request may still reach. Delayed emissions are
    /// merged with the requests that reach them, so that one trigger emits
    /// each generator at most once per pass.
    fn split_ready(&self, emissions: Vec<Request>, calls: &[Request]) -> (Vec<Request>, Vec<Request>) {
        let upstream = |target: GeneratorId| {
            emissions
                .iter()
                .chain(calls)
                .map(|r| r.generator)
                .any(|g| g != target && self.relations.propagates_to(g, target))
        };
        let (ready, delayed): (Vec<Request>, Vec<Request>) =
            emissions.iter().cloned().partition(|r| !upstream(r.generator));
        if ready.is_empty() && calls.is_empty() {
            // Pending emissions reach each other through a loop.
            return (emissions, Vec::new());
        }
        (ready, delayed)
    }

    fn process_call(&mut self, request: Request) {
        let generator = request.generator;
        match self.check_callable(generator) {
            Ok(()) => {}
            Err(PlanError::Localized(err)) => {
                self.route_error(err);
                return;
            }
            Err(other) => {
                debug!(%generator, error = %other, "dropping call request");
                return;
            }
        }

        let failed_precondition = self.generators.get(&generator).and_then(|g| {
            g.preconditions
                .iter()
                .find(|p| !(p.check)(self, &request.context))
                .map(|p| p.reason.clone())
        });
        if let Some(reason) = failed_precondition {
            let err = self
                .localize(ErrorKind::EventPreconditionFailed, FailurePoint::Generator(generator))
                .with_message(reason);
            warn!(%err, "precondition failed");
            self.propagation.handled.push(err);
            return;
        }

        let (command, task, is_start) = match self.generators.get_mut(&generator) {
            Some(g) => {
                g.pending = true;
                (g.command.clone(), g.task, g.symbol() == Some(START))
            }
            None => return,
        };
        let Some(command) = command else {
            return;
        };
        if is_start {
            if let Some(task) = task {
                self.freeze_arguments(task);
            }
        }

        debug!(%generator, ?task, "calling event");
        self.propagation.sources.push(request.sources);
        let result = command(
            self,
            &CommandContext {
                generator,
                task,
                context: request.context,
            },
        );
        self.propagation.sources.pop();

        if let Err(error) = result {
            if let Some(canceled) = error.downcast_ref::<Canceled>() {
                if let Some(g) = self.generators.get_mut(&generator) {
                    g.pending = false;
                }
                let err = self
                    .localize(ErrorKind::EventCanceled, FailurePoint::Generator(generator))
                    .with_message(canceled.0.clone());
                warn!(%err, "event call canceled");
                self.propagation.handled.push(err);
                return;
            }
            let err = self.localize(
                ErrorKind::CommandFailed(Arc::new(error)),
                FailurePoint::Generator(generator),
            );
            // Routed while still pending: a failing terminal command means
            // the task is already terminating.
            self.route_error(err);
            if let Some(g) = self.generators.get_mut(&generator) {
                g.pending = false;
            }
        }
    }

    fn process_emission(&mut self, request: Request) {
        let generator = request.generator;
        match self.check_emittable(generator) {
            Ok(()) => {}
            Err(PlanError::Localized(err)) => {
                self.route_error(err);
                return;
            }
            Err(other) => {
                debug!(%generator, error = %other, "dropping emission request");
                return;
            }
        }

        let event = self.record_emission(generator, request.context, request.sources);
        self.follow_relations(&event);
        self.run_event_handlers(&event);
    }

    fn record_emission(
        &mut self,
        generator: GeneratorId,
        context: Vec<Value>,
        sources: Vec<EventId>,
    ) -> Event {
        let id = EventId(self.allocate_id());
        let task = self.generators.get(&generator).and_then(|g| g.task);
        let event = Event {
            id,
            generator,
            task,
            time: std::time::SystemTime::now(),
            propagation_id: self.propagation.pass,
            context,
            sources,
        };
        self.events.insert(id, event.clone());

        let (symbol, terminal) = match self.generators.get_mut(&generator) {
            Some(g) => {
                g.pending = false;
                g.history.push(id);
                g.unreachable_handlers.retain(|h| !h.cancel_at_emission);
                (g.symbol.clone(), g.terminal)
            }
            None => (None, None),
        };
        debug!(%generator, event = %id, ?task, symbol = ?symbol, "emitted event");

        if let Some(task) = task {
            self.update_task_on_emission(task, id, symbol.as_deref(), terminal);
        }
        event
    }

    fn update_task_on_emission(
        &mut self,
        task: TaskId,
        event: EventId,
        symbol: Option<&str>,
        terminal: Option<TerminalKind>,
    ) {
        let Some(t) = self.tasks.get_mut(&task) else {
            return;
        };
        if symbol == Some(START) {
            t.started = true;
            debug!(%task, "task started");
        }
        if let Some(kind) = terminal {
            t.terminal_event.get_or_insert(event);
            match kind {
                TerminalKind::Success => {
                    t.success.get_or_insert(true);
                }
                TerminalKind::Failure => {
                    t.success.get_or_insert(false);
                    t.failure_event.get_or_insert(event);
                }
                TerminalKind::Stop => {}
            }
        }
        if symbol == Some(STOP) {
            t.finished = true;
            let reason = t.terminal_event.unwrap_or(event);
            debug!(%task, success = ?t.success, "task finished");
            self.mark_task_unreachable(task, UnreachableReason::Event(reason));
        }
    }

    fn follow_relations(&mut self, event: &Event) {
        let generator = event.generator;
        for target in self.relations.signal.children(generator) {
            self.propagation.calls.push(Request {
                generator: target,
                context: event.context.clone(),
                sources: vec![event.id],
            });
        }
        let mut emitted = Vec::new();
        for target in self
            .relations
            .forwarding
            .children(generator)
            .into_iter()
            .chain(self.relations.causal_link.children(generator))
        {
            if emitted.contains(&target) {
                continue;
            }
            emitted.push(target);
            self.propagation.emissions.push(Request {
                generator: target,
                context: event.context.clone(),
                sources: vec![event.id],
            });
        }
    }

    fn run_event_handlers(&mut self, event: &Event) {
        let handlers = self
            .generators
            .get(&event.generator)
            .map(|g| g.handlers.clone())
            .unwrap_or_default();
        if handlers.is_empty() {
            return;
        }
        self.propagation.sources.push(vec![event.id]);
        for handler in handlers {
            if let Err(error) = (handler.callback)(self, event) {
                let err = self.localize(
                    ErrorKind::EventHandlerError(Arc::new(error)),
                    FailurePoint::Event(event.id),
                );
                self.route_error(err);
            }
        }
        self.propagation.sources.pop();
    }

    /// Mark every generator of `task` unreachable.
    pub(crate) fn mark_task_unreachable(&mut self, task: TaskId, reason: UnreachableReason) {
        let generators: Vec<GeneratorId> = self
            .tasks
            .get(&task)
            .map(|t| t.events.iter().map(|(_, g)| *g).collect())
            .unwrap_or_default();
        for generator in generators {
            self.mark_unreachable(generator, reason.clone());
        }
    }

    pub(crate) fn mark_unreachable(&mut self, generator: GeneratorId, reason: UnreachableReason) {
        let handlers = match self.generators.get_mut(&generator) {
            Some(g) if g.unreachable.is_none() => {
                g.unreachable = Some(reason.clone());
                g.pending = false;
                std::mem::take(&mut g.unreachable_handlers)
            }
            _ => return,
        };
        trace!(%generator, %reason, "event became unreachable");
        for handler in handlers {
            if let Err(error) = (handler.callback)(self, generator, &reason) {
                let err = self.localize(
                    ErrorKind::EventHandlerError(Arc::new(error)),
                    FailurePoint::Generator(generator),
                );
                self.route_error(err);
            }
        }
    }

    pub(crate) fn fail_to_start(&mut self, task: TaskId, reason: Option<LocalizedError>) {
        let start = self.start_event_of(task);
        let Some(t) = self.tasks.get_mut(&task) else {
            return;
        };
        if t.started || t.failed_to_start {
            return;
        }
        t.failed_to_start = true;
        t.success = Some(false);
        t.failure_reason = reason.clone();
        if let Some(start) = start.and_then(|g| self.generators.get_mut(&g)) {
            start.pending = false;
        }
        warn!(%task, reason = ?reason.as_ref().map(|r| r.to_string()), "task failed to start");

        let unreachable = match (reason, start) {
            (Some(error), _) => UnreachableReason::Error(Box::new(error)),
            (None, Some(start)) => UnreachableReason::Generator(start),
            (None, None) => UnreachableReason::Removed,
        };
        self.mark_task_unreachable(task, unreachable);
    }

    /// Attribute an error to its task, see the module documentation.
    pub(crate) fn route_error(&mut self, error: LocalizedError) {
        let Some(task) = error.failed_task() else {
            warn!(%error, "error in free event");
            self.propagation.handled.push(error);
            return;
        };
        let Some(status) = self.status(task) else {
            self.propagation.handled.push(error);
            return;
        };

        if status.finished() {
            warn!(%error, "error on finished task");
            self.propagation.handled.push(error);
        } else if !status.started() {
            self.fail_to_start(task, Some(error.clone()));
            self.propagation.handled.push(error);
        } else if self.is_terminating(task) {
            let fatal = self.localize(
                ErrorKind::TaskEmergencyTermination {
                    reason: Box::new(error),
                },
                FailurePoint::Task(task),
            );
            error!(%fatal, "error while the task was terminating");
            self.propagation.fatal.push(fatal);
        } else {
            warn!(%error, "task failed");
            let internal_error = self.tasks.get_mut(&task).and_then(|t| {
                t.failure_reason.get_or_insert(error.clone());
                t.event(INTERNAL_ERROR)
            });
            self.propagation.handled.push(error.clone());
            match internal_error {
                Some(generator) => {
                    let sources = self.propagation.current_sources();
                    self.propagation.emissions.push(Request {
                        generator,
                        context: vec![Value::String(error.to_string())],
                        sources,
                    });
                }
                None => {
                    if let Err(e) = self.forcefully_terminate(task) {
                        warn!(%task, error = %e, "could not terminate failed task");
                        let fatal = self.localize(
                            ErrorKind::TaskEmergencyTermination {
                                reason: Box::new(error),
                            },
                            FailurePoint::Task(task),
                        );
                        self.propagation.fatal.push(fatal);
                    }
                }
            }
        }
    }

    /// Fails unless `generator` can be called now.
    pub fn check_callable(&self, generator: GeneratorId) -> Result<()> {
        self.check_executable(generator, false)?;
        let g = self.generator_or_err(generator)?;
        if !g.is_controllable() {
            return Err(self
                .localize(ErrorKind::EventNotControlable, FailurePoint::Generator(generator))
                .with_message(format!("{generator} is not controllable"))
                .into());
        }
        Ok(())
    }

    /// Fails unless `generator` can be emitted now.
    pub fn check_emittable(&self, generator: GeneratorId) -> Result<()> {
        self.check_executable(generator, true)
    }

    fn check_executable(&self, generator: GeneratorId, emitting: bool) -> Result<()> {
        let g = self.generator_or_err(generator)?;
        let not_executable = |message: String| -> PlanError {
            self.localize(ErrorKind::EventNotExecutable, FailurePoint::Generator(generator))
                .with_message(message)
                .into()
        };

        if let Some(reason) = &g.unreachable {
            return Err(not_executable(format!(
                "{generator} is unreachable ({reason})"
            )));
        }

        match g.task {
            Some(task) => {
                let t = self.task_or_err(task)?;
                if let Some(cause) = self.non_executable_cause(task) {
                    return Err(self
                        .localize(ErrorKind::TaskEventNotExecutable, FailurePoint::Generator(generator))
                        .with_message(format!("cannot use {generator} of {task}: {cause}"))
                        .into());
                }
                if g.symbol() == Some(START) {
                    if t.started {
                        return Err(not_executable(format!("{task} is already running")));
                    }
                    if !emitting && g.pending {
                        return Err(not_executable(format!("{task} is already starting")));
                    }
                } else if !t.started {
                    return Err(not_executable(format!(
                        "{task} is not running, cannot use '{}'",
                        g.symbol().unwrap_or_default()
                    )));
                }
            }
            None => {
                if !self.executable || g.executable == Some(false) {
                    return Err(not_executable(format!("{generator} is not executable")));
                }
            }
        }
        Ok(())
    }

    /// Run poll handlers of running tasks. Failures are routed like any
    /// other user-code error.
    pub(crate) fn run_polls(&mut self) {
        let running: Vec<TaskId> = self
            .tasks
            .keys()
            .copied()
            .filter(|t| self.status(*t).is_some_and(|s| s.running()))
            .collect();
        for task in running {
            let handlers = self
                .tasks
                .get(&task)
                .map(|t| t.poll_handlers.clone())
                .unwrap_or_default();
            for handler in handlers {
                if !self.status(task).is_some_and(|s| s.running()) {
                    break;
                }
                if let Err(error) = (handler.callback)(self, task) {
                    let err = self.localize(
                        ErrorKind::PollingFailed(Arc::new(error)),
                        FailurePoint::Task(task),
                    );
                    self.route_error(err);
                }
            }
        }
    }
}

/// Merge requests for the same generator: contexts are concatenated and
/// sources unioned, in first-request order.
fn merge_requests(requests: Vec<Request>) -> Vec<Request> {
    let mut order = Vec::new();
    let mut merged: BTreeMap<GeneratorId, Request> = BTreeMap::new();
    for request in requests {
        match merged.get_mut(&request.generator) {
            Some(existing) => {
                existing.context.extend(request.context);
                for source in request.sources {
                    if !existing.sources.contains(&source) {
                        existing.sources.push(source);
                    }
                }
            }
            None => {
                order.push(request.generator);
                merged.insert(request.generator, request);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|g| merged.remove(&g))
        .collect()
}
