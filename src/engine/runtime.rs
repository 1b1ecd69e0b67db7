// src/engine/runtime.rs

use std::fmt;
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::{ErrorKind, FailurePoint, PlanError, Result};
use crate::types::{EventId, GeneratorId};

use super::core::ExecutionEngine;
use super::handle::{EngineHandle, EngineRequest};

/// Why [`Runtime::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxCycles,
    Idle,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub missions_succeeded: usize,
    pub missions_failed: usize,
    pub reason: StopReason,
}

struct Waiter {
    generator: GeneratorId,
    seen: usize,
    reply: oneshot::Sender<Result<EventId>>,
}

/// Ticks the engine periodically and applies the requests sent through
/// [`EngineHandle`]s.
///
/// This is the IO shell around [`ExecutionEngine`], which contains all the
/// execution semantics. The engine is not `Send`: run this on a
/// current-thread runtime (or a `LocalSet`).
pub struct Runtime {
    engine: ExecutionEngine,
    rx: mpsc::Receiver<EngineRequest>,
    waiters: Vec<Waiter>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine)
            .field("waiters", &self.waiters.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Runtime plus the handle feeding it. The calling thread is taken as
    /// the engine thread.
    pub fn new(engine: ExecutionEngine, capacity: usize) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = EngineHandle::new(tx, thread::current().id());
        let runtime = Self {
            engine,
            rx,
            waiters: Vec::new(),
        };
        (runtime, handle)
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ExecutionEngine {
        &mut self.engine
    }

    /// Main loop.
    ///
    /// - Runs one engine cycle per tick of the cycle period.
    /// - Queues incoming requests for the next cycle.
    /// - Stops on shutdown, after `max_cycles`, or when idle if
    ///   `exit_when_idle` is set. Fatal engine errors end the loop with
    ///   [`PlanError::Aborting`].
    pub async fn run(mut self) -> Result<RunSummary> {
        let options = *self.engine.options();
        info!(period = ?options.cycle_period, max_cycles = ?options.max_cycles, "planloop runtime started");

        let mut interval = time::interval(options.cycle_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut requests_open = true;

        let reason = loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.engine.process_events() {
                        self.fail_waiters(&e);
                        return Err(e);
                    }
                    self.resolve_waiters();

                    if options.max_cycles.is_some_and(|max| self.engine.cycle() >= max) {
                        info!(cycles = self.engine.cycle(), "cycle limit reached");
                        break StopReason::MaxCycles;
                    }
                    if options.exit_when_idle && self.engine.is_idle() {
                        info!(cycles = self.engine.cycle(), "no mission left, stopping");
                        break StopReason::Idle;
                    }
                }
                request = self.rx.recv(), if requests_open => {
                    match request {
                        Some(EngineRequest::Shutdown) => {
                            info!("shutdown requested");
                            break StopReason::Shutdown;
                        }
                        Some(request) => self.accept(request),
                        None => {
                            debug!("all engine handles dropped");
                            requests_open = false;
                        }
                    }
                }
            }
        };

        let results = self.engine.mission_results();
        let summary = RunSummary {
            cycles: self.engine.cycle(),
            missions_succeeded: results.values().filter(|s| **s).count(),
            missions_failed: results.values().filter(|s| !**s).count(),
            reason,
        };
        info!(?summary, "runtime exiting");
        Ok(summary)
    }

    fn accept(&mut self, request: EngineRequest) {
        debug!(?request, "runtime received request");
        match request {
            EngineRequest::Call {
                generator,
                context,
                reply,
            } => self.defer(move |plan| plan.call(generator, context), reply),
            EngineRequest::Emit {
                generator,
                context,
                reply,
            } => self.defer(move |plan| plan.emit(generator, context), reply),
            EngineRequest::Execute { work, reply } => {
                self.defer(move |plan| work(plan).map_err(PlanError::from), reply)
            }
            EngineRequest::WaitUntil { generator, reply } => {
                match self.engine.plan().generator(generator) {
                    Some(g) => self.waiters.push(Waiter {
                        generator,
                        seen: g.history().len(),
                        reply,
                    }),
                    None => {
                        let _ = reply.send(Err(PlanError::Ownership(format!(
                            "{generator} is not included in this plan"
                        ))));
                    }
                }
            }
            EngineRequest::Shutdown => {}
        }
    }

    fn defer(
        &mut self,
        work: impl FnOnce(&mut crate::plan::Plan) -> Result<()> + 'static,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        match reply {
            Some(reply) => self.engine.once_with_reply(work, move |result| {
                if reply.send(result).is_err() {
                    debug!("requester went away before the reply");
                }
            }),
            None => self.engine.once(work),
        }
    }

    fn resolve_waiters(&mut self) {
        let plan = self.engine.plan();
        let mut remaining = Vec::new();
        for waiter in self.waiters.drain(..) {
            let Some(g) = plan.generator(waiter.generator) else {
                let _ = waiter.reply.send(Err(PlanError::Ownership(format!(
                    "{} has been removed from the plan",
                    waiter.generator
                ))));
                continue;
            };
            if let Some(event) = g.history().get(waiter.seen) {
                let _ = waiter.reply.send(Ok(*event));
            } else if let Some(reason) = g.unreachability_reason() {
                let error = plan.localize(
                    ErrorKind::UnreachableEvent {
                        reason: Some(reason.clone()),
                    },
                    FailurePoint::Generator(waiter.generator),
                );
                let _ = waiter.reply.send(Err(error.into()));
            } else {
                remaining.push(waiter);
            }
        }
        self.waiters = remaining;
    }

    fn fail_waiters(&mut self, error: &PlanError) {
        for waiter in self.waiters.drain(..) {
            warn!(generator = %waiter.generator, "engine aborted while waiting for event");
            let _ = waiter
                .reply
                .send(Err(PlanError::Other(anyhow::anyhow!("engine aborted: {error}"))));
        }
    }
}
