// src/engine/core.rs

//! Pure execution engine: one synchronous cycle at a time.
//!
//! [`ExecutionEngine::process_events`] runs one cycle:
//! 1. deferred work queued since the last cycle (external calls, emits,
//!    closures) runs in a single propagation pass;
//! 2. structure checks run on the settled plan;
//! 3. the faults they report go through exception handling;
//! 4. garbage collection;
//! 5. schedulers and task polls run in one propagation pass.
//!
//! Fatal errors gathered along the way abort the cycle with
//! [`PlanError::Aborting`].
//!
//! The engine has no channels, no Tokio types and performs no IO; the
//! async shell lives in [`crate::engine::runtime`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::engine::exceptions::{
    handle_exceptions, DecisionControl, DefaultDecisionControl, ExceptionOutcome,
};
use crate::engine::gc::GcReport;
use crate::engine::scheduler::{BasicScheduler, Scheduler};
use crate::errors::{Aborting, LocalizedError, PlanError, Result};
use crate::plan::Plan;
use crate::types::TaskId;

/// Engine options, usually read from the `[engine]` section of the plan
/// file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub cycle_period: Duration,
    /// Stop after this many cycles.
    pub max_cycles: Option<u64>,
    /// Stop once no mission or permanent task is left unfinished.
    pub exit_when_idle: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cycle_period: Duration::from_millis(100),
            max_cycles: None,
            exit_when_idle: true,
        }
    }
}

type Work = Box<dyn FnOnce(&mut Plan) -> Result<()>>;
type Reply = Box<dyn FnOnce(Result<()>)>;

struct Deferred {
    work: Work,
    reply: Option<Reply>,
}

/// What happened during one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    /// Errors reported by propagation and handled locally (task failures,
    /// canceled calls, failed preconditions...).
    pub handled: Vec<LocalizedError>,
    pub exceptions: ExceptionOutcome,
    pub gc: GcReport,
}

pub struct ExecutionEngine {
    plan: Plan,
    control: Box<dyn DecisionControl>,
    schedulers: Vec<Box<dyn Scheduler>>,
    options: EngineOptions,
    cycle: u64,
    deferred: VecDeque<Deferred>,
    mission_results: BTreeMap<TaskId, bool>,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("plan", &self.plan)
            .field("options", &self.options)
            .field("cycle", &self.cycle)
            .field("deferred", &self.deferred.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Engine with the default decision control and a [`BasicScheduler`].
    pub fn new(plan: Plan, options: EngineOptions) -> Self {
        Self {
            plan,
            control: Box::new(DefaultDecisionControl),
            schedulers: vec![Box::new(BasicScheduler::new())],
            options,
            cycle: 0,
            deferred: VecDeque::new(),
            mission_results: BTreeMap::new(),
        }
    }

    pub fn with_control(mut self, control: Box<dyn DecisionControl>) -> Self {
        self.control = control;
        self
    }

    /// Replace all schedulers.
    pub fn with_schedulers(mut self, schedulers: Vec<Box<dyn Scheduler>>) -> Self {
        self.schedulers = schedulers;
        self
    }

    pub fn add_scheduler(&mut self, scheduler: Box<dyn Scheduler>) {
        self.schedulers.push(scheduler);
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn plan_mut(&mut self) -> &mut Plan {
        &mut self.plan
    }

    pub fn into_plan(self) -> Plan {
        self.plan
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Number of cycles run so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Queue `work` for the top of the next cycle.
    pub fn once(&mut self, work: impl FnOnce(&mut Plan) -> Result<()> + 'static) {
        self.deferred.push_back(Deferred {
            work: Box::new(work),
            reply: None,
        });
    }

    /// Like [`ExecutionEngine::once`], `reply` gets the result of `work`.
    pub fn once_with_reply(
        &mut self,
        work: impl FnOnce(&mut Plan) -> Result<()> + 'static,
        reply: impl FnOnce(Result<()>) + 'static,
    ) {
        self.deferred.push_back(Deferred {
            work: Box::new(work),
            reply: Some(Box::new(reply)),
        });
    }

    /// True when no mission or permanent task is left unfinished.
    pub fn is_idle(&self) -> bool {
        self.plan
            .missions()
            .chain(self.plan.permanent_tasks.iter().copied())
            .all(|t| self.plan.status(t).is_none_or(|s| s.finished()))
    }

    /// Missions that finished, with their success.
    pub fn mission_results(&self) -> &BTreeMap<TaskId, bool> {
        &self.mission_results
    }

    pub fn process_events(&mut self) -> Result<CycleReport> {
        if self.plan.is_propagating() {
            return Err(PlanError::PhaseMismatch(
                "process_events called during propagation".to_string(),
            ));
        }
        self.cycle += 1;
        debug!(cycle = self.cycle, "cycle started");
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };
        let mut fatal = Vec::new();

        fatal.extend(self.run_deferred());
        self.record_missions();

        let errors = self.plan.check_structure_with(self.control.as_mut());
        if !errors.is_empty() {
            info!(cycle = self.cycle, count = errors.len(), "structure checks reported errors");
        }
        report.exceptions = handle_exceptions(&mut self.plan, self.control.as_mut(), errors);
        fatal.append(&mut report.exceptions.fatal.clone());

        report.gc = self.plan.garbage_collect()?;
        fatal.append(&mut report.gc.fatal.clone());

        let schedulers = &mut self.schedulers;
        let (result, errors) = self.plan.propagate_collect(|plan| {
            for scheduler in schedulers.iter_mut() {
                if let Err(e) = scheduler.schedule(plan) {
                    warn!(scheduler = scheduler.name(), error = %e, "scheduler failed");
                }
            }
            plan.run_polls();
            Ok(())
        });
        result?;
        fatal.extend(errors);
        self.record_missions();

        report.handled = self.plan.take_handled_errors();
        if !fatal.is_empty() {
            for error in &fatal {
                error!(cycle = self.cycle, %error, "fatal error");
            }
            return Err(PlanError::Aborting(Aborting::new(fatal)));
        }
        Ok(report)
    }

    fn run_deferred(&mut self) -> Vec<LocalizedError> {
        if self.deferred.is_empty() {
            return Vec::new();
        }
        let deferred: Vec<Deferred> = self.deferred.drain(..).collect();
        debug!(count = deferred.len(), "running deferred work");
        let (_, fatal) = self.plan.propagate_collect(|plan| {
            for Deferred { work, reply } in deferred {
                let result = work(plan);
                if let Err(e) = &result {
                    warn!(error = %e, "deferred work failed");
                }
                if let Some(reply) = reply {
                    reply(result);
                }
            }
            Ok(())
        });
        fatal
    }

    fn record_missions(&mut self) {
        for mission in self.plan.missions() {
            if self.mission_results.contains_key(&mission) {
                continue;
            }
            let Some(status) = self.plan.status(mission) else {
                continue;
            };
            if status.finished() {
                info!(%mission, success = status.success(), "mission finished");
                self.mission_results.insert(mission, status.success());
            }
        }
    }
}
