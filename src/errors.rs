// src/errors.rs

//! Crate-wide error types.
//!
//! There are two layers:
//! - [`PlanError`] is what public operations return: usage errors, context
//!   errors, configuration errors and localized plan faults.
//! - [`LocalizedError`] is a fault attributed to exactly one plan object
//!   (an emitted event, an event generator or a task). These are what the
//!   propagation engine, the structure checks and the exception pipeline
//!   pass around.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::plan::UnreachableReason;
use crate::types::{EventId, GeneratorId, TaskId};

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Argument error: {0}")]
    Argument(String),

    #[error("Model violation: {0}")]
    ModelViolation(String),

    #[error("Relation cycle: {0}")]
    RelationCycle(String),

    #[error("Ownership error: {0}")]
    Ownership(String),

    #[error("Invalid replacement of {from} by {to}: {reason}")]
    InvalidReplace {
        from: TaskId,
        to: TaskId,
        reason: String,
    },

    #[error("Phase mismatch: {0}")]
    PhaseMismatch(String),

    #[error("Thread mismatch: {0}")]
    ThreadMismatch(String),

    #[error("Transaction is already {0}")]
    TransactionClosed(&'static str),

    #[error(transparent)]
    Localized(#[from] LocalizedError),

    #[error(transparent)]
    Aborting(#[from] Aborting),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlanError {
    /// The localized fault carried by this error, if any.
    pub fn localized(&self) -> Option<&LocalizedError> {
        match self {
            PlanError::Localized(e) => Some(e),
            _ => None,
        }
    }

    /// Short name of the localized fault kind (e.g. `"CommandFailed"`).
    pub fn kind_name(&self) -> Option<&'static str> {
        self.localized().map(|e| e.kind().name())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PlanError>;

/// Marker error for event commands that decline to run.
///
/// A command returning this error (through `anyhow`) produces an
/// `EventCanceled` report instead of a `CommandFailed` fault, and the
/// owning task is left alone.
#[derive(Debug, Error)]
#[error("event call canceled: {0}")]
pub struct Canceled(pub String);

/// The plan object a fault is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePoint {
    Event(EventId),
    Generator(GeneratorId),
    Task(TaskId),
}

impl fmt::Display for FailurePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePoint::Event(id) => write!(f, "{id}"),
            FailurePoint::Generator(id) => write!(f, "{id}"),
            FailurePoint::Task(id) => write!(f, "{id}"),
        }
    }
}

/// Kind of a localized fault.
///
/// Kinds holding an `anyhow::Error` form the code-error family: they wrap a
/// failure raised by user code (commands, handlers, polls).
#[derive(Debug, Clone)]
pub enum ErrorKind {
    TaskNotExecutable,
    TaskEventNotExecutable,
    EventNotExecutable,
    EventNotControlable,
    EventCanceled,
    EventPreconditionFailed,
    /// Raised when a failing command or handler hits a task that is already
    /// terminating. Always fatal.
    TaskEmergencyTermination { reason: Box<LocalizedError> },
    CommandFailed(Arc<anyhow::Error>),
    EventHandlerError(Arc<anyhow::Error>),
    EmissionFailed(Option<Arc<anyhow::Error>>),
    PollingFailed(Arc<anyhow::Error>),
    FailedExceptionHandler {
        error: Arc<anyhow::Error>,
        handled: Box<LocalizedError>,
    },
    UnreachableEvent { reason: Option<UnreachableReason> },
    ChildFailed {
        parent: TaskId,
        explanation: Option<Box<LocalizedError>>,
    },
    PlanningFailed { planned: TaskId },
    MissionFailed,
    PropagationLoop,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::TaskNotExecutable => "TaskNotExecutable",
            ErrorKind::TaskEventNotExecutable => "TaskEventNotExecutable",
            ErrorKind::EventNotExecutable => "EventNotExecutable",
            ErrorKind::EventNotControlable => "EventNotControlable",
            ErrorKind::EventCanceled => "EventCanceled",
            ErrorKind::EventPreconditionFailed => "EventPreconditionFailed",
            ErrorKind::TaskEmergencyTermination { .. } => "TaskEmergencyTermination",
            ErrorKind::CommandFailed(_) => "CommandFailed",
            ErrorKind::EventHandlerError(_) => "EventHandlerError",
            ErrorKind::EmissionFailed(_) => "EmissionFailed",
            ErrorKind::PollingFailed(_) => "PollingFailed",
            ErrorKind::FailedExceptionHandler { .. } => "FailedExceptionHandler",
            ErrorKind::UnreachableEvent { .. } => "UnreachableEvent",
            ErrorKind::ChildFailed { .. } => "ChildFailed",
            ErrorKind::PlanningFailed { .. } => "PlanningFailed",
            ErrorKind::MissionFailed => "MissionFailed",
            ErrorKind::PropagationLoop => "PropagationLoop",
        }
    }

    /// True for faults raised by user code.
    pub fn is_code_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::CommandFailed(_)
                | ErrorKind::EventHandlerError(_)
                | ErrorKind::EmissionFailed(_)
                | ErrorKind::PollingFailed(_)
                | ErrorKind::FailedExceptionHandler { .. }
        )
    }

    /// The user-code error wrapped by a code-error kind.
    pub fn code_error(&self) -> Option<&anyhow::Error> {
        match self {
            ErrorKind::CommandFailed(e)
            | ErrorKind::EventHandlerError(e)
            | ErrorKind::PollingFailed(e)
            | ErrorKind::FailedExceptionHandler { error: e, .. } => Some(e.as_ref()),
            ErrorKind::EmissionFailed(e) => e.as_deref(),
            _ => None,
        }
    }

    fn default_message(&self) -> String {
        match self {
            ErrorKind::TaskEmergencyTermination { reason } => {
                format!("task failed while already terminating: {reason}")
            }
            ErrorKind::FailedExceptionHandler { error, handled } => {
                format!("exception handler failed with {error} while handling {handled}")
            }
            ErrorKind::ChildFailed { parent, explanation } => match explanation {
                Some(e) => format!("dependency of {parent} failed: {e}"),
                None => format!("dependency of {parent} failed"),
            },
            ErrorKind::PlanningFailed { planned } => format!("failed to plan {planned}"),
            ErrorKind::UnreachableEvent { reason } => match reason {
                Some(r) => format!("event became unreachable: {r}"),
                None => "event became unreachable".to_string(),
            },
            other => match other.code_error() {
                Some(e) => e.to_string(),
                None => String::new(),
            },
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fault attributed to one plan object.
///
/// The failed task / generator / event are deduced from the failure point
/// when the error is created, so they stay meaningful even after the
/// objects have been removed from the plan.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message} (at {failure_point})")]
pub struct LocalizedError {
    kind: ErrorKind,
    failure_point: FailurePoint,
    failed_event: Option<EventId>,
    failed_generator: Option<GeneratorId>,
    failed_task: Option<TaskId>,
    message: String,
}

impl LocalizedError {
    /// Build a fault at `failure_point`, deducing the failed objects from
    /// `plan`. Fails if the point resolves to neither a task nor a generator.
    pub fn new(
        kind: ErrorKind,
        failure_point: FailurePoint,
        plan: &crate::plan::Plan,
    ) -> Result<Self> {
        let (event, generator, task) = plan.resolve_failure_point(&failure_point);
        if generator.is_none() && task.is_none() {
            return Err(PlanError::Argument(format!(
                "cannot deduce a task and/or a generator from {failure_point}"
            )));
        }
        Ok(Self::from_parts(kind, failure_point, event, generator, task))
    }

    pub(crate) fn from_parts(
        kind: ErrorKind,
        failure_point: FailurePoint,
        failed_event: Option<EventId>,
        failed_generator: Option<GeneratorId>,
        failed_task: Option<TaskId>,
    ) -> Self {
        let message = kind.default_message();
        Self {
            kind,
            failure_point,
            failed_event,
            failed_generator,
            failed_task,
            message,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn failure_point(&self) -> &FailurePoint {
        &self.failure_point
    }

    pub fn failed_event(&self) -> Option<EventId> {
        self.failed_event
    }

    pub fn failed_generator(&self) -> Option<GeneratorId> {
        self.failed_generator
    }

    pub fn failed_task(&self) -> Option<TaskId> {
        self.failed_task
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True if this fault (or a fault it wraps) is attributed to `task`.
    pub fn involves_task(&self, task: TaskId) -> bool {
        if self.failed_task == Some(task) {
            return true;
        }
        match &self.kind {
            ErrorKind::ChildFailed { parent, .. } => *parent == task,
            ErrorKind::PlanningFailed { planned } => *planned == task,
            ErrorKind::TaskEmergencyTermination { reason } => reason.involves_task(task),
            _ => false,
        }
    }
}

/// Returned by an engine cycle that ended with fatal (escalated) faults.
#[derive(Debug, Clone, Error)]
#[error("control loop aborting because of {} unhandled fatal error(s)", .errors.len())]
pub struct Aborting {
    errors: Vec<LocalizedError>,
}

impl Aborting {
    pub fn new(errors: Vec<LocalizedError>) -> Self {
        Self { errors }
    }

    pub fn all_exceptions(&self) -> &[LocalizedError] {
        &self.errors
    }
}
