use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Opaque payload carried by event contexts and task arguments.
pub type Value = toml::Value;

macro_rules! plan_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

plan_id!(
    /// Identity of a task inside a plan (and of its proxy in a transaction).
    TaskId,
    "task"
);
plan_id!(
    /// Identity of an event generator (task-bound or free).
    GeneratorId,
    "generator"
);
plan_id!(
    /// Identity of one emission of a generator.
    EventId,
    "event"
);

/// What happens to a handler when its task is replaced by another one.
///
/// - `Copy`: the handler is also installed on the replacing task.
/// - `Drop`: the handler stays with the replaced task only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacePolicy {
    Copy,
    Drop,
}

impl FromStr for ReplacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "copy" => Ok(ReplacePolicy::Copy),
            "drop" => Ok(ReplacePolicy::Drop),
            other => Err(format!(
                "invalid replace policy: {other} (expected \"copy\" or \"drop\")"
            )),
        }
    }
}

/// The three event relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventRelation {
    /// Emission of the source calls the target's command.
    Signal,
    /// Emission of the source emits the target directly.
    Forwarding,
    /// Ordering-only link; the target is emitted alongside the source.
    CausalLink,
}

impl fmt::Display for EventRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventRelation::Signal => "signal",
            EventRelation::Forwarding => "forwarding",
            EventRelation::CausalLink => "causal link",
        };
        f.write_str(name)
    }
}

/// Classification of a task's terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// Ends the task without saying whether it succeeded (e.g. `stop`).
    Stop,
    /// Leads to `success`.
    Success,
    /// Leads to `failed`.
    Failure,
}

pub const START: &str = "start";
pub const STOP: &str = "stop";
pub const SUCCESS: &str = "success";
pub const FAILED: &str = "failed";
pub const ABORTED: &str = "aborted";
pub const INTERNAL_ERROR: &str = "internal_error";
