// src/engine/mod.rs

//! Execution engine for planloop.
//!
//! This module ties together:
//! - event propagation (calls, emissions, error routing)
//! - structure checks and exception handling
//! - garbage collection and task replacement
//! - scheduling policies
//! - the cycle driver and its async shell
//!
//! The pure, synchronous engine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`], and off-thread code talks to it through
//! [`handle::EngineHandle`].

pub mod core;
pub mod exceptions;
pub mod gc;
pub mod handle;
pub mod propagation;
pub mod replace;
pub mod runtime;
pub mod scheduler;
pub mod structure;

pub use core::{CycleReport, EngineOptions, ExecutionEngine};
pub use exceptions::{
    DecisionControl, DefaultDecisionControl, ErrorDecision, ErrorFilter, ExceptionAction,
    ExceptionCallback, ExecutionException, ExceptionOutcome,
};
pub use gc::GcReport;
pub use handle::{EngineHandle, EngineRequest};
pub use runtime::{RunSummary, Runtime, StopReason};
pub use scheduler::{BasicScheduler, Scheduler};
pub use structure::{StructureCheck, StructureError};
