// src/config/mod.rs

//! Plan files: TOML description of task models, tasks and dependencies.
//!
//! Flow: [`loader`] reads a [`RawPlanFile`], [`validate`] turns it into a
//! [`PlanFile`], and [`build`] instantiates the plan and engine from it.

pub mod build;
pub mod loader;
pub mod model;
pub mod validate;

pub use build::{build_engine, build_plan, build_registry, BuiltPlan};
pub use loader::{default_config_path, load_and_validate, load_from_path, parse_str};
pub use model::{
    DependencyConfig, EngineSection, EventConfig, ModelConfig, PlanFile, RawPlanFile, TaskConfig,
};
pub use validate::validate_plan_file;
