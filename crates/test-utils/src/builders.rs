#![allow(dead_code)]

use std::collections::BTreeMap;

use planloop::config::{
    DependencyConfig, EngineSection, ModelConfig, PlanFile, RawPlanFile, TaskConfig,
};
use planloop::engine::{EngineOptions, ExecutionEngine};
use planloop::plan::{EventSpec, ModelRegistry, Plan, TaskModelBuilder, SIMPLE_MODEL};

/// Builder for `PlanFile` to simplify test setup.
pub struct PlanFileBuilder {
    file: RawPlanFile,
}

impl PlanFileBuilder {
    pub fn new() -> Self {
        Self {
            file: RawPlanFile {
                tags: Vec::new(),
                engine: EngineSection::default(),
                model: BTreeMap::new(),
                task: BTreeMap::new(),
                dependency: Vec::new(),
            },
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.file.tags.push(tag.to_string());
        self
    }

    pub fn with_model(mut self, name: &str, model: ModelConfig) -> Self {
        self.file.model.insert(name.to_string(), model);
        self
    }

    pub fn with_task(mut self, name: &str, task: TaskConfig) -> Self {
        self.file.task.insert(name.to_string(), task);
        self
    }

    pub fn with_dependency(mut self, parent: &str, child: &str) -> Self {
        self.file.dependency.push(dependency(parent, child));
        self
    }

    pub fn with_dependency_config(mut self, dep: DependencyConfig) -> Self {
        self.file.dependency.push(dep);
        self
    }

    pub fn max_cycles(mut self, cycles: u64) -> Self {
        self.file.engine.max_cycles = cycles;
        self
    }

    pub fn cycle_period_ms(mut self, ms: u64) -> Self {
        self.file.engine.cycle_period_ms = ms;
        self
    }

    pub fn exit_when_idle(mut self, value: bool) -> Self {
        self.file.engine.exit_when_idle = value;
        self
    }

    /// The raw file, for tests that expect validation to fail.
    pub fn raw(self) -> RawPlanFile {
        self.file
    }

    pub fn build(self) -> PlanFile {
        PlanFile::try_from(self.file).expect("Failed to build valid plan file from builder")
    }
}

impl Default for PlanFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn dependency(parent: &str, child: &str) -> DependencyConfig {
    DependencyConfig {
        parent: parent.to_string(),
        child: child.to_string(),
        success: None,
        failure: Vec::new(),
        roles: Vec::new(),
        remove_when_done: None,
        consider_in_pending: None,
    }
}

/// Builder for `TaskConfig`.
pub struct TaskConfigBuilder {
    task: TaskConfig,
}

impl TaskConfigBuilder {
    pub fn new() -> Self {
        Self {
            task: TaskConfig::default(),
        }
    }

    pub fn model(mut self, model: &str) -> Self {
        self.task.model = Some(model.to_string());
        self
    }

    pub fn mission(mut self) -> Self {
        self.task.mission = true;
        self
    }

    pub fn permanent(mut self) -> Self {
        self.task.permanent = true;
        self
    }

    pub fn planned_by(mut self, planner: &str) -> Self {
        self.task.planned_by = Some(planner.to_string());
        self
    }

    pub fn succeed_after(mut self, polls: u32) -> Self {
        self.task.succeed_after = Some(polls);
        self
    }

    pub fn fail_after(mut self, polls: u32) -> Self {
        self.task.fail_after = Some(polls);
        self
    }

    pub fn argument(mut self, name: &str, value: toml::Value) -> Self {
        self.task.arguments.insert(name.to_string(), value);
        self
    }

    pub fn build(self) -> TaskConfig {
        self.task
    }
}

impl Default for TaskConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with a few models shared by the tests:
/// - `Localization` tag,
/// - `Move`: a `Simple` task with a contingent `blocked` event leading to
///   `failed`,
/// - `Localize`: provides `Localization`, has a `located` event forwarded
///   to `success`,
/// - `Goto`: a `Move` that needs a `target` argument.
pub fn test_registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry
        .define_tag("Localization")
        .expect("Failed to define tag");
    registry
        .register(
            TaskModelBuilder::new("Move")
                .parent(SIMPLE_MODEL)
                .event("blocked", EventSpec::new())
                .forward("blocked", "failed"),
        )
        .expect("Failed to register Move");
    registry
        .register(
            TaskModelBuilder::new("Localize")
                .parent(SIMPLE_MODEL)
                .tag("Localization")
                .event("located", EventSpec::new())
                .forward("located", "success"),
        )
        .expect("Failed to register Localize");
    registry
        .register(TaskModelBuilder::new("Goto").parent("Move").argument("target"))
        .expect("Failed to register Goto");
    registry
}

pub fn test_plan() -> Plan {
    Plan::with_models(test_registry())
}

/// Engine that never waits: tests drive it with `process_events`.
pub fn test_engine(plan: Plan) -> ExecutionEngine {
    ExecutionEngine::new(
        plan,
        EngineOptions {
            cycle_period: std::time::Duration::from_millis(1),
            max_cycles: None,
            exit_when_idle: true,
        },
    )
}
