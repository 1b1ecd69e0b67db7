// src/config/build.rs

//! Turn a validated [`PlanFile`] into a plan and an engine.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info};

use crate::config::model::{EngineSection, ModelConfig, PlanFile, TaskConfig};
use crate::engine::{EngineOptions, ExecutionEngine};
use crate::errors::{PlanError, Result};
use crate::plan::{
    ArgumentDefault, EventSpec, ModelRegistry, Plan, PollCallback, TaskModelBuilder,
};
use crate::relations::DependencyOptions;
use crate::types::{TaskId, FAILED, SUCCESS};

/// Plan built from a plan file, with the ids of its named tasks.
#[derive(Debug)]
pub struct BuiltPlan {
    pub plan: Plan,
    pub tasks: BTreeMap<String, TaskId>,
}

impl From<EngineSection> for EngineOptions {
    fn from(section: EngineSection) -> Self {
        Self {
            cycle_period: Duration::from_millis(section.cycle_period_ms),
            max_cycles: (section.max_cycles > 0).then_some(section.max_cycles),
            exit_when_idle: section.exit_when_idle,
        }
    }
}

pub fn build_registry(file: &PlanFile) -> Result<ModelRegistry> {
    let mut registry = ModelRegistry::new();
    for tag in file.tags.iter() {
        registry.define_tag(tag.clone())?;
    }

    // Parents first.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for (name, model) in file.model.iter() {
        graph.add_node(name.as_str());
        if file.model.contains_key(model.effective_parent()) {
            graph.add_edge(model.effective_parent(), name.as_str(), ());
        }
    }
    let order = toposort(&graph, None).map_err(|cycle| {
        PlanError::ConfigError(format!(
            "cycle detected in model inheritance involving model '{}'",
            cycle.node_id()
        ))
    })?;

    for name in order {
        let Some(model) = file.model.get(name) else {
            continue;
        };
        registry.register(model_builder(name, model))?;
        debug!(model = name, "registered model from plan file");
    }
    Ok(registry)
}

fn model_builder(name: &str, model: &ModelConfig) -> TaskModelBuilder {
    let mut builder = TaskModelBuilder::new(name).parent(model.effective_parent());
    if model.is_abstract {
        builder = builder.abstract_model();
    }
    for tag in model.tags.iter() {
        builder = builder.tag(tag.clone());
    }
    for argument in model.arguments.iter() {
        builder = builder.argument(argument.clone());
    }
    for (argument, value) in model.defaults.iter() {
        builder = builder.argument_with_default(argument.clone(), ArgumentDefault::Value(value.clone()));
    }
    for (event, config) in model.events.iter() {
        let mut spec = if config.controllable {
            EventSpec::controllable()
        } else {
            EventSpec::new()
        };
        if config.terminal {
            spec = spec.terminal();
        }
        builder = builder.event(event.clone(), spec);
    }
    for [from, to] in model.forward.iter() {
        builder = builder.forward(from.clone(), to.clone());
    }
    for [from, to] in model.signal.iter() {
        builder = builder.signal(from.clone(), to.clone());
    }
    for [from, to] in model.causal_link.iter() {
        builder = builder.causal_link(from.clone(), to.clone());
    }
    builder
}

/// Poll emitting `event` on the `after`-th poll of the task.
fn countdown(event: &'static str, after: u32) -> PollCallback {
    let polls = Rc::new(Cell::new(0u32));
    Rc::new(move |plan: &mut Plan, task: TaskId| -> anyhow::Result<()> {
        polls.set(polls.get() + 1);
        if polls.get() == after {
            debug!(%task, event, "countdown elapsed");
            plan.emit_event(task, event)?;
        }
        Ok(())
    })
}

fn add_task(plan: &mut Plan, name: &str, config: &TaskConfig) -> Result<TaskId> {
    let id = plan.add_task_with(
        config.effective_model(),
        config.arguments.iter().map(|(k, v)| (k.clone(), v.clone())),
    )?;
    if config.mission {
        plan.add_mission_task(id)?;
    }
    if config.permanent {
        plan.add_permanent_task(id)?;
    }
    if let Some(after) = config.succeed_after {
        plan.poll(id, None, countdown(SUCCESS, after))?;
    }
    if let Some(after) = config.fail_after {
        plan.poll(id, None, countdown(FAILED, after))?;
    }
    debug!(task = name, id = %id, model = config.effective_model(), "added task from plan file");
    Ok(id)
}

pub fn build_plan(file: &PlanFile) -> Result<BuiltPlan> {
    let mut plan = Plan::with_models(build_registry(file)?);

    let mut tasks = BTreeMap::new();
    for (name, config) in file.task.iter() {
        let id = add_task(&mut plan, name, config)?;
        tasks.insert(name.clone(), id);
    }

    let lookup = |name: &str| {
        tasks
            .get(name)
            .copied()
            .ok_or_else(|| PlanError::ConfigError(format!("unknown task '{name}'")))
    };

    for (name, config) in file.task.iter() {
        if let Some(planner) = config.planned_by.as_deref() {
            plan.planned_by(lookup(name)?, lookup(planner)?)?;
        }
    }

    for dep in file.dependency.iter() {
        let mut options = DependencyOptions::new();
        if let Some(success) = &dep.success {
            options = options.success(success.iter().cloned());
        }
        if !dep.failure.is_empty() {
            options = options.failure(dep.failure.iter().cloned());
        }
        for role in dep.roles.iter() {
            options = options.role(role.clone());
        }
        if let Some(value) = dep.remove_when_done {
            options = options.remove_when_done(value);
        }
        if let Some(value) = dep.consider_in_pending {
            options = options.consider_in_pending(value);
        }
        plan.depends_on(lookup(&dep.parent)?, lookup(&dep.child)?, options)?;
    }

    info!(
        tasks = tasks.len(),
        dependencies = file.dependency.len(),
        "plan built from plan file"
    );
    Ok(BuiltPlan { plan, tasks })
}

/// Engine running the plan described by `file`, with the default scheduler.
pub fn build_engine(file: &PlanFile) -> Result<ExecutionEngine> {
    let built = build_plan(file)?;
    Ok(ExecutionEngine::new(built.plan, file.engine.into()))
}
