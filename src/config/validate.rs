// src/config/validate.rs

use std::collections::{BTreeSet, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{PlanFile, RawPlanFile};
use crate::errors::{PlanError, Result};
use crate::plan::ModelRegistry;

impl TryFrom<RawPlanFile> for PlanFile {
    type Error = PlanError;

    fn try_from(raw: RawPlanFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_plan(&raw)?;
        Ok(PlanFile::new_unchecked(raw))
    }
}

/// Check an already-built plan file again (e.g. after editing it in code).
pub fn validate_plan_file(file: &PlanFile) -> Result<()> {
    let raw = RawPlanFile {
        tags: file.tags.clone(),
        engine: file.engine,
        model: file.model.clone(),
        task: file.task.clone(),
        dependency: file.dependency.clone(),
    };
    validate_raw_plan(&raw)
}

fn validate_raw_plan(cfg: &RawPlanFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_engine_section(cfg)?;
    let builtins = ModelRegistry::new();
    validate_models(cfg, &builtins)?;
    validate_model_inheritance(cfg)?;
    validate_tasks(cfg, &builtins)?;
    validate_dependencies(cfg, &builtins)?;
    validate_acyclic(
        "dependency",
        cfg.dependency
            .iter()
            .map(|d| (d.parent.as_str(), d.child.as_str())),
    )?;
    validate_acyclic(
        "planning",
        cfg.task
            .iter()
            .filter_map(|(name, t)| t.planned_by.as_deref().map(|p| (name.as_str(), p))),
    )?;
    Ok(())
}

fn ensure_has_tasks(cfg: &RawPlanFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(PlanError::ConfigError(
            "plan file must contain at least one [task.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_engine_section(cfg: &RawPlanFile) -> Result<()> {
    if cfg.engine.cycle_period_ms == 0 {
        return Err(PlanError::ConfigError(
            "[engine].cycle_period_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn model_exists(cfg: &RawPlanFile, builtins: &ModelRegistry, name: &str) -> bool {
    cfg.model.contains_key(name) || builtins.contains(name)
}

/// Event names of `model`, following config parents up to a built-in.
fn model_events(cfg: &RawPlanFile, builtins: &ModelRegistry, model: &str) -> BTreeSet<String> {
    let mut events = BTreeSet::new();
    let mut seen = HashSet::new();
    let mut current = Some(model);
    while let Some(name) = current {
        if !seen.insert(name) {
            break;
        }
        match cfg.model.get(name) {
            Some(m) => {
                events.extend(m.events.keys().cloned());
                current = Some(m.effective_parent());
            }
            None => {
                if let Some(builtin) = builtins.get(name) {
                    events.extend(builtin.events().iter().map(|e| e.name().to_string()));
                }
                current = None;
            }
        }
    }
    events
}

fn validate_models(cfg: &RawPlanFile, builtins: &ModelRegistry) -> Result<()> {
    let tags: HashSet<&str> = cfg.tags.iter().map(String::as_str).collect();
    for (name, model) in cfg.model.iter() {
        if builtins.contains(name) {
            return Err(PlanError::ConfigError(format!(
                "model '{name}' redefines a built-in model"
            )));
        }
        if tags.contains(name.as_str()) {
            return Err(PlanError::ConfigError(format!(
                "'{name}' is declared both as a tag and as a model"
            )));
        }
        let parent = model.effective_parent();
        if !model_exists(cfg, builtins, parent) {
            return Err(PlanError::ConfigError(format!(
                "model '{name}' has unknown parent '{parent}'"
            )));
        }
        for tag in model.tags.iter() {
            if !tags.contains(tag.as_str()) {
                return Err(PlanError::ConfigError(format!(
                    "model '{name}' uses undeclared tag '{tag}'"
                )));
            }
        }
        let events = model_events(cfg, builtins, name);
        for [from, to] in model.edges() {
            for event in [from, to] {
                if !events.contains(event) {
                    return Err(PlanError::ConfigError(format!(
                        "model '{name}' relates unknown event '{event}'"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_model_inheritance(cfg: &RawPlanFile) -> Result<()> {
    // Edge direction: parent -> model.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for (name, model) in cfg.model.iter() {
        graph.add_node(name.as_str());
        let parent = model.effective_parent();
        if cfg.model.contains_key(parent) {
            graph.add_edge(parent, name.as_str(), ());
        }
    }
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(PlanError::ConfigError(format!(
            "cycle detected in model inheritance involving model '{}'",
            cycle.node_id()
        ))),
    }
}

fn validate_tasks(cfg: &RawPlanFile, builtins: &ModelRegistry) -> Result<()> {
    for (name, task) in cfg.task.iter() {
        let model = task.effective_model();
        if !model_exists(cfg, builtins, model) {
            return Err(PlanError::ConfigError(format!(
                "task '{name}' uses unknown model '{model}'"
            )));
        }
        if task.succeed_after == Some(0) || task.fail_after == Some(0) {
            return Err(PlanError::ConfigError(format!(
                "task '{name}': succeed_after/fail_after must be >= 1"
            )));
        }
        let events = model_events(cfg, builtins, model);
        let needed = [
            task.succeed_after.map(|_| crate::types::SUCCESS),
            task.fail_after.map(|_| crate::types::FAILED),
        ];
        for event in needed.into_iter().flatten() {
            if !events.contains(event) {
                return Err(PlanError::ConfigError(format!(
                    "task '{name}' ({model}) has no '{event}' event"
                )));
            }
        }
        if let Some(planner) = task.planned_by.as_deref() {
            if !cfg.task.contains_key(planner) {
                return Err(PlanError::ConfigError(format!(
                    "task '{name}' is planned by unknown task '{planner}'"
                )));
            }
            if planner == name {
                return Err(PlanError::ConfigError(format!(
                    "task '{name}' cannot plan itself"
                )));
            }
        }
    }
    Ok(())
}

fn validate_dependencies(cfg: &RawPlanFile, builtins: &ModelRegistry) -> Result<()> {
    for dep in cfg.dependency.iter() {
        for end in [&dep.parent, &dep.child] {
            if !cfg.task.contains_key(end) {
                return Err(PlanError::ConfigError(format!(
                    "dependency {} -> {} refers to unknown task '{end}'",
                    dep.parent, dep.child
                )));
            }
        }
        if dep.parent == dep.child {
            return Err(PlanError::ConfigError(format!(
                "task '{}' cannot depend on itself",
                dep.parent
            )));
        }
        let child_model = cfg
            .task
            .get(&dep.child)
            .map(|t| t.effective_model())
            .unwrap_or(crate::plan::SIMPLE_MODEL);
        let events = model_events(cfg, builtins, child_model);
        let referenced = dep.success.iter().flatten().chain(dep.failure.iter());
        for event in referenced {
            if !events.contains(event) {
                return Err(PlanError::ConfigError(format!(
                    "dependency {} -> {} refers to unknown event '{event}' of {child_model}",
                    dep.parent, dep.child
                )));
            }
        }
    }
    Ok(())
}

fn validate_acyclic<'a>(
    relation: &str,
    edges: impl Iterator<Item = (&'a str, &'a str)>,
) -> Result<()> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for (from, to) in edges {
        graph.add_edge(from, to, ());
    }
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(PlanError::RelationCycle(format!(
            "cycle detected in the {relation} relation involving task '{}'",
            cycle.node_id()
        ))),
    }
}
