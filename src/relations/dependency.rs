// src/relations/dependency.rs

//! The dependency relation: a parent task needs a child task to reach
//! some goal.
//!
//! Each edge carries a [`DependencyInfo`]:
//! - `model`: what the child is required to be (models/tags + arguments);
//! - `success`: predicate over the child's events that completes the edge
//!   (`None` means the edge never completes);
//! - `failure`: predicate that makes the edge fail (always or-ed with
//!   "start can no longer be emitted");
//! - `roles`: names under which the parent refers to the child;
//! - `remove_when_done`: drop the edge once it succeeded;
//! - `consider_in_pending`: report failures while the parent is pending.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::engine::exceptions::DecisionControl;
use crate::engine::structure::StructureError;
use crate::errors::{ErrorKind, FailurePoint, LocalizedError, PlanError, Result};
use crate::plan::{ModelRegistry, Plan, UnreachableReason, ROOT_MODEL};
use crate::relations::predicate::{Explanation, Predicate};
use crate::types::{TaskId, Value, START, STOP, SUCCESS};

/// What a child task must be.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelConstraint {
    /// Model names and tags, all of which must be fulfilled.
    pub models: Vec<String>,
    /// Argument values the child must have.
    pub arguments: BTreeMap<String, Value>,
}

impl ModelConstraint {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            models: vec![model.into()],
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !self.models.contains(&model) {
            self.models.push(model);
        }
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyInfo {
    pub model: ModelConstraint,
    pub success: Option<Predicate>,
    pub failure: Option<Predicate>,
    pub roles: BTreeSet<String>,
    pub remove_when_done: bool,
    pub consider_in_pending: bool,
}

impl DependencyInfo {
    /// Failure predicate including the implicit "start can no longer be
    /// emitted" term.
    pub fn effective_failure(&self) -> Predicate {
        let never_started = Predicate::never(START);
        match &self.failure {
            Some(p) => p.clone().or(never_started),
            None => never_started,
        }
    }
}

/// Options of [`Plan::depends_on`]. Unset fields take their defaults on a
/// new edge and leave the existing value alone when merging.
#[derive(Debug, Clone, Default)]
pub struct DependencyOptions {
    model: Option<ModelConstraint>,
    success: Option<Option<Predicate>>,
    failure: Option<Predicate>,
    roles: BTreeSet<String>,
    remove_when_done: Option<bool>,
    consider_in_pending: Option<bool>,
}

impl DependencyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(mut self, model: ModelConstraint) -> Self {
        self.model = Some(model);
        self
    }

    /// The edge succeeds when any of `events` is emitted. An empty list
    /// means the edge has no success condition.
    pub fn success<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.success = Some(Predicate::any_emitted(events));
        self
    }

    pub fn success_predicate(mut self, predicate: Predicate) -> Self {
        self.success = Some(Some(predicate));
        self
    }

    /// The edge fails when any of `events` is emitted.
    pub fn failure<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure = Predicate::any_emitted(events);
        self
    }

    pub fn failure_predicate(mut self, predicate: Predicate) -> Self {
        self.failure = Some(predicate);
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn remove_when_done(mut self, value: bool) -> Self {
        self.remove_when_done = Some(value);
        self
    }

    pub fn consider_in_pending(mut self, value: bool) -> Self {
        self.consider_in_pending = Some(value);
        self
    }

    /// Options that recreate `info` exactly.
    pub fn from_info(info: &DependencyInfo) -> Self {
        Self {
            model: Some(info.model.clone()),
            success: Some(info.success.clone()),
            failure: info.failure.clone(),
            roles: info.roles.clone(),
            remove_when_done: Some(info.remove_when_done),
            consider_in_pending: Some(info.consider_in_pending),
        }
    }

    pub(crate) fn into_info(self, child_model: &str) -> DependencyInfo {
        let success = match self.success {
            Some(s) => s,
            None => Some(Predicate::emitted(SUCCESS)),
        };
        DependencyInfo {
            model: self
                .model
                .unwrap_or_else(|| ModelConstraint::new(child_model)),
            success,
            failure: self.failure,
            roles: self.roles,
            remove_when_done: self.remove_when_done.unwrap_or(true),
            consider_in_pending: self.consider_in_pending.unwrap_or(true),
        }
    }
}

/// Combine two model constraints: the most specific model wins, tags and
/// arguments are unioned.
pub fn merge_model_constraints(
    registry: &ModelRegistry,
    a: &ModelConstraint,
    b: &ModelConstraint,
) -> Result<ModelConstraint> {
    let mut class: Option<&str> = None;
    let mut tags: BTreeSet<&str> = BTreeSet::new();
    for name in a.models.iter().chain(&b.models) {
        let name = name.as_str();
        if registry.is_tag(name) {
            tags.insert(name);
            continue;
        }
        class = match class {
            None => Some(name),
            Some(current) if registry.is_subclass(name, current) => Some(name),
            Some(current) if registry.is_subclass(current, name) => Some(current),
            Some(current) => {
                return Err(PlanError::ModelViolation(format!(
                    "incompatible models {current} and {name}"
                )));
            }
        };
    }

    let mut arguments = a.arguments.clone();
    for (name, value) in &b.arguments {
        match arguments.get(name) {
            Some(existing) if existing != value => {
                return Err(PlanError::ModelViolation(format!(
                    "incompatible values for argument '{name}': {existing} and {value}"
                )));
            }
            _ => {
                arguments.insert(name.clone(), value.clone());
            }
        }
    }

    let mut models: Vec<String> = class.into_iter().map(str::to_string).collect();
    models.extend(tags.into_iter().map(str::to_string));
    Ok(ModelConstraint { models, arguments })
}

pub(crate) fn merge_info(
    registry: &ModelRegistry,
    existing: &DependencyInfo,
    options: DependencyOptions,
) -> Result<DependencyInfo> {
    let model = match &options.model {
        Some(m) => merge_model_constraints(registry, &existing.model, m)?,
        None => existing.model.clone(),
    };
    let success = match options.success {
        None => existing.success.clone(),
        Some(new) => match (existing.success.clone(), new) {
            (None, p) | (p, None) => p,
            (Some(a), Some(b)) => Some(a.and(b)),
        },
    };
    let failure = match (existing.failure.clone(), options.failure) {
        (None, p) | (p, None) => p,
        (Some(a), Some(b)) => Some(a.or(b)),
    };
    let remove_when_done = match options.remove_when_done {
        Some(false) if existing.remove_when_done => {
            return Err(PlanError::ModelViolation(
                "cannot change remove_when_done from true to false on an existing dependency"
                    .to_string(),
            ));
        }
        Some(v) => v,
        None => existing.remove_when_done,
    };
    let consider_in_pending = match options.consider_in_pending {
        Some(v) => existing.consider_in_pending && v,
        None => existing.consider_in_pending,
    };
    let mut roles = existing.roles.clone();
    roles.extend(options.roles);

    Ok(DependencyInfo {
        model,
        success,
        failure,
        roles,
        remove_when_done,
        consider_in_pending,
    })
}

impl Plan {
    /// Add (or merge into) the dependency `parent` -> `child`.
    pub fn depends_on(
        &mut self,
        parent: TaskId,
        child: TaskId,
        options: DependencyOptions,
    ) -> Result<()> {
        self.task_or_err(parent)?;
        let child_model = self.task_or_err(child)?.model_name().to_string();
        if parent == child {
            return Err(PlanError::RelationCycle(format!(
                "{parent} cannot depend on itself"
            )));
        }

        let info = match self.relations.dependency.edge(parent, child) {
            Some(existing) => merge_info(&self.models, existing, options)?,
            None => {
                if self.relations.dependency.reaches(child, parent) {
                    return Err(PlanError::RelationCycle(format!(
                        "adding {parent} -> {child} would create a dependency cycle"
                    )));
                }
                options.into_info(&child_model)
            }
        };
        self.validate_dependency_info(child, &info)?;

        self.relations.dependency.add_edge(parent, child, info);
        debug!(%parent, %child, "added dependency");
        Ok(())
    }

    fn validate_dependency_info(&self, child: TaskId, info: &DependencyInfo) -> Result<()> {
        let child_task = self.task_or_err(child)?;
        for predicate in info.success.iter().chain(&info.failure) {
            for event in predicate.events() {
                if child_task.event(event).is_none() {
                    return Err(PlanError::Argument(format!(
                        "{child} ({}) has no event '{event}'",
                        child_task.model_name()
                    )));
                }
            }
        }
        self.validate_fulfillment(child, &info.model)
    }

    /// Check that `task` fulfills `constraint`.
    pub fn validate_fulfillment(&self, task: TaskId, constraint: &ModelConstraint) -> Result<()> {
        let t = self.task_or_err(task)?;
        for model in &constraint.models {
            if !self.models.contains(model) {
                return Err(PlanError::Argument(format!("unknown model or tag '{model}'")));
            }
            if !t.model.fullfills(model) {
                return Err(PlanError::Argument(format!(
                    "{task} ({}) does not fulfill {model}",
                    t.model_name()
                )));
            }
        }
        for (name, value) in &constraint.arguments {
            if self.argument(task, name).as_ref() != Some(value) {
                return Err(PlanError::Argument(format!(
                    "{task} does not have argument {name} = {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn remove_dependency(&mut self, parent: TaskId, child: TaskId) -> Option<DependencyInfo> {
        let removed = self.relations.dependency.remove_edge(parent, child);
        if removed.is_some() {
            self.completed_dependencies.remove(&(parent, child));
            debug!(%parent, %child, "removed dependency");
        }
        removed
    }

    pub fn dependency_info(&self, parent: TaskId, child: TaskId) -> Option<&DependencyInfo> {
        self.relations.dependency.edge(parent, child)
    }

    pub fn depends_on_task(&self, parent: TaskId, child: TaskId) -> bool {
        self.relations.dependency.contains_edge(parent, child)
    }

    pub fn children(&self, parent: TaskId) -> Vec<TaskId> {
        self.relations.dependency.children(parent)
    }

    pub fn parents(&self, child: TaskId) -> Vec<TaskId> {
        self.relations.dependency.parents(child)
    }

    pub fn roles_of(&self, parent: TaskId, child: TaskId) -> BTreeSet<String> {
        self.dependency_info(parent, child)
            .map(|i| i.roles.clone())
            .unwrap_or_default()
    }

    pub fn child_from_role(&self, parent: TaskId, role: &str) -> Option<TaskId> {
        self.children(parent)
            .into_iter()
            .find(|child| self.roles_of(parent, *child).contains(role))
    }

    pub fn child_from_role_strict(&self, parent: TaskId, role: &str) -> Result<TaskId> {
        self.child_from_role(parent, role).ok_or_else(|| {
            PlanError::Argument(format!("{parent} has no child with the role '{role}'"))
        })
    }

    /// Every role sequence leading from `from` to `to` in the dependency
    /// graph.
    pub fn role_paths(&self, from: TaskId, to: TaskId) -> Vec<Vec<String>> {
        if from == to {
            return vec![Vec::new()];
        }
        let mut result = Vec::new();
        for child in self.children(from) {
            let roles = self.roles_of(from, child);
            if roles.is_empty() {
                continue;
            }
            for tail in self.role_paths(child, to) {
                for role in &roles {
                    let mut path = vec![role.clone()];
                    path.extend(tail.iter().cloned());
                    result.push(path);
                }
            }
        }
        result
    }

    pub fn resolve_role_path(&self, from: TaskId, path: &[&str]) -> Result<TaskId> {
        path.iter()
            .try_fold(from, |task, role| self.child_from_role_strict(task, role))
    }

    /// Children of `parent` that are not ordered after another child by an
    /// event relation reaching their `start` event.
    pub fn first_children(&self, parent: TaskId) -> Vec<TaskId> {
        let children = self.children(parent);
        children
            .iter()
            .copied()
            .filter(|child| {
                let Some(start) = self.start_event_of(*child) else {
                    return false;
                };
                !children
                    .iter()
                    .filter(|other| *other != child)
                    .any(|other| self.task_events_reach(*other, start))
            })
            .collect()
    }

    fn task_events_reach(&self, task: TaskId, target: crate::types::GeneratorId) -> bool {
        let Some(t) = self.tasks.get(&task) else {
            return false;
        };
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<_> = t.events.iter().map(|(_, g)| *g).collect();
        while let Some(g) = queue.pop_front() {
            if !seen.insert(g) {
                continue;
            }
            for next in self.relations.event_successors(g) {
                if next == target {
                    return true;
                }
                queue.push_back(next);
            }
        }
        false
    }

    /// Remove the dependencies of `parent` on finished children and return
    /// those children.
    pub fn remove_finished_children(&mut self, parent: TaskId) -> Vec<TaskId> {
        let finished: Vec<TaskId> = self
            .children(parent)
            .into_iter()
            .filter(|c| self.status(*c).is_some_and(|s| s.finished()))
            .collect();
        for child in &finished {
            self.remove_dependency(parent, *child);
        }
        finished
    }

    /// The model constraint `task` has to fulfill given all its parents.
    pub fn fullfilled_model(&self, task: TaskId) -> Result<ModelConstraint> {
        self.task_or_err(task)?;
        let mut result = ModelConstraint::new(ROOT_MODEL);
        for parent in self.parents(task) {
            if let Some(info) = self.dependency_info(parent, task) {
                result = merge_model_constraints(&self.models, &result, &info.model)?;
            }
        }
        if self.validate_fulfillment(task, &result).is_err() {
            return Err(PlanError::ModelViolation(format!(
                "{task} does not fulfill the model required by its parents"
            )));
        }
        Ok(result)
    }

    pub(crate) fn dependency_failure_point(
        &self,
        child: TaskId,
        explanation: Option<&Explanation>,
    ) -> FailurePoint {
        match explanation {
            Some(Explanation::Emitted(event)) => {
                let is_stop = self
                    .events
                    .get(event)
                    .and_then(|e| self.generators.get(&e.generator))
                    .is_some_and(|g| g.symbol() == Some(STOP));
                let terminal = self.tasks.get(&child).and_then(|t| t.terminal_event);
                match terminal {
                    Some(terminal) if is_stop => FailurePoint::Event(terminal),
                    _ => FailurePoint::Event(*event),
                }
            }
            Some(Explanation::Unreachable { generator, reason }) => match reason {
                Some(UnreachableReason::Event(e)) => FailurePoint::Event(*e),
                Some(UnreachableReason::Generator(g)) => FailurePoint::Generator(*g),
                Some(UnreachableReason::Error(e)) => e.failure_point().clone(),
                Some(UnreachableReason::Removed) | None => FailurePoint::Generator(*generator),
            },
            None => FailurePoint::Task(child),
        }
    }
}

/// Edges whose success predicate holds and that should be dropped.
pub(crate) fn completed_dependencies(plan: &Plan) -> Vec<(TaskId, TaskId)> {
    plan.relations
        .dependency
        .edges()
        .into_iter()
        .filter(|(_, child, info)| {
            info.remove_when_done
                && info
                    .success
                    .as_ref()
                    .is_some_and(|p| p.evaluate(plan, *child).value)
        })
        .map(|(parent, child, _)| (parent, child))
        .collect()
}

/// Structure check of the dependency relation.
pub(crate) fn check_dependencies(
    plan: &Plan,
    control: &mut dyn DecisionControl,
) -> Vec<StructureError> {
    let mut errors = Vec::new();
    for (parent, child, info) in plan.relations.dependency.edges() {
        let Some(parent_status) = plan.status(parent) else {
            continue;
        };
        if parent_status.finished() {
            continue;
        }

        let success = info.success.as_ref().map(|p| p.evaluate(plan, child));
        if success.as_ref().is_some_and(|s| s.value) {
            continue;
        }

        let failure = info.effective_failure().evaluate(plan, child);
        let explanation = if failure.value {
            failure.explanation
        } else {
            match success {
                Some(s) if s.is_static_false() => s.explanation,
                _ => continue,
            }
        };

        let error = child_failed(plan, parent, child, explanation.as_ref());
        if !parent_status.started() {
            if !info.consider_in_pending {
                continue;
            }
            if !control.pending_dependency_failed(plan, parent, child, &error) {
                debug!(%parent, %child, "ignoring dependency failure on pending parent");
                continue;
            }
        }
        errors.push(StructureError {
            error,
            involved: vec![child, parent],
        });
    }
    errors
}

fn child_failed(
    plan: &Plan,
    parent: TaskId,
    child: TaskId,
    explanation: Option<&Explanation>,
) -> LocalizedError {
    let nested = match explanation {
        Some(Explanation::Unreachable { generator, reason }) => Some(Box::new(plan.localize(
            ErrorKind::UnreachableEvent {
                reason: reason.clone(),
            },
            FailurePoint::Generator(*generator),
        ))),
        _ => None,
    };
    let point = plan.dependency_failure_point(child, explanation);
    plan.localize(
        ErrorKind::ChildFailed {
            parent,
            explanation: nested,
        },
        point,
    )
}
