// src/transaction/mod.rs

//! Transactions: speculative edits of a plan, committed or discarded as a
//! whole.
//!
//! A [`Transaction`] borrows the plan mutably but never touches it before
//! [`Transaction::commit`]. Reading a task through the transaction creates a
//! proxy that snapshots the task's relations and flags; edits go to the
//! proxy only. New tasks get ids reserved from the plan's id space.
//!
//! Commit diffs every proxy against its snapshot and replays the
//! differences on a copy of the plan through the regular plan operations,
//! so the same validation applies as outside transactions. The copy
//! replaces the plan only if every operation succeeded; otherwise the plan
//! is untouched and the transaction stays open.
//!
//! A transaction dropped while open is discarded.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::errors::{PlanError, Result};
use crate::plan::{Plan, TaskIds, TaskModel};
use crate::relations::dependency::{merge_info, DependencyInfo, DependencyOptions};
use crate::types::{EventRelation, GeneratorId, TaskId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    Discarded,
}

impl TransactionState {
    fn name(self) -> &'static str {
        match self {
            TransactionState::Open => "open",
            TransactionState::Committed => "committed",
            TransactionState::Discarded => "discarded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
struct TaskState {
    mission: bool,
    permanent: bool,
    arguments: BTreeMap<String, Value>,
    children: BTreeMap<TaskId, DependencyInfo>,
    planner: Option<TaskId>,
}

/// Transaction-side view of a task.
#[derive(Clone)]
pub struct TaskProxy {
    id: TaskId,
    model: Rc<TaskModel>,
    events: Vec<(String, GeneratorId)>,
    created: bool,
    snapshot: TaskState,
    current: TaskState,
}

impl TaskProxy {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// True for tasks created inside the transaction.
    pub fn is_new(&self) -> bool {
        self.created
    }

    pub fn is_modified(&self) -> bool {
        self.created || self.current != self.snapshot
    }

    fn event(&self, symbol: &str) -> Option<GeneratorId> {
        self.events
            .iter()
            .find(|(name, _)| name == symbol)
            .map(|(_, g)| *g)
    }
}

impl fmt::Debug for TaskProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProxy")
            .field("id", &self.id)
            .field("model", &self.model.name())
            .field("created", &self.created)
            .field("modified", &self.is_modified())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
struct EventEdges {
    signal: BTreeSet<GeneratorId>,
    forwarding: BTreeSet<GeneratorId>,
    causal_link: BTreeSet<GeneratorId>,
}

impl EventEdges {
    fn get(&self, relation: EventRelation) -> &BTreeSet<GeneratorId> {
        match relation {
            EventRelation::Signal => &self.signal,
            EventRelation::Forwarding => &self.forwarding,
            EventRelation::CausalLink => &self.causal_link,
        }
    }

    fn get_mut(&mut self, relation: EventRelation) -> &mut BTreeSet<GeneratorId> {
        match relation {
            EventRelation::Signal => &mut self.signal,
            EventRelation::Forwarding => &mut self.forwarding,
            EventRelation::CausalLink => &mut self.causal_link,
        }
    }
}

#[derive(Debug, Clone)]
struct EventProxy {
    snapshot: EventEdges,
    current: EventEdges,
}

const RELATIONS: [EventRelation; 3] = [
    EventRelation::Signal,
    EventRelation::Forwarding,
    EventRelation::CausalLink,
];

pub struct Transaction<'p> {
    plan: &'p mut Plan,
    state: TransactionState,
    tasks: BTreeMap<TaskId, TaskProxy>,
    events: BTreeMap<GeneratorId, EventProxy>,
    created: Vec<TaskId>,
    next_id: u64,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state)
            .field("proxies", &self.tasks.len())
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl Plan {
    /// Open a transaction on this plan.
    pub fn transaction(&mut self) -> Transaction<'_> {
        Transaction::new(self)
    }
}

/// Run `f` in a transaction, committing if it succeeds and discarding
/// otherwise.
pub fn in_transaction<R>(
    plan: &mut Plan,
    f: impl FnOnce(&mut Transaction<'_>) -> Result<R>,
) -> Result<R> {
    let mut tx = Transaction::new(plan);
    match f(&mut tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            tx.discard();
            Err(e)
        }
    }
}

impl<'p> Transaction<'p> {
    pub fn new(plan: &'p mut Plan) -> Self {
        let next_id = plan.peek_next_id();
        debug!("transaction opened");
        Self {
            plan,
            state: TransactionState::Open,
            tasks: BTreeMap::new(),
            events: BTreeMap::new(),
            created: Vec::new(),
            next_id,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// The plan as it was when the transaction opened.
    pub fn plan(&self) -> &Plan {
        &*self.plan
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            other => Err(PlanError::TransactionClosed(other.name())),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ---- tasks ----

    pub fn add_task(&mut self, model: &str) -> Result<TaskId> {
        self.add_task_with(model, std::iter::empty::<(String, Value)>())
    }

    pub fn add_task_with<K, I>(&mut self, model: &str, arguments: I) -> Result<TaskId>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        self.ensure_open()?;
        let model = self.plan.models().get_or_err(model)?;
        let id = TaskId(self.allocate_id());
        let events = model
            .events()
            .iter()
            .map(|e| (e.name().to_string(), GeneratorId(self.allocate_id())))
            .collect();
        let state = TaskState {
            arguments: arguments.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            ..TaskState::default()
        };
        self.tasks.insert(
            id,
            TaskProxy {
                id,
                model,
                events,
                created: true,
                snapshot: TaskState::default(),
                current: state,
            },
        );
        self.created.push(id);
        debug!(task = %id, "task added in transaction");
        Ok(id)
    }

    pub fn add_mission(&mut self, model: &str) -> Result<TaskId> {
        let id = self.add_task(model)?;
        self.proxy_mut(id)?.current.mission = true;
        Ok(id)
    }

    pub fn contains_task(&self, task: TaskId) -> bool {
        self.tasks.contains_key(&task) || self.plan.contains_task(task)
    }

    /// Real and new tasks, in id order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: BTreeSet<TaskId> = self.plan.task_ids().into_iter().collect();
        ids.extend(self.created.iter().copied());
        ids.into_iter().collect()
    }

    /// The proxy of `task`, if the transaction touched it.
    pub fn proxy(&self, task: TaskId) -> Option<&TaskProxy> {
        self.tasks.get(&task)
    }

    /// Proxies that differ from the plan.
    pub fn modified_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|p| p.is_modified())
            .map(|p| p.id)
            .collect()
    }

    /// Proxy of `task`, created on first access.
    fn proxy_mut(&mut self, task: TaskId) -> Result<&mut TaskProxy> {
        self.ensure_open()?;
        if !self.tasks.contains_key(&task) {
            let proxy = self.snapshot_task(task)?;
            self.tasks.insert(task, proxy);
        }
        self.tasks
            .get_mut(&task)
            .ok_or_else(|| PlanError::Ownership(format!("{task} is not included in this plan")))
    }

    fn snapshot_task(&self, task: TaskId) -> Result<TaskProxy> {
        let t = self.plan.task_or_err(task)?;
        let children = self
            .plan
            .children(task)
            .into_iter()
            .filter_map(|c| self.plan.dependency_info(task, c).map(|i| (c, i.clone())))
            .collect();
        let state = TaskState {
            mission: self.plan.is_mission(task),
            permanent: self.plan.is_permanent(task),
            arguments: t.arguments().values().clone(),
            children,
            planner: self.plan.planning_task(task),
        };
        Ok(TaskProxy {
            id: task,
            model: t.model.clone(),
            events: t.events.clone(),
            created: false,
            snapshot: state.clone(),
            current: state,
        })
    }

    fn model_of(&self, task: TaskId) -> Result<Rc<TaskModel>> {
        match self.tasks.get(&task) {
            Some(proxy) => Ok(proxy.model.clone()),
            None => Ok(self.plan.task_or_err(task)?.model.clone()),
        }
    }

    fn children_view(&self, task: TaskId) -> BTreeMap<TaskId, DependencyInfo> {
        match self.tasks.get(&task) {
            Some(proxy) => proxy.current.children.clone(),
            None => self
                .plan
                .children(task)
                .into_iter()
                .filter_map(|c| self.plan.dependency_info(task, c).map(|i| (c, i.clone())))
                .collect(),
        }
    }

    pub fn children(&self, task: TaskId) -> Vec<TaskId> {
        self.children_view(task).into_keys().collect()
    }

    pub fn parents(&self, task: TaskId) -> Vec<TaskId> {
        self.task_ids()
            .into_iter()
            .filter(|p| self.children_view(*p).contains_key(&task))
            .collect()
    }

    pub fn dependency_info(&self, parent: TaskId, child: TaskId) -> Option<DependencyInfo> {
        self.children_view(parent).remove(&child)
    }

    pub fn roles_of(&self, parent: TaskId, child: TaskId) -> BTreeSet<String> {
        self.dependency_info(parent, child)
            .map(|info| info.roles)
            .unwrap_or_default()
    }

    fn reaches(&self, from: TaskId, to: TaskId) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(task) = queue.pop_front() {
            if task == to {
                return true;
            }
            if seen.insert(task) {
                queue.extend(self.children_view(task).into_keys());
            }
        }
        false
    }

    /// Add (or merge into) the dependency `parent` -> `child`.
    pub fn depends_on(
        &mut self,
        parent: TaskId,
        child: TaskId,
        options: DependencyOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let child_model = self.model_of(child)?;
        self.model_of(parent)?;
        if parent == child {
            return Err(PlanError::RelationCycle(format!(
                "{parent} cannot depend on itself"
            )));
        }

        let info = match self.dependency_info(parent, child) {
            Some(existing) => merge_info(self.plan.models(), &existing, options)?,
            None => {
                if self.reaches(child, parent) {
                    return Err(PlanError::RelationCycle(format!(
                        "adding {parent} -> {child} would create a dependency cycle"
                    )));
                }
                options.into_info(child_model.name())
            }
        };
        for predicate in info.success.iter().chain(&info.failure) {
            for event in predicate.events() {
                if child_model.event(event).is_none() {
                    return Err(PlanError::Argument(format!(
                        "{child} ({}) has no event '{event}'",
                        child_model.name()
                    )));
                }
            }
        }

        self.proxy_mut(parent)?.current.children.insert(child, info);
        Ok(())
    }

    pub fn remove_dependency(&mut self, parent: TaskId, child: TaskId) -> Result<Option<DependencyInfo>> {
        Ok(self.proxy_mut(parent)?.current.children.remove(&child))
    }

    pub fn planned_by(&mut self, planned: TaskId, planner: TaskId) -> Result<()> {
        self.ensure_open()?;
        self.model_of(planner)?;
        if planned == planner {
            return Err(PlanError::RelationCycle(format!(
                "{planned} cannot plan itself"
            )));
        }
        self.proxy_mut(planned)?.current.planner = Some(planner);
        Ok(())
    }

    pub fn planning_task(&self, planned: TaskId) -> Option<TaskId> {
        match self.tasks.get(&planned) {
            Some(proxy) => proxy.current.planner,
            None => self.plan.planning_task(planned),
        }
    }

    pub fn set_argument(&mut self, task: TaskId, name: &str, value: Value) -> Result<()> {
        let proxy = self.proxy_mut(task)?;
        match proxy.current.arguments.get(name) {
            Some(existing) if *existing != value => Err(PlanError::Argument(format!(
                "argument '{name}' of {task} is already set to {existing}"
            ))),
            Some(_) => Ok(()),
            None => {
                proxy.current.arguments.insert(name.to_string(), value);
                Ok(())
            }
        }
    }

    pub fn argument(&self, task: TaskId, name: &str) -> Option<Value> {
        match self.tasks.get(&task) {
            Some(proxy) => proxy.current.arguments.get(name).cloned(),
            None => self.plan.argument(task, name),
        }
    }

    pub fn add_mission_task(&mut self, task: TaskId) -> Result<()> {
        self.proxy_mut(task)?.current.mission = true;
        Ok(())
    }

    pub fn unmark_mission(&mut self, task: TaskId) -> Result<()> {
        self.proxy_mut(task)?.current.mission = false;
        Ok(())
    }

    pub fn is_mission(&self, task: TaskId) -> bool {
        match self.tasks.get(&task) {
            Some(proxy) => proxy.current.mission,
            None => self.plan.is_mission(task),
        }
    }

    pub fn add_permanent_task(&mut self, task: TaskId) -> Result<()> {
        self.proxy_mut(task)?.current.permanent = true;
        Ok(())
    }

    pub fn unmark_permanent(&mut self, task: TaskId) -> Result<()> {
        self.proxy_mut(task)?.current.permanent = false;
        Ok(())
    }

    pub fn is_permanent(&self, task: TaskId) -> bool {
        match self.tasks.get(&task) {
            Some(proxy) => proxy.current.permanent,
            None => self.plan.is_permanent(task),
        }
    }

    // ---- events ----

    /// Generator of `task` named `symbol`, for real and new tasks.
    pub fn task_event(&self, task: TaskId, symbol: &str) -> Result<GeneratorId> {
        match self.tasks.get(&task) {
            Some(proxy) => proxy.event(symbol).ok_or_else(|| {
                PlanError::Argument(format!(
                    "{task} ({}) has no event '{symbol}'",
                    proxy.model_name()
                ))
            }),
            None => self.plan.task_event(task, symbol),
        }
    }

    fn new_task_of(&self, generator: GeneratorId) -> Option<&TaskProxy> {
        self.created
            .iter()
            .filter_map(|t| self.tasks.get(t))
            .find(|p| p.events.iter().any(|(_, g)| *g == generator))
    }

    fn is_controllable(&self, generator: GeneratorId) -> Result<bool> {
        if let Some(g) = self.plan.generator(generator) {
            return Ok(g.is_controllable());
        }
        let proxy = self.new_task_of(generator).ok_or_else(|| {
            PlanError::Ownership(format!("{generator} is not included in this plan"))
        })?;
        Ok(proxy
            .events
            .iter()
            .find(|(_, g)| *g == generator)
            .and_then(|(name, _)| proxy.model.event(name))
            .is_some_and(|e| e.is_controllable()))
    }

    /// Edges of `generator` as the plan has them, or as instantiating the
    /// model of a new task will create them.
    fn base_edges(&self, generator: GeneratorId) -> EventEdges {
        if self.plan.contains_generator(generator) {
            let mut edges = EventEdges::default();
            for relation in RELATIONS {
                edges
                    .get_mut(relation)
                    .extend(self.plan.event_children(relation, generator));
            }
            return edges;
        }
        let mut edges = EventEdges::default();
        let Some(proxy) = self.new_task_of(generator) else {
            return edges;
        };
        let Some(symbol) = proxy
            .events
            .iter()
            .find(|(_, g)| *g == generator)
            .map(|(name, _)| name.as_str())
        else {
            return edges;
        };
        let model_edges = [
            (EventRelation::Signal, proxy.model.signals()),
            (EventRelation::Forwarding, proxy.model.forwards()),
            (EventRelation::CausalLink, proxy.model.causal_links()),
        ];
        for (relation, pairs) in model_edges {
            for (from, to) in pairs {
                if from == symbol {
                    if let Some(target) = proxy.event(to) {
                        edges.get_mut(relation).insert(target);
                    }
                }
            }
        }
        edges
    }

    fn edges_view(&self, generator: GeneratorId) -> EventEdges {
        match self.events.get(&generator) {
            Some(proxy) => proxy.current.clone(),
            None => self.base_edges(generator),
        }
    }

    pub fn event_children(&self, relation: EventRelation, generator: GeneratorId) -> Vec<GeneratorId> {
        self.edges_view(generator)
            .get(relation)
            .iter()
            .copied()
            .collect()
    }

    pub fn has_event_relation(
        &self,
        relation: EventRelation,
        from: GeneratorId,
        to: GeneratorId,
    ) -> bool {
        self.edges_view(from).get(relation).contains(&to)
    }

    fn event_proxy_mut(&mut self, generator: GeneratorId) -> Result<&mut EventProxy> {
        self.ensure_open()?;
        if !self.events.contains_key(&generator) {
            self.is_controllable(generator)?;
            let base = self.base_edges(generator);
            self.events.insert(
                generator,
                EventProxy {
                    snapshot: base.clone(),
                    current: base,
                },
            );
        }
        self.events.get_mut(&generator).ok_or_else(|| {
            PlanError::Ownership(format!("{generator} is not included in this plan"))
        })
    }

    pub fn add_event_relation(
        &mut self,
        relation: EventRelation,
        from: GeneratorId,
        to: GeneratorId,
    ) -> Result<()> {
        self.ensure_open()?;
        let controllable = self.is_controllable(to)?;
        if relation == EventRelation::Signal && !controllable {
            return Err(PlanError::Argument(format!(
                "cannot signal {to}: it is not controllable"
            )));
        }
        self.event_proxy_mut(from)?.current.get_mut(relation).insert(to);
        Ok(())
    }

    pub fn add_signal(&mut self, from: GeneratorId, to: GeneratorId) -> Result<()> {
        self.add_event_relation(EventRelation::Signal, from, to)
    }

    pub fn add_forwarding(&mut self, from: GeneratorId, to: GeneratorId) -> Result<()> {
        self.add_event_relation(EventRelation::Forwarding, from, to)
    }

    pub fn add_causal_link(&mut self, from: GeneratorId, to: GeneratorId) -> Result<()> {
        self.add_event_relation(EventRelation::CausalLink, from, to)
    }

    pub fn remove_event_relation(
        &mut self,
        relation: EventRelation,
        from: GeneratorId,
        to: GeneratorId,
    ) -> Result<bool> {
        Ok(self.event_proxy_mut(from)?.current.get_mut(relation).remove(&to))
    }

    // ---- commit / discard ----

    /// Apply every change to the plan, or none of them.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut next = self.plan.clone();
        if let Err(e) = self.apply(&mut next) {
            warn!(error = %e, "transaction commit failed, plan left unchanged");
            return Err(e);
        }
        *self.plan = next;
        self.state = TransactionState::Committed;
        info!(
            created = self.created.len(),
            modified = self.modified_tasks().len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Drop every change. Always succeeds on an open transaction.
    pub fn discard(&mut self) {
        if self.state != TransactionState::Open {
            return;
        }
        self.tasks.clear();
        self.events.clear();
        self.created.clear();
        self.state = TransactionState::Discarded;
        debug!("transaction discarded");
    }

    fn apply(&self, plan: &mut Plan) -> Result<()> {
        plan.reserve_ids(self.next_id);

        for id in &self.created {
            let Some(proxy) = self.tasks.get(id) else {
                continue;
            };
            let ids = TaskIds {
                task: proxy.id,
                events: proxy.events.iter().map(|(_, g)| *g).collect(),
            };
            plan.instantiate_task(proxy.model.clone(), proxy.current.arguments.clone(), ids)?;
        }

        // Flags and arguments.
        for proxy in self.tasks.values() {
            let (before, after) = (&proxy.snapshot, &proxy.current);
            let task = proxy.id;
            if !proxy.created {
                for (name, value) in &after.arguments {
                    if before.arguments.get(name) != Some(value) {
                        plan.set_argument(task, name, value.clone())?;
                    }
                }
            }
            match (before.mission, after.mission) {
                (false, true) => plan.add_mission_task(task)?,
                (true, false) => plan.unmark_mission(task),
                _ => {}
            }
            match (before.permanent, after.permanent) {
                (false, true) => plan.add_permanent_task(task)?,
                (true, false) => plan.unmark_permanent(task),
                _ => {}
            }
        }

        // Removals first, so that additions never see a transient cycle.
        for proxy in self.tasks.values() {
            let task = proxy.id;
            for (child, info) in &proxy.snapshot.children {
                if proxy.current.children.get(child) != Some(info) {
                    plan.remove_dependency(task, *child);
                }
            }
            if let Some(planner) = proxy.snapshot.planner {
                if proxy.current.planner != Some(planner) {
                    plan.remove_planning(task, planner);
                }
            }
        }
        for (generator, proxy) in &self.events {
            for relation in RELATIONS {
                for target in proxy.snapshot.get(relation) {
                    if !proxy.current.get(relation).contains(target) {
                        plan.remove_event_relation(relation, *generator, *target);
                    }
                }
            }
        }

        for proxy in self.tasks.values() {
            let task = proxy.id;
            for (child, info) in &proxy.current.children {
                if proxy.snapshot.children.get(child) != Some(info) {
                    plan.depends_on(task, *child, DependencyOptions::from_info(info))?;
                }
            }
            if let Some(planner) = proxy.current.planner {
                if proxy.snapshot.planner != Some(planner) {
                    plan.planned_by(task, planner)?;
                }
            }
        }
        for (generator, proxy) in &self.events {
            for relation in RELATIONS {
                for target in proxy.current.get(relation) {
                    if !proxy.snapshot.get(relation).contains(target) {
                        plan.add_event_relation(relation, *generator, *target)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TransactionState::Open {
            debug!("open transaction dropped, discarding");
            self.discard();
        }
    }
}
