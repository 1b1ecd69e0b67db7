// src/plan/event.rs

//! Emitted events.
//!
//! An [`Event`] is an immutable record of one emission. It lives in the
//! plan's event table until its generator is removed.

use std::collections::{BTreeSet, VecDeque};
use std::time::SystemTime;

use crate::plan::Plan;
use crate::types::{EventId, GeneratorId, TaskId, Value};

#[derive(Debug, Clone)]
pub struct Event {
    pub(crate) id: EventId,
    pub(crate) generator: GeneratorId,
    pub(crate) task: Option<TaskId>,
    pub(crate) time: SystemTime,
    pub(crate) propagation_id: u64,
    pub(crate) context: Vec<Value>,
    pub(crate) sources: Vec<EventId>,
}

impl Event {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn generator(&self) -> GeneratorId {
        self.generator
    }

    /// Owning task, for task events.
    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn time(&self) -> SystemTime {
        self.time
    }

    /// Propagation pass during which the event was emitted.
    pub fn propagation_id(&self) -> u64 {
        self.propagation_id
    }

    pub fn context(&self) -> &[Value] {
        &self.context
    }

    /// Events that caused this one within the same propagation pass.
    pub fn sources(&self) -> &[EventId] {
        &self.sources
    }
}

impl Plan {
    pub fn event(&self, id: EventId) -> Option<&Event> {
        self.events.get(&id)
    }

    /// Transitive closure of `sources`, nearest first.
    pub fn all_sources(&self, id: EventId) -> Vec<EventId> {
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        let mut queue: VecDeque<EventId> = self
            .events
            .get(&id)
            .map(|e| e.sources.iter().copied().collect())
            .unwrap_or_default();

        while let Some(source) = queue.pop_front() {
            if !seen.insert(source) {
                continue;
            }
            result.push(source);
            if let Some(event) = self.events.get(&source) {
                queue.extend(event.sources.iter().copied());
            }
        }
        result
    }

    /// Sources that have no sources themselves.
    pub fn root_sources(&self, id: EventId) -> Vec<EventId> {
        let all = self.all_sources(id);
        if all.is_empty() {
            return vec![id];
        }
        all.into_iter()
            .filter(|e| {
                self.events
                    .get(e)
                    .is_some_and(|event| event.sources.is_empty())
            })
            .collect()
    }

    /// Sources of `id` that belong to `task`, following sources through
    /// events of other tasks and free events.
    pub fn task_sources(&self, id: EventId, task: TaskId) -> Vec<EventId> {
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        let mut queue: VecDeque<EventId> = self
            .events
            .get(&id)
            .map(|e| e.sources.iter().copied().collect())
            .unwrap_or_default();

        while let Some(source) = queue.pop_front() {
            if !seen.insert(source) {
                continue;
            }
            let Some(event) = self.events.get(&source) else {
                continue;
            };
            if event.task == Some(task) {
                result.push(source);
            } else {
                queue.extend(event.sources.iter().copied());
            }
        }
        result
    }

    /// Every event of `task` among the transitive sources of `id`.
    pub fn all_task_sources(&self, id: EventId, task: TaskId) -> Vec<EventId> {
        self.all_sources(id)
            .into_iter()
            .filter(|e| self.events.get(e).is_some_and(|event| event.task == Some(task)))
            .collect()
    }
}
