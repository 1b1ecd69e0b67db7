use std::cell::RefCell;
use std::rc::Rc;

use planloop::plan::{Event, EventCallback, FinalizationCallback, Plan, PollCallback};
use planloop::types::TaskId;

/// Shared log of callback invocations, in call order.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    entries: Rc<RefCell<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.borrow().iter().filter(|e| *e == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    /// Event handler recording `label` on each emission.
    pub fn on_event(&self, label: &str) -> EventCallback {
        let recorder = self.clone();
        let label = label.to_string();
        Rc::new(move |_: &mut Plan, _: &Event| -> anyhow::Result<()> {
            recorder.push(label.clone());
            Ok(())
        })
    }

    /// Poll handler recording `label` on each poll.
    pub fn on_poll(&self, label: &str) -> PollCallback {
        let recorder = self.clone();
        let label = label.to_string();
        Rc::new(move |_: &mut Plan, _: TaskId| -> anyhow::Result<()> {
            recorder.push(label.clone());
            Ok(())
        })
    }

    /// Finalization handler recording `label`.
    pub fn on_finalized(&self, label: &str) -> FinalizationCallback {
        let recorder = self.clone();
        let label = label.to_string();
        Rc::new(move |_: &Plan, _: TaskId| {
            recorder.push(label.clone());
        })
    }
}
