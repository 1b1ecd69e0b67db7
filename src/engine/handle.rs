// src/engine/handle.rs

//! Handle used by off-thread work to talk to a running engine.
//!
//! Requests go through an mpsc channel and are applied by the runtime at
//! the top of the next cycle. Replies come back on oneshot channels.

use std::fmt;
use std::thread::{self, ThreadId};

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};

use crate::errors::{PlanError, Result};
use crate::plan::Plan;
use crate::types::{EventId, GeneratorId, Value};

pub type RemoteWork = Box<dyn FnOnce(&mut Plan) -> anyhow::Result<()> + Send>;

/// Requests understood by [`crate::engine::Runtime`].
pub enum EngineRequest {
    Call {
        generator: GeneratorId,
        context: Vec<Value>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Emit {
        generator: GeneratorId,
        context: Vec<Value>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// Run a closure on the plan.
    Execute {
        work: RemoteWork,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// Reply with the next emission of `generator`, or an error once it
    /// becomes unreachable.
    WaitUntil {
        generator: GeneratorId,
        reply: oneshot::Sender<Result<EventId>>,
    },
    Shutdown,
}

impl fmt::Debug for EngineRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineRequest::Call { generator, .. } => write!(f, "Call({generator})"),
            EngineRequest::Emit { generator, .. } => write!(f, "Emit({generator})"),
            EngineRequest::Execute { .. } => f.write_str("Execute"),
            EngineRequest::WaitUntil { generator, .. } => write!(f, "WaitUntil({generator})"),
            EngineRequest::Shutdown => f.write_str("Shutdown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    owner: ThreadId,
}

fn engine_gone() -> PlanError {
    PlanError::Other(anyhow!("the engine is not running"))
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<EngineRequest>, owner: ThreadId) -> Self {
        Self { tx, owner }
    }

    /// True when called from the thread running the engine.
    pub fn is_engine_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> EngineRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    pub async fn call(&self, generator: GeneratorId, context: Vec<Value>) -> Result<()> {
        self.request(|reply| EngineRequest::Call {
            generator,
            context,
            reply: Some(reply),
        })
        .await
    }

    pub async fn emit(&self, generator: GeneratorId, context: Vec<Value>) -> Result<()> {
        self.request(|reply| EngineRequest::Emit {
            generator,
            context,
            reply: Some(reply),
        })
        .await
    }

    pub async fn execute(
        &self,
        work: impl FnOnce(&mut Plan) -> anyhow::Result<()> + Send + 'static,
    ) -> Result<()> {
        self.request(|reply| EngineRequest::Execute {
            work: Box::new(work),
            reply: Some(reply),
        })
        .await
    }

    pub async fn wait_until(&self, generator: GeneratorId) -> Result<EventId> {
        self.request(|reply| EngineRequest::WaitUntil { generator, reply })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(EngineRequest::Shutdown)
            .await
            .map_err(|_| engine_gone())
    }

    fn ensure_foreign_thread(&self, operation: &str) -> Result<()> {
        if self.is_engine_thread() {
            return Err(PlanError::ThreadMismatch(format!(
                "{operation} would block the engine thread"
            )));
        }
        Ok(())
    }

    fn blocking_request<T>(
        &self,
        operation: &str,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> EngineRequest,
    ) -> Result<T> {
        self.ensure_foreign_thread(operation)?;
        let (reply, rx) = oneshot::channel();
        self.tx.blocking_send(make(reply)).map_err(|_| engine_gone())?;
        rx.blocking_recv().map_err(|_| engine_gone())?
    }

    /// Blocking [`EngineHandle::call`], for threads outside the runtime.
    pub fn blocking_call(&self, generator: GeneratorId, context: Vec<Value>) -> Result<()> {
        self.blocking_request("blocking_call", |reply| EngineRequest::Call {
            generator,
            context,
            reply: Some(reply),
        })
    }

    pub fn blocking_emit(&self, generator: GeneratorId, context: Vec<Value>) -> Result<()> {
        self.blocking_request("blocking_emit", |reply| EngineRequest::Emit {
            generator,
            context,
            reply: Some(reply),
        })
    }

    pub fn blocking_wait_until(&self, generator: GeneratorId) -> Result<EventId> {
        self.blocking_request("blocking_wait_until", |reply| EngineRequest::WaitUntil {
            generator,
            reply,
        })
    }
}
