//! Call broker: runs one contract method in a fresh sandbox.
//!
//! Each call gets its own sandbox, dispatch table and completion slot, so
//! invocations running concurrently share nothing mutable. The sandbox
//! lifecycle is synchronous and runs on a blocking thread; the async front
//! end adds an optional deadline on top.

mod broker;
mod invocation;

pub use broker::InvocationState;
pub use invocation::Invocation;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::capabilities::{
    CapabilitySpec, DispatchError, ExecutionContext, Host, HostError, CATALOG,
};
use crate::codec::{DecodeError, EncodeError, MethodCall, Outcome};
use crate::sandbox::{InterruptHandle, SandboxError, SandboxFactory};

/// The guest broke the message protocol. Always fatal for the invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("malformed envelope: {0}")]
    Decode(DecodeError),

    #[error(transparent)]
    Dispatch(DispatchError),

    #[error("{capability} must be sent as a {expected}")]
    DirectionMismatch {
        capability: String,
        expected: &'static str,
    },

    #[error("the reserved invocation group cannot be called")]
    ReservedGroupCall,

    #[error("{0}")]
    BadArguments(String),

    #[error("malformed terminal envelope: {0}")]
    MalformedCompletion(String),

    #[error("second terminal envelope")]
    SecondCompletion,

    #[error("guest went idle without a terminal envelope")]
    MissingCompletion,

    #[error("envelope received while {0}")]
    UnexpectedEnvelope(InvocationState),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("sandbox creation failed: {0}")]
    SandboxCreation(SandboxError),

    #[error("invalid capability catalog: {0}")]
    Dispatch(DispatchError),

    #[error("{0}")]
    ModuleLoad(SandboxError),

    #[error("protocol violation: {0}")]
    Protocol(ProtocolViolation),

    #[error("{capability} failed: {source}")]
    Capability {
        capability: String,
        source: HostError,
    },

    #[error("invocation request cannot be encoded: {0}")]
    Encode(EncodeError),

    #[error("invocation failed: {0}")]
    Send(SandboxError),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("invocation thread failed: {0}")]
    Join(String),
}

/// Runs contract methods. Cheap to share behind an `Arc`.
pub struct Worker {
    factory: Arc<dyn SandboxFactory>,
    host: Host,
    catalog: &'static [CapabilitySpec],
    deadline: Option<Duration>,
}

impl Worker {
    pub fn new(factory: Arc<dyn SandboxFactory>, host: Host) -> Self {
        Self {
            factory,
            host,
            catalog: CATALOG,
            deadline: None,
        }
    }

    /// Interrupts invocations that run longer than `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_catalog(mut self, catalog: &'static [CapabilitySpec]) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn engine(&self) -> &str {
        self.factory.name()
    }

    /// Prepares an invocation without running it. [`Invocation::run`]
    /// blocks the calling thread until the sandbox is terminated.
    pub fn invocation(
        &self,
        context: &ExecutionContext,
        code: &str,
        call: MethodCall,
        interrupt: InterruptHandle,
    ) -> Invocation {
        Invocation {
            factory: self.factory.clone(),
            host: self.host.clone(),
            catalog: self.catalog,
            context: context.clone(),
            code: code.to_string(),
            call,
            interrupt,
        }
    }

    /// Executes `call` against `code` in a fresh sandbox.
    ///
    /// Guest-raised errors come back as `Ok(Outcome::Error(_))`; everything
    /// else that goes wrong is a [`WorkerError`].
    pub async fn process_method_call(
        &self,
        context: &ExecutionContext,
        code: &str,
        call: MethodCall,
    ) -> Result<Outcome, WorkerError> {
        let interrupt = InterruptHandle::new();
        let invocation = self.invocation(context, code, call, interrupt.clone());
        let mut task = tokio::task::spawn_blocking(move || invocation.run());

        let joined = match self.deadline {
            None => task.await,
            Some(deadline) => match tokio::time::timeout(deadline, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        "Invocation {} exceeded its {deadline:?} deadline, interrupting",
                        context.id()
                    );
                    interrupt.trip();
                    // The blocking side terminates the sandbox on its way out
                    if let Err(e) = task.await {
                        error!("Invocation {} thread failed after interrupt: {e}", context.id());
                    }
                    return Err(WorkerError::DeadlineExceeded(deadline));
                }
            },
        };
        joined.map_err(|e| WorkerError::Join(e.to_string()))?
    }
}
