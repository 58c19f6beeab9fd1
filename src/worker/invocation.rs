//! One invocation from sandbox creation to termination.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::broker::{Broker, InvocationState};
use super::{ProtocolViolation, WorkerError};
use crate::capabilities::{CapabilitySpec, DispatchTable, ExecutionContext, Host};
use crate::codec::{Envelope, MethodCall, Outcome};
use crate::sandbox::{InterruptHandle, Sandbox, SandboxError, SandboxFactory};
use crate::stubs;

/// Everything one invocation needs, owned so it can move to a blocking thread.
pub struct Invocation {
    pub(super) factory: Arc<dyn SandboxFactory>,
    pub(super) host: Host,
    pub(super) catalog: &'static [CapabilitySpec],
    pub(super) context: ExecutionContext,
    pub(super) code: String,
    pub(super) call: MethodCall,
    pub(super) interrupt: InterruptHandle,
}

impl Invocation {
    /// Runs the invocation to completion on the current thread.
    ///
    /// The sandbox is terminated exactly once on every path out of here,
    /// including panics.
    pub fn run(self) -> Result<Outcome, WorkerError> {
        let started = Instant::now();
        let table = DispatchTable::for_invocation(self.catalog, &self.host, &self.context)
            .map_err(WorkerError::Dispatch)?;
        let (broker, completion) = Broker::new(self.context.id(), table);
        let broker = Arc::new(broker);

        let sandbox = self
            .factory
            .create(broker.clone(), self.interrupt.clone())
            .map_err(WorkerError::SandboxCreation)?;
        let mut sandbox = SandboxGuard {
            inner: sandbox,
            broker: broker.clone(),
            terminated: false,
        };

        let result = self.drive(&mut sandbox, &broker, completion);
        sandbox.terminate();

        let elapsed = started.elapsed().as_millis();
        match &result {
            Ok(outcome) => info!(
                "Invocation {} ({}) finished in {elapsed}ms with {} capability calls: {outcome}",
                self.context.id(),
                self.call.method(),
                broker.capability_calls()
            ),
            Err(e) => warn!(
                "Invocation {} ({}) failed after {elapsed}ms: {e}",
                self.context.id(),
                self.call.method()
            ),
        }
        result
    }

    fn drive(
        &self,
        sandbox: &mut SandboxGuard,
        broker: &Broker,
        mut completion: oneshot::Receiver<Outcome>,
    ) -> Result<Outcome, WorkerError> {
        broker.advance(InvocationState::ModulesLoading);
        let modules = stubs::modules_for(
            self.catalog,
            &self.context,
            &self.code,
            self.call.method(),
        );
        for module in &modules {
            debug!(
                "Invocation {}: loading module {} ({} bytes)",
                self.context.id(),
                module.name,
                module.source.len()
            );
            let loaded = sandbox.load_module(&module.name, &module.source);
            // Top-level guest code must not talk to the host yet
            if let Some(violation) = broker.take_violation() {
                return Err(WorkerError::Protocol(violation));
            }
            loaded.map_err(WorkerError::ModuleLoad)?;
        }

        broker.advance(InvocationState::Running);
        let request = Envelope::invocation(&self.call)
            .encode()
            .map_err(WorkerError::Encode)?;
        let sent = sandbox.send(&request);

        if let Some(violation) = broker.take_violation() {
            return Err(WorkerError::Protocol(violation));
        }
        if let Some(failure) = broker.take_write_failure() {
            return Err(failure);
        }
        sent.map_err(WorkerError::Send)?;
        completion
            .try_recv()
            .map_err(|_| WorkerError::Protocol(ProtocolViolation::MissingCompletion))
    }
}

/// Owns the sandbox and terminates it once, explicitly or on drop.
struct SandboxGuard {
    inner: Box<dyn Sandbox>,
    broker: Arc<Broker>,
    terminated: bool,
}

impl SandboxGuard {
    fn load_module(&mut self, name: &str, source: &str) -> Result<(), SandboxError> {
        self.inner.load_module(name, source)
    }

    fn send(&mut self, message: &[u8]) -> Result<(), SandboxError> {
        self.inner.send(message)
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.inner.terminate();
        self.broker.advance(InvocationState::Terminated);
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}
