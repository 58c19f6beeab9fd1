//! Host end of one invocation's channel.
//!
//! Every guest message lands here. Direction decides what a group-0
//! envelope means: as a one-way notification it is the terminal result, as
//! a call it is a protocol violation. Any other group is a capability and is
//! resolved through the invocation's dispatch table.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{ProtocolViolation, WorkerError};
use crate::capabilities::{CapabilityError, CapabilityKind, DispatchTable, Entry};
use crate::codec::{Envelope, Outcome};
use crate::sandbox::{HandlerRejection, MessageHandler};

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Created,
    ModulesLoading,
    Running,
    /// A capability call is being served; the guest is suspended.
    AwaitingCapabilityReply,
    Completed,
    Terminated,
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvocationState::Created => "created",
            InvocationState::ModulesLoading => "loading modules",
            InvocationState::Running => "running",
            InvocationState::AwaitingCapabilityReply => "awaiting a capability reply",
            InvocationState::Completed => "completed",
            InvocationState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

struct Progress {
    state: InvocationState,
    /// First violation wins; later ones are only logged.
    violation: Option<ProtocolViolation>,
    write_failure: Option<WorkerError>,
    capability_calls: usize,
}

pub struct Broker {
    context_id: String,
    table: DispatchTable,
    progress: Mutex<Progress>,
    /// Single-slot completion signal, taken by the first terminal envelope.
    completion: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Broker {
    pub fn new(context_id: &str, table: DispatchTable) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let broker = Self {
            context_id: context_id.to_string(),
            table,
            progress: Mutex::new(Progress {
                state: InvocationState::Created,
                violation: None,
                write_failure: None,
                capability_calls: 0,
            }),
            completion: Mutex::new(Some(tx)),
        };
        (broker, rx)
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> InvocationState {
        self.progress().state
    }

    pub fn advance(&self, next: InvocationState) {
        let mut progress = self.progress();
        debug!(
            "Invocation {}: {} -> {}",
            self.context_id, progress.state, next
        );
        progress.state = next;
    }

    pub fn capability_calls(&self) -> usize {
        self.progress().capability_calls
    }

    pub fn take_violation(&self) -> Option<ProtocolViolation> {
        self.progress().violation.take()
    }

    pub fn take_write_failure(&self) -> Option<WorkerError> {
        self.progress().write_failure.take()
    }

    /// Records a violation and turns it into the rejection the guest sees.
    fn violate(&self, violation: ProtocolViolation) -> HandlerRejection {
        warn!("Invocation {}: protocol violation: {violation}", self.context_id);
        let rejection = HandlerRejection(violation.to_string());
        let mut progress = self.progress();
        if progress.violation.is_none() {
            progress.violation = Some(violation);
        }
        rejection
    }

    fn decode(&self, message: &[u8]) -> Result<Envelope, HandlerRejection> {
        Envelope::decode(message).map_err(|e| self.violate(ProtocolViolation::Decode(e)))
    }

    /// Guest messages are only accepted while the invocation runs.
    fn ensure_running(&self, envelope: &Envelope) -> Result<(), HandlerRejection> {
        let state = self.state();
        match state {
            InvocationState::Running => Ok(()),
            InvocationState::Completed if envelope.is_invocation_group() => {
                Err(self.violate(ProtocolViolation::SecondCompletion))
            }
            _ => Err(self.violate(ProtocolViolation::UnexpectedEnvelope(state))),
        }
    }

    fn resolve(&self, envelope: &Envelope) -> Result<&Entry, HandlerRejection> {
        self.table
            .resolve(envelope.group, envelope.op)
            .map_err(|e| self.violate(ProtocolViolation::Dispatch(e)))
    }

    fn complete(&self, envelope: Envelope) -> Result<(), HandlerRejection> {
        let outcome = envelope
            .into_outcome()
            .map_err(|reason| self.violate(ProtocolViolation::MalformedCompletion(reason)))?;
        let sender = self
            .completion
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(sender) = sender else {
            return Err(self.violate(ProtocolViolation::SecondCompletion));
        };
        debug!("Invocation {}: terminal result {outcome}", self.context_id);
        self.advance(InvocationState::Completed);
        // The receiver lives until the invocation returns
        let _ = sender.send(outcome);
        Ok(())
    }
}

impl MessageHandler for Broker {
    fn notify(&self, message: &[u8]) -> Result<(), HandlerRejection> {
        let envelope = self.decode(message)?;
        self.ensure_running(&envelope)?;
        if envelope.is_invocation_group() {
            return self.complete(envelope);
        }

        let entry = self.resolve(&envelope)?;
        if entry.kind() != CapabilityKind::Write {
            return Err(self.violate(ProtocolViolation::DirectionMismatch {
                capability: entry.name().to_string(),
                expected: "call",
            }));
        }
        debug!("Invocation {}: {}", self.context_id, entry.name());
        self.progress().capability_calls += 1;

        match entry.invoke(&envelope.values) {
            Ok(_) => Ok(()),
            Err(CapabilityError::BadArguments { capability, reason }) => Err(self.violate(
                ProtocolViolation::BadArguments(format!("{capability}: {reason}")),
            )),
            Err(CapabilityError::Host(source)) => {
                warn!(
                    "Invocation {}: {} failed: {source}",
                    self.context_id,
                    entry.name()
                );
                let rejection = HandlerRejection(source.to_string());
                let mut progress = self.progress();
                if progress.write_failure.is_none() {
                    progress.write_failure = Some(WorkerError::Capability {
                        capability: entry.name().to_string(),
                        source,
                    });
                }
                Err(rejection)
            }
        }
    }

    fn call(&self, message: &[u8]) -> Result<Vec<u8>, HandlerRejection> {
        let envelope = self.decode(message)?;
        self.ensure_running(&envelope)?;
        if envelope.is_invocation_group() {
            return Err(self.violate(ProtocolViolation::ReservedGroupCall));
        }

        let entry = self.resolve(&envelope)?;
        if entry.kind() == CapabilityKind::Write {
            return Err(self.violate(ProtocolViolation::DirectionMismatch {
                capability: entry.name().to_string(),
                expected: "notification",
            }));
        }
        debug!("Invocation {}: {}", self.context_id, entry.name());
        {
            let mut progress = self.progress();
            progress.capability_calls += 1;
            progress.state = InvocationState::AwaitingCapabilityReply;
        }
        let result = entry.invoke(&envelope.values);
        self.advance(InvocationState::Running);

        let reply = match result {
            Ok(Some(value)) => Outcome::Value(value),
            Ok(None) => Outcome::Empty,
            Err(CapabilityError::BadArguments { capability, reason }) => {
                return Err(self.violate(ProtocolViolation::BadArguments(format!(
                    "{capability}: {reason}"
                ))))
            }
            // Reported to the guest, which may handle it
            Err(CapabilityError::Host(e)) => {
                debug!(
                    "Invocation {}: {} answered with error: {e}",
                    self.context_id,
                    entry.name()
                );
                Outcome::Error(e.to_string())
            }
        };
        Envelope::outcome(&reply)
            .encode()
            .or_else(|e| {
                warn!(
                    "Invocation {}: {} reply cannot be encoded: {e}",
                    self.context_id,
                    entry.name()
                );
                Envelope::outcome(&Outcome::Error(e.to_string())).encode()
            })
            .map_err(|e| HandlerRejection(e.to_string()))
    }

    fn print(&self, text: &str) {
        debug!(target: "contract_broker::guest", "[{}] {text}", self.context_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capabilities::{
        ExecutionContext, Host, MemoryStateStore, PermissionScope, StaticIdentity, CATALOG,
        GROUP_STATE, OP_READ_UINT32, OP_WRITE_UINT32,
    };
    use crate::codec::TypedValue;

    fn broker() -> (Broker, oneshot::Receiver<Outcome>) {
        let host = Host::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(StaticIdentity::default()),
        );
        let ctx = ExecutionContext::new("b-1", PermissionScope::Service);
        let table = DispatchTable::for_invocation(CATALOG, &host, &ctx).unwrap();
        let (broker, rx) = Broker::new(ctx.id(), table);
        broker.advance(InvocationState::Running);
        (broker, rx)
    }

    fn key(k: &str) -> TypedValue {
        TypedValue::String(k.to_string())
    }

    #[test]
    fn test_terminal_notification_completes() {
        let (broker, mut rx) = broker();
        broker
            .notify(&Envelope::outcome(&Outcome::Empty).encode().unwrap())
            .unwrap();
        assert_eq!(broker.state(), InvocationState::Completed);
        assert_eq!(rx.try_recv().unwrap(), Outcome::Empty);
    }

    #[test]
    fn test_second_terminal_is_a_violation() {
        let (broker, _rx) = broker();
        let terminal = Envelope::outcome(&Outcome::Empty).encode().unwrap();
        broker.notify(&terminal).unwrap();
        assert!(broker.notify(&terminal).is_err());
        assert_eq!(
            broker.take_violation(),
            Some(ProtocolViolation::SecondCompletion)
        );
    }

    #[test]
    fn test_call_on_invocation_group_is_a_violation() {
        let (broker, _rx) = broker();
        let err = broker
            .call(&Envelope::outcome(&Outcome::Empty).encode().unwrap())
            .unwrap_err();
        assert!(err.0.contains("reserved"));
        assert_eq!(
            broker.take_violation(),
            Some(ProtocolViolation::ReservedGroupCall)
        );
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (broker, _rx) = broker();
        let write = Envelope::new(GROUP_STATE, OP_WRITE_UINT32, vec![key("balance"), TypedValue::Uint32(7)]);
        broker.notify(&write.encode().unwrap()).unwrap();

        let read = Envelope::new(GROUP_STATE, OP_READ_UINT32, vec![key("balance")]);
        let reply = Envelope::decode(&broker.call(&read.encode().unwrap()).unwrap()).unwrap();
        assert_eq!(
            reply.into_outcome(),
            Ok(Outcome::Value(TypedValue::Uint32(7)))
        );
        assert_eq!(broker.capability_calls(), 2);
        assert_eq!(broker.state(), InvocationState::Running);
    }

    #[test]
    fn test_direction_mismatch() {
        let (broker, _rx) = broker();
        let read_as_notify = Envelope::new(GROUP_STATE, OP_READ_UINT32, vec![key("k")]);
        assert!(broker.notify(&read_as_notify.encode().unwrap()).is_err());
        assert!(matches!(
            broker.take_violation(),
            Some(ProtocolViolation::DirectionMismatch { expected: "call", .. })
        ));

        let write_as_call = Envelope::new(GROUP_STATE, OP_WRITE_UINT32, vec![key("k"), TypedValue::Uint32(1)]);
        assert!(broker.call(&write_as_call.encode().unwrap()).is_err());
        assert!(matches!(
            broker.take_violation(),
            Some(ProtocolViolation::DirectionMismatch { expected: "notification", .. })
        ));
    }

    #[test]
    fn test_messages_outside_running_are_rejected() {
        let (broker, _rx) = broker();
        broker.advance(InvocationState::ModulesLoading);
        let read = Envelope::new(GROUP_STATE, OP_READ_UINT32, vec![key("k")]);
        assert!(broker.call(&read.encode().unwrap()).is_err());
        assert_eq!(
            broker.take_violation(),
            Some(ProtocolViolation::UnexpectedEnvelope(
                InvocationState::ModulesLoading
            ))
        );

        broker.advance(InvocationState::Terminated);
        assert!(broker.call(&read.encode().unwrap()).is_err());
    }

    #[test]
    fn test_garbage_is_a_decode_violation() {
        let (broker, _rx) = broker();
        assert!(broker.notify(&[1, 2, 3]).is_err());
        assert!(matches!(
            broker.take_violation(),
            Some(ProtocolViolation::Decode(_))
        ));
    }

    #[test]
    fn test_first_violation_wins() {
        let (broker, _rx) = broker();
        let _ = broker.notify(&[1]);
        let _ = broker.call(&Envelope::new(99, 1, vec![]).encode().unwrap());
        assert!(matches!(
            broker.take_violation(),
            Some(ProtocolViolation::Decode(_))
        ));
    }
}
