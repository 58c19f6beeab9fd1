//! Execution sandbox: the seam between the broker and a script engine.
//!
//! An engine only has to:
//! - load named modules in order,
//! - deliver a host message to the guest's registered receiver,
//! - route guest messages to a [`MessageHandler`], keeping one-way
//!   notifications and call-and-wait requests apart,
//! - stop when its [`InterruptHandle`] is tripped, and be terminated.
//!
//! Every engine exposes the same bridge to guest code, a global `Sandbox`
//! object:
//!
//! | member | direction | meaning |
//! |---|---|---|
//! | `recv(fn)` | host → guest | registers the receiver for host messages |
//! | `send(bytes)` | guest → host | one-way notification |
//! | `call(bytes)` | guest → host → guest | blocks until the host replies |
//! | `print(...parts)` | guest → host | diagnostic output |
//!
//! One sandbox serves exactly one invocation and is never reused.

#[cfg(feature = "quickjs")]
pub mod quickjs;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Host side of the guest bridge. Implemented by the broker.
///
/// Returning an error makes the engine raise an exception at the guest's
/// call site.
pub trait MessageHandler: Send + Sync {
    /// Guest → host one-way message (`Sandbox.send`).
    fn notify(&self, message: &[u8]) -> Result<(), HandlerRejection>;

    /// Guest → host call (`Sandbox.call`); the reply is handed back to the
    /// suspended guest.
    fn call(&self, message: &[u8]) -> Result<Vec<u8>, HandlerRejection>;

    /// Guest diagnostic output (`Sandbox.print`).
    fn print(&self, text: &str);
}

/// Why the host refused a guest message. Surfaces in the guest as an
/// exception carrying this text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerRejection(pub String);

/// Cross-thread stop flag for one sandbox.
///
/// Tripping is idempotent and safe at any point of the invocation.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to create sandbox: {0}")]
    Create(String),

    #[error("failed to load module '{module}': {reason}")]
    ModuleLoad { module: String, reason: String },

    /// Uncaught guest exception while handling a host message.
    #[error("guest raised: {0}")]
    Guest(String),

    #[error("execution interrupted")]
    Interrupted,

    #[error("sandbox already terminated")]
    Terminated,
}

/// One disposable engine instance.
///
/// Not required to be `Send`: a sandbox is created, driven and terminated
/// on a single thread.
pub trait Sandbox {
    /// Compiles and evaluates a module under `name`. Later modules may import
    /// it by that name.
    fn load_module(&mut self, name: &str, source: &str) -> Result<(), SandboxError>;

    /// Delivers `message` to the guest's receiver and runs the guest until it
    /// has no pending work left.
    fn send(&mut self, message: &[u8]) -> Result<(), SandboxError>;

    /// Stops execution and releases the engine. Must be safe to call in any
    /// state; calls after the first are no-ops.
    fn terminate(&mut self);
}

/// Creates sandboxes. Shared by all invocations of a worker.
pub trait SandboxFactory: Send + Sync {
    fn create(
        &self,
        handler: Arc<dyn MessageHandler>,
        interrupt: InterruptHandle,
    ) -> Result<Box<dyn Sandbox>, SandboxError>;

    /// Engine name for logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_is_shared_between_clones() {
        let handle = InterruptHandle::new();
        let remote = handle.clone();
        assert!(!handle.is_tripped());
        remote.trip();
        remote.trip();
        assert!(handle.is_tripped());
    }

    #[test]
    fn test_traits_are_object_safe() {
        fn _sandbox(_: &dyn Sandbox) {}
        fn _factory(_: &dyn SandboxFactory) {}
        fn _handler(_: &dyn MessageHandler) {}
    }
}
