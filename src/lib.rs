//! Contract sandbox broker.
//!
//! Runs an untrusted contract method in a fresh script sandbox and brokers
//! every host interaction the contract makes (state reads and writes,
//! identity queries) over a small binary envelope protocol.
//!
//! - [`codec`]: typed-value wire format and envelopes
//! - [`capabilities`]: capability catalog, host collaborators and the
//!   per-invocation dispatch table
//! - [`stubs`]: JavaScript loaded into the sandbox next to the contract
//! - [`sandbox`]: engine seam (QuickJS behind the `quickjs` feature)
//! - [`worker`]: the per-invocation lifecycle

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod sandbox;
pub mod stubs;
pub mod worker;

#[cfg(test)]
mod testing;

pub use capabilities::{ExecutionContext, Host, PermissionScope};
pub use codec::{MethodCall, Outcome, TypedValue};
pub use worker::{Worker, WorkerError};
