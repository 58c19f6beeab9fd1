//! Per-invocation `(group, op) -> handler` table.
//!
//! Built once when an invocation starts and read-only afterwards. Handlers
//! are closures bound to the invocation's [`ExecutionContext`], so nothing
//! here is shared between invocations.

use std::collections::HashMap;

use tracing::debug;

use super::{CapabilityError, CapabilityKind, CapabilitySpec, ExecutionContext, Host};
use crate::codec::envelope::INVOCATION_GROUP;
use crate::codec::TypedValue;

pub type Handler =
    Box<dyn Fn(&[TypedValue]) -> Result<Option<TypedValue>, CapabilityError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no capability registered for group {group}, op {op}")]
    NotFound { group: u32, op: u32 },

    #[error("group {INVOCATION_GROUP} is reserved for the invocation itself")]
    ReservedGroup,

    #[error("capability already registered for group {group}, op {op}")]
    Duplicate { group: u32, op: u32 },
}

/// A resolved capability.
pub struct Entry {
    name: String,
    kind: CapabilityKind,
    handler: Handler,
}

impl Entry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn invoke(&self, args: &[TypedValue]) -> Result<Option<TypedValue>, CapabilityError> {
        (self.handler)(args)
    }
}

#[derive(Default)]
pub struct DispatchTable {
    entries: HashMap<(u32, u32), Entry>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table for one invocation from the static catalog.
    /// Every handler validates its arguments and applies the read default.
    pub fn for_invocation(
        catalog: &'static [CapabilitySpec],
        host: &Host,
        context: &ExecutionContext,
    ) -> Result<Self, DispatchError> {
        let mut table = Self::new();
        for spec in catalog {
            let host = host.clone();
            let context = context.clone();
            table.register(
                spec.group,
                spec.op,
                spec.name(),
                spec.kind,
                Box::new(move |args| {
                    spec.check_args(args)?;
                    let value = (spec.invoke)(&host, &context, args)?;
                    Ok(value.or_else(|| spec.default_value()))
                }),
            )?;
        }
        debug!(
            "Dispatch table for {} built with {} capabilities",
            context.id(),
            table.len()
        );
        Ok(table)
    }

    pub fn register(
        &mut self,
        group: u32,
        op: u32,
        name: impl Into<String>,
        kind: CapabilityKind,
        handler: Handler,
    ) -> Result<(), DispatchError> {
        if group == INVOCATION_GROUP {
            return Err(DispatchError::ReservedGroup);
        }
        if self.entries.contains_key(&(group, op)) {
            return Err(DispatchError::Duplicate { group, op });
        }
        self.entries.insert(
            (group, op),
            Entry {
                name: name.into(),
                kind,
                handler,
            },
        );
        Ok(())
    }

    /// Looks up a capability. Unknown pairs fail closed.
    pub fn resolve(&self, group: u32, op: u32) -> Result<&Entry, DispatchError> {
        self.entries
            .get(&(group, op))
            .ok_or(DispatchError::NotFound { group, op })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
