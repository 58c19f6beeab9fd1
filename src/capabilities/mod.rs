//! Host capabilities exposed to contracts.
//!
//! A capability is a host operation addressed by a `(group, op)` pair. The
//! catalog below is static configuration shared by every invocation; the
//! per-invocation [`DispatchTable`] binds each entry to one
//! [`ExecutionContext`] and the host collaborators.

pub mod dispatch;
pub mod host;

use std::fmt;

use serde::Deserialize;

use crate::codec::{TypedValue, ValueType};

pub use dispatch::{DispatchError, DispatchTable, Entry};
pub use host::{Host, HostError, IdentityProvider, MemoryStateStore, StateStore, StaticIdentity};

pub const GROUP_STATE: u32 = 1;
pub const GROUP_ADDRESS: u32 = 2;

pub const OP_READ_BYTES: u32 = 1;
pub const OP_WRITE_BYTES: u32 = 2;
pub const OP_READ_STRING: u32 = 3;
pub const OP_WRITE_STRING: u32 = 4;
pub const OP_READ_UINT32: u32 = 5;
pub const OP_WRITE_UINT32: u32 = 6;
pub const OP_READ_UINT64: u32 = 7;
pub const OP_WRITE_UINT64: u32 = 8;
pub const OP_CLEAR: u32 = 9;

pub const OP_GET_SIGNER_ADDRESS: u32 = 1;
pub const OP_GET_CALLER_ADDRESS: u32 = 2;

/// Access level an invocation runs under.
///
/// Collaborators decide what each level may do; the in-memory store
/// rejects every mutation under `Query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    /// Read-only calls (queries)
    Query,
    /// Regular contract calls
    #[default]
    Service,
    /// System contracts
    System,
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermissionScope::Query => "query",
            PermissionScope::Service => "service",
            PermissionScope::System => "system",
        };
        f.write_str(name)
    }
}

/// Identifies one invocation and carries its permission scope.
/// Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    id: String,
    scope: PermissionScope,
}

impl ExecutionContext {
    pub fn new(id: impl Into<String>, scope: PermissionScope) -> Self {
        Self {
            id: id.into(),
            scope,
        }
    }

    /// Creates a context with a random id.
    pub fn generate(scope: PermissionScope) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), scope)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> PermissionScope {
        self.scope
    }
}

/// Whether a capability answers the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    /// One-way: the guest fires the envelope and continues.
    Write,
    /// Call-and-wait: the guest blocks until the host replies with a value
    /// of this type.
    Read(ValueType),
}

#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: &'static str,
    pub ty: ValueType,
}

const fn param(name: &'static str, ty: ValueType) -> Param {
    Param { name, ty }
}

/// Host-side implementation of a capability. Returns `None` when the
/// underlying store has no value.
pub type CapabilityFn =
    fn(&Host, &ExecutionContext, &[TypedValue]) -> Result<Option<TypedValue>, CapabilityError>;

/// One catalog entry.
#[derive(Clone, Copy)]
pub struct CapabilitySpec {
    pub group: u32,
    pub op: u32,
    /// Guest object the stub is attached to (`State`, `Address`).
    pub object: &'static str,
    /// Guest function name.
    pub method: &'static str,
    pub params: &'static [Param],
    pub kind: CapabilityKind,
    pub invoke: CapabilityFn,
}

impl fmt::Debug for CapabilitySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySpec")
            .field("group", &self.group)
            .field("op", &self.op)
            .field("name", &self.name())
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl CapabilitySpec {
    /// `Object.method`, as the guest sees it.
    pub fn name(&self) -> String {
        format!("{}.{}", self.object, self.method)
    }

    /// Value a read returns when the store has nothing under the key.
    pub fn default_value(&self) -> Option<TypedValue> {
        match self.kind {
            CapabilityKind::Write => None,
            CapabilityKind::Read(ty) => default_for(ty),
        }
    }

    /// Checks the decoded arguments against the declared parameters.
    pub fn check_args(&self, args: &[TypedValue]) -> Result<(), CapabilityError> {
        if args.len() != self.params.len() {
            return Err(CapabilityError::BadArguments {
                capability: self.name(),
                reason: format!("expected {} arguments, got {}", self.params.len(), args.len()),
            });
        }
        for (param, arg) in self.params.iter().zip(args) {
            if arg.value_type() != param.ty {
                return Err(CapabilityError::BadArguments {
                    capability: self.name(),
                    reason: format!(
                        "argument '{}' must be {:?}, got {:?}",
                        param.name,
                        param.ty,
                        arg.value_type()
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Empty sentinel per result type. Addresses have none.
pub fn default_for(ty: ValueType) -> Option<TypedValue> {
    match ty {
        ValueType::Bytes => Some(TypedValue::Bytes(Vec::new())),
        ValueType::String => Some(TypedValue::String(String::new())),
        ValueType::Uint32 => Some(TypedValue::Uint32(0)),
        ValueType::Uint64 => Some(TypedValue::Uint64(0)),
        ValueType::Address => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// The envelope's arguments don't match the catalog. This is a stub or
    /// catalog defect, not something the guest can cause through the stubs.
    #[error("bad arguments for {capability}: {reason}")]
    BadArguments { capability: String, reason: String },

    #[error(transparent)]
    Host(#[from] HostError),
}

const KEY: Param = param("key", ValueType::String);

/// Every capability a contract can reach.
pub static CATALOG: &[CapabilitySpec] = &[
    CapabilitySpec {
        group: GROUP_STATE,
        op: OP_READ_BYTES,
        object: "State",
        method: "readBytes",
        params: &[KEY],
        kind: CapabilityKind::Read(ValueType::Bytes),
        invoke: read_bytes,
    },
    CapabilitySpec {
        group: GROUP_STATE,
        op: OP_WRITE_BYTES,
        object: "State",
        method: "writeBytes",
        params: &[KEY, param("value", ValueType::Bytes)],
        kind: CapabilityKind::Write,
        invoke: write_bytes,
    },
    CapabilitySpec {
        group: GROUP_STATE,
        op: OP_READ_STRING,
        object: "State",
        method: "readString",
        params: &[KEY],
        kind: CapabilityKind::Read(ValueType::String),
        invoke: read_string,
    },
    CapabilitySpec {
        group: GROUP_STATE,
        op: OP_WRITE_STRING,
        object: "State",
        method: "writeString",
        params: &[KEY, param("value", ValueType::String)],
        kind: CapabilityKind::Write,
        invoke: write_string,
    },
    CapabilitySpec {
        group: GROUP_STATE,
        op: OP_READ_UINT32,
        object: "State",
        method: "readUint32",
        params: &[KEY],
        kind: CapabilityKind::Read(ValueType::Uint32),
        invoke: read_uint32,
    },
    CapabilitySpec {
        group: GROUP_STATE,
        op: OP_WRITE_UINT32,
        object: "State",
        method: "writeUint32",
        params: &[KEY, param("value", ValueType::Uint32)],
        kind: CapabilityKind::Write,
        invoke: write_uint32,
    },
    CapabilitySpec {
        group: GROUP_STATE,
        op: OP_READ_UINT64,
        object: "State",
        method: "readUint64",
        params: &[KEY],
        kind: CapabilityKind::Read(ValueType::Uint64),
        invoke: read_uint64,
    },
    CapabilitySpec {
        group: GROUP_STATE,
        op: OP_WRITE_UINT64,
        object: "State",
        method: "writeUint64",
        params: &[KEY, param("value", ValueType::Uint64)],
        kind: CapabilityKind::Write,
        invoke: write_uint64,
    },
    CapabilitySpec {
        group: GROUP_STATE,
        op: OP_CLEAR,
        object: "State",
        method: "clear",
        params: &[KEY],
        kind: CapabilityKind::Write,
        invoke: clear,
    },
    CapabilitySpec {
        group: GROUP_ADDRESS,
        op: OP_GET_SIGNER_ADDRESS,
        object: "Address",
        method: "getSignerAddress",
        params: &[],
        kind: CapabilityKind::Read(ValueType::Address),
        invoke: signer_address,
    },
    CapabilitySpec {
        group: GROUP_ADDRESS,
        op: OP_GET_CALLER_ADDRESS,
        object: "Address",
        method: "getCallerAddress",
        params: &[],
        kind: CapabilityKind::Read(ValueType::Address),
        invoke: caller_address,
    },
];

// ── Handlers ──────────────────────────────────────────────
//
// Arguments have already been checked against the entry's params by the
// dispatch table; the `else` branches only guard against catalog typos.

type HandlerResult = Result<Option<TypedValue>, CapabilityError>;

fn mismatch(capability: &str) -> CapabilityError {
    CapabilityError::BadArguments {
        capability: capability.to_string(),
        reason: "argument shape does not match handler".to_string(),
    }
}

fn read_bytes(host: &Host, ctx: &ExecutionContext, args: &[TypedValue]) -> HandlerResult {
    let [TypedValue::String(key)] = args else {
        return Err(mismatch("State.readBytes"));
    };
    Ok(host.state.read_bytes(ctx, key)?.map(TypedValue::Bytes))
}

fn write_bytes(host: &Host, ctx: &ExecutionContext, args: &[TypedValue]) -> HandlerResult {
    let [TypedValue::String(key), TypedValue::Bytes(value)] = args else {
        return Err(mismatch("State.writeBytes"));
    };
    host.state.write_bytes(ctx, key, value)?;
    Ok(None)
}

fn read_string(host: &Host, ctx: &ExecutionContext, args: &[TypedValue]) -> HandlerResult {
    let [TypedValue::String(key)] = args else {
        return Err(mismatch("State.readString"));
    };
    Ok(host.state.read_string(ctx, key)?.map(TypedValue::String))
}

fn write_string(host: &Host, ctx: &ExecutionContext, args: &[TypedValue]) -> HandlerResult {
    let [TypedValue::String(key), TypedValue::String(value)] = args else {
        return Err(mismatch("State.writeString"));
    };
    host.state.write_string(ctx, key, value)?;
    Ok(None)
}

fn read_uint32(host: &Host, ctx: &ExecutionContext, args: &[TypedValue]) -> HandlerResult {
    let [TypedValue::String(key)] = args else {
        return Err(mismatch("State.readUint32"));
    };
    Ok(host.state.read_uint32(ctx, key)?.map(TypedValue::Uint32))
}

fn write_uint32(host: &Host, ctx: &ExecutionContext, args: &[TypedValue]) -> HandlerResult {
    let [TypedValue::String(key), TypedValue::Uint32(value)] = args else {
        return Err(mismatch("State.writeUint32"));
    };
    host.state.write_uint32(ctx, key, *value)?;
    Ok(None)
}

fn read_uint64(host: &Host, ctx: &ExecutionContext, args: &[TypedValue]) -> HandlerResult {
    let [TypedValue::String(key)] = args else {
        return Err(mismatch("State.readUint64"));
    };
    Ok(host.state.read_uint64(ctx, key)?.map(TypedValue::Uint64))
}

fn write_uint64(host: &Host, ctx: &ExecutionContext, args: &[TypedValue]) -> HandlerResult {
    let [TypedValue::String(key), TypedValue::Uint64(value)] = args else {
        return Err(mismatch("State.writeUint64"));
    };
    host.state.write_uint64(ctx, key, *value)?;
    Ok(None)
}

fn clear(host: &Host, ctx: &ExecutionContext, args: &[TypedValue]) -> HandlerResult {
    let [TypedValue::String(key)] = args else {
        return Err(mismatch("State.clear"));
    };
    host.state.clear(ctx, key)?;
    Ok(None)
}

fn signer_address(host: &Host, ctx: &ExecutionContext, _args: &[TypedValue]) -> HandlerResult {
    Ok(Some(TypedValue::Address(host.identity.signer_address(ctx)?)))
}

fn caller_address(host: &Host, ctx: &ExecutionContext, _args: &[TypedValue]) -> HandlerResult {
    Ok(Some(TypedValue::Address(host.identity.caller_address(ctx)?)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_catalog_ids_are_unique_and_not_reserved() {
        let mut seen = HashSet::new();
        for spec in CATALOG {
            assert_ne!(spec.group, 0, "{} uses the reserved group", spec.name());
            assert!(seen.insert((spec.group, spec.op)), "duplicate {:?}", spec);
        }
    }

    #[test]
    fn test_catalog_names_are_unique() {
        let names: HashSet<String> = CATALOG.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), CATALOG.len());
    }

    #[test]
    fn test_defaults_per_read_type() {
        let defaults: Vec<(String, Option<TypedValue>)> = CATALOG
            .iter()
            .filter(|s| matches!(s.kind, CapabilityKind::Read(_)))
            .map(|s| (s.name(), s.default_value()))
            .collect();
        assert!(defaults.contains(&("State.readBytes".into(), Some(TypedValue::Bytes(vec![])))));
        assert!(defaults.contains(&("State.readString".into(), Some(TypedValue::String(String::new())))));
        assert!(defaults.contains(&("State.readUint32".into(), Some(TypedValue::Uint32(0)))));
        assert!(defaults.contains(&("State.readUint64".into(), Some(TypedValue::Uint64(0)))));
        assert!(defaults.contains(&("Address.getCallerAddress".into(), None)));
    }

    #[test]
    fn test_check_args_rejects_wrong_arity_and_type() {
        let write = CATALOG
            .iter()
            .find(|s| s.op == OP_WRITE_UINT32 && s.group == GROUP_STATE)
            .unwrap();
        assert!(write
            .check_args(&[TypedValue::String("k".into()), TypedValue::Uint32(1)])
            .is_ok());
        assert!(matches!(
            write.check_args(&[TypedValue::String("k".into())]),
            Err(CapabilityError::BadArguments { .. })
        ));
        let err = write
            .check_args(&[TypedValue::String("k".into()), TypedValue::Uint64(1)])
            .unwrap_err();
        assert!(err.to_string().contains("argument 'value'"));
    }

    #[test]
    fn test_generated_context_ids_differ() {
        let a = ExecutionContext::generate(PermissionScope::Service);
        let b = ExecutionContext::generate(PermissionScope::Service);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.scope(), PermissionScope::Service);
    }

    #[test]
    fn test_scope_display_and_default() {
        assert_eq!(PermissionScope::default(), PermissionScope::Service);
        assert_eq!(PermissionScope::Query.to_string(), "query");
    }
}
