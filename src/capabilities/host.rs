//! Host collaborators: the state store and the identity provider.
//!
//! The broker only defines the shape of these calls. Durability, access
//! control and key scoping belong to the implementations. `MemoryStateStore`
//! and `StaticIdentity` are the implementations used by the CLI and tests.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use tracing::{debug, info};

use super::{ExecutionContext, PermissionScope};
use crate::codec::Address;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("permission denied for {operation} under {scope} scope")]
    PermissionDenied {
        operation: String,
        scope: PermissionScope,
    },

    #[error("stored value for '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("host collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Durable key/value state as seen by a contract.
///
/// Only the byte-level operations are required; typed reads and writes
/// default to little-endian integers and UTF-8 strings over them.
pub trait StateStore: Send + Sync {
    fn read_bytes(&self, ctx: &ExecutionContext, key: &str) -> Result<Option<Vec<u8>>, HostError>;

    fn write_bytes(&self, ctx: &ExecutionContext, key: &str, value: &[u8]) -> Result<(), HostError>;

    fn clear(&self, ctx: &ExecutionContext, key: &str) -> Result<(), HostError>;

    fn read_uint32(&self, ctx: &ExecutionContext, key: &str) -> Result<Option<u32>, HostError> {
        self.read_bytes(ctx, key)?
            .map(|raw| fixed::<4>(key, raw).map(u32::from_le_bytes))
            .transpose()
    }

    fn write_uint32(&self, ctx: &ExecutionContext, key: &str, value: u32) -> Result<(), HostError> {
        self.write_bytes(ctx, key, &value.to_le_bytes())
    }

    fn read_uint64(&self, ctx: &ExecutionContext, key: &str) -> Result<Option<u64>, HostError> {
        self.read_bytes(ctx, key)?
            .map(|raw| fixed::<8>(key, raw).map(u64::from_le_bytes))
            .transpose()
    }

    fn write_uint64(&self, ctx: &ExecutionContext, key: &str, value: u64) -> Result<(), HostError> {
        self.write_bytes(ctx, key, &value.to_le_bytes())
    }

    fn read_string(&self, ctx: &ExecutionContext, key: &str) -> Result<Option<String>, HostError> {
        self.read_bytes(ctx, key)?
            .map(|raw| {
                String::from_utf8(raw).map_err(|e| HostError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn write_string(&self, ctx: &ExecutionContext, key: &str, value: &str) -> Result<(), HostError> {
        self.write_bytes(ctx, key, value.as_bytes())
    }
}

fn fixed<const N: usize>(key: &str, raw: Vec<u8>) -> Result<[u8; N], HostError> {
    raw.try_into().map_err(|raw: Vec<u8>| HostError::Corrupt {
        key: key.to_string(),
        reason: format!("expected {N} bytes, found {}", raw.len()),
    })
}

/// Who is calling and who signed the transaction.
pub trait IdentityProvider: Send + Sync {
    fn caller_address(&self, ctx: &ExecutionContext) -> Result<Address, HostError>;

    fn signer_address(&self, ctx: &ExecutionContext) -> Result<Address, HostError>;
}

/// The collaborators handed to every invocation's dispatch table.
#[derive(Clone)]
pub struct Host {
    pub state: Arc<dyn StateStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl Host {
    pub fn new(state: Arc<dyn StateStore>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { state, identity }
    }
}

// ── In-memory implementations ────────────────────────────

/// Process-local state store. Mutations are refused under the query scope.
///
/// Can be loaded from and saved to a JSON snapshot (`{"key": "hex"}`) so the
/// CLI keeps state between runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot. A missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No state snapshot at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading state snapshot {}", path.display()))?;
        let snapshot: BTreeMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("parsing state snapshot {}", path.display()))?;
        let mut entries = HashMap::with_capacity(snapshot.len());
        for (key, value) in snapshot {
            let raw = hex::decode(&value)
                .with_context(|| format!("invalid hex for key '{key}' in snapshot"))?;
            entries.insert(key, raw);
        }
        info!("Loaded {} state entries from {}", entries.len(), path.display());
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Writes the current state as a JSON snapshot, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot: BTreeMap<String, String> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), hex::encode(v)))
            .collect();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)
            .with_context(|| format!("writing state snapshot {}", path.display()))?;
        debug!("Saved {} state entries to {}", snapshot.len(), path.display());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // A panic while holding the lock leaves the map itself consistent
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_writable(ctx: &ExecutionContext, operation: &str) -> Result<(), HostError> {
        if ctx.scope() == PermissionScope::Query {
            return Err(HostError::PermissionDenied {
                operation: operation.to_string(),
                scope: ctx.scope(),
            });
        }
        Ok(())
    }
}

impl StateStore for MemoryStateStore {
    fn read_bytes(&self, _ctx: &ExecutionContext, key: &str) -> Result<Option<Vec<u8>>, HostError> {
        Ok(self.get(key))
    }

    fn write_bytes(&self, ctx: &ExecutionContext, key: &str, value: &[u8]) -> Result<(), HostError> {
        Self::ensure_writable(ctx, "write")?;
        self.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn clear(&self, ctx: &ExecutionContext, key: &str) -> Result<(), HostError> {
        Self::ensure_writable(ctx, "clear")?;
        self.lock().remove(key);
        Ok(())
    }
}

/// Fixed caller and signer addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    signer: Address,
    caller: Address,
}

impl StaticIdentity {
    pub fn new(signer: Address, caller: Address) -> Self {
        Self { signer, caller }
    }
}

impl IdentityProvider for StaticIdentity {
    fn caller_address(&self, _ctx: &ExecutionContext) -> Result<Address, HostError> {
        Ok(self.caller)
    }

    fn signer_address(&self, _ctx: &ExecutionContext) -> Result<Address, HostError> {
        Ok(self.signer)
    }
}
