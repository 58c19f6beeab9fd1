//! In-process scripted engine and recording collaborators for tests.
//!
//! A scripted "guest" is a Rust closure that receives the host message and a
//! [`GuestPort`] standing in for the `Sandbox` bridge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::capabilities::{
    ExecutionContext, HostError, MemoryStateStore, StateStore, GROUP_STATE,
};
use crate::codec::{Envelope, Outcome, TypedValue};
use crate::sandbox::{InterruptHandle, MessageHandler, Sandbox, SandboxError, SandboxFactory};

type GuestFn = dyn Fn(&GuestPort, &[u8]) -> Result<(), SandboxError> + Send + Sync;

/// The guest's view of the bridge.
pub struct GuestPort {
    handler: Arc<dyn MessageHandler>,
    interrupt: InterruptHandle,
}

impl GuestPort {
    /// `Sandbox.send`
    pub fn send(&self, envelope: &Envelope) -> Result<(), SandboxError> {
        let bytes = envelope
            .encode()
            .map_err(|e| SandboxError::Guest(e.to_string()))?;
        self.send_raw(&bytes)
    }

    pub fn send_raw(&self, bytes: &[u8]) -> Result<(), SandboxError> {
        self.handler
            .notify(bytes)
            .map_err(|e| SandboxError::Guest(e.0))
    }

    /// `Sandbox.call`
    pub fn call(&self, envelope: &Envelope) -> Result<Envelope, SandboxError> {
        let bytes = envelope
            .encode()
            .map_err(|e| SandboxError::Guest(e.to_string()))?;
        let reply = self
            .handler
            .call(&bytes)
            .map_err(|e| SandboxError::Guest(e.0))?;
        Envelope::decode(&reply).map_err(|e| SandboxError::Guest(e.to_string()))
    }

    /// What a generated read proxy does: call and unwrap the reply.
    pub fn read(&self, group: u32, op: u32, args: Vec<TypedValue>) -> Result<Option<TypedValue>, String> {
        let reply = self
            .call(&Envelope::new(group, op, args))
            .map_err(|e| e.to_string())?;
        match reply.into_outcome()? {
            Outcome::Value(v) => Ok(Some(v)),
            Outcome::Empty => Ok(None),
            Outcome::Error(msg) => Err(msg),
        }
    }

    /// What a generated write proxy does.
    pub fn write(&self, op: u32, args: Vec<TypedValue>) -> Result<(), String> {
        self.send(&Envelope::new(GROUP_STATE, op, args))
            .map_err(|e| e.to_string())
    }

    pub fn print(&self, text: &str) {
        self.handler.print(text);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.is_tripped()
    }
}

/// Counters shared between a factory and every sandbox it creates.
#[derive(Debug, Default)]
pub struct SandboxStats {
    created: AtomicUsize,
    terminate_calls: AtomicUsize,
    loaded: Mutex<Vec<String>>,
}

impl SandboxStats {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> Vec<String> {
        self.loaded.lock().unwrap().clone()
    }
}

pub struct ScriptedFactory {
    guest: Arc<GuestFn>,
    on_load: Option<Arc<dyn Fn(&GuestPort, &str) + Send + Sync>>,
    fail_module: Option<String>,
    fail_create: bool,
    stats: Arc<SandboxStats>,
}

impl ScriptedFactory {
    pub fn new(
        guest: impl Fn(&GuestPort, &[u8]) -> Result<(), SandboxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            guest: Arc::new(guest),
            on_load: None,
            fail_module: None,
            fail_create: false,
            stats: Arc::new(SandboxStats::default()),
        }
    }

    /// Fails loading the first module whose name starts with `prefix`.
    pub fn failing_module(mut self, prefix: &str) -> Self {
        self.fail_module = Some(prefix.to_string());
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Runs `hook` as top-level module code for every loaded module.
    pub fn on_load(mut self, hook: impl Fn(&GuestPort, &str) + Send + Sync + 'static) -> Self {
        self.on_load = Some(Arc::new(hook));
        self
    }

    pub fn stats(&self) -> Arc<SandboxStats> {
        self.stats.clone()
    }
}

impl SandboxFactory for ScriptedFactory {
    fn create(
        &self,
        handler: Arc<dyn MessageHandler>,
        interrupt: InterruptHandle,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        if self.fail_create {
            return Err(SandboxError::Create("scripted failure".to_string()));
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSandbox {
            guest: self.guest.clone(),
            on_load: self.on_load.clone(),
            fail_module: self.fail_module.clone(),
            port: GuestPort { handler, interrupt },
            stats: self.stats.clone(),
            terminated: false,
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct ScriptedSandbox {
    guest: Arc<GuestFn>,
    on_load: Option<Arc<dyn Fn(&GuestPort, &str) + Send + Sync>>,
    fail_module: Option<String>,
    port: GuestPort,
    stats: Arc<SandboxStats>,
    terminated: bool,
}

impl Sandbox for ScriptedSandbox {
    fn load_module(&mut self, name: &str, _source: &str) -> Result<(), SandboxError> {
        if self.terminated {
            return Err(SandboxError::Terminated);
        }
        self.stats.loaded.lock().unwrap().push(name.to_string());
        if let Some(hook) = &self.on_load {
            hook(&self.port, name);
        }
        match &self.fail_module {
            Some(prefix) if name.starts_with(prefix.as_str()) => Err(SandboxError::ModuleLoad {
                module: name.to_string(),
                reason: "SyntaxError: unexpected token".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn send(&mut self, message: &[u8]) -> Result<(), SandboxError> {
        if self.terminated {
            return Err(SandboxError::Terminated);
        }
        (self.guest)(&self.port, message)
    }

    fn terminate(&mut self) {
        self.stats.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.terminated = true;
        self.port.interrupt.trip();
    }
}

/// Behaves like the generated invocation module around `body`: decodes the
/// request, runs the method and sends exactly one terminal envelope.
pub fn contract(
    body: impl Fn(&GuestPort, &str, &[TypedValue]) -> Result<Option<TypedValue>, String>
        + Send
        + Sync
        + 'static,
) -> impl Fn(&GuestPort, &[u8]) -> Result<(), SandboxError> + Send + Sync + 'static {
    move |port: &GuestPort, message: &[u8]| {
        let result = Envelope::decode(message)
            .map_err(|e| e.to_string())
            .and_then(|request| {
                let mut values = request.values.into_iter();
                match values.next() {
                    Some(TypedValue::String(method)) => {
                        let args: Vec<TypedValue> = values.collect();
                        body(port, &method, &args)
                    }
                    _ => Err("invocation without a method name".to_string()),
                }
            });
        let outcome = match result {
            Ok(Some(value)) => Outcome::Value(value),
            Ok(None) => Outcome::Empty,
            Err(msg) => Outcome::Error(msg),
        };
        port.send(&Envelope::outcome(&outcome))
    }
}

/// One typed store call as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Read { key: String },
    Write { key: String, value: TypedValue },
    Clear { key: String },
}

/// Memory store that records every typed call it receives.
#[derive(Debug, Default)]
pub struct RecordingStore {
    pub inner: MemoryStateStore,
    calls: Mutex<Vec<StoreCall>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<StoreCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, StoreCall::Write { .. }))
            .collect()
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn read(&self, key: &str) {
        self.record(StoreCall::Read {
            key: key.to_string(),
        });
    }

    fn wrote(&self, key: &str, value: TypedValue) {
        self.record(StoreCall::Write {
            key: key.to_string(),
            value,
        });
    }
}

impl StateStore for RecordingStore {
    fn read_bytes(&self, ctx: &ExecutionContext, key: &str) -> Result<Option<Vec<u8>>, HostError> {
        self.read(key);
        self.inner.read_bytes(ctx, key)
    }

    fn write_bytes(&self, ctx: &ExecutionContext, key: &str, value: &[u8]) -> Result<(), HostError> {
        self.wrote(key, TypedValue::Bytes(value.to_vec()));
        self.inner.write_bytes(ctx, key, value)
    }

    fn clear(&self, ctx: &ExecutionContext, key: &str) -> Result<(), HostError> {
        self.record(StoreCall::Clear {
            key: key.to_string(),
        });
        self.inner.clear(ctx, key)
    }

    fn read_uint32(&self, ctx: &ExecutionContext, key: &str) -> Result<Option<u32>, HostError> {
        self.read(key);
        self.inner.read_uint32(ctx, key)
    }

    fn write_uint32(&self, ctx: &ExecutionContext, key: &str, value: u32) -> Result<(), HostError> {
        self.wrote(key, TypedValue::Uint32(value));
        self.inner.write_uint32(ctx, key, value)
    }

    fn read_uint64(&self, ctx: &ExecutionContext, key: &str) -> Result<Option<u64>, HostError> {
        self.read(key);
        self.inner.read_uint64(ctx, key)
    }

    fn write_uint64(&self, ctx: &ExecutionContext, key: &str, value: u64) -> Result<(), HostError> {
        self.wrote(key, TypedValue::Uint64(value));
        self.inner.write_uint64(ctx, key, value)
    }

    fn read_string(&self, ctx: &ExecutionContext, key: &str) -> Result<Option<String>, HostError> {
        self.read(key);
        self.inner.read_string(ctx, key)
    }

    fn write_string(&self, ctx: &ExecutionContext, key: &str, value: &str) -> Result<(), HostError> {
        self.wrote(key, TypedValue::String(value.to_string()));
        self.inner.write_string(ctx, key, value)
    }
}
