//! QuickJS engine (`rquickjs`).
//!
//! Bytes cross the bridge as lowercase hex strings; the prelude converts
//! them to and from `Uint8Array` on the guest side.

use std::sync::Arc;

use rquickjs::{CatchResultExt, Context, Ctx, Exception, Function, Module, Object, Runtime};
use tracing::debug;

use super::{InterruptHandle, MessageHandler, Sandbox, SandboxError, SandboxFactory};

pub const DEFAULT_MEMORY_LIMIT: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAX_STACK_SIZE: usize = 1024 * 1024;

const PRELUDE: &str = r#"
(function (host) {
    const toHex = (bytes) =>
        Array.from(bytes, (b) => b.toString(16).padStart(2, "0")).join("");
    const fromHex = (hex) => {
        const out = new Uint8Array(hex.length / 2);
        for (let i = 0; i < out.length; i++) {
            out[i] = parseInt(hex.substr(i * 2, 2), 16);
        }
        return out;
    };
    let receiver = null;
    const bridge = Object.freeze({
        recv(fn) {
            if (typeof fn !== "function") {
                throw new TypeError("Sandbox.recv expects a function");
            }
            receiver = fn;
        },
        send(bytes) {
            host.notify(toHex(bytes));
        },
        call(bytes) {
            return fromHex(host.call(toHex(bytes)));
        },
        print(...parts) {
            host.print(parts.map(String).join(" "));
        },
    });
    Object.defineProperty(globalThis, "Sandbox", { value: bridge });
    Object.defineProperty(globalThis, "__deliver", {
        value: (hex) => {
            if (receiver === null) {
                throw new Error("no receiver registered");
            }
            receiver(fromHex(hex));
        },
    });
})(globalThis.__host);
delete globalThis.__host;
"#;

pub struct QuickJsFactory {
    memory_limit: usize,
    max_stack_size: usize,
}

impl QuickJsFactory {
    pub fn new(memory_limit: usize, max_stack_size: usize) -> Self {
        Self {
            memory_limit,
            max_stack_size,
        }
    }
}

impl Default for QuickJsFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT, DEFAULT_MAX_STACK_SIZE)
    }
}

impl SandboxFactory for QuickJsFactory {
    fn create(
        &self,
        handler: Arc<dyn MessageHandler>,
        interrupt: InterruptHandle,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        let create = |e: rquickjs::Error| SandboxError::Create(e.to_string());
        let runtime = Runtime::new().map_err(create)?;
        runtime.set_memory_limit(self.memory_limit);
        runtime.set_max_stack_size(self.max_stack_size);
        let flag = interrupt.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || flag.is_tripped())));

        let context = Context::full(&runtime).map_err(create)?;
        context.with(|ctx| -> Result<(), SandboxError> {
            install_bridge(&ctx, handler)
                .catch(&ctx)
                .map_err(|e| SandboxError::Create(e.to_string()))
        })?;

        debug!(
            "QuickJS sandbox created (memory limit {} bytes, stack {} bytes)",
            self.memory_limit, self.max_stack_size
        );
        Ok(Box::new(QuickJsSandbox {
            engine: Some(Engine { context, runtime }),
            interrupt,
        }))
    }

    fn name(&self) -> &str {
        "quickjs"
    }
}

fn install_bridge<'js>(ctx: &Ctx<'js>, handler: Arc<dyn MessageHandler>) -> rquickjs::Result<()> {
    let host = Object::new(ctx.clone())?;

    let notify = handler.clone();
    host.set(
        "notify",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, message: String| -> rquickjs::Result<()> {
            let bytes = hex::decode(&message).map_err(|e| throw(&ctx, &e.to_string()))?;
            notify.notify(&bytes).map_err(|e| throw(&ctx, &e.0))
        })?,
    )?;

    let call = handler.clone();
    host.set(
        "call",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, message: String| -> rquickjs::Result<String> {
            let bytes = hex::decode(&message).map_err(|e| throw(&ctx, &e.to_string()))?;
            call.call(&bytes)
                .map(hex::encode)
                .map_err(|e| throw(&ctx, &e.0))
        })?,
    )?;

    let print = handler;
    host.set(
        "print",
        Function::new(ctx.clone(), move |text: String| print.print(&text))?,
    )?;

    ctx.globals().set("__host", host)?;
    ctx.eval::<(), _>(PRELUDE)
}

fn throw(ctx: &Ctx<'_>, message: &str) -> rquickjs::Error {
    Exception::throw_message(ctx, message)
}

// Context must drop before its runtime
struct Engine {
    context: Context,
    runtime: Runtime,
}

pub struct QuickJsSandbox {
    engine: Option<Engine>,
    interrupt: InterruptHandle,
}

impl QuickJsSandbox {
    fn engine(&self) -> Result<&Engine, SandboxError> {
        self.engine.as_ref().ok_or(SandboxError::Terminated)
    }

    fn guest_error(&self, reason: String) -> SandboxError {
        if self.interrupt.is_tripped() {
            SandboxError::Interrupted
        } else {
            SandboxError::Guest(reason)
        }
    }

    /// Runs queued promise jobs until the engine is idle.
    fn drain_jobs(&self) -> Result<(), SandboxError> {
        let engine = self.engine()?;
        loop {
            match engine.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(e) => return Err(self.guest_error(format!("pending job failed: {e}"))),
            }
        }
    }
}

impl Sandbox for QuickJsSandbox {
    fn load_module(&mut self, name: &str, source: &str) -> Result<(), SandboxError> {
        let engine = self.engine()?;
        engine
            .context
            .with(|ctx| {
                Module::evaluate(ctx.clone(), name, source)
                    .catch(&ctx)
                    .and_then(|promise| promise.finish::<()>().catch(&ctx))
                    .map_err(|e| e.to_string())
            })
            .map_err(|reason| SandboxError::ModuleLoad {
                module: name.to_string(),
                reason,
            })?;
        self.drain_jobs()
    }

    fn send(&mut self, message: &[u8]) -> Result<(), SandboxError> {
        let engine = self.engine()?;
        let payload = hex::encode(message);
        engine
            .context
            .with(|ctx| {
                let deliver: Function = ctx.globals().get("__deliver").catch(&ctx).map_err(|e| e.to_string())?;
                deliver
                    .call::<_, ()>((payload,))
                    .catch(&ctx)
                    .map_err(|e| e.to_string())
            })
            .map_err(|reason| self.guest_error(reason))?;
        self.drain_jobs()
    }

    fn terminate(&mut self) {
        self.interrupt.trip();
        if self.engine.take().is_some() {
            debug!("QuickJS sandbox terminated");
        }
    }
}
