//! Generates the JavaScript loaded into every sandbox next to the contract:
//!
//! - the capability module (`contract-sdk/v1`): one proxy function per
//!   catalog entry, grouped under `State` / `Address`;
//! - the invocation module: the receiver that runs the requested contract
//!   method and reports exactly one terminal envelope.
//!
//! Names coming from outside (context ids, method names) only ever reach
//! the generated code as JSON string literals.

use crate::capabilities::{CapabilityKind, CapabilitySpec, ExecutionContext};
use crate::codec::{guest, ValueType};

/// Module id contracts import capabilities from.
pub const SDK_MODULE_ID: &str = "contract-sdk/v1";

/// A named module ready to be loaded into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestModule {
    pub name: String,
    pub source: String,
}

/// The three modules of one invocation, in load order.
pub fn modules_for(
    catalog: &[CapabilitySpec],
    context: &ExecutionContext,
    code: &str,
    method: &str,
) -> [GuestModule; 3] {
    let contract_id = contract_module_id(context);
    [
        GuestModule {
            name: guest::MODULE_ID.to_string(),
            source: guest::codec_module(),
        },
        GuestModule {
            name: SDK_MODULE_ID.to_string(),
            source: capability_module(catalog),
        },
        GuestModule {
            source: wrap_contract(code, &contract_id, method),
            name: contract_id,
        },
    ]
}

/// Module id of the contract for one invocation: the context id, hex encoded,
/// so distinct ids never share a module id.
pub fn contract_module_id(context: &ExecutionContext) -> String {
    format!("contract-{}.js", hex::encode(context.id()))
}

fn js_string(text: &str) -> String {
    // JSON strings are valid JS string literals
    serde_json::Value::String(text.to_string()).to_string()
}

fn wrapper_for(ty: ValueType) -> &'static str {
    match ty {
        ValueType::Uint32 => "argUint32",
        ValueType::Uint64 => "argUint64",
        ValueType::String => "argString",
        ValueType::Bytes => "argBytes",
        ValueType::Address => "argAddress",
    }
}

fn default_literal(ty: ValueType) -> &'static str {
    match ty {
        ValueType::Uint32 => "0",
        ValueType::Uint64 => "0n",
        ValueType::String => "\"\"",
        ValueType::Bytes => "new Uint8Array()",
        ValueType::Address => "undefined",
    }
}

fn proxy_function(spec: &CapabilitySpec) -> String {
    let params = spec
        .params
        .iter()
        .map(|p| p.name)
        .collect::<Vec<_>>()
        .join(", ");
    let wrapped = spec
        .params
        .iter()
        .map(|p| format!("{}({})", wrapper_for(p.ty), p.name))
        .collect::<Vec<_>>()
        .join(", ");
    match spec.kind {
        CapabilityKind::Write => format!(
            "    {}: ({params}) => {{\n        __notify({}, {}, [{wrapped}]);\n    }},\n",
            spec.method, spec.group, spec.op
        ),
        CapabilityKind::Read(ty) => format!(
            "    {}: ({params}) => __call({}, {}, [{wrapped}], {}),\n",
            spec.method,
            spec.group,
            spec.op,
            default_literal(ty)
        ),
    }
}

const SDK_PRELUDE: &str = r#"
function __notify(group, op, args) {
    Sandbox.send(encodeEnvelope(group, op, args));
}

function __call(group, op, args, fallback) {
    const reply = decodeEnvelope(Sandbox.call(encodeEnvelope(group, op, args)));
    if (reply.group !== INVOCATION_GROUP) {
        throw new Error("unexpected reply group " + reply.group);
    }
    if (reply.op === OP_ERROR) {
        throw new Error(reply.args.length > 0 ? String(reply.args[0].value) : "capability failed");
    }
    if (reply.op !== OP_VALUE) {
        throw new Error("unsupported reply op " + reply.op);
    }
    return reply.args.length > 0 ? reply.args[0].value : fallback;
}
"#;

/// Capability module: proxies for every catalog entry.
///
/// Writes fire a one-way envelope and return nothing. Reads go through the
/// call-and-wait primitive and return the reply value, the catalog default
/// when the reply is empty, or throw when the reply carries the error op.
pub fn capability_module(catalog: &[CapabilitySpec]) -> String {
    let mut source = format!(
        "import {{ argUint32, argUint64, argString, argBytes, argAddress, encodeEnvelope, \
         decodeEnvelope, INVOCATION_GROUP, OP_VALUE, OP_ERROR }} from {};\n",
        js_string(guest::MODULE_ID)
    );
    source.push_str(SDK_PRELUDE);

    // Group by guest object, keeping catalog order
    let mut objects: Vec<&str> = Vec::new();
    for spec in catalog {
        if !objects.contains(&spec.object) {
            objects.push(spec.object);
        }
    }
    for object in objects {
        source.push_str(&format!("\nexport const {object} = Object.freeze({{\n"));
        for spec in catalog.iter().filter(|s| s.object == object) {
            source.push_str(&proxy_function(spec));
        }
        source.push_str("});\n");
    }
    source
}

/// Invocation module: registers the receiver for the initial envelope.
///
/// The method is looked up as an own export of the contract module and
/// must be a function; anything else fails closed with an error result.
/// Every path, including exceptions from the contract, ends in exactly
/// one terminal `Sandbox.send`.
pub fn invocation_module(contract_id: &str, method: &str) -> String {
    let module = js_string(contract_id);
    let codec = js_string(guest::MODULE_ID);
    let method = js_string(method);
    format!(
        r#"
import * as __contract from {module};
import {{
    argString as __argString,
    decodeEnvelope as __decodeEnvelope,
    encodeEnvelope as __encodeEnvelope,
    toArgument as __toArgument,
    INVOCATION_GROUP as __INVOCATION_GROUP,
    OP_VALUE as __OP_VALUE,
    OP_ERROR as __OP_ERROR,
}} from {codec};

const __METHOD = {method};

function __errorMessage(e) {{
    return e instanceof Error ? e.message : String(e);
}}

Sandbox.recv(function (message) {{
    let result;
    try {{
        const request = __decodeEnvelope(message);
        if (request.group !== __INVOCATION_GROUP || request.op !== __OP_VALUE) {{
            throw new Error("unexpected invocation envelope " + request.group + "/" + request.op);
        }}
        const [name, ...args] = request.args.map((a) => a.value);
        if (name !== __METHOD) {{
            throw new Error("method '" + name + "' does not match loaded method '" + __METHOD + "'");
        }}
        if (!Object.prototype.hasOwnProperty.call(__contract, __METHOD)
            || typeof __contract[__METHOD] !== "function") {{
            throw new Error("method '" + __METHOD + "' not found in contract");
        }}
        const value = __contract[__METHOD](...args);
        result = value === undefined
            ? __encodeEnvelope(__INVOCATION_GROUP, __OP_VALUE, [])
            : __encodeEnvelope(__INVOCATION_GROUP, __OP_VALUE, [__toArgument(value)]);
    }} catch (e) {{
        Sandbox.print("contract error: " + __errorMessage(e));
        result = __encodeEnvelope(__INVOCATION_GROUP, __OP_ERROR, [__argString(__errorMessage(e))]);
    }}
    Sandbox.send(result);
}});
"#
    )
}

/// Contract source followed by the invocation module, loaded as one module
/// under `contract_id`.
pub fn wrap_contract(code: &str, contract_id: &str, method: &str) -> String {
    format!("{code}\n{}", invocation_module(contract_id, method))
}
