use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use contract_broker::capabilities::{MemoryStateStore, StaticIdentity};
use contract_broker::config::Config;
use contract_broker::sandbox::quickjs::QuickJsFactory;
use contract_broker::{ExecutionContext, Host, MethodCall, Outcome, TypedValue, Worker};

fn print_help() {
    println!(
        "\
contract-broker v{}

Runs one contract method in a fresh QuickJS sandbox.

USAGE:
    contract-broker [OPTIONS] <CONTRACT> <METHOD> [ARG...]

ARGUMENTS:
    CONTRACT    Path to the contract module (JavaScript)
    METHOD      Exported function to call
    ARG         Typed argument: u32:7, u64:9, str:hello, bytes:0a0b, addr:<40 hex>

OPTIONS:
    -c, --config <PATH>    TOML configuration file [default: config/broker.toml if present]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, contract_broker=debug,contract_broker::guest=debug)

EXAMPLES:
    contract-broker demos/token.js transfer u32:7
    contract-broker -c broker.toml demos/token.js getBalance
    RUST_LOG=debug contract-broker demos/token.js boom",
        env!("CARGO_PKG_VERSION"),
    );
}

const DEFAULT_CONFIG: &str = "config/broker.toml";

struct Args {
    config: Option<String>,
    contract: String,
    method: String,
    values: Vec<TypedValue>,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("contract-broker v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config = Some(args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?);
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let (Some(contract), Some(method)) = (positional.next(), positional.next()) else {
        print_help();
        bail!("missing CONTRACT and METHOD");
    };
    let values = positional
        .map(|raw| raw.parse::<TypedValue>().map_err(|e| anyhow!("argument '{raw}': {e}")))
        .collect::<Result<Vec<_>>>()?;

    Ok(Args {
        config,
        contract,
        method,
        values,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("contract_broker=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path)?
        }
        None if Path::new(DEFAULT_CONFIG).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG}");
            Config::load(DEFAULT_CONFIG)?
        }
        None => Config::default(),
    };

    let store = Arc::new(match &config.state.snapshot {
        Some(path) => MemoryStateStore::load(path)?,
        None => MemoryStateStore::new(),
    });
    let identity = StaticIdentity::new(
        config.identity.signer_address()?,
        config.identity.caller_address()?,
    );
    let factory = QuickJsFactory::new(
        config.engine.memory_limit_bytes,
        config.engine.max_stack_size_bytes,
    );

    let mut worker = Worker::new(Arc::new(factory), Host::new(store.clone(), Arc::new(identity)));
    if let Some(deadline) = config.broker.deadline() {
        worker = worker.with_deadline(deadline);
    }

    let code = std::fs::read_to_string(&args.contract)
        .with_context(|| format!("reading contract {}", args.contract))?;
    let call = MethodCall::new(args.method, args.values)?;
    let context = ExecutionContext::generate(config.broker.permission_scope);
    info!(
        "Invoking {}.{} as {} (scope: {}, engine: {})",
        args.contract,
        call.method(),
        context.id(),
        context.scope(),
        worker.engine()
    );

    let outcome = match worker.process_method_call(&context, &code, call).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Invocation failed: {e}");
            return Err(e.into());
        }
    };

    if let Some(path) = &config.state.snapshot {
        store.save(path)?;
    }

    println!("{outcome}");
    if let Outcome::Error(message) = outcome {
        bail!("contract raised: {message}");
    }
    Ok(())
}
