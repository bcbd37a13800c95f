//! echo-backend - example backend exercising the full bridge contract.
//!
//! Keeps a counter and a message log, echoes payloads, and does small
//! arithmetic - enough surface to drive every runtime path (success,
//! domain errors, parameter validation) from a host or an integration
//! test. All state is backend-owned; the runtime never touches it.

use anyhow::Result;
use clap::Parser;
use hostbridge::{Backend, BackendError, Bridge, Ctx, DispatchTable, Params, Reply};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "echo-backend")]
#[command(about = "Echo backend for the host bridge")]
struct Args {
    /// Enable debug logging (stderr; stdout carries the protocol)
    #[arg(short, long)]
    debug: bool,
}

#[derive(Default)]
struct EchoBackend {
    counter: u64,
    messages: Vec<String>,
}

#[derive(Deserialize)]
struct CalculateParams {
    operation: String,
    a: f64,
    b: f64,
}

impl EchoBackend {
    fn echo(&mut self, params: Params) -> Result<Value, BackendError> {
        let data = params.get::<Value>("data")?.unwrap_or(Value::Null);
        Ok(json!({ "echo": data, "timestamp": unix_time() }))
    }

    fn increment(&mut self) -> Result<Value, BackendError> {
        self.counter += 1;
        Ok(json!({ "count": self.counter }))
    }

    fn get_count(&self) -> Result<Value, BackendError> {
        Ok(json!({ "count": self.counter }))
    }

    fn add_message(&mut self, params: Params) -> Result<Value, BackendError> {
        let message: String = params.require("message")?;
        self.messages.push(message);
        Ok(json!({ "count": self.messages.len() }))
    }

    fn get_messages(&self) -> Result<Value, BackendError> {
        Ok(json!({ "messages": self.messages }))
    }

    fn calculate(&self, params: Params) -> Result<Value, BackendError> {
        let CalculateParams { operation, a, b } = params.parse()?;
        let result = match operation.as_str() {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return Err(BackendError::new("Division by zero"));
                }
                a / b
            }
            other => {
                return Err(BackendError::new(format!("Unknown operation: {other}")));
            }
        };
        Ok(json!({
            "operation": operation,
            "a": a,
            "b": b,
            "result": result,
        }))
    }

    fn ping(&self) -> Result<Value, BackendError> {
        Ok(json!({ "pong": true, "timestamp": unix_time() }))
    }
}

impl Backend for EchoBackend {
    fn capabilities(table: &mut DispatchTable<Self>) {
        table.register("echo", |b: &mut Self, p, _ctx: &mut Ctx<'_>| {
            b.echo(p).map(Reply::Value)
        });
        table.register("increment", |b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
            b.increment().map(Reply::Value)
        });
        table.register("get_count", |b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
            b.get_count().map(Reply::Value)
        });
        table.register("add_message", |b: &mut Self, p, _ctx: &mut Ctx<'_>| {
            b.add_message(p).map(Reply::Value)
        });
        table.register("get_messages", |b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
            b.get_messages().map(Reply::Value)
        });
        table.register("calculate", |b: &mut Self, p, _ctx: &mut Ctx<'_>| {
            b.calculate(p).map(Reply::Value)
        });
        table.register("ping", |b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
            b.ping().map(Reply::Value)
        });
    }
}

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("starting echo backend");
    Bridge::stdio(EchoBackend::default()).run()?;
    Ok(())
}
