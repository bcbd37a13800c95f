//! Bridge runtime - the receive loop and lifecycle signaling.
//!
//! State machine: `Created → Running → Stopped`.
//!
//! - `run()` flips to Running, dispatches a synthetic `ready` command (id 0)
//!   to itself and emits the Response, so the host always observes a defined
//!   readiness signal before any other message.
//! - The loop then reads one framed input at a time: blank input is skipped,
//!   everything else is decoded, routed through the dispatch table, and
//!   answered - strictly sequentially, one command at a time. The running
//!   flag is re-checked at the top of each iteration, so a shutdown handler
//!   ends the loop at the next boundary, not instantaneously.
//! - Decode failures, unresolvable names and handler errors all degrade to
//!   error Responses. The loop only ends on end-of-input, a failed write,
//!   or the shutdown built-in clearing the running flag.

use std::io::{self, BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::dispatch::{Ctx, DispatchTable, EventSink, Reply};
use crate::error::BackendError;
use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::message::{Command, Event, Response};

impl<W: Write> EventSink for FrameWriter<W> {
    fn emit(&mut self, event: &Event) -> Result<(), FrameError> {
        self.write(&event.encode())
    }
}

/// The capability interface a concrete backend implements.
///
/// A backend is a set of named operations plus backend-owned state. The
/// runtime stays agnostic of command semantics - it routes by name only and
/// requires nothing beyond "named, invokable, JSON-serializable result".
/// The `'static` supertrait is what lets handlers be stored in the
/// dispatch table as boxed closures over the backend type.
pub trait Backend: 'static {
    /// Populate the dispatch table with this backend's operations.
    ///
    /// The runtime registers the `ready` and `shutdown` built-ins before
    /// calling this, so a backend may override either by re-registering the
    /// name. A handler that replaces `shutdown` outright must call
    /// [`Ctx::request_shutdown`] itself.
    fn capabilities(table: &mut DispatchTable<Self>)
    where
        Self: Sized;

    /// Readiness probe, dispatched once automatically when the loop starts.
    /// Override to report extra startup state.
    fn ready(&mut self) -> Result<Value, BackendError> {
        Ok(json!({
            "status": "ready",
            "runtime_version": env!("CARGO_PKG_VERSION"),
        }))
    }

    /// Graceful shutdown hook, run before the receive loop stops. Override
    /// to release resources.
    fn shutdown(&mut self) -> Result<Value, BackendError> {
        Ok(json!({ "status": "shutdown" }))
    }
}

/// The bridge between a host byte stream and a backend's dispatch table.
pub struct Bridge<B: Backend, R: BufRead, W: Write> {
    backend: B,
    table: DispatchTable<B>,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    running: AtomicBool,
}

impl<B: Backend> Bridge<B, BufReader<io::Stdin>, io::Stdout> {
    /// A bridge over the process's standard streams - the deployment shape.
    /// stdout carries the protocol; anything else a backend prints must go
    /// to stderr.
    pub fn stdio(backend: B) -> Self {
        Self::new(backend, BufReader::new(io::stdin()), io::stdout())
    }
}

impl<B: Backend, R: BufRead, W: Write> Bridge<B, R, W> {
    /// Build a bridge over arbitrary streams. The dispatch table is built
    /// here, once: lifecycle built-ins first, then the backend's own
    /// capability set (which may override them).
    pub fn new(backend: B, reader: R, writer: W) -> Self {
        let mut table = DispatchTable::new();
        table.register("ready", |backend: &mut B, _params, _ctx: &mut Ctx<'_>| {
            backend.ready().map(Reply::Value)
        });
        table.register("shutdown", |backend: &mut B, _params, ctx: &mut Ctx<'_>| {
            ctx.request_shutdown();
            backend.shutdown().map(Reply::Value)
        });
        B::capabilities(&mut table);

        Self {
            backend,
            table,
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            running: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Run the receive loop until shutdown or end of input.
    ///
    /// Returns `Ok(())` for every orderly stop; the only errors are I/O
    /// failures on the framed channel itself.
    pub fn run(&mut self) -> Result<(), FrameError> {
        self.running.store(true, Ordering::SeqCst);
        info!("bridge running");

        // Readiness handshake, emitted before any host input is consumed.
        if let Some(response) = self.handle(Command::internal("ready")) {
            self.writer.write(&response.encode())?;
        }

        while self.running.load(Ordering::SeqCst) {
            let line = match self.reader.read()? {
                Some(line) => line,
                None => break,
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = match Command::decode(&line) {
                Ok(command) => self.handle(command),
                Err(err) => {
                    // No id is recoverable from undecodable input; the
                    // protocol reserves 0 for this case.
                    warn!(error = %err, "undecodable input");
                    Some(Response::failure(0, err.to_string()))
                }
            };
            if let Some(response) = response {
                self.writer.write(&response.encode())?;
            }
        }

        info!("bridge stopped");
        Ok(())
    }

    /// Route one decoded command. `None` means the handler suppressed its
    /// Response.
    fn handle(&mut self, command: Command) -> Option<Response> {
        debug!(cmd = %command.name, id = command.id, "dispatch");

        let handler = match self.table.resolve(&command.name) {
            Ok(handler) => handler,
            Err(err) => return Some(Response::failure(command.id, err.to_string())),
        };

        let mut ctx = Ctx::new(&mut self.writer, &self.running);
        let reply = handler(&mut self.backend, command.params, &mut ctx);

        match reply {
            Ok(Reply::Value(value)) => Some(Response::success(command.id, value)),
            Ok(Reply::Deferred(deferred)) => match deferred.wait() {
                Ok(value) => Some(Response::success(command.id, value)),
                Err(err) => Some(failure_response(command.id, &err)),
            },
            Ok(Reply::Suppressed) => None,
            Err(err) => Some(failure_response(command.id, &err)),
        }
    }
}

fn failure_response(id: i64, err: &BackendError) -> Response {
    let response = Response::failure(id, err.message());
    match err.trace() {
        Some(trace) => response.with_traceback(trace),
        None => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Deferred;

    #[derive(Default)]
    struct TestBackend {
        counter: u64,
    }

    impl Backend for TestBackend {
        fn capabilities(table: &mut DispatchTable<Self>) {
            table.register("increment", |b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
                b.counter += 1;
                Ok(Reply::Value(json!({ "count": b.counter })))
            });
            table.register("fail", |_b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
                Err(BackendError::new("boom"))
            });
            table.register("fail_traced", |_b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
                let err = anyhow::anyhow!("socket closed").context("transmit failed");
                Err(err.into())
            });
            table.register("notify", |_b: &mut Self, _p, ctx: &mut Ctx<'_>| {
                ctx.emit_event("progress", json!({ "pct": 100 }))?;
                Ok(Reply::Value(json!({ "notified": true })))
            });
            table.register("quiet", |_b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
                Ok(Reply::Suppressed)
            });
            table.register("defer", |_b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
                let (tx, deferred) = Deferred::channel();
                std::thread::spawn(move || {
                    let _ = tx.send(Ok(json!({ "deferred": true })));
                });
                Ok(Reply::Deferred(deferred))
            });
            table.declare("reserved");
        }
    }

    fn run_bridge(input: &str) -> Vec<Value> {
        let mut out = Vec::new();
        {
            let mut bridge = Bridge::new(TestBackend::default(), input.as_bytes(), &mut out);
            bridge.run().expect("run should succeed");
        }
        parse_frames(&out)
    }

    fn parse_frames(bytes: &[u8]) -> Vec<Value> {
        bytes
            .split(|b| *b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| serde_json::from_slice(chunk).expect("frame is JSON"))
            .collect()
    }

    // TEST140: the readiness Response is the first frame, before any input
    // is consumed
    #[test]
    fn test140_ready_emitted_first() {
        let frames = run_bridge("");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], 0);
        assert_eq!(frames[0]["status"], "success");
        assert_eq!(frames[0]["result"]["status"], "ready");
        assert!(frames[0]["result"]["runtime_version"].is_string());
    }

    // TEST141: responses echo the command id; repeated increments advance
    // backend state sequentially
    #[test]
    fn test141_id_correlation_and_state() {
        let frames = run_bridge(
            "{\"cmd\":\"increment\",\"id\":1,\"params\":{}}\n\
             {\"cmd\":\"increment\",\"id\":2,\"params\":{}}\n",
        );
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1]["id"], 1);
        assert_eq!(frames[1]["result"]["count"], 1);
        assert_eq!(frames[2]["id"], 2);
        assert_eq!(frames[2]["result"]["count"], 2);
    }

    // TEST142: an unknown name short-circuits to an error Response carrying
    // the original id and the offending name
    #[test]
    fn test142_unknown_command() {
        let frames = run_bridge("{\"cmd\":\"nonexistent\",\"id\":9,\"params\":{}}\n");
        assert_eq!(frames[1]["id"], 9);
        assert_eq!(frames[1]["status"], "error");
        assert_eq!(frames[1]["error"], "Unknown command: nonexistent");
    }

    // TEST143: a declared-but-unbound name reports NotInvocable, correlated
    #[test]
    fn test143_vacant_command() {
        let frames = run_bridge("{\"cmd\":\"reserved\",\"id\":4}\n");
        assert_eq!(frames[1]["id"], 4);
        assert_eq!(frames[1]["error"], "Command is not callable: reserved");
    }

    // TEST144: undecodable input answers with id 0 and the loop keeps
    // serving subsequent commands
    #[test]
    fn test144_decode_error_then_recovery() {
        let frames = run_bridge("not-json\n{\"cmd\":\"increment\",\"id\":3}\n");
        assert_eq!(frames[1]["id"], 0);
        assert_eq!(frames[1]["status"], "error");
        assert!(frames[1]["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON:"));
        assert_eq!(frames[2]["id"], 3);
        assert_eq!(frames[2]["result"]["count"], 1);
    }

    // TEST145: a handler failure degrades to an error Response and never
    // terminates the loop; traced failures carry a traceback
    #[test]
    fn test145_handler_failure_recovery() {
        let frames = run_bridge(
            "{\"cmd\":\"fail\",\"id\":5}\n\
             {\"cmd\":\"fail_traced\",\"id\":6}\n\
             {\"cmd\":\"increment\",\"id\":7}\n",
        );
        assert_eq!(frames[1]["id"], 5);
        assert_eq!(frames[1]["error"], "boom");
        assert!(frames[1].get("traceback").is_none());

        assert_eq!(frames[2]["id"], 6);
        assert_eq!(frames[2]["error"], "transmit failed");
        let trace = frames[2]["traceback"].as_str().expect("trace present");
        assert!(trace.contains("socket closed"));

        assert_eq!(frames[3]["result"]["count"], 1);
    }

    // TEST146: an Event emitted mid-handler is written before the Response
    // for the command that triggered it
    #[test]
    fn test146_event_precedes_response() {
        let frames = run_bridge("{\"cmd\":\"notify\",\"id\":8}\n");
        assert_eq!(frames[1]["status"], "event");
        assert_eq!(frames[1]["cmd"], "progress");
        assert_eq!(frames[2]["id"], 8);
        assert_eq!(frames[2]["result"]["notified"], true);
    }

    // TEST147: a deferred reply blocks the loop until resolved, then
    // responds normally
    #[test]
    fn test147_deferred_reply_resolved() {
        let frames = run_bridge("{\"cmd\":\"defer\",\"id\":11}\n");
        assert_eq!(frames[1]["id"], 11);
        assert_eq!(frames[1]["status"], "success");
        assert_eq!(frames[1]["result"]["deferred"], true);
    }

    // TEST148: a suppressed reply writes nothing; the next command still
    // gets its Response
    #[test]
    fn test148_suppressed_reply() {
        let frames = run_bridge(
            "{\"cmd\":\"quiet\",\"id\":12}\n{\"cmd\":\"increment\",\"id\":13}\n",
        );
        assert_eq!(frames.len(), 2, "quiet must produce no frame");
        assert_eq!(frames[1]["id"], 13);
    }

    // TEST149: shutdown answers, then the loop stops at the next iteration
    // boundary - later input is never consumed
    #[test]
    fn test149_shutdown_stops_loop() {
        let frames = run_bridge(
            "{\"cmd\":\"shutdown\",\"id\":2}\n{\"cmd\":\"increment\",\"id\":3}\n",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["id"], 2);
        assert_eq!(frames[1]["result"]["status"], "shutdown");
    }

    // TEST150: blank and whitespace-only lines are skipped without output
    #[test]
    fn test150_blank_lines_skipped() {
        let frames = run_bridge("\n   \n{\"cmd\":\"increment\",\"id\":1}\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["id"], 1);
    }

    // TEST151: ready is idempotent - a host-issued ready returns the same
    // shape under its own id
    #[test]
    fn test151_ready_idempotent() {
        let frames = run_bridge("{\"cmd\":\"ready\",\"id\":7}\n{\"cmd\":\"ready\",\"id\":8}\n");
        for (frame, id) in [(&frames[1], 7), (&frames[2], 8)] {
            assert_eq!(frame["id"], id);
            assert_eq!(frame["result"]["status"], "ready");
            assert!(frame["result"]["runtime_version"].is_string());
        }
    }

    // TEST152: a backend may override the ready built-in through its
    // capability set
    #[test]
    fn test152_ready_overridable() {
        #[derive(Default)]
        struct CustomReady;

        impl Backend for CustomReady {
            fn capabilities(table: &mut DispatchTable<Self>) {
                table.register("ready", |_b: &mut Self, _p, _ctx: &mut Ctx<'_>| {
                    Ok(Reply::Value(json!({ "status": "ready", "warm": true })))
                });
            }
        }

        let mut out = Vec::new();
        {
            let mut bridge = Bridge::new(CustomReady, &b""[..], &mut out);
            bridge.run().expect("run");
        }
        let frames = parse_frames(&out);
        assert_eq!(frames[0]["result"]["warm"], true);
    }

    // TEST153: backend state is reachable through the bridge before and
    // after a run
    #[test]
    fn test153_backend_accessors() {
        let mut out = Vec::new();
        let mut bridge = Bridge::new(
            TestBackend::default(),
            &b"{\"cmd\":\"increment\",\"id\":1}\n"[..],
            &mut out,
        );
        assert_eq!(bridge.backend().counter, 0);
        bridge.run().expect("run");
        assert_eq!(bridge.backend().counter, 1);
        bridge.backend_mut().counter = 9;
        assert_eq!(bridge.backend().counter, 9);
    }
}
