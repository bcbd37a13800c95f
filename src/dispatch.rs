//! Dispatch table - command name to typed handler.
//!
//! Replaces lookup-by-reflection with an explicit mapping built once at
//! backend construction and immutable for the process lifetime. An entry is
//! either a bound handler or a vacant declaration (a capability name
//! reserved without a function behind it); resolving a vacant entry is the
//! typed equivalent of finding a non-callable attribute.
//!
//! Handlers never see the wire protocol. They receive the backend, the
//! decoded parameters, and a [`Ctx`] handle for event emission and shutdown
//! requests, and they answer with a [`Reply`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use tracing::trace;

use crate::error::BackendError;
use crate::frame::FrameError;
use crate::message::{Event, Params};

/// Resolution failures. Both degrade to an error Response carrying the
/// offending name; neither reaches a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No entry for the command name.
    #[error("Unknown command: {0}")]
    Unknown(String),

    /// The name is declared but has no bound handler.
    #[error("Command is not callable: {0}")]
    NotInvocable(String),
}

/// What a handler produced.
pub enum Reply {
    /// An immediate value; becomes a success Response.
    Value(Value),

    /// A result still being produced elsewhere. The runtime blocks on it
    /// before the Response is written - the bridge supports at most one
    /// in-flight completion at a time.
    Deferred(Deferred),

    /// The handler took care of any output itself; no Response is written.
    Suppressed,
}

/// The receiving half of a deferred handler result.
///
/// A backend that runs work on its own threads hands the sender to the
/// worker and returns `Reply::Deferred`; the runtime resolves it with a
/// blocking [`wait`](Deferred::wait) before responding.
pub struct Deferred {
    rx: Receiver<Result<Value, BackendError>>,
}

impl Deferred {
    /// Create a deferred slot and the sender that completes it.
    pub fn channel() -> (Sender<Result<Value, BackendError>>, Deferred) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (tx, Deferred { rx })
    }

    /// Block until the worker completes the result. A dropped sender is a
    /// handler failure, not a hang.
    pub fn wait(self) -> Result<Value, BackendError> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(BackendError::new("Deferred result abandoned by worker")))
    }
}

/// Object-safe outbound sink the runtime threads through [`Ctx`].
///
/// The runtime's frame writer is the production impl; tests substitute
/// their own to observe or discard emitted events.
pub trait EventSink {
    fn emit(&mut self, event: &Event) -> Result<(), FrameError>;
}

/// An [`EventSink`] that drops every event. Useful when invoking handlers
/// outside a running bridge, e.g. in backend unit tests.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: &Event) -> Result<(), FrameError> {
        Ok(())
    }
}

/// Per-invocation handle to the outbound channel and the runtime's control
/// state.
///
/// Events emitted here are written immediately, ahead of the Response for
/// the command being handled - that Response is only built after the
/// handler returns.
pub struct Ctx<'a> {
    sink: &'a mut dyn EventSink,
    running: &'a AtomicBool,
}

impl<'a> Ctx<'a> {
    pub fn new(sink: &'a mut dyn EventSink, running: &'a AtomicBool) -> Self {
        Self { sink, running }
    }

    /// Push an unsolicited Event to the host now.
    pub fn emit_event(&mut self, name: &str, payload: Value) -> Result<(), BackendError> {
        trace!(event = name, "emit");
        self.sink
            .emit(&Event::new(name, payload))
            .map_err(|e| BackendError::new(format!("Event write failed: {e}")))
    }

    /// Ask the receive loop to stop at its next iteration boundary. The
    /// current handler still runs to completion and its Response is still
    /// written.
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// A bound handler: backend, decoded parameters, invocation context.
pub type HandlerFn<B> =
    Box<dyn Fn(&mut B, Params, &mut Ctx<'_>) -> Result<Reply, BackendError>>;

enum Entry<B> {
    Handler(HandlerFn<B>),
    Vacant,
}

/// The name → handler mapping used to route Commands to backend `B`.
pub struct DispatchTable<B> {
    entries: HashMap<String, Entry<B>>,
}

impl<B> std::fmt::Debug for DispatchTable<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("entry_count", &self.entries.len())
            .finish()
    }
}

impl<B> Default for DispatchTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> DispatchTable<B> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Bind a handler to a command name. Re-registering a name replaces the
    /// previous entry, which is how backends override built-ins.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&mut B, Params, &mut Ctx<'_>) -> Result<Reply, BackendError> + 'static,
    {
        self.entries
            .insert(name.to_string(), Entry::Handler(Box::new(handler)));
    }

    /// Reserve a capability name without binding a function. Resolving it
    /// yields [`DispatchError::NotInvocable`]. A later `register` fills the
    /// slot; `declare` never displaces a bound handler.
    pub fn declare(&mut self, name: &str) {
        self.entries
            .entry(name.to_string())
            .or_insert(Entry::Vacant);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Declared command names, sorted for stable listings.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Look up the handler for a command name.
    pub fn resolve(&self, name: &str) -> Result<&HandlerFn<B>, DispatchError> {
        match self.entries.get(name) {
            Some(Entry::Handler(handler)) => Ok(handler),
            Some(Entry::Vacant) => Err(DispatchError::NotInvocable(name.to_string())),
            None => Err(DispatchError::Unknown(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counter {
        count: u64,
    }

    struct VecSink {
        frames: Vec<String>,
    }

    impl EventSink for VecSink {
        fn emit(&mut self, event: &Event) -> Result<(), FrameError> {
            self.frames.push(event.encode());
            Ok(())
        }
    }

    fn increment(
        backend: &mut Counter,
        _params: Params,
        _ctx: &mut Ctx<'_>,
    ) -> Result<Reply, BackendError> {
        backend.count += 1;
        Ok(Reply::Value(json!({ "count": backend.count })))
    }

    // TEST130: an unknown name resolves to Unknown carrying the name
    #[test]
    fn test130_resolve_unknown() {
        let table: DispatchTable<Counter> = DispatchTable::new();
        let err = table.resolve("nonexistent").err().expect("must not resolve");
        assert_eq!(err.to_string(), "Unknown command: nonexistent");
    }

    // TEST131: a declared-but-unbound name resolves to NotInvocable
    #[test]
    fn test131_resolve_vacant() {
        let mut table: DispatchTable<Counter> = DispatchTable::new();
        table.declare("planned_op");
        let err = table.resolve("planned_op").err().expect("vacant entry");
        assert_eq!(err.to_string(), "Command is not callable: planned_op");
    }

    // TEST132: a bound handler resolves and mutates backend state when
    // invoked
    #[test]
    fn test132_register_and_invoke() {
        let mut table = DispatchTable::new();
        table.register("increment", increment);

        let mut backend = Counter { count: 0 };
        let running = AtomicBool::new(true);
        let mut sink = VecSink { frames: Vec::new() };
        let mut ctx = Ctx::new(&mut sink, &running);

        let handler = table.resolve("increment").expect("bound");
        let reply = handler(&mut backend, Params::default(), &mut ctx).expect("invoke");
        assert!(matches!(reply, Reply::Value(v) if v["count"] == 1));
        assert_eq!(backend.count, 1);
    }

    // TEST133: re-registering replaces the entry (backends override
    // built-ins this way), and declare never displaces a bound handler
    #[test]
    fn test133_register_overrides_declare_does_not() {
        let mut table: DispatchTable<Counter> = DispatchTable::new();
        table.register("op", |_, _, _: &mut Ctx<'_>| Ok(Reply::Value(json!(1))));
        table.register("op", |_, _, _: &mut Ctx<'_>| Ok(Reply::Value(json!(2))));
        table.declare("op");

        let mut backend = Counter { count: 0 };
        let running = AtomicBool::new(true);
        let mut sink = VecSink { frames: Vec::new() };
        let mut ctx = Ctx::new(&mut sink, &running);
        let handler = table.resolve("op").expect("still bound after declare");
        let reply = handler(&mut backend, Params::default(), &mut ctx).unwrap();
        assert!(matches!(reply, Reply::Value(v) if v == json!(2)));
    }

    // TEST134: a deferred result resolves to the worker's value
    #[test]
    fn test134_deferred_wait() {
        let (tx, deferred) = Deferred::channel();
        let worker = std::thread::spawn(move || {
            tx.send(Ok(json!({ "status": "delivered" }))).unwrap();
        });
        let value = deferred.wait().expect("worker completed");
        assert_eq!(value["status"], "delivered");
        worker.join().unwrap();
    }

    // TEST135: a worker dropping the sender surfaces as a handler failure
    #[test]
    fn test135_deferred_abandoned() {
        let (tx, deferred) = Deferred::channel();
        drop(tx);
        let err = deferred.wait().expect_err("abandoned");
        assert_eq!(err.message(), "Deferred result abandoned by worker");
    }

    // TEST136: request_shutdown clears the shared running flag
    #[test]
    fn test136_ctx_shutdown_request() {
        let running = AtomicBool::new(true);
        let mut sink = VecSink { frames: Vec::new() };
        let ctx = Ctx::new(&mut sink, &running);
        assert!(ctx.is_running());
        ctx.request_shutdown();
        assert!(!running.load(Ordering::SeqCst));
    }

    // TEST137: emit_event writes through the sink immediately
    #[test]
    fn test137_ctx_emit_event() {
        let running = AtomicBool::new(true);
        let mut sink = VecSink { frames: Vec::new() };
        let mut ctx = Ctx::new(&mut sink, &running);
        ctx.emit_event("progress", json!({"pct": 50})).expect("emit");
        assert_eq!(sink.frames.len(), 1);
        assert!(sink.frames[0].contains(r#""status":"event""#));
    }
}
