//! Host bridge runtime - command dispatch for child-process backends.
//!
//! A backend process receives JSON commands from its parent host on stdin
//! (one per line), routes each to a named handler, and writes correlated
//! responses - plus any unsolicited events - back on stdout, each frame
//! terminated by a NUL sentinel. The runtime owns framing, decoding,
//! dispatch, error degradation, and the ready/shutdown lifecycle; the
//! backend owns all domain behavior and state.
//!
//! ```ignore
//! use hostbridge::{Backend, Bridge, Ctx, DispatchTable, Reply};
//!
//! struct MyBackend { count: u64 }
//!
//! impl Backend for MyBackend {
//!     fn capabilities(table: &mut DispatchTable<Self>) {
//!         table.register("increment", |b: &mut Self, _params, _ctx: &mut Ctx<'_>| {
//!             b.count += 1;
//!             Ok(Reply::Value(serde_json::json!({ "count": b.count })))
//!         });
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     Bridge::stdio(MyBackend { count: 0 }).run()?;
//!     Ok(())
//! }
//! ```
//!
//! Execution is strictly sequential: one receive loop, one in-flight
//! command, responses in request order. Backends needing overlap run their
//! own workers and either block the handler (see
//! [`Reply::Deferred`](dispatch::Reply)) or push results later as events.

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod message;
pub mod runtime;

pub use dispatch::*;
pub use error::*;
pub use frame::*;
pub use message::*;
pub use runtime::*;
