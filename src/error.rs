//! Backend-raised errors and their wire rendering.
//!
//! Four failure classes cross the dispatch path: undecodable input
//! ([`DecodeError`](crate::message::DecodeError)), unknown or vacant command
//! names ([`DispatchError`](crate::dispatch::DispatchError)), and handler
//! failures ([`BackendError`]). All of them degrade to an error Response on
//! the wire; none terminates the receive loop. The only fatal conditions
//! are stream closure and a failed write, surfaced as
//! [`FrameError`](crate::frame::FrameError).

/// A domain failure raised by a backend operation.
///
/// Carries the human-readable message that lands in the Response `error`
/// field and an optional diagnostic trace for the `traceback` field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
    trace: Option<String>,
}

impl BackendError {
    /// A failure with a bare message and no trace.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    /// A failure with an explicit diagnostic trace.
    pub fn with_trace(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: Some(trace.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}

impl From<anyhow::Error> for BackendError {
    /// Renders the full error chain into the trace so a `?` on any
    /// `anyhow`-compatible failure still produces a useful `traceback`.
    fn from(err: anyhow::Error) -> Self {
        let trace = err
            .chain()
            .enumerate()
            .map(|(depth, cause)| format!("{depth}: {cause}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            message: err.to_string(),
            trace: Some(trace),
        }
    }
}
