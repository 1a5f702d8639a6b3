use crate::status::ReactorStatus;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the reactor.
///
/// Only reactor-fatal conditions propagate out of `execute`; errors scoped to
/// a single session are delivered to that session's
/// [`exception`](crate::EventHandler::exception) hook instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("event handler error: {0}")]
    Handler(String),
    #[error("reactor is in an invalid state: {0}")]
    InvalidState(ReactorStatus),
    #[error("reactor has been shut down")]
    ShutDown,
    /// Unrecoverable failure in the reactor's own select loop. The cause is
    /// also recorded in the audit log.
    #[error("i/o reactor failure: {source}")]
    Reactor {
        #[source]
        source: Arc<Error>,
    },
    /// A worker thread died abnormally; fatal to the whole reactor.
    #[error("worker thread `{name}` terminated abnormally: {source}")]
    Worker {
        name: String,
        #[source]
        source: Arc<Error>,
    },
    #[error("worker thread `{name}` panicked: {message}")]
    Panic { name: String, message: String },
    #[error("worker thread `{name}` did not stop within the grace period")]
    Stalled { name: String },
}
