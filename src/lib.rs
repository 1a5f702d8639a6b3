//! A multi-worker non-blocking I/O reactor.
//!
//! The crate provides the event-dispatch engine that sits beneath
//! higher-level protocol code: a main selector that feeds newly connected
//! channels to a fixed pool of worker threads, each running its own
//! select-dispatch-timeout loop. Protocol code is plugged in through the
//! [`EventHandler`] / [`EventHandlerFactory`] interfaces; the reactor
//! carries bytes for handlers, it never interprets them.

pub mod audit;
pub mod config;
pub mod connector;
pub mod error;
pub mod handler;
pub mod listener;
pub mod reactor;
pub mod request;
mod selector;
pub mod session;
pub mod status;
pub mod worker;

// Re-exported so callers can name `Interest`, `Token`, and the `net` types
// without adding the dependency themselves.
pub use mio;

pub use audit::ExceptionEvent;
pub use config::ReactorConfig;
pub use connector::{ConnectHooks, Connector};
pub use error::Error;
pub use handler::{EventHandler, EventHandlerFactory, ExceptionHandler};
pub use listener::AcceptHooks;
pub use reactor::{
    IoReactor, NullHooks, OsThreadSpawner, ReactorHandle, ReactorHooks, ThreadSpawner,
};
pub use request::{Outcome, SessionRequest, SessionRequestCallback};
pub use session::{IoSession, PendingSession, SessionId, SessionStatus, ATTACHMENT_KEY};
pub use status::ReactorStatus;
pub use worker::{Worker, WorkerHandle};

pub type Result<T> = std::result::Result<T, Error>;
