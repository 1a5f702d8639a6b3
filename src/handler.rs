//! Interfaces between the reactor and the protocol layer.

use crate::error::Error;
use crate::session::IoSession;
use std::sync::Mutex;

/// Per-session protocol hooks, invoked on the session's owning worker
/// thread. Callbacks for one session are totally ordered and never run
/// concurrently.
///
/// An `Err` returned from a readiness hook is routed to
/// [`exception`](EventHandler::exception) and the session is closed.
pub trait EventHandler: Send {
    /// The session was registered with its worker and is ready for I/O.
    ///
    /// Note: the configured socket timeout is applied around registration;
    /// do not assume it is already active here.
    fn connected(&mut self, session: &mut IoSession) -> crate::Result<()> {
        let _ = session;
        Ok(())
    }

    /// The channel has data (or end-of-stream) to read.
    fn input_ready(&mut self, session: &mut IoSession) -> crate::Result<()>;

    /// The channel accepts writes again.
    fn output_ready(&mut self, session: &mut IoSession) -> crate::Result<()> {
        let _ = session;
        Ok(())
    }

    /// The session has been idle past its socket timeout. The default closes
    /// the session; implementations may extend instead.
    fn timeout(&mut self, session: &mut IoSession) -> crate::Result<()> {
        session.close();
        Ok(())
    }

    /// A transport error scoped to this session. The session is closed after
    /// this hook returns.
    fn exception(&mut self, session: &mut IoSession, error: &Error) {
        let _ = (session, error);
    }

    /// The session is gone. Delivered exactly once per session.
    fn disconnected(&mut self, session: &mut IoSession) {
        let _ = session;
    }
}

/// Creates the handler attached to each newly registered session. Shared
/// across workers.
pub trait EventHandlerFactory: Send + Sync {
    fn create_handler(&self, session: &mut IoSession) -> crate::Result<Box<dyn EventHandler>>;
}

// Blanket implementation so a plain closure can serve as the factory.
impl<F> EventHandlerFactory for F
where
    F: Fn(&mut IoSession) -> crate::Result<Box<dyn EventHandler>> + Send + Sync,
{
    fn create_handler(&self, session: &mut IoSession) -> crate::Result<Box<dyn EventHandler>> {
        (self)(session)
    }
}

/// Consulted before a loop-machinery error is treated as fatal. Returning
/// `true` keeps the reactor alive; without an installed handler such errors
/// terminate the reactor.
pub trait ExceptionHandler: Send {
    fn handle(&self, error: &Error) -> bool;
}

#[derive(Default)]
pub(crate) struct ExceptionHandlerSlot {
    inner: Mutex<Option<Box<dyn ExceptionHandler>>>,
}

impl ExceptionHandlerSlot {
    pub(crate) fn new() -> ExceptionHandlerSlot {
        ExceptionHandlerSlot::default()
    }

    pub(crate) fn set(&self, handler: Box<dyn ExceptionHandler>) {
        *self.inner.lock().unwrap() = Some(handler);
    }

    pub(crate) fn handle(&self, error: &Error) -> bool {
        match self.inner.lock().unwrap().as_ref() {
            Some(handler) => handler.handle(error),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tolerant;
    impl ExceptionHandler for Tolerant {
        fn handle(&self, error: &Error) -> bool {
            matches!(error, Error::Io(_))
        }
    }

    #[test]
    fn errors_are_fatal_without_a_handler() {
        let slot = ExceptionHandlerSlot::new();
        assert!(!slot.handle(&Error::ShutDown));
    }

    #[test]
    fn installed_handler_decides_survival() {
        let slot = ExceptionHandlerSlot::new();
        slot.set(Box::new(Tolerant));
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "oops"));
        assert!(slot.handle(&io));
        assert!(!slot.handle(&Error::ShutDown));
    }
}
