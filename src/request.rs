//! One-shot handle for an outbound connect attempt.
//!
//! A [`SessionRequest`] is created by the connector layer and travels with
//! its channel into the reactor, which is responsible for exactly one
//! `completed` / `failed` / `cancelled` signal. Once settled, the outcome is
//! immutable.

use crate::error::Error;
use crate::session::SessionId;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Resolution of a [`SessionRequest`].
#[derive(Debug, Clone)]
pub enum Outcome {
    Pending,
    Completed(SessionId),
    Failed(Arc<Error>),
    Cancelled,
}

impl Outcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }
}

/// Completion hooks fired when a request settles, on the settling thread.
pub trait SessionRequestCallback: Send + Sync {
    fn completed(&self, request: &SessionRequest) {
        let _ = request;
    }

    fn failed(&self, request: &SessionRequest) {
        let _ = request;
    }

    fn cancelled(&self, request: &SessionRequest) {
        let _ = request;
    }
}

pub struct SessionRequest {
    endpoint: SocketAddr,
    attachment: Mutex<Option<Box<dyn Any + Send>>>,
    state: Mutex<Outcome>,
    cond: Condvar,
    callback: Option<Box<dyn SessionRequestCallback>>,
}

impl SessionRequest {
    pub fn new(endpoint: SocketAddr) -> Arc<SessionRequest> {
        SessionRequest::build(endpoint, None, None)
    }

    pub fn with_attachment(
        endpoint: SocketAddr,
        attachment: Box<dyn Any + Send>,
    ) -> Arc<SessionRequest> {
        SessionRequest::build(endpoint, Some(attachment), None)
    }

    pub fn with_callback(
        endpoint: SocketAddr,
        attachment: Option<Box<dyn Any + Send>>,
        callback: Box<dyn SessionRequestCallback>,
    ) -> Arc<SessionRequest> {
        SessionRequest::build(endpoint, attachment, Some(callback))
    }

    fn build(
        endpoint: SocketAddr,
        attachment: Option<Box<dyn Any + Send>>,
        callback: Option<Box<dyn SessionRequestCallback>>,
    ) -> Arc<SessionRequest> {
        Arc::new(SessionRequest {
            endpoint,
            attachment: Mutex::new(attachment),
            state: Mutex::new(Outcome::Pending),
            cond: Condvar::new(),
            callback,
        })
    }

    /// The remote endpoint this request targets.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn outcome(&self) -> Outcome {
        self.state.lock().unwrap().clone()
    }

    pub fn is_settled(&self) -> bool {
        !self.outcome().is_pending()
    }

    /// Cancel the request. Returns `false` if it had already settled.
    pub fn cancel(&self) -> bool {
        if self.settle(Outcome::Cancelled) {
            if let Some(callback) = &self.callback {
                callback.cancelled(self);
            }
            return true;
        }
        false
    }

    /// Block until the request settles, or until `timeout` elapses. A zero
    /// timeout waits forever. Returns the outcome snapshot either way.
    pub fn await_outcome(&self, timeout: Duration) -> Outcome {
        let mut state = self.state.lock().unwrap();
        if timeout.is_zero() {
            while state.is_pending() {
                state = self.cond.wait(state).unwrap();
            }
            return state.clone();
        }
        let deadline = Instant::now() + timeout;
        while state.is_pending() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
        state.clone()
    }

    pub(crate) fn complete(&self, session: SessionId) {
        if self.settle(Outcome::Completed(session)) {
            if let Some(callback) = &self.callback {
                callback.completed(self);
            }
        }
    }

    pub(crate) fn fail(&self, error: Error) -> Arc<Error> {
        let error = Arc::new(error);
        if self.settle(Outcome::Failed(Arc::clone(&error))) {
            if let Some(callback) = &self.callback {
                callback.failed(self);
            }
        }
        error
    }

    /// Transition out of `Pending` exactly once.
    fn settle(&self, outcome: Outcome) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.is_pending() {
            return false;
        }
        *state = outcome;
        drop(state);
        self.cond.notify_all();
        true
    }

    /// Move the attachment out, for propagation into the session's
    /// attribute map.
    pub(crate) fn take_attachment(&self) -> Option<Box<dyn Any + Send>> {
        self.attachment.lock().unwrap().take()
    }
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("endpoint", &self.endpoint)
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn endpoint() -> SocketAddr {
        "127.0.0.1:80".parse().unwrap()
    }

    #[test]
    fn outcome_transitions_are_one_shot() {
        let request = SessionRequest::new(endpoint());
        request.complete(SessionId {
            worker: 0,
            token: 7,
        });
        assert!(matches!(request.outcome(), Outcome::Completed(_)));

        // later signals are ignored
        request.fail(Error::ShutDown);
        assert!(!request.cancel());
        assert!(matches!(request.outcome(), Outcome::Completed(_)));
    }

    #[test]
    fn await_outcome_wakes_on_settle() {
        let request = SessionRequest::new(endpoint());
        let waiter = {
            let request = Arc::clone(&request);
            thread::spawn(move || request.await_outcome(Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(10));
        request.fail(Error::ShutDown);
        assert!(matches!(waiter.join().unwrap(), Outcome::Failed(_)));
    }

    #[test]
    fn await_outcome_times_out_while_pending() {
        let request = SessionRequest::new(endpoint());
        let outcome = request.await_outcome(Duration::from_millis(20));
        assert!(outcome.is_pending());
    }

    #[test]
    fn callback_fires_exactly_once() {
        struct Counting(Arc<AtomicUsize>);
        impl SessionRequestCallback for Counting {
            fn cancelled(&self, _request: &SessionRequest) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let request =
            SessionRequest::with_callback(endpoint(), None, Box::new(Counting(Arc::clone(&count))));
        assert!(request.cancel());
        assert!(!request.cancel());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attachment_is_taken_once() {
        let request = SessionRequest::with_attachment(endpoint(), Box::new("ctx".to_string()));
        let attachment = request.take_attachment().unwrap();
        assert_eq!(attachment.downcast_ref::<String>().unwrap(), "ctx");
        assert!(request.take_attachment().is_none());
    }
}
