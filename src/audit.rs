//! Append-only audit trail of reactor failures.
//!
//! The log preserves the original fatal error plus every error encountered
//! during teardown, in order, so operators can decide whether a restart is
//! safe.

use crate::error::Error;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// One recorded failure: the error value and when it was observed.
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub error: Arc<Error>,
    pub timestamp: SystemTime,
}

impl ExceptionEvent {
    fn new(error: Arc<Error>) -> ExceptionEvent {
        ExceptionEvent {
            error,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct AuditLog {
    entries: Mutex<Vec<ExceptionEvent>>,
}

impl AuditLog {
    pub(crate) fn new() -> AuditLog {
        AuditLog::default()
    }

    /// Append an error, returning the shared handle for callers that also
    /// need to propagate it.
    pub(crate) fn append(&self, error: Error) -> Arc<Error> {
        let error = Arc::new(error);
        self.append_shared(Arc::clone(&error));
        error
    }

    pub(crate) fn append_shared(&self, error: Arc<Error>) {
        let mut entries = self.entries.lock().unwrap();
        entries.push(ExceptionEvent::new(error));
    }

    /// Copy-on-read snapshot; later appends do not affect the copy.
    pub(crate) fn snapshot(&self) -> Vec<ExceptionEvent> {
        self.entries.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_isolated_from_later_appends() {
        let log = AuditLog::new();
        log.append(Error::ShutDown);
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 1);

        log.append(Error::Config("bad".into()));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(log.snapshot().len(), 2);
    }

    #[test]
    fn entries_keep_insertion_order() {
        let log = AuditLog::new();
        log.append(Error::ShutDown);
        log.append(Error::Config("second".into()));
        let snapshot = log.snapshot();
        assert!(matches!(*snapshot[0].error, Error::ShutDown));
        assert!(matches!(*snapshot[1].error, Error::Config(_)));
    }
}
