//! Reactor lifecycle state machine.
//!
//! Every reactor (the multi-worker coordinator and each worker) carries a
//! [`ReactorStatus`] that only ever moves forward:
//!
//! `Inactive → Active → ShutdownRequest → ShuttingDown → ShutDown`
//!
//! External callers transition the status and wake the selector; the owning
//! loop observes the new value on its next tick and runs the matching
//! shutdown branch. Waiters block until the owning thread has finished its
//! terminal teardown, not merely until the status word reads `ShutDown`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle phase of a reactor. Totally ordered and monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReactorStatus {
    Inactive = 0,
    Active = 1,
    ShutdownRequest = 2,
    ShuttingDown = 3,
    ShutDown = 4,
}

impl ReactorStatus {
    fn from_u8(value: u8) -> ReactorStatus {
        match value {
            0 => ReactorStatus::Inactive,
            1 => ReactorStatus::Active,
            2 => ReactorStatus::ShutdownRequest,
            3 => ReactorStatus::ShuttingDown,
            _ => ReactorStatus::ShutDown,
        }
    }
}

impl fmt::Display for ReactorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReactorStatus::Inactive => "inactive",
            ReactorStatus::Active => "active",
            ReactorStatus::ShutdownRequest => "shutdown requested",
            ReactorStatus::ShuttingDown => "shutting down",
            ReactorStatus::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

/// Shared status cell: an atomic for lock-free snapshot reads (which may lag
/// a transition by one select tick) plus a mutex/condvar pair for waiters.
#[derive(Debug)]
pub(crate) struct StatusCell {
    state: AtomicU8,
    terminated: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StatusCell {
    pub(crate) fn new() -> StatusCell {
        StatusCell {
            state: AtomicU8::new(ReactorStatus::Inactive as u8),
            terminated: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Snapshot read without taking the lock.
    pub(crate) fn get(&self) -> ReactorStatus {
        ReactorStatus::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Forward-only transition. Returns `true` if the status changed.
    pub(crate) fn advance(&self, to: ReactorStatus) -> bool {
        let _guard = self.lock.lock().unwrap();
        if to <= self.get() {
            return false;
        }
        self.state.store(to as u8, Ordering::Release);
        self.cond.notify_all();
        true
    }

    /// Transition to `to` only when the current status is exactly `from`.
    pub(crate) fn advance_from(&self, from: ReactorStatus, to: ReactorStatus) -> bool {
        let _guard = self.lock.lock().unwrap();
        if self.get() != from || to <= from {
            return false;
        }
        self.state.store(to as u8, Ordering::Release);
        self.cond.notify_all();
        true
    }

    /// Mark the terminal teardown complete and wake all waiters. Implies
    /// `ShutDown`.
    pub(crate) fn terminate(&self) {
        let _guard = self.lock.lock().unwrap();
        self.state
            .store(ReactorStatus::ShutDown as u8, Ordering::Release);
        self.terminated.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Block until the owning thread has finished shutting down, or until
    /// `timeout` elapses. A zero timeout waits forever. Returns `true` once
    /// the reactor has terminated.
    pub(crate) fn await_shutdown(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock().unwrap();
        if timeout.is_zero() {
            while !self.terminated.load(Ordering::Acquire) {
                guard = self.cond.wait(guard).unwrap();
            }
            return true;
        }
        let deadline = Instant::now() + timeout;
        while !self.terminated.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = next;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn status_ordering_is_total() {
        assert!(ReactorStatus::Inactive < ReactorStatus::Active);
        assert!(ReactorStatus::Active < ReactorStatus::ShutdownRequest);
        assert!(ReactorStatus::ShutdownRequest < ReactorStatus::ShuttingDown);
        assert!(ReactorStatus::ShuttingDown < ReactorStatus::ShutDown);
    }

    #[test]
    fn transitions_only_move_forward() {
        let cell = StatusCell::new();
        assert!(cell.advance(ReactorStatus::Active));
        assert!(cell.advance(ReactorStatus::ShuttingDown));
        // going backwards is refused
        assert!(!cell.advance(ReactorStatus::Active));
        assert_eq!(cell.get(), ReactorStatus::ShuttingDown);
        // repeating the current status is a no-op
        assert!(!cell.advance(ReactorStatus::ShuttingDown));
    }

    #[test]
    fn advance_from_requires_exact_state() {
        let cell = StatusCell::new();
        assert!(!cell.advance_from(ReactorStatus::Active, ReactorStatus::ShutdownRequest));
        assert!(cell.advance_from(ReactorStatus::Inactive, ReactorStatus::Active));
        assert!(cell.advance_from(ReactorStatus::Active, ReactorStatus::ShutDown));
        assert_eq!(cell.get(), ReactorStatus::ShutDown);
    }

    #[test]
    fn await_shutdown_times_out_until_terminated() {
        let cell = Arc::new(StatusCell::new());
        assert!(!cell.await_shutdown(Duration::from_millis(20)));

        let waiter = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.await_shutdown(Duration::ZERO))
        };
        cell.terminate();
        assert!(waiter.join().unwrap());
        assert_eq!(cell.get(), ReactorStatus::ShutDown);
        // already terminated: returns immediately
        assert!(cell.await_shutdown(Duration::from_millis(1)));
    }
}
