//! Thin wrapper around the OS readiness primitive.

use mio::{Events, Poll, Registry, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the wakeup channel. Session tokens are slab keys and
/// never reach this value.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

pub(crate) const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug)]
pub(crate) struct Selector {
    poll: Poll,
    waker: Arc<Waker>,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Selector { poll, waker })
    }

    /// Wait for readiness, bounded by `timeout`. Returns the number of ready
    /// events; a wakeup or an interrupted wait yields an empty tick.
    pub(crate) fn select(&mut self, events: &mut Events, timeout: Duration) -> io::Result<usize> {
        match self.poll.poll(events, Some(timeout)) {
            Ok(()) => Ok(events.iter().count()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Shared wakeup handle; waking makes a blocked `select` return promptly.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wakeup_interrupts_a_long_select() {
        let mut selector = Selector::new().unwrap();
        let waker = selector.waker();
        let mut events = Events::with_capacity(8);

        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let start = Instant::now();
        selector
            .select(&mut events, Duration::from_secs(5))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(events.iter().any(|event| event.token() == WAKER_TOKEN));
        trigger.join().unwrap();
    }

    #[test]
    fn select_times_out_with_no_sources() {
        let mut selector = Selector::new().unwrap();
        let mut events = Events::with_capacity(8);
        let ready = selector
            .select(&mut events, Duration::from_millis(10))
            .unwrap();
        assert_eq!(ready, 0);
    }
}
