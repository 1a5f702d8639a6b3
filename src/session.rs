//! Per-connection session state.
//!
//! An [`IoSession`] is created by its owning worker when a pending channel
//! is drained from the hand-off queue, lives in that worker's session slab
//! (its [`Token`] is the slab key, registered as the selector user-data),
//! and is destroyed after being surfaced through the closed queue and
//! dispatched to its handler's `disconnected` hook. All session access
//! happens on the owning worker thread; there is no per-session locking.

use crate::handler::EventHandler;
use crate::request::SessionRequest;
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Attribute key under which a session request's attachment is stored.
pub const ATTACHMENT_KEY: &str = "session.attachment";

/// Session lifecycle. `Closing` marks a session awaiting its surfacing
/// through the closed queue; `Closed` means the close hook has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    Active,
    Closing,
    Closed,
}

/// Identifies a session by its worker and slab token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub worker: usize,
    pub token: usize,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.worker, self.token)
    }
}

/// One connection, bound to one channel and one worker.
pub struct IoSession {
    token: Token,
    channel: TcpStream,
    interest: Interest,
    interest_changed: bool,
    status: SessionStatus,
    reaped: bool,
    timeout: Duration,
    last_read: Instant,
    last_write: Instant,
    last_access: Instant,
    attributes: HashMap<String, Box<dyn Any + Send>>,
    handler: Option<Box<dyn EventHandler>>,
}

impl IoSession {
    pub(crate) fn new(token: Token, channel: TcpStream) -> IoSession {
        let now = Instant::now();
        IoSession {
            token,
            channel,
            interest: Interest::READABLE,
            interest_changed: false,
            status: SessionStatus::Active,
            reaped: false,
            timeout: Duration::ZERO,
            last_read: now,
            last_write: now,
            last_access: now,
            attributes: HashMap::new(),
            handler: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.channel.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.channel.local_addr()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.status > SessionStatus::Active
    }

    /// Request an orderly close. Idempotent; the owning worker surfaces the
    /// session through its closed queue and delivers `disconnected` exactly
    /// once.
    pub fn close(&mut self) {
        if self.status == SessionStatus::Active {
            self.status = SessionStatus::Closing;
        }
    }

    /// Readiness interest for this session. Changes are applied by the
    /// owning worker after the current dispatch returns.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn set_interest(&mut self, interest: Interest) {
        if self.interest != interest {
            self.interest = interest;
            self.interest_changed = true;
        }
    }

    /// Soft idle timeout; zero disables the check. The handler's `timeout`
    /// hook decides whether to close or extend.
    pub fn socket_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_socket_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn last_read_time(&self) -> Instant {
        self.last_read
    }

    pub fn last_write_time(&self) -> Instant {
        self.last_write
    }

    /// The later of the last read and last write. Monotonically
    /// non-decreasing.
    pub fn last_access_time(&self) -> Instant {
        self.last_access
    }

    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>> {
        self.attributes.insert(name.into(), value)
    }

    pub fn attribute(&self, name: &str) -> Option<&(dyn Any + Send)> {
        self.attributes.get(name).map(|value| value.as_ref())
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Box<dyn Any + Send>> {
        self.attributes.remove(name)
    }

    pub(crate) fn reset_last_read(&mut self, now: Instant) {
        self.last_read = now;
        self.last_access = now;
    }

    pub(crate) fn reset_last_write(&mut self, now: Instant) {
        self.last_write = now;
        self.last_access = now;
    }

    pub(crate) fn is_timed_out(&self, now: Instant) -> bool {
        !self.timeout.is_zero() && now.duration_since(self.last_access) > self.timeout
    }

    /// One-shot gate for the closed queue: the first call after the session
    /// left `Active` returns `true`, every later call returns `false`.
    pub(crate) fn should_reap(&mut self) -> bool {
        if self.is_closed() && !self.reaped {
            self.reaped = true;
            return true;
        }
        false
    }

    pub(crate) fn mark_closed(&mut self) {
        self.status = SessionStatus::Closed;
    }

    pub(crate) fn take_interest_change(&mut self) -> Option<Interest> {
        if self.interest_changed {
            self.interest_changed = false;
            return Some(self.interest);
        }
        None
    }

    pub(crate) fn attach_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.handler = Some(handler);
    }

    pub(crate) fn take_handler(&mut self) -> Option<Box<dyn EventHandler>> {
        self.handler.take()
    }

    pub(crate) fn restore_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.handler = Some(handler);
    }

    pub(crate) fn channel_mut(&mut self) -> &mut TcpStream {
        &mut self.channel
    }
}

impl Read for IoSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }
}

impl Write for IoSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.channel.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.channel.flush()
    }
}

impl fmt::Debug for IoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSession")
            .field("token", &self.token)
            .field("status", &self.status)
            .field("interest", &self.interest)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A connected channel awaiting registration by its assigned worker,
/// optionally paired with the [`SessionRequest`] that produced it.
#[derive(Debug)]
pub struct PendingSession {
    pub(crate) channel: TcpStream,
    pub(crate) request: Option<Arc<SessionRequest>>,
}

impl PendingSession {
    pub fn new(channel: TcpStream) -> PendingSession {
        PendingSession {
            channel,
            request: None,
        }
    }

    pub fn with_request(channel: TcpStream, request: Arc<SessionRequest>) -> PendingSession {
        PendingSession {
            channel,
            request: Some(request),
        }
    }

    /// Wrap a std stream, flipping it to non-blocking mode first.
    pub fn from_std(
        channel: std::net::TcpStream,
        request: Option<Arc<SessionRequest>>,
    ) -> io::Result<PendingSession> {
        channel.set_nonblocking(true)?;
        Ok(PendingSession {
            channel: TcpStream::from_std(channel),
            request,
        })
    }

    /// Cancel the paired request (if any) and close the channel.
    pub(crate) fn cancel(self) {
        if let Some(request) = self.request {
            request.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn connected_pair() -> (StdTcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(server))
    }

    #[test]
    fn close_is_idempotent_and_reap_is_one_shot() {
        let (_client, channel) = connected_pair();
        let mut session = IoSession::new(Token(0), channel);
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(!session.should_reap());

        session.close();
        session.close();
        assert_eq!(session.status(), SessionStatus::Closing);
        assert!(session.should_reap());
        assert!(!session.should_reap());
    }

    #[test]
    fn attributes_round_trip_through_any() {
        let (_client, channel) = connected_pair();
        let mut session = IoSession::new(Token(3), channel);
        session.set_attribute(ATTACHMENT_KEY, Box::new(42u32));
        let value = session
            .attribute(ATTACHMENT_KEY)
            .and_then(|value| value.downcast_ref::<u32>())
            .copied();
        assert_eq!(value, Some(42));
        assert!(session.remove_attribute(ATTACHMENT_KEY).is_some());
        assert!(session.attribute(ATTACHMENT_KEY).is_none());
    }

    #[test]
    fn access_time_tracks_reads_and_writes() {
        let (_client, channel) = connected_pair();
        let mut session = IoSession::new(Token(1), channel);
        let t0 = session.last_access_time();

        let t1 = Instant::now() + Duration::from_millis(1);
        session.reset_last_read(t1);
        assert_eq!(session.last_access_time(), t1);
        assert!(session.last_access_time() >= t0);

        let t2 = t1 + Duration::from_millis(1);
        session.reset_last_write(t2);
        assert_eq!(session.last_access_time(), t2);
    }

    #[test]
    fn timeout_check_respects_the_zero_sentinel() {
        let (_client, channel) = connected_pair();
        let mut session = IoSession::new(Token(2), channel);
        let later = Instant::now() + Duration::from_secs(60);
        assert!(!session.is_timed_out(later));

        session.set_socket_timeout(Duration::from_millis(100));
        assert!(session.is_timed_out(later));
        assert!(!session.is_timed_out(session.last_access_time()));
    }

    #[test]
    fn interest_changes_are_consumed_once() {
        let (_client, channel) = connected_pair();
        let mut session = IoSession::new(Token(4), channel);
        assert!(session.take_interest_change().is_none());

        session.set_interest(Interest::READABLE | Interest::WRITABLE);
        let change = session.take_interest_change().unwrap();
        assert!(change.is_writable());
        assert!(session.take_interest_change().is_none());
    }
}
