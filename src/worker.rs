//! Single-worker event loop.
//!
//! A [`Worker`] owns one selector and a slab of sessions, and runs the
//! select → dispatch → timeout-check → reap-closed → intake-pending loop on
//! its own thread. The [`WorkerHandle`] is the thread-safe control surface:
//! it hands new channels to the worker (the sole cross-thread path in) and
//! drives the worker's shutdown.
//!
//! External shutdown calls only advance the status word and wake the
//! selector; channel teardown always happens on the worker thread's
//! terminal step, preserving the invariant that per-session code runs
//! exclusively on the owning worker.

use crate::config::ReactorConfig;
use crate::error::Error;
use crate::handler::{EventHandler, EventHandlerFactory, ExceptionHandlerSlot};
use crate::selector::{Selector, EVENTS_CAPACITY, WAKER_TOKEN};
use crate::session::{IoSession, PendingSession, SessionId, SessionStatus, ATTACHMENT_KEY};
use crate::status::{ReactorStatus, StatusCell};
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::TcpStream;
use mio::{Events, Interest, Token, Waker};
use slab::Slab;
use socket2::SockRef;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

struct WorkerShared {
    name: String,
    status: StatusCell,
    waker: Arc<Waker>,
    pending: Sender<PendingSession>,
    error: Mutex<Option<Arc<Error>>>,
}

/// Thread-safe control surface for one [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Snapshot of the worker's status; may lag a transition by one tick.
    pub fn status(&self) -> ReactorStatus {
        self.shared.status.get()
    }

    /// Append a channel to the worker's pending queue and wake its selector.
    /// The worker observes the hand-off on its next loop iteration.
    ///
    /// Once the worker is past `Active` the paired request (if any) is
    /// cancelled and `Error::ShutDown` is returned.
    pub fn enqueue(&self, pending: PendingSession) -> crate::Result<()> {
        if self.shared.status.get() > ReactorStatus::Active {
            pending.cancel();
            return Err(Error::ShutDown);
        }
        if let Err(rejected) = self.shared.pending.send(pending) {
            rejected.into_inner().cancel();
            return Err(Error::ShutDown);
        }
        // publication order: enqueue, then wake
        if let Err(err) = self.shared.waker.wake() {
            debug!(worker = %self.shared.name, cause = %err, "selector wakeup failed");
        }
        Ok(())
    }

    /// Ask the worker to close its sessions politely and exit. Idempotent;
    /// safe from any thread.
    pub fn graceful_shutdown(&self) {
        if self.shared.status.advance(ReactorStatus::ShuttingDown) {
            debug!(worker = %self.shared.name, "graceful shutdown requested");
            let _ = self.shared.waker.wake();
        }
    }

    /// Force the worker out of its loop. The worker still releases its
    /// channels in its terminal step. Idempotent; safe from any thread.
    pub fn hard_shutdown(&self) {
        if self.shared.status.advance(ReactorStatus::ShutDown) {
            debug!(worker = %self.shared.name, "hard shutdown requested");
            let _ = self.shared.waker.wake();
        }
    }

    /// Block until the worker has finished its terminal teardown. A zero
    /// timeout waits forever. Returns `true` once the worker is down.
    pub fn await_shutdown(&self, timeout: Duration) -> bool {
        self.shared.status.await_shutdown(timeout)
    }

    pub(crate) fn set_error(&self, error: Arc<Error>) {
        let mut slot = self.shared.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn take_error(&self) -> Option<Arc<Error>> {
        self.shared.error.lock().unwrap().take()
    }

    pub(crate) fn mark_terminated(&self) {
        self.shared.status.terminate();
    }
}

enum Intake {
    Registered,
    Skipped,
    /// Registration hit a closed channel; stop draining for this tick.
    Stop,
}

/// A single-threaded reactor owning one selector and the sessions assigned
/// to it.
pub struct Worker {
    index: usize,
    shared: Arc<WorkerShared>,
    selector: Selector,
    sessions: Slab<IoSession>,
    pending: Receiver<PendingSession>,
    closed: Vec<Token>,
    factory: Arc<dyn EventHandlerFactory>,
    exceptions: Arc<ExceptionHandlerSlot>,
    config: ReactorConfig,
    draining: bool,
}

impl Worker {
    /// Build a standalone worker and its control handle.
    pub fn new(
        index: usize,
        factory: Arc<dyn EventHandlerFactory>,
        config: ReactorConfig,
    ) -> crate::Result<(Worker, WorkerHandle)> {
        Worker::with_shared(index, factory, Arc::new(ExceptionHandlerSlot::new()), config)
    }

    pub(crate) fn with_shared(
        index: usize,
        factory: Arc<dyn EventHandlerFactory>,
        exceptions: Arc<ExceptionHandlerSlot>,
        config: ReactorConfig,
    ) -> crate::Result<(Worker, WorkerHandle)> {
        let selector = Selector::new().map_err(Error::Io)?;
        let (pending_tx, pending_rx) = unbounded();
        let shared = Arc::new(WorkerShared {
            name: format!("io-worker-{index}"),
            status: StatusCell::new(),
            waker: selector.waker(),
            pending: pending_tx,
            error: Mutex::new(None),
        });
        let worker = Worker {
            index,
            shared: Arc::clone(&shared),
            selector,
            sessions: Slab::new(),
            pending: pending_rx,
            closed: Vec::new(),
            factory,
            exceptions,
            config,
            draining: false,
        };
        Ok((worker, WorkerHandle { shared }))
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the event loop until shutdown, consuming the worker. The terminal
    /// step always releases every channel, even when the loop fails.
    pub fn execute(mut self) -> crate::Result<()> {
        if !self
            .shared
            .status
            .advance_from(ReactorStatus::Inactive, ReactorStatus::Active)
        {
            // shut down before the loop ever ran
            self.teardown();
            return Ok(());
        }
        debug!(worker = %self.shared.name, "event loop started");
        let result = self.run_loop();
        if let Err(err) = &result {
            error!(worker = %self.shared.name, cause = %err, "event loop failed");
        }
        self.teardown();
        result
    }

    fn run_loop(&mut self) -> crate::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            let ready = match self.selector.select(&mut events, self.config.select_interval) {
                Ok(count) => count,
                Err(err) => {
                    let err = Error::Io(err);
                    if self.exceptions.handle(&err) {
                        warn!(worker = %self.shared.name, cause = %err, "select error discarded by exception handler");
                        continue;
                    }
                    return Err(err);
                }
            };

            let status = self.shared.status.get();
            if status == ReactorStatus::ShutDown {
                // hard shutdown from outside; teardown runs in the terminal step
                break;
            }
            if status == ReactorStatus::ShuttingDown {
                self.drain_for_shutdown();
            }

            if ready > 0 {
                for event in events.iter() {
                    let token = event.token();
                    if token == WAKER_TOKEN {
                        continue;
                    }
                    self.on_event(
                        token,
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error(),
                    );
                }
            }

            self.check_timeouts();
            self.reap_closed();

            if self.shared.status.get() == ReactorStatus::Active {
                if let Err(err) = self.intake_pending() {
                    if self.exceptions.handle(&err) {
                        warn!(worker = %self.shared.name, cause = %err, "intake error discarded by exception handler");
                    } else {
                        return Err(err);
                    }
                }
            }

            if self.shared.status.get() > ReactorStatus::Active && self.sessions.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Graceful-shutdown branch: close every active session and cancel the
    /// channels still waiting in the pending queue. Closed sessions surface
    /// through the regular reap path.
    fn drain_for_shutdown(&mut self) {
        if !self.draining {
            self.draining = true;
            debug!(
                worker = %self.shared.name,
                sessions = self.sessions.len(),
                "closing sessions for shutdown"
            );
        }
        for (_, session) in self.sessions.iter_mut() {
            session.close();
        }
        for pending in self.pending.try_iter() {
            pending.cancel();
        }
    }

    fn on_event(&mut self, token: Token, readable: bool, writable: bool, errored: bool) {
        if !self.sessions.contains(token.0) {
            // stale event for a session reaped earlier in this tick
            trace!(worker = %self.shared.name, token = token.0, "event for unknown token");
            return;
        }
        if errored {
            let cause = self
                .sessions
                .get_mut(token.0)
                .and_then(|session| session.channel_mut().take_error().ok().flatten())
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error readiness"));
            self.shut_session(token, Error::Io(cause));
            return;
        }

        let now = Instant::now();
        if readable {
            if let Some(session) = self.sessions.get_mut(token.0) {
                if session.status() == SessionStatus::Active {
                    session.reset_last_read(now);
                }
            }
            self.with_handler(token, |handler, session| handler.input_ready(session));
        }
        if writable {
            if let Some(session) = self.sessions.get_mut(token.0) {
                if session.status() == SessionStatus::Active {
                    session.reset_last_write(now);
                }
            }
            self.with_handler(token, |handler, session| handler.output_ready(session));
        }
        self.apply_interest(token);
    }

    /// Dispatch one handler callback for an active session, routing a
    /// callback error to the `exception` hook and closing the session.
    fn with_handler<F>(&mut self, token: Token, dispatch: F)
    where
        F: FnOnce(&mut dyn EventHandler, &mut IoSession) -> crate::Result<()>,
    {
        let Some(session) = self.sessions.get_mut(token.0) else {
            return;
        };
        if session.status() != SessionStatus::Active {
            return;
        }
        let Some(mut handler) = session.take_handler() else {
            return;
        };
        if let Err(err) = dispatch(handler.as_mut(), session) {
            debug!(worker = %self.shared.name, token = token.0, cause = %err, "handler error");
            handler.exception(session, &err);
            session.close();
        }
        session.restore_handler(handler);
    }

    /// Deliver a transport error to the session and close it.
    fn shut_session(&mut self, token: Token, error: Error) {
        let Some(session) = self.sessions.get_mut(token.0) else {
            return;
        };
        debug!(worker = %self.shared.name, token = token.0, cause = %error, "session error");
        if let Some(mut handler) = session.take_handler() {
            handler.exception(session, &error);
            session.restore_handler(handler);
        }
        session.close();
    }

    /// Apply a deferred interest change via reregistration.
    fn apply_interest(&mut self, token: Token) {
        let registry = self.selector.registry();
        let failure = match self.sessions.get_mut(token.0) {
            Some(session) => match session.take_interest_change() {
                Some(interest) => {
                    let reregister = registry.reregister(session.channel_mut(), token, interest);
                    reregister.err()
                }
                None => None,
            },
            None => None,
        };
        if let Some(err) = failure {
            self.shut_session(token, Error::Io(err));
        }
    }

    /// Soft-timeout sweep: signal every session idle past its timeout.
    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<Token> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                session.status() == SessionStatus::Active && session.is_timed_out(now)
            })
            .map(|(key, _)| Token(key))
            .collect();
        for token in expired {
            debug!(worker = %self.shared.name, token = token.0, "session timed out");
            self.with_handler(token, |handler, session| handler.timeout(session));
            self.apply_interest(token);
        }
    }

    /// Surface newly closed sessions exactly once, then destroy them:
    /// deregister, deliver `disconnected`, drop the channel.
    fn reap_closed(&mut self) {
        for (key, session) in self.sessions.iter_mut() {
            if session.should_reap() {
                self.closed.push(Token(key));
            }
        }
        if self.closed.is_empty() {
            return;
        }
        let reapable: Vec<Token> = self.closed.drain(..).collect();
        for token in reapable {
            if !self.sessions.contains(token.0) {
                continue;
            }
            let mut session = self.sessions.remove(token.0);
            if let Err(err) = self.selector.registry().deregister(session.channel_mut()) {
                trace!(worker = %self.shared.name, token = token.0, cause = %err, "deregister on close");
            }
            session.mark_closed();
            if let Some(mut handler) = session.take_handler() {
                handler.disconnected(&mut session);
            }
            debug!(worker = %self.shared.name, token = token.0, "session closed");
        }
    }

    /// Drain the pending queue: register each channel for read readiness,
    /// build its session, attach a handler, and complete the paired request.
    fn intake_pending(&mut self) -> crate::Result<()> {
        while let Ok(pending) = self.pending.try_recv() {
            match self.register_pending(pending)? {
                Intake::Registered | Intake::Skipped => {}
                Intake::Stop => break,
            }
        }
        Ok(())
    }

    fn register_pending(&mut self, pending: PendingSession) -> crate::Result<Intake> {
        let PendingSession {
            mut channel,
            request,
        } = pending;

        if let Some(req) = &request {
            if req.is_settled() {
                // cancelled while queued; just drop the channel
                return Ok(Intake::Skipped);
            }
        }

        let token = Token(self.sessions.vacant_entry().key());
        if let Err(err) = self
            .selector
            .registry()
            .register(&mut channel, token, Interest::READABLE)
        {
            if is_closed_channel(&err) {
                warn!(worker = %self.shared.name, cause = %err, "channel closed before registration");
                if let Some(req) = request {
                    req.fail(Error::Io(err));
                }
                return Ok(Intake::Stop);
            }
            return Err(Error::Io(err));
        }

        self.apply_socket_options(&channel);
        let key = self.sessions.insert(IoSession::new(token, channel));
        debug_assert_eq!(key, token.0);

        let created: crate::Result<()> = {
            let session = self
                .sessions
                .get_mut(token.0)
                .expect("session just inserted");
            match self.factory.create_handler(&mut *session) {
                Ok(handler) => {
                    session.attach_handler(handler);
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        if let Err(err) = created {
            // a broken factory is fatal to this worker; fail the paired
            // request before surfacing the error
            let mut session = self.sessions.remove(token.0);
            let _ = self.selector.registry().deregister(session.channel_mut());
            if let Some(req) = request {
                req.fail(Error::Handler(err.to_string()));
            }
            return Err(err);
        }

        {
            let session = self
                .sessions
                .get_mut(token.0)
                .expect("session just inserted");
            session.set_socket_timeout(self.config.so_timeout);
            if let Some(req) = &request {
                if let Some(attachment) = req.take_attachment() {
                    session.set_attribute(ATTACHMENT_KEY, attachment);
                }
                req.complete(SessionId {
                    worker: self.index,
                    token: token.0,
                });
            }
        }
        debug!(worker = %self.shared.name, token = token.0, "session registered");
        self.with_handler(token, |handler, session| handler.connected(session));
        self.apply_interest(token);
        Ok(Intake::Registered)
    }

    fn apply_socket_options(&self, channel: &TcpStream) {
        if self.config.tcp_nodelay {
            if let Err(err) = channel.set_nodelay(true) {
                debug!(worker = %self.shared.name, cause = %err, "set TCP_NODELAY");
            }
        }
        let sock = SockRef::from(channel);
        if self.config.so_keepalive {
            if let Err(err) = sock.set_keepalive(true) {
                debug!(worker = %self.shared.name, cause = %err, "set SO_KEEPALIVE");
            }
        }
        if let Some(linger) = self.config.so_linger {
            if let Err(err) = sock.set_linger(Some(linger)) {
                debug!(worker = %self.shared.name, cause = %err, "set SO_LINGER");
            }
        }
        if self.config.rcv_buf_size > 0 {
            if let Err(err) = sock.set_recv_buffer_size(self.config.rcv_buf_size) {
                debug!(worker = %self.shared.name, cause = %err, "set SO_RCVBUF");
            }
        }
        if self.config.snd_buf_size > 0 {
            if let Err(err) = sock.set_send_buffer_size(self.config.snd_buf_size) {
                debug!(worker = %self.shared.name, cause = %err, "set SO_SNDBUF");
            }
        }
    }

    /// Terminal step: cancel whatever never got registered, close every
    /// remaining session with exactly one `disconnected`, then mark the
    /// worker terminated and wake all waiters.
    fn teardown(&mut self) {
        for pending in self.pending.try_iter() {
            pending.cancel();
        }
        let remaining: Vec<usize> = self.sessions.iter().map(|(key, _)| key).collect();
        for key in remaining {
            let mut session = self.sessions.remove(key);
            let _ = self.selector.registry().deregister(session.channel_mut());
            session.mark_closed();
            if let Some(mut handler) = session.take_handler() {
                handler.disconnected(&mut session);
            }
        }
        self.closed.clear();
        self.shared.status.terminate();
        debug!(worker = %self.shared.name, "worker shut down");
    }

    /// Cancel queued channels and mark the worker terminated without running
    /// the loop. Used when the reactor shuts down before ever executing.
    pub(crate) fn abort(mut self) {
        self.teardown();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // a worker that never ran (or unwound) must still release waiters
        self.shared.status.terminate();
    }
}

fn is_closed_channel(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn socket_pair() -> (StdTcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[derive(Default)]
    struct Counters {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    struct Echo {
        counters: Arc<Counters>,
    }

    impl EventHandler for Echo {
        fn connected(&mut self, _session: &mut IoSession) -> crate::Result<()> {
            self.counters.connected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn input_ready(&mut self, session: &mut IoSession) -> crate::Result<()> {
            let mut buf = [0u8; 4096];
            loop {
                match session.read(&mut buf) {
                    Ok(0) => {
                        session.close();
                        return Ok(());
                    }
                    Ok(n) => session.write_all(&buf[..n]).map_err(Error::Io)?,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(Error::Io(err)),
                }
            }
        }

        fn disconnected(&mut self, _session: &mut IoSession) {
            self.counters.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn echo_factory(counters: Arc<Counters>) -> Arc<dyn EventHandlerFactory> {
        Arc::new(move |_session: &mut IoSession| {
            Ok(Box::new(Echo {
                counters: Arc::clone(&counters),
            }) as Box<dyn EventHandler>)
        })
    }

    fn test_config() -> ReactorConfig {
        ReactorConfig::new().with_select_interval(Duration::from_millis(20))
    }

    #[test]
    #[tracing_test::traced_test]
    fn echoes_and_reports_disconnect() {
        let counters = Arc::new(Counters::default());
        let (worker, handle) = Worker::new(0, echo_factory(Arc::clone(&counters)), test_config())
            .expect("worker");
        let runner = thread::spawn(move || worker.execute());

        let (mut client, server) = socket_pair();
        handle
            .enqueue(PendingSession::from_std(server, None).unwrap())
            .unwrap();

        client.write_all(b"hello").unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello");

        // closing the peer ends the session
        drop(client);
        handle.graceful_shutdown();
        assert!(handle.await_shutdown(Duration::from_secs(5)));
        runner.join().unwrap().unwrap();

        assert_eq!(counters.connected.load(Ordering::SeqCst), 1);
        assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(handle.status(), ReactorStatus::ShutDown);
    }

    #[test]
    fn graceful_shutdown_closes_idle_sessions() {
        let counters = Arc::new(Counters::default());
        let (worker, handle) = Worker::new(1, echo_factory(Arc::clone(&counters)), test_config())
            .expect("worker");
        let runner = thread::spawn(move || worker.execute());

        let (_client, server) = socket_pair();
        handle
            .enqueue(PendingSession::from_std(server, None).unwrap())
            .unwrap();

        // wait for the session to register before asking for shutdown
        let deadline = Instant::now() + Duration::from_secs(5);
        while counters.connected.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counters.connected.load(Ordering::SeqCst), 1);

        handle.graceful_shutdown();
        assert!(handle.await_shutdown(Duration::from_secs(5)));
        runner.join().unwrap().unwrap();
        assert_eq!(counters.disconnected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enqueue_after_shutdown_cancels_the_request() {
        let counters = Arc::new(Counters::default());
        let (worker, handle) =
            Worker::new(2, echo_factory(counters), test_config()).expect("worker");
        let runner = thread::spawn(move || worker.execute());

        handle.hard_shutdown();
        assert!(handle.await_shutdown(Duration::from_secs(5)));
        runner.join().unwrap().unwrap();

        let (_client, server) = socket_pair();
        let request = crate::SessionRequest::new("127.0.0.1:80".parse().unwrap());
        let result = handle.enqueue(
            PendingSession::from_std(server, Some(Arc::clone(&request))).unwrap(),
        );
        assert!(matches!(result, Err(Error::ShutDown)));
        assert!(matches!(request.outcome(), crate::Outcome::Cancelled));
    }
}
