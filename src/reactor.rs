//! Multi-worker reactor coordinator.
//!
//! [`IoReactor`] owns the main selector, a fixed pool of workers and their
//! threads, the audit log, and the top-level shutdown state machine. New
//! channels are distributed round-robin across the pool; after placement a
//! session never hops threads again.
//!
//! Accepting and connecting specializations live outside the coordinator,
//! plugged in as a [`ReactorHooks`] capability object (see
//! [`AcceptHooks`](crate::AcceptHooks) and
//! [`ConnectHooks`](crate::ConnectHooks)).

use crate::audit::{AuditLog, ExceptionEvent};
use crate::config::ReactorConfig;
use crate::error::Error;
use crate::handler::{EventHandlerFactory, ExceptionHandler, ExceptionHandlerSlot};
use crate::selector::{Selector, EVENTS_CAPACITY};
use crate::session::PendingSession;
use crate::status::{ReactorStatus, StatusCell};
use crate::worker::{Worker, WorkerHandle};
use mio::{Events, Registry, Waker};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Default wait used by [`IoReactor::shutdown`].
const DEFAULT_SHUTDOWN_WAIT: Duration = Duration::from_millis(2000);

/// Capability object holding the accepting/connecting specialization of a
/// reactor. Variants compose; there is no subclassing.
pub trait ReactorHooks: Send {
    /// Called once when the reactor becomes active, before the first select.
    /// The registry belongs to the main selector; hooks register the
    /// endpoints they own here.
    fn activate(&mut self, registry: &Registry) -> crate::Result<()> {
        let _ = registry;
        Ok(())
    }

    /// Called after every main-selector tick with the ready events.
    fn process_events(&mut self, events: &Events, handle: &ReactorHandle) -> crate::Result<()>;

    /// Called once during orderly shutdown. Hooks cancel outstanding
    /// requests and close the endpoints they own.
    fn cancel_requests(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// Hooks for a reactor fed exclusively through
/// [`ReactorHandle::enqueue_session`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHooks;

impl ReactorHooks for NullHooks {
    fn process_events(&mut self, _events: &Events, _handle: &ReactorHandle) -> crate::Result<()> {
        Ok(())
    }
}

/// Spawns the worker threads. The default implementation names OS threads;
/// callers may substitute their own policy.
pub trait ThreadSpawner: Send + Sync {
    fn spawn(
        &self,
        name: String,
        runnable: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadSpawner;

impl ThreadSpawner for OsThreadSpawner {
    fn spawn(
        &self,
        name: String,
        runnable: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(name).spawn(runnable)
    }
}

struct ReactorShared {
    config: ReactorConfig,
    status: StatusCell,
    audit: AuditLog,
    workers: Vec<WorkerHandle>,
    next_worker: AtomicI64,
    waker: Arc<Waker>,
    exceptions: Arc<ExceptionHandlerSlot>,
}

impl ReactorShared {
    fn enqueue_session(&self, pending: PendingSession) -> crate::Result<()> {
        if self.status.get() > ReactorStatus::Active {
            pending.cancel();
            return Err(Error::ShutDown);
        }
        let counter = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let index = distribute(counter, self.workers.len());
        self.workers[index].enqueue(pending)
    }
}

/// Worker index for the `n`-th hand-off. The counter wraps; the absolute
/// value keeps the index positive across the wraparound.
pub(crate) fn distribute(counter: i64, workers: usize) -> usize {
    (counter.unsigned_abs() % workers as u64) as usize
}

/// Cloneable control surface shared with hooks and other threads.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    /// Snapshot of the reactor status; may lag a transition by one tick.
    pub fn status(&self) -> ReactorStatus {
        self.shared.status.get()
    }

    /// Copy-on-read snapshot of the audit log.
    pub fn audit(&self) -> Vec<ExceptionEvent> {
        self.shared.audit.snapshot()
    }

    /// Install the hook consulted before a loop-machinery error is treated
    /// as fatal. Replaces any previous hook.
    pub fn set_exception_handler(&self, handler: Box<dyn ExceptionHandler>) {
        self.shared.exceptions.set(handler);
    }

    /// Hand a connected channel to the pool. The worker is chosen
    /// round-robin; the channel is registered on that worker's next tick.
    pub fn enqueue_session(&self, pending: PendingSession) -> crate::Result<()> {
        self.shared.enqueue_session(pending)
    }

    pub(crate) fn wakeup(&self) {
        let _ = self.shared.waker.wake();
    }
}

struct MainState {
    selector: Selector,
    hooks: Box<dyn ReactorHooks>,
    workers: Vec<Worker>,
    spawner: Box<dyn ThreadSpawner>,
}

/// Multi-worker non-blocking I/O reactor.
///
/// `execute` blocks the calling thread in the main-selector loop; every
/// other method is safe to call from any thread.
pub struct IoReactor {
    shared: Arc<ReactorShared>,
    main: Mutex<Option<MainState>>,
}

impl IoReactor {
    pub fn new(
        factory: Arc<dyn EventHandlerFactory>,
        config: ReactorConfig,
        hooks: Box<dyn ReactorHooks>,
    ) -> crate::Result<IoReactor> {
        IoReactor::with_spawner(factory, config, hooks, Box::new(OsThreadSpawner))
    }

    pub fn with_spawner(
        factory: Arc<dyn EventHandlerFactory>,
        config: ReactorConfig,
        hooks: Box<dyn ReactorHooks>,
        spawner: Box<dyn ThreadSpawner>,
    ) -> crate::Result<IoReactor> {
        config.validate()?;
        let selector = Selector::new().map_err(Error::Io)?;
        let exceptions = Arc::new(ExceptionHandlerSlot::new());

        let mut workers = Vec::with_capacity(config.io_thread_count);
        let mut handles = Vec::with_capacity(config.io_thread_count);
        for index in 0..config.io_thread_count {
            let (worker, handle) = Worker::with_shared(
                index,
                Arc::clone(&factory),
                Arc::clone(&exceptions),
                config.clone(),
            )?;
            workers.push(worker);
            handles.push(handle);
        }

        let shared = Arc::new(ReactorShared {
            waker: selector.waker(),
            config,
            status: StatusCell::new(),
            audit: AuditLog::new(),
            workers: handles,
            next_worker: AtomicI64::new(0),
            exceptions,
        });
        Ok(IoReactor {
            shared,
            main: Mutex::new(Some(MainState {
                selector,
                hooks,
                workers,
                spawner,
            })),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Snapshot of the reactor status; may lag a transition by one tick.
    pub fn status(&self) -> ReactorStatus {
        self.shared.status.get()
    }

    /// Copy-on-read snapshot of the audit log.
    pub fn audit(&self) -> Vec<ExceptionEvent> {
        self.shared.audit.snapshot()
    }

    /// See [`ReactorHandle::set_exception_handler`].
    pub fn set_exception_handler(&self, handler: Box<dyn ExceptionHandler>) {
        self.shared.exceptions.set(handler);
    }

    /// See [`ReactorHandle::enqueue_session`].
    pub fn enqueue_session(&self, pending: PendingSession) -> crate::Result<()> {
        self.shared.enqueue_session(pending)
    }

    /// Run the reactor: spawn the worker threads, then drive the
    /// main-selector loop until shutdown. The terminal step always performs
    /// the orderly teardown, even when the loop fails; the fatal cause is
    /// recorded in the audit log before it propagates.
    pub fn execute(&self) -> crate::Result<()> {
        if !self
            .shared
            .status
            .advance_from(ReactorStatus::Inactive, ReactorStatus::Active)
        {
            let status = self.shared.status.get();
            if status >= ReactorStatus::ShutdownRequest {
                // already shutting down: become terminal and return
                self.shared.status.terminate();
                return Ok(());
            }
            return Err(Error::InvalidState(status));
        }

        let taken = self.main.lock().unwrap().take();
        let Some(mut state) = taken else {
            return Err(Error::InvalidState(ReactorStatus::Active));
        };

        let mut threads = Vec::new();
        let result = self.run_main(&mut state, &mut threads);
        let teardown = self.do_shutdown(&mut state, &mut threads);
        self.shared.status.terminate();
        info!("reactor shut down");
        result.and(teardown)
    }

    fn run_main(
        &self,
        state: &mut MainState,
        threads: &mut Vec<(usize, String, JoinHandle<()>)>,
    ) -> crate::Result<()> {
        let mut spawn_failure = None;
        for (index, worker) in state.workers.drain(..).enumerate() {
            if spawn_failure.is_some() || self.shared.status.get() != ReactorStatus::Active {
                debug!("status changed during startup, aborting worker start");
                worker.abort();
                continue;
            }
            let watcher = worker.handle();
            let name = watcher.name().to_string();
            let runnable = Box::new(move || {
                match panic::catch_unwind(AssertUnwindSafe(move || worker.execute())) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => watcher.set_error(Arc::new(err)),
                    Err(payload) => {
                        watcher.set_error(Arc::new(Error::Panic {
                            name: watcher.name().to_string(),
                            message: panic_message(payload.as_ref()),
                        }));
                        watcher.mark_terminated();
                    }
                }
            });
            match state.spawner.spawn(name.clone(), runnable) {
                Ok(join) => threads.push((index, name, join)),
                Err(err) => spawn_failure = Some(Error::Io(err)),
            }
        }
        if let Some(err) = spawn_failure {
            return Err(self.fatal(err));
        }

        if let Err(err) = state.hooks.activate(state.selector.registry()) {
            return Err(self.fatal(err));
        }

        let handle = self.handle();
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(workers = self.shared.workers.len(), "reactor active");

        loop {
            let ready = match state
                .selector
                .select(&mut events, self.shared.config.select_interval)
            {
                Ok(count) => count,
                Err(err) => {
                    let err = Error::Io(err);
                    if self.shared.exceptions.handle(&err) {
                        warn!(cause = %err, "select error discarded by exception handler");
                        continue;
                    }
                    return Err(self.fatal(err));
                }
            };
            trace!(ready, "main selector tick");

            // drain the tick that observed a shutdown request before exiting
            if let Err(err) = state.hooks.process_events(&events, &handle) {
                if self.shared.exceptions.handle(&err) {
                    warn!(cause = %err, "hook error discarded by exception handler");
                } else {
                    return Err(self.fatal(err));
                }
            }

            // a worker that died abnormally is fatal to the whole reactor
            for worker in &self.shared.workers {
                if let Some(source) = worker.take_error() {
                    error!(worker = worker.name(), cause = %source, "worker terminated abnormally");
                    self.shared.audit.append_shared(Arc::clone(&source));
                    return Err(Error::Worker {
                        name: worker.name().to_string(),
                        source,
                    });
                }
            }

            if self.shared.status.get() > ReactorStatus::Active {
                break;
            }
        }
        Ok(())
    }

    /// Orderly teardown; runs once. Every error on this path is audited
    /// rather than propagated, except a panicked worker join.
    fn do_shutdown(
        &self,
        state: &mut MainState,
        threads: &mut Vec<(usize, String, JoinHandle<()>)>,
    ) -> crate::Result<()> {
        if !self.shared.status.advance(ReactorStatus::ShuttingDown) {
            return Ok(());
        }
        info!("reactor shutting down");

        if let Err(err) = state.hooks.cancel_requests() {
            warn!(cause = %err, "cancelling requests failed");
            self.shared.audit.append(err);
        }
        // hook-owned endpoints are closed by cancel_requests; the main
        // selector itself closes when the loop state is dropped
        let _ = self.shared.waker.wake();

        for worker in &self.shared.workers {
            worker.graceful_shutdown();
        }

        let grace = self.shared.config.shutdown_grace_period;
        let mut stalled = vec![false; self.shared.workers.len()];
        for (index, worker) in self.shared.workers.iter().enumerate() {
            if worker.await_shutdown(grace) {
                continue;
            }
            warn!(worker = worker.name(), "grace period expired, forcing shutdown");
            worker.hard_shutdown();
            if !worker.await_shutdown(grace) {
                stalled[index] = true;
                self.shared.audit.append(Error::Stalled {
                    name: worker.name().to_string(),
                });
            }
        }

        // workers that failed during teardown still reach the audit log
        for worker in &self.shared.workers {
            if let Some(err) = worker.take_error() {
                self.shared.audit.append_shared(err);
            }
        }

        let mut join_failure = None;
        for (index, name, join) in threads.drain(..) {
            if stalled.get(index).copied().unwrap_or(false) {
                // left to finish its own teardown
                continue;
            }
            if let Err(payload) = join.join() {
                let message = panic_message(payload.as_ref());
                self.shared.audit.append(Error::Panic {
                    name: name.clone(),
                    message: message.clone(),
                });
                if join_failure.is_none() {
                    join_failure = Some(Error::Panic { name, message });
                }
            }
        }
        match join_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Controlled teardown with the default wait.
    pub fn shutdown(&self) {
        self.shutdown_within(DEFAULT_SHUTDOWN_WAIT)
    }

    /// Controlled teardown. Requests shutdown and waits up to `wait` for the
    /// reactor to terminate (zero waits forever). A reactor already past
    /// `Active` is left alone; calling this twice is a no-op.
    pub fn shutdown_within(&self, wait: Duration) {
        let status = self.shared.status.get();
        if status > ReactorStatus::Active {
            return;
        }
        if status == ReactorStatus::Inactive
            && self
                .shared
                .status
                .advance_from(ReactorStatus::Inactive, ReactorStatus::ShutDown)
        {
            // the loop never ran; tear down inline
            if let Some(mut state) = self.main.lock().unwrap().take() {
                if let Err(err) = state.hooks.cancel_requests() {
                    self.shared.audit.append(err);
                }
                for worker in state.workers.drain(..) {
                    worker.abort();
                }
                // main selector closes when `state` drops
            }
            self.shared.status.terminate();
            return;
        }
        if self
            .shared
            .status
            .advance_from(ReactorStatus::Active, ReactorStatus::ShutdownRequest)
        {
            let _ = self.shared.waker.wake();
        }
        self.shared.status.await_shutdown(wait);
    }

    /// Record a fatal loop failure in the audit log and wrap it for the
    /// caller.
    fn fatal(&self, err: Error) -> Error {
        let source = self.shared.audit.append(err);
        Error::Reactor { source }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EventHandler;
    use crate::session::IoSession;

    struct Sink;
    impl EventHandler for Sink {
        fn input_ready(&mut self, session: &mut IoSession) -> crate::Result<()> {
            session.close();
            Ok(())
        }
    }

    fn sink_factory() -> Arc<dyn EventHandlerFactory> {
        Arc::new(|_session: &mut IoSession| Ok(Box::new(Sink) as Box<dyn EventHandler>))
    }

    fn small_config() -> ReactorConfig {
        ReactorConfig::new()
            .with_io_thread_count(2)
            .with_select_interval(Duration::from_millis(20))
    }

    #[test]
    fn round_robin_tolerates_wraparound() {
        assert_eq!(distribute(0, 4), 0);
        assert_eq!(distribute(5, 4), 1);
        assert_eq!(distribute(-3, 4), 3);
        assert_eq!(distribute(i64::MAX, 4), 3);
        assert_eq!(distribute(i64::MIN, 4), 0);
    }

    #[test]
    fn round_robin_is_fair() {
        let workers = 4;
        let mut counts = vec![0usize; workers];
        for counter in 0..400i64 {
            counts[distribute(counter, workers)] += 1;
        }
        assert!(counts.iter().all(|&count| count == 100));
    }

    #[test]
    fn shutdown_of_an_inactive_reactor_is_terminal_and_idempotent() {
        let reactor = IoReactor::new(sink_factory(), small_config(), Box::new(NullHooks)).unwrap();
        assert_eq!(reactor.status(), ReactorStatus::Inactive);

        reactor.shutdown_within(Duration::from_millis(100));
        assert_eq!(reactor.status(), ReactorStatus::ShutDown);
        // calling shutdown again is a no-op
        reactor.shutdown_within(Duration::from_millis(100));
        assert_eq!(reactor.status(), ReactorStatus::ShutDown);
        assert!(reactor.audit().is_empty());
    }

    #[test]
    fn execute_after_shutdown_returns_without_running() {
        let reactor = IoReactor::new(sink_factory(), small_config(), Box::new(NullHooks)).unwrap();
        reactor.shutdown();
        assert!(reactor.execute().is_ok());
        assert_eq!(reactor.status(), ReactorStatus::ShutDown);
    }

    #[test]
    fn execute_requires_an_inactive_reactor() {
        let reactor =
            Arc::new(IoReactor::new(sink_factory(), small_config(), Box::new(NullHooks)).unwrap());
        let runner = {
            let reactor = Arc::clone(&reactor);
            thread::spawn(move || reactor.execute())
        };
        // wait for the loop to come up
        while reactor.status() < ReactorStatus::Active {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            reactor.execute(),
            Err(Error::InvalidState(ReactorStatus::Active))
        ));
        reactor.shutdown();
        runner.join().unwrap().unwrap();
        assert_eq!(reactor.status(), ReactorStatus::ShutDown);
    }
}
