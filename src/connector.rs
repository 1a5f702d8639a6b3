//! Connecting specialization: outbound non-blocking connects driven off the
//! main selector.
//!
//! A non-blocking connect reports completion through writability; the
//! handshake outcome is then read from the socket's error slot. Each
//! in-flight attempt is paired with its [`SessionRequest`], which receives
//! exactly one `completed` / `failed` / `cancelled` signal: completion is
//! signalled by the worker that registers the established channel, failure
//! and cancellation here.

use crate::error::Error;
use crate::reactor::{ReactorHandle, ReactorHooks};
use crate::request::SessionRequest;
use crate::session::PendingSession;
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::TcpStream;
use mio::{Events, Interest, Registry, Token};
use slab::Slab;
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Token range for in-flight connect attempts, clear of listener tokens.
const CONNECT_BASE: usize = 1 << 20;

struct Attempt {
    channel: TcpStream,
    request: Arc<SessionRequest>,
}

/// [`ReactorHooks`] implementation owning the in-flight connect attempts.
/// Paired with a cloneable [`Connector`] used to submit new attempts from
/// any thread.
pub struct ConnectHooks {
    commands: Receiver<Arc<SessionRequest>>,
    attempts: Slab<Attempt>,
    registry: Option<Registry>,
}

impl ConnectHooks {
    pub fn new() -> (ConnectHooks, Connector) {
        let (tx, rx) = unbounded();
        (
            ConnectHooks {
                commands: rx,
                attempts: Slab::new(),
                registry: None,
            },
            Connector { commands: tx },
        )
    }

    fn start_attempt(&mut self, request: Arc<SessionRequest>) {
        let endpoint = request.endpoint();
        let Some(registry) = &self.registry else {
            request.fail(Error::ShutDown);
            return;
        };
        let mut channel = match TcpStream::connect(endpoint) {
            Ok(channel) => channel,
            Err(err) => {
                debug!(%endpoint, cause = %err, "connect failed to start");
                request.fail(Error::Io(err));
                return;
            }
        };
        let entry = self.attempts.vacant_entry();
        let token = Token(CONNECT_BASE + entry.key());
        if let Err(err) = registry.register(&mut channel, token, Interest::WRITABLE) {
            request.fail(Error::Io(err));
            return;
        }
        debug!(%endpoint, "connect attempt started");
        entry.insert(Attempt { channel, request });
    }

    fn finish_attempt(&mut self, key: usize, handle: &ReactorHandle) {
        // inspect in place; the attempt stays registered until resolved
        let resolved = {
            let attempt = &mut self.attempts[key];
            match attempt.channel.take_error() {
                Ok(Some(err)) | Err(err) => Some(Err(err)),
                Ok(None) => match attempt.channel.peer_addr() {
                    Ok(_) => Some(Ok(())),
                    Err(err) if err.kind() == io::ErrorKind::NotConnected => None,
                    Err(err) => Some(Err(err)),
                },
            }
        };
        let Some(result) = resolved else {
            // handshake still in progress; a new writability edge follows
            return;
        };

        let Attempt {
            mut channel,
            request,
        } = self.attempts.remove(key);
        if let Some(registry) = &self.registry {
            if let Err(err) = registry.deregister(&mut channel) {
                trace!(cause = %err, "deregister connect attempt");
            }
        }
        if request.is_settled() {
            // cancelled mid-flight; drop the channel
            return;
        }
        match result {
            Ok(()) => {
                debug!(endpoint = %request.endpoint(), "connection established");
                if let Err(err) =
                    handle.enqueue_session(PendingSession::with_request(channel, request))
                {
                    // the hand-off path has already cancelled the request
                    warn!(cause = %err, "established connection dropped");
                }
            }
            Err(err) => {
                debug!(endpoint = %request.endpoint(), cause = %err, "connect failed");
                request.fail(Error::Io(err));
            }
        }
    }
}

impl ReactorHooks for ConnectHooks {
    fn activate(&mut self, registry: &Registry) -> crate::Result<()> {
        self.registry = Some(registry.try_clone().map_err(Error::Io)?);
        Ok(())
    }

    fn process_events(&mut self, events: &Events, handle: &ReactorHandle) -> crate::Result<()> {
        for event in events.iter() {
            let token = event.token().0;
            if token < CONNECT_BASE {
                continue;
            }
            let key = token - CONNECT_BASE;
            if !self.attempts.contains(key) {
                continue;
            }
            if event.is_writable() || event.is_error() {
                self.finish_attempt(key, handle);
            }
        }
        while let Ok(request) = self.commands.try_recv() {
            if request.is_settled() {
                continue;
            }
            self.start_attempt(request);
        }
        Ok(())
    }

    fn cancel_requests(&mut self) -> crate::Result<()> {
        for request in self.commands.try_iter() {
            request.cancel();
        }
        for attempt in self.attempts.drain() {
            attempt.request.cancel();
        }
        Ok(())
    }
}

/// Submits outbound connect attempts to a running reactor built with
/// [`ConnectHooks`].
#[derive(Clone)]
pub struct Connector {
    commands: Sender<Arc<SessionRequest>>,
}

impl Connector {
    /// Start a non-blocking connect to `endpoint`. The returned request
    /// settles once the attempt resolves; on completion the attachment is
    /// propagated into the session's attribute map.
    pub fn connect(
        &self,
        handle: &ReactorHandle,
        endpoint: SocketAddr,
        attachment: Option<Box<dyn Any + Send>>,
    ) -> crate::Result<Arc<SessionRequest>> {
        let request = match attachment {
            Some(attachment) => SessionRequest::with_attachment(endpoint, attachment),
            None => SessionRequest::new(endpoint),
        };
        self.submit(handle, Arc::clone(&request))?;
        Ok(request)
    }

    /// Submit a caller-built request (for callback-carrying requests).
    pub fn submit(
        &self,
        handle: &ReactorHandle,
        request: Arc<SessionRequest>,
    ) -> crate::Result<()> {
        if let Err(rejected) = self.commands.send(request) {
            rejected.into_inner().cancel();
            return Err(Error::ShutDown);
        }
        handle.wakeup();
        Ok(())
    }
}
