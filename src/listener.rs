//! Accepting specialization: listening endpoints on the main selector.

use crate::error::Error;
use crate::reactor::{ReactorHandle, ReactorHooks};
use crate::session::PendingSession;
use mio::net::TcpListener;
use mio::{Events, Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// [`ReactorHooks`] implementation that owns one or more listening sockets,
/// accepts ready connections on every main-selector tick, and distributes
/// them across the worker pool.
///
/// Socket options for accepted channels are applied by the worker during
/// registration, not here.
pub struct AcceptHooks {
    endpoints: Vec<(Token, TcpListener)>,
    addrs: Vec<SocketAddr>,
}

impl AcceptHooks {
    /// Bind a listener for each address. Binding to port 0 picks an
    /// ephemeral port; see [`local_addrs`](AcceptHooks::local_addrs) for the
    /// actual endpoints.
    pub fn bind(addrs: &[SocketAddr]) -> crate::Result<AcceptHooks> {
        let mut endpoints = Vec::with_capacity(addrs.len());
        let mut bound = Vec::with_capacity(addrs.len());
        for (index, addr) in addrs.iter().enumerate() {
            let listener = TcpListener::bind(*addr).map_err(Error::Io)?;
            bound.push(listener.local_addr().map_err(Error::Io)?);
            endpoints.push((Token(index), listener));
        }
        Ok(AcceptHooks {
            endpoints,
            addrs: bound,
        })
    }

    /// The addresses actually bound.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Accept until the listener would block, handing each connection to
    /// the pool.
    fn accept_ready(
        listener: &mut TcpListener,
        handle: &ReactorHandle,
    ) -> crate::Result<()> {
        loop {
            match listener.accept() {
                Ok((channel, peer)) => {
                    debug!(%peer, "accepted connection");
                    match handle.enqueue_session(PendingSession::new(channel)) {
                        Ok(()) => {}
                        Err(Error::ShutDown) => {
                            // reactor is draining; stop accepting
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if is_per_connection_error(&err) => {
                    // the aborted connection is gone; the next one may be fine
                    debug!(cause = %err, "connection aborted during accept");
                }
                Err(err) => {
                    warn!(cause = %err, "accept failed");
                    return Err(Error::Io(err));
                }
            }
        }
    }
}

impl ReactorHooks for AcceptHooks {
    fn activate(&mut self, registry: &Registry) -> crate::Result<()> {
        for (token, listener) in self.endpoints.iter_mut() {
            registry
                .register(listener, *token, Interest::READABLE)
                .map_err(Error::Io)?;
        }
        info!(addrs = ?self.addrs, "listening");
        Ok(())
    }

    fn process_events(&mut self, events: &Events, handle: &ReactorHandle) -> crate::Result<()> {
        for event in events.iter() {
            let token = event.token();
            let Some(position) = self
                .endpoints
                .iter()
                .position(|(candidate, _)| *candidate == token)
            else {
                continue;
            };
            let (_, listener) = &mut self.endpoints[position];
            AcceptHooks::accept_ready(listener, handle)?;
        }
        Ok(())
    }

    fn cancel_requests(&mut self) -> crate::Result<()> {
        // dropping the listeners closes them; the main selector is torn
        // down right after
        self.endpoints.clear();
        Ok(())
    }
}

/// Errors scoped to the connection being accepted, not to the listener.
fn is_per_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
