//! Listener and accept loop.
//!
//! ```text
//! Listening -> AcceptPending -> AcceptCompleted -> Listening
//!                            \-> AcceptFailed   -> Listening
//! ```
//!
//! A permit is acquired before each accept. On completion the connection
//! gets a context from the pool and is handed to its own task, and the loop
//! goes straight back to accepting. The loop only stops on shutdown.

use crate::router::Router;
use crate::runtime::admission::{Admission, AdmissionPermit};
use crate::runtime::connection;
use crate::runtime::context::ContextPool;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

/// Accept loop phases. The permit travels with the state that owns it.
#[derive(Debug)]
enum ListenerState {
    Listening,
    AcceptPending(AdmissionPermit),
    AcceptCompleted(AdmissionPermit, TcpStream, SocketAddr),
    AcceptFailed(AdmissionPermit, io::Error),
    Stopped,
}

/// Connection counters shared by all accept loops of a server.
#[derive(Debug, Default)]
pub struct Counters {
    pub accepted: AtomicU64,
    pub completed: AtomicU64,
}

/// Everything an accept loop needs.
#[derive(Clone)]
pub struct Shared {
    pub pool: Arc<ContextPool>,
    pub admission: Admission,
    pub router: Arc<Router>,
    pub counters: Arc<Counters>,
    pub io_timeout: Duration,
}

/// Bind a non-blocking listening socket.
pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Accept connections until `shutdown` flips to `true`.
pub async fn accept_loop(listener: TcpListener, shared: Shared, mut shutdown: watch::Receiver<bool>) {
    let local = listener.local_addr().ok();
    let mut state = ListenerState::Listening;

    loop {
        state = match state {
            ListenerState::Listening => {
                if *shutdown.borrow() {
                    ListenerState::Stopped
                } else {
                    tokio::select! {
                        _ = shutdown.changed() => ListenerState::Stopped,
                        permit = shared.admission.acquire() => match permit {
                            Ok(permit) => ListenerState::AcceptPending(permit),
                            Err(_) => ListenerState::Stopped,
                        },
                    }
                }
            }

            ListenerState::AcceptPending(permit) => {
                tokio::select! {
                    _ = shutdown.changed() => ListenerState::Stopped,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => ListenerState::AcceptCompleted(permit, stream, peer),
                        Err(e) => ListenerState::AcceptFailed(permit, e),
                    },
                }
            }

            ListenerState::AcceptCompleted(permit, stream, peer) => {
                shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
                spawn_connection(&shared, permit, stream, peer);
                ListenerState::Listening
            }

            ListenerState::AcceptFailed(permit, e) => {
                error!(error = %e, "Failed to accept connection");
                drop(permit);
                ListenerState::Listening
            }

            ListenerState::Stopped => {
                info!(address = ?local, "Listener stopped");
                return;
            }
        };
    }
}

fn spawn_connection(shared: &Shared, permit: AdmissionPermit, mut stream: TcpStream, peer: SocketAddr) {
    let shared = shared.clone();
    let mut ctx = shared.pool.pop();
    debug!(peer = %peer, context = ctx.id(), "Accepted connection");

    tokio::spawn(async move {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "Failed to set TCP_NODELAY");
        }

        let outcome = connection::serve(&mut stream, &mut ctx, &shared.router, shared.io_timeout).await;
        drop(stream);
        debug!(
            peer = %peer,
            context = ctx.id(),
            responded = outcome.responded,
            sends = outcome.sends,
            bytes = outcome.bytes_sent,
            "Connection closed"
        );

        let returned = shared.pool.push(ctx);
        shared.counters.completed.fetch_add(1, Ordering::Relaxed);
        permit.release(returned);
    });
}
