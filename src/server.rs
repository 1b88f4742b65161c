//! Server lifecycle.
//!
//! `init` pre-allocates the arena, the context pool and the admission
//! semaphore. `start_listening` binds a port and spawns its accept loop.
//! `clean_up_on_exit` stops every loop and releases the pooled buffers; it
//! is safe to call more than once.

use crate::config::{Config, ConfigError};
use crate::router::Router;
use crate::runtime::listener::{self, Counters, Shared};
use crate::runtime::{Admission, ArenaError, BufferArena, ContextPool};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Startup and lifecycle failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot allocate buffers: {0}")]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid listen host '{0}'")]
    InvalidHost(String),
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Point-in-time view of the server's resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub completed: u64,
    pub contexts_free: usize,
    pub contexts_in_use: usize,
    pub permits_available: usize,
}

/// Server instance
pub struct Server {
    host: IpAddr,
    backlog: i32,
    http_port: u16,
    shared: Shared,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    cleaned_up: AtomicBool,
}

impl Server {
    /// Validate `config`, then allocate the arena and pools.
    pub fn init(config: &Config, router: Router) -> Result<Self, ServerError> {
        config.validate()?;
        let host: IpAddr = config
            .host
            .parse()
            .map_err(|_| ServerError::InvalidHost(config.host.clone()))?;
        let http_port = config.http_port()?;

        let arena = BufferArena::new(
            config.max_connections,
            config.receive_buffer_size,
            config.send_buffer_size,
        )?;
        info!(
            contexts = config.max_connections,
            receive_size = arena.receive_size(),
            send_size = arena.send_size(),
            arena_bytes = arena.total_size(),
            "Buffer arena allocated"
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Server {
            host,
            backlog: config.backlog,
            http_port,
            shared: Shared {
                pool: ContextPool::new(arena),
                admission: Admission::new(config.max_connections),
                router: Arc::new(router),
                counters: Arc::new(Counters::default()),
                io_timeout: Duration::from_secs(config.io_timeout_secs),
            },
            shutdown,
            listeners: Mutex::new(Vec::new()),
            cleaned_up: AtomicBool::new(false),
        })
    }

    /// Bind `port` on the configured host and start accepting.
    ///
    /// Returns the bound address, which differs from the request for port 0.
    pub async fn start_listening(&self, port: u16) -> Result<SocketAddr, ServerError> {
        if self.cleaned_up.load(Ordering::Acquire) {
            return Err(ServerError::ShuttingDown);
        }

        let addr = SocketAddr::new(self.host, port);
        let listener = listener::bind(addr, self.backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(address = %local, "Server listening");

        let handle = tokio::spawn(listener::accept_loop(
            listener,
            self.shared.clone(),
            self.shutdown.subscribe(),
        ));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);

        Ok(local)
    }

    /// Listen on the HTTP port until `signal` resolves, then clean up.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        self.start_listening(self.http_port).await?;
        signal.await;
        info!("Shutdown requested");
        self.clean_up_on_exit().await;
        Ok(())
    }

    /// Stop all accept loops and drop the pooled contexts.
    ///
    /// Connections already in flight finish their episode; their contexts
    /// are dropped instead of pooled.
    pub async fn clean_up_on_exit(&self) {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.send_replace(true);
        self.shared.admission.close();

        let handles = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }

        let dropped = self.shared.pool.drain();
        info!(
            contexts_dropped = dropped,
            in_flight = self.shared.pool.in_use(),
            "Server cleaned up"
        );
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn admission(&self) -> &Admission {
        &self.shared.admission
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted: self.shared.counters.accepted.load(Ordering::Relaxed),
            completed: self.shared.counters.completed.load(Ordering::Relaxed),
            contexts_free: self.shared.pool.available(),
            contexts_in_use: self.shared.pool.in_use(),
            permits_available: self.shared.admission.available(),
        }
    }
}
