//! Multi-threaded HTTP/1.1 endpoint.
//!
//! An [`Endpoint`] binds a listening socket, then serves it with one acceptor
//! thread and a fixed [`WorkerPool`]. The acceptor binds each connection to a
//! worker; the worker runs the endpoint's [`Handler`] for every request on
//! that connection.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::handler::Handler;

mod connection;
pub mod options;
pub mod pool;
pub(crate) mod writer;

pub use options::{DispatchPolicy, ServerOptions};
pub use pool::{WorkerId, WorkerPool};
pub use writer::ResponseWriter;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} did not resolve to any address")]
    Resolve(String),

    #[error("invalid server options: {0}")]
    InvalidOptions(&'static str),

    #[error("invalid server configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("endpoint is already serving or has been shut down")]
    NotBound,

    #[error("worker {0} is no longer accepting connections")]
    WorkerGone(WorkerId),
}

enum State {
    Bound {
        runtime: Runtime,
        listener: TcpListener,
    },
    Serving {
        pool: Arc<WorkerPool>,
        acceptor: Option<JoinHandle<()>>,
    },
    Stopped,
}

/// An HTTP server bound to one address, with one handler.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use pledge::{Endpoint, ServerOptions};
/// use pledge::handler::DelayedHandler;
///
/// let server = Endpoint::bind(
///     "localhost:0",
///     ServerOptions::default().threads(3),
///     DelayedHandler::new(Duration::ZERO),
/// )?;
/// println!("listening on port {}", server.port());
/// server.serve_threaded()?;
/// // ...
/// server.shutdown();
/// # Ok::<(), pledge::ServerError>(())
/// ```
pub struct Endpoint {
    local_addr: SocketAddr,
    options: ServerOptions,
    handler: Arc<dyn Handler>,
    shutdown: watch::Sender<bool>,
    state: Mutex<State>,
}

impl Endpoint {
    /// Binds a listening socket on `addr`. Port 0 picks an ephemeral port;
    /// read it back with [`Endpoint::port`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidOptions`] for bad options,
    /// [`ServerError::Resolve`] if `addr` names no address, and
    /// [`ServerError::Bind`] if the socket cannot be bound.
    pub fn bind<H: Handler>(
        addr: impl AsRef<str>,
        options: ServerOptions,
        handler: H,
    ) -> Result<Self, ServerError> {
        options.validate()?;
        let addr = addr.as_ref();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;
        let listener = runtime.block_on(listen(addr, &options))?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, threads = options.threads, "endpoint bound");

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            local_addr,
            options,
            handler: Arc::new(handler),
            shutdown,
            state: Mutex::new(State::Bound { runtime, listener }),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Starts the worker pool and an acceptor thread, then returns.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotBound`] if the endpoint is already serving or
    /// was shut down, or a spawn error if a thread cannot be started.
    pub fn serve_threaded(&self) -> Result<(), ServerError> {
        let (runtime, acceptor) = self.start()?;
        let thread = thread::Builder::new()
            .name("pledge-acceptor".to_owned())
            .spawn(move || runtime.block_on(acceptor.run()))
            .map_err(ServerError::Spawn)?;

        if let State::Serving { acceptor, .. } = &mut *self.lock() {
            *acceptor = Some(thread);
        }
        Ok(())
    }

    /// Starts the worker pool and accepts connections on the calling thread
    /// until [`Endpoint::shutdown`] is called (or Ctrl-C, if the signal
    /// handler is installed).
    ///
    /// # Errors
    ///
    /// As [`Endpoint::serve_threaded`].
    pub fn serve(&self) -> Result<(), ServerError> {
        let (runtime, acceptor) = self.start()?;
        runtime.block_on(acceptor.run());
        Ok(())
    }

    /// Stops accepting, stops the workers and waits for their threads.
    /// Calling this more than once is harmless.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let previous = mem::replace(&mut *self.lock(), State::Stopped);
        if let State::Serving { pool, acceptor } = previous {
            if let Some(acceptor) = acceptor {
                if acceptor.join().is_err() {
                    error!("acceptor thread panicked");
                }
            }
            pool.shutdown();
            info!(address = %self.local_addr, "endpoint shut down");
        }
    }

    fn start(&self) -> Result<(Runtime, Acceptor), ServerError> {
        let mut state = self.lock();
        let (runtime, listener) = match mem::replace(&mut *state, State::Stopped) {
            State::Bound { runtime, listener } => (runtime, listener),
            other => {
                *state = other;
                return Err(ServerError::NotBound);
            }
        };

        let pool = Arc::new(WorkerPool::spawn(&self.options, Arc::clone(&self.handler))?);
        *state = State::Serving {
            pool: Arc::clone(&pool),
            acceptor: None,
        };
        info!(address = %self.local_addr, "endpoint serving");

        Ok((
            runtime,
            Acceptor {
                listener,
                pool,
                shutdown: self.shutdown.subscribe(),
                install_signal_handler: self.options.install_signal_handler,
            },
        ))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolves `addr` (preferring IPv4) and opens a listening socket.
async fn listen(addr: &str, options: &ServerOptions) -> Result<TcpListener, ServerError> {
    let bind_err = |source| ServerError::Bind {
        addr: addr.to_owned(),
        source,
    };

    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr).await.map_err(bind_err)?.collect();
    let socket_addr = candidates
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| ServerError::Resolve(addr.to_owned()))?;

    let socket = if socket_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(options.reuse_addr).map_err(bind_err)?;
    socket.bind(socket_addr).map_err(bind_err)?;
    socket.listen(options.backlog).map_err(bind_err)
}

/// Accept loop: binds every connection to a worker.
struct Acceptor {
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    shutdown: watch::Receiver<bool>,
    install_signal_handler: bool,
}

impl Acceptor {
    async fn run(self) {
        let Acceptor {
            listener,
            pool,
            mut shutdown,
            install_signal_handler,
        } = self;

        let interrupted = async move {
            if install_signal_handler {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => return,
                    Err(e) => warn!(error = %e, "cannot install Ctrl-C handler"),
                }
            }
            std::future::pending::<()>().await
        };
        tokio::pin!(interrupted);

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                () = &mut interrupted => {
                    info!("interrupt received, stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => match pool.dispatch(stream, peer) {
                        Ok(worker) => debug!(%peer, worker, "connection accepted"),
                        Err(e) => warn!(%peer, error = %e, "dropping connection"),
                    },
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
            }
        }

        drop(listener);
        pool.shutdown();
    }
}
