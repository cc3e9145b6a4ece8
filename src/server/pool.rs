//! Fixed-size worker pool.
//!
//! Each worker is one OS thread driving its own current-thread Tokio
//! runtime. The acceptor hands every new connection to exactly one worker,
//! which owns it until it closes. Handlers run synchronously on the owning
//! worker's thread, so:
//!
//! - at most one handler runs per worker, and never more than the pool size
//!   across the server;
//! - a handler that blocks stalls only the connections bound to its worker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::ServerError;
use super::connection::Connection;
use super::options::{DispatchPolicy, ServerOptions};
use crate::handler::Handler;

/// Index of a worker within its pool.
pub type WorkerId = usize;

/// A connection on its way to a worker.
struct Assignment {
    stream: std::net::TcpStream,
    peer: SocketAddr,
}

struct Worker {
    id: WorkerId,
    sender: Mutex<Option<mpsc::UnboundedSender<Assignment>>>,
    /// Connections currently bound to this worker.
    load: Arc<AtomicUsize>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Chooses a worker for each new connection.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    policy: DispatchPolicy,
    next: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn new(policy: DispatchPolicy) -> Self {
        Self {
            policy,
            next: AtomicUsize::new(0),
        }
    }

    /// Picks an index into `loads`, which must not be empty.
    pub(crate) fn pick(&self, loads: &[usize]) -> WorkerId {
        match self.policy {
            DispatchPolicy::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % loads.len(),
            DispatchPolicy::LeastLoaded => loads
                .iter()
                .enumerate()
                .min_by_key(|&(id, load)| (*load, id))
                .map_or(0, |(id, _)| id),
        }
    }
}

/// The server's workers and the policy that feeds them.
pub struct WorkerPool {
    workers: Vec<Worker>,
    dispatcher: Dispatcher,
    /// Once set, workers stop invoking the handler for new requests.
    stopping: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `options.threads` workers, each serving requests with `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Runtime`] or [`ServerError::Spawn`] if a
    /// worker cannot be started. Workers started before the failure are
    /// shut down.
    pub fn spawn(options: &ServerOptions, handler: Arc<dyn Handler>) -> Result<Self, ServerError> {
        options.validate()?;
        let mut pool = Self {
            workers: Vec::with_capacity(options.threads),
            dispatcher: Dispatcher::new(options.dispatch),
            stopping: Arc::new(AtomicBool::new(false)),
        };
        for id in 0..options.threads {
            let stopping = Arc::clone(&pool.stopping);
            match Worker::spawn(id, Arc::clone(&handler), options.max_request_size, stopping) {
                Ok(worker) => pool.workers.push(worker),
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }
        info!(workers = options.threads, policy = ?options.dispatch, "worker pool started");
        Ok(pool)
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Open connections per worker, indexed by [`WorkerId`].
    pub fn loads(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|w| w.load.load(Ordering::SeqCst))
            .collect()
    }

    /// Binds `stream` to a worker and hands it over. The binding lasts for
    /// the connection's lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::WorkerGone`] if the chosen worker has stopped,
    /// or [`ServerError::Io`] if the socket cannot be detached from the
    /// acceptor's runtime.
    pub fn dispatch(&self, stream: TcpStream, peer: SocketAddr) -> Result<WorkerId, ServerError> {
        let id = self.dispatcher.pick(&self.loads());
        let worker = &self.workers[id];
        let stream = stream.into_std()?;

        let guard = worker.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(ServerError::WorkerGone(id));
        };
        worker.load.fetch_add(1, Ordering::SeqCst);
        if sender.send(Assignment { stream, peer }).is_err() {
            worker.load.fetch_sub(1, Ordering::SeqCst);
            return Err(ServerError::WorkerGone(id));
        }
        Ok(id)
    }

    /// Stops every worker and waits for its thread to exit. Connections still
    /// open are dropped. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for worker in &self.workers {
            worker.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        }
        for worker in &self.workers {
            let thread = worker.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    error!(worker = worker.id, "worker thread panicked");
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Worker {
    fn spawn(
        id: WorkerId,
        handler: Arc<dyn Handler>,
        max_request_size: usize,
        stopping: Arc<AtomicBool>,
    ) -> Result<Self, ServerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Assignment>();
        let load = Arc::new(AtomicUsize::new(0));
        let worker_load = Arc::clone(&load);

        let thread = thread::Builder::new()
            .name(format!("pledge-worker-{id}"))
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(Assignment { stream, peer }) = receiver.recv().await {
                        let stream = match TcpStream::from_std(stream) {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(worker = id, %peer, error = %e, "cannot register connection");
                                worker_load.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        };
                        debug!(worker = id, %peer, "connection bound");
                        let handler = Arc::clone(&handler);
                        let load = Arc::clone(&worker_load);
                        let stopping = Arc::clone(&stopping);
                        tokio::spawn(async move {
                            let conn = Connection {
                                peer,
                                worker: id,
                                handler,
                                max_request_size,
                                stopping,
                            };
                            if let Err(e) = conn.serve(stream).await {
                                warn!(worker = id, %peer, error = %e, "connection closed with error");
                            }
                            load.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                });
                debug!(worker = id, "worker stopped");
            })
            .map_err(ServerError::Spawn)?;

        Ok(Self {
            id,
            sender: Mutex::new(Some(sender)),
            load,
            thread: Mutex::new(Some(thread)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles() {
        let dispatcher = Dispatcher::new(DispatchPolicy::RoundRobin);
        let loads = [5, 0, 9];
        let picks: Vec<_> = (0..7).map(|_| dispatcher.pick(&loads)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn least_loaded_prefers_lowest_id_on_ties() {
        let dispatcher = Dispatcher::new(DispatchPolicy::LeastLoaded);
        assert_eq!(dispatcher.pick(&[3, 1, 1, 2]), 1);
        assert_eq!(dispatcher.pick(&[0, 0]), 0);
        assert_eq!(dispatcher.pick(&[4, 2, 0]), 2);
    }

    #[test]
    fn spawn_and_shutdown_idempotent() {
        let handler: Arc<dyn Handler> = Arc::new(crate::handler::DelayedHandler::default());
        let pool = WorkerPool::spawn(&ServerOptions::default().threads(2), handler).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.loads(), vec![0, 0]);
        pool.shutdown();
        pool.shutdown();
    }
}
