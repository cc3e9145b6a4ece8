//! The per-request handler contract and the stock handlers.
//!
//! A [`Handler`] receives each decoded [`Request`] on the worker thread that
//! owns the connection and must eventually reply exactly once through the
//! [`ResponseWriter`]. Handlers may block: doing so stalls only the
//! connections bound to the same worker.
//!
//! Any `Fn(&Request, ResponseWriter)` closure is a handler:
//!
//! ```rust,no_run
//! use pledge::{Endpoint, Request, ResponseWriter, ServerOptions, StatusCode};
//!
//! let server = Endpoint::bind(
//!     "127.0.0.1:0",
//!     ServerOptions::default(),
//!     |req: &Request, writer: ResponseWriter| {
//!         let _ = writer.send(StatusCode::Ok, format!("you asked for {}", req.path()));
//!     },
//! )?;
//! server.serve_threaded()?;
//! # Ok::<(), pledge::ServerError>(())
//! ```

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::http::{Request, StatusCode};
use crate::promise::FailurePolicy;
use crate::server::ResponseWriter;

/// Produces the response for one request.
pub trait Handler: Send + Sync + 'static {
    /// Handles `request`, replying through `writer`.
    fn on_request(&self, request: &Request, writer: ResponseWriter);
}

impl<F> Handler for F
where
    F: Fn(&Request, ResponseWriter) + Send + Sync + 'static,
{
    fn on_request(&self, request: &Request, writer: ResponseWriter) {
        (self)(request, writer)
    }
}

const GREETING: &str = "Hello, World!";

/// Sleeps for a fixed delay, then answers `200 OK` with a greeting.
#[derive(Debug, Clone, Default)]
pub struct DelayedHandler {
    delay: Duration,
}

impl DelayedHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Handler for DelayedHandler {
    fn on_request(&self, _request: &Request, writer: ResponseWriter) {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let _ = writer.send(StatusCode::Ok, GREETING);
    }
}

/// Answers `200 OK` with a greeting, sleeping first only when the request
/// targets one specific path.
#[derive(Debug, Clone)]
pub struct SlowPathHandler {
    path: String,
    delay: Duration,
}

impl SlowPathHandler {
    pub fn new(path: impl Into<String>, delay: Duration) -> Self {
        Self {
            path: path.into(),
            delay,
        }
    }
}

impl Handler for SlowPathHandler {
    fn on_request(&self, request: &Request, writer: ResponseWriter) {
        if request.path() == self.path {
            thread::sleep(self.delay);
        }
        let _ = writer.send(StatusCode::Ok, GREETING);
    }
}

/// Serves one file for every request and logs how many bytes were sent.
///
/// Transfer failures follow the configured [`FailurePolicy`]: `Ignore` logs
/// and drops them, `Propagate` hands them to the completion promise returned
/// by [`FileHandler::serve`].
#[derive(Debug, Clone)]
pub struct FileHandler {
    path: PathBuf,
    policy: FailurePolicy,
}

impl FileHandler {
    pub fn new(path: impl Into<PathBuf>, policy: FailurePolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    /// Starts streaming the file; the promise resolves with the byte count
    /// after the transfer is logged.
    pub fn serve(&self, writer: ResponseWriter) -> crate::promise::Promise<u64> {
        let path = self.path.clone();
        writer.serve_file(&self.path).then(
            move |bytes| {
                info!(bytes = *bytes, path = %path.display(), "file sent");
                *bytes
            },
            self.policy,
        )
    }
}

impl Handler for FileHandler {
    fn on_request(&self, _request: &Request, writer: ResponseWriter) {
        let _ = self.serve(writer);
    }
}
