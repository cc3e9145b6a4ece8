//! HTTP/1.1 client whose requests complete through promises.
//!
//! [`RequestBuilder::send`] returns immediately with a
//! [`Promise<Response>`](crate::promise::Promise). Every send is an
//! independent exchange on a fresh connection, so several sends may be in
//! flight at once and may complete in any order. The client never times a
//! request out on its own; callers bound their wait with a
//! [`Barrier`](crate::promise::Barrier) and simply stop waiting when the
//! budget runs out.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use pledge::{Barrier, Client, ClientOptions, WaitOutcome, when_all};
//!
//! let client = Client::new("localhost:8080", ClientOptions::default())?;
//! let hello = client.get("/hello");
//! let all = when_all((0..3).map(|_| hello.send()));
//! match Barrier::new(&all).wait_for(Duration::from_secs(2)) {
//!     WaitOutcome::Ready(responses) => println!("{} responses", responses.len()),
//!     WaitOutcome::Failed(e) => eprintln!("request failed: {e}"),
//!     WaitOutcome::TimedOut => eprintln!("gave up waiting"),
//! }
//! client.shutdown();
//! # Ok::<(), pledge::ClientError>(())
//! ```

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::error::Error;
use crate::http::{Headers, Method, Request, Response, ResponseError};
use crate::promise::Promise;

/// Initial read buffer capacity per exchange.
const INITIAL_BUF_SIZE: usize = 4096;

/// Errors raised while constructing a [`Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid target {0:?}: expected host:port")]
    InvalidTarget(String),

    #[error("invalid client options: {0}")]
    InvalidOptions(&'static str),

    #[error("invalid client configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to build runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Options for a [`Client`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Threads driving the client's exchanges.
    pub threads: usize,
    /// Largest response (head plus body) an exchange will buffer.
    pub max_response_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            max_response_size: 8 * 1024 * 1024,
        }
    }
}

impl ClientOptions {
    /// Parses options from a JSON object; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] on malformed JSON and
    /// [`ClientError::InvalidOptions`] if the result fails validation.
    pub fn from_json(json: &str) -> Result<Self, ClientError> {
        let opts: Self = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }

    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = bytes;
        self
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.threads == 0 {
            return Err(ClientError::InvalidOptions("threads must be at least 1"));
        }
        Ok(())
    }
}

struct Shared {
    /// `host:port` of the server.
    target: String,
    max_response_size: usize,
    runtime: Mutex<Option<Runtime>>,
}

impl Shared {
    fn runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A client bound to one server.
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Creates a client for the server at `target` (`host:port`, optionally
    /// prefixed with `http://`).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidTarget`] if `target` has no port,
    /// [`ClientError::InvalidOptions`] for bad options, and
    /// [`ClientError::Runtime`] if the client's threads cannot start.
    pub fn new(target: impl AsRef<str>, options: ClientOptions) -> Result<Self, ClientError> {
        options.validate()?;
        let target = parse_target(target.as_ref())?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.threads)
            .thread_name("pledge-client")
            .enable_all()
            .build()
            .map_err(ClientError::Runtime)?;
        debug!(server = %target, threads = options.threads, "client started");

        Ok(Self {
            shared: Arc::new(Shared {
                target,
                max_response_size: options.max_response_size,
                runtime: Mutex::new(Some(runtime)),
            }),
        })
    }

    /// Returns the `host:port` this client talks to.
    pub fn target(&self) -> &str {
        &self.shared.target
    }

    /// Starts a `GET` request for `path`.
    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::Get, path)
    }

    /// Starts a `POST` request for `path`.
    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::Post, path)
    }

    /// Starts a request with any method.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        RequestBuilder {
            shared: Arc::clone(&self.shared),
            method,
            path: if path.is_empty() { "/".to_owned() } else { path.to_owned() },
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Releases the client's threads. Exchanges still in flight are
    /// abandoned: their promises never settle. Later sends are rejected with
    /// [`Error::Shutdown`]. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        let runtime = self.shared.runtime().take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            info!(server = %self.shared.target, "client shut down");
        }
    }

    /// Returns `true` once [`Client::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.runtime().is_none()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A reusable request description; each [`send`](Self::send) issues it once.
pub struct RequestBuilder {
    shared: Arc<Shared>,
    method: Method,
    path: String,
    headers: Headers,
    body: Bytes,
}

impl RequestBuilder {
    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sends the request on a new connection.
    ///
    /// The promise resolves with the complete response, or rejects with
    /// [`Error::Io`] on a transport failure, [`Error::Protocol`] on a
    /// malformed response, and [`Error::Shutdown`] if the client is shut down.
    pub fn send(&self) -> Promise<Response> {
        let runtime = self.shared.runtime();
        let Some(runtime) = runtime.as_ref() else {
            return Promise::rejected(Error::Shutdown);
        };

        let mut request = Request::new(self.method.clone(), &self.path)
            .header("Connection", "close")
            .body(self.body.clone());
        for (name, value) in self.headers.iter() {
            request = request.header(name, value);
        }
        let wire = request.into_bytes(&self.shared.target).freeze();

        let promise = Promise::new();
        let settle = promise.clone();
        let target = self.shared.target.clone();
        let max_response_size = self.shared.max_response_size;
        let method = self.method.clone();
        let path = self.path.clone();

        runtime.spawn(async move {
            match exchange(&target, &wire, max_response_size).await {
                Ok(response) => {
                    debug!(%method, %path, status = %response.status(), "response received");
                    let _ = settle.resolve(response);
                }
                Err(e) => {
                    debug!(%method, %path, error = %e, "request failed");
                    let _ = settle.reject(e);
                }
            }
        });
        promise
    }
}

/// One request/response exchange over a fresh connection.
async fn exchange(target: &str, wire: &[u8], max_response_size: usize) -> Result<Response, Error> {
    let mut stream = TcpStream::connect(target).await?;
    stream.write_all(wire).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let (head, body_offset) = loop {
        match Response::parse(&buf) {
            Ok(pair) => break pair,
            Err(ResponseError::Incomplete) => {}
            Err(e) => return Err(Error::Protocol(e.to_string())),
        }
        if buf.len() > max_response_size {
            return Err(Error::Protocol("response head too large".to_owned()));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(closed_early("before the response head"));
        }
    };

    if head
        .headers()
        .get("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    {
        return Err(Error::Protocol("chunked responses are not supported".to_owned()));
    }

    let announced = match head.headers().get("content-length") {
        Some(raw) => Some(
            raw.trim()
                .parse::<usize>()
                .map_err(|_| Error::Protocol(format!("invalid Content-Length: {raw:?}")))?,
        ),
        None => None,
    };
    let body_len = match announced {
        Some(len) => {
            if body_offset + len > max_response_size {
                return Err(Error::Protocol(format!("response body of {len} bytes is too large")));
            }
            while buf.len() < body_offset + len {
                if stream.read_buf(&mut buf).await? == 0 {
                    return Err(closed_early("mid-body"));
                }
            }
            len
        }
        // No length: the body runs until the server closes the connection.
        None => {
            while stream.read_buf(&mut buf).await? != 0 {
                if buf.len() > max_response_size {
                    return Err(Error::Protocol("response too large".to_owned()));
                }
            }
            buf.len() - body_offset
        }
    };

    let mut body = buf.split_off(body_offset);
    body.truncate(body_len);
    Ok(head.with_body(body.freeze()))
}

fn closed_early(when: &str) -> Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("connection closed {when}"),
    )
    .into()
}

fn parse_target(target: &str) -> Result<String, ClientError> {
    let authority = target.strip_prefix("http://").unwrap_or(target);
    let authority = authority.trim_end_matches('/');
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(authority.to_owned())
        }
        _ => Err(ClientError::InvalidTarget(target.to_owned())),
    }
}
