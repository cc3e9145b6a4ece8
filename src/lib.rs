//! # pledge
//!
//! An embeddable HTTP/1.1 client/server engine built around promise-style
//! completion, with explicit "abandon, don't cancel" timeouts.
//!
//! - [`promise`]: single-assignment [`Promise`]s with chained continuations,
//!   the [`when_all`] / [`when_any`] combinators and the deadline-bound
//!   [`Barrier`].
//! - [`server`]: an [`Endpoint`] that binds every connection to one worker of
//!   a fixed pool, so a slow [`Handler`] only stalls its own worker.
//! - [`client`]: a [`Client`] whose sends return `Promise<Response>`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use pledge::{Barrier, Client, ClientOptions, Endpoint, ServerOptions, WaitOutcome};
//! use pledge::handler::DelayedHandler;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Endpoint::bind(
//!     "localhost:0",
//!     ServerOptions::default().threads(2),
//!     DelayedHandler::new(Duration::ZERO),
//! )?;
//! server.serve_threaded()?;
//!
//! let client = Client::new(format!("localhost:{}", server.port()), ClientOptions::default())?;
//! let response = client.get("/").send();
//! if let WaitOutcome::Ready(resp) = Barrier::new(&response).wait_for(Duration::from_secs(2)) {
//!     println!("{}: {}", resp.status(), resp.text());
//! }
//!
//! client.shutdown();
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod handler;
pub mod http;
pub mod promise;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use client::{Client, ClientError, ClientOptions, RequestBuilder};
pub use error::{AlreadySettled, Error};
pub use handler::Handler;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use promise::{Barrier, FailurePolicy, Promise, WaitOutcome, when_all, when_any};
pub use server::{Endpoint, ResponseWriter, ServerError, ServerOptions};
