//! Server configuration.

use serde::Deserialize;

use super::ServerError;

/// How the dispatcher picks a worker for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Cycle through the workers in order.
    #[default]
    RoundRobin,
    /// Pick the worker with the fewest open connections; ties go to the
    /// lowest worker id.
    LeastLoaded,
}

/// Options for an [`Endpoint`](super::Endpoint).
///
/// Built with the chained setters or read from JSON; missing fields take
/// their defaults.
///
/// # Examples
///
/// ```
/// use pledge::server::{DispatchPolicy, ServerOptions};
///
/// let opts = ServerOptions::from_json(r#"{ "threads": 3, "dispatch": "least_loaded" }"#).unwrap();
/// assert_eq!(opts.threads, 3);
/// assert_eq!(opts.dispatch, DispatchPolicy::LeastLoaded);
/// assert!(opts.reuse_addr);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Number of worker threads. Must be at least 1.
    pub threads: usize,
    /// Set `SO_REUSEADDR` on the listening socket.
    pub reuse_addr: bool,
    /// Stop accepting connections on Ctrl-C.
    pub install_signal_handler: bool,
    /// Pending-connection queue length passed to `listen(2)`.
    pub backlog: u32,
    /// Largest request (head plus body) a connection may buffer.
    pub max_request_size: usize,
    pub dispatch: DispatchPolicy,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            reuse_addr: true,
            install_signal_handler: false,
            backlog: 1024,
            max_request_size: 8 * 1024 * 1024,
            dispatch: DispatchPolicy::RoundRobin,
        }
    }
}

impl ServerOptions {
    /// Parses options from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] on malformed JSON and
    /// [`ServerError::InvalidOptions`] if the result fails validation.
    pub fn from_json(json: &str) -> Result<Self, ServerError> {
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
    pub fn reuse_addr(mut self, reuse: bool) -> Self {
        self.reuse_addr = reuse;
        self
    }

    #[must_use]
    pub fn install_signal_handler(mut self, install: bool) -> Self {
        self.install_signal_handler = install;
        self
    }

    #[must_use]
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    #[must_use]
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    #[must_use]
    pub fn dispatch(mut self, policy: DispatchPolicy) -> Self {
        self.dispatch = policy;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ServerError> {
        if self.threads == 0 {
            return Err(ServerError::InvalidOptions("threads must be at least 1"));
        }
        if self.max_request_size == 0 {
            return Err(ServerError::InvalidOptions("max_request_size must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_single_threaded() {
        let opts = ServerOptions::default();
        assert_eq!(opts.threads, 1);
        assert_eq!(opts.dispatch, DispatchPolicy::RoundRobin);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn zero_threads_rejected() {
        let err = ServerOptions::from_json(r#"{ "threads": 0 }"#).unwrap_err();
        assert!(matches!(err, ServerError::InvalidOptions(_)));
    }

    #[test]
    fn malformed_json_rejected() {
        let err = ServerOptions::from_json("{ threads: ").unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }
}
