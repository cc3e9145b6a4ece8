//! HTTP/1.1 requests: parsed on the server with [`httparse`], built and
//! serialized on the client.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),
}

/// An HTTP/1.1 request.
///
/// On the server it is created by [`Request::parse`] from a raw byte buffer;
/// on the client by [`Request::new`] and serialized with
/// [`Request::into_bytes`].
///
/// # Examples
///
/// ```
/// use pledge::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.resource(), "/hello?name=world");
/// assert_eq!(request.query_string(), Some("name=world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Creates an HTTP/1.1 request for `target` (path plus optional query).
    pub fn new(method: Method, target: &str) -> Self {
        let target = if target.starts_with('/') {
            target.to_owned()
        } else {
            format!("/{target}")
        };
        let (path, query) = split_target(&target);
        Self {
            method,
            path,
            version: 1,
            headers: Headers::new(),
            query,
            body: Bytes::new(),
        }
    }

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator).
    /// The body holds whatever follows the head in `buf`; callers wait for
    /// `Content-Length` bytes and then call [`Request::truncate_body`].
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — more data is needed to complete the request headers.
    /// - [`RequestError::Parse`] — the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`] — a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req.method {
            Some(m) => m.parse::<Method>().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let (path, query) = split_target(raw_path);

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        Ok((
            Self {
                method,
                path,
                version,
                headers: Headers::from_raw(raw_req.headers),
                query,
                body: Bytes::copy_from_slice(&buf[body_offset..]),
            },
            body_offset,
        ))
    }

    /// Appends a header.
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

    /// Drops any bytes past the first `len` of the body, such as the start of
    /// a following request on the same connection.
    pub(crate) fn truncate_body(&mut self, len: usize) {
        self.body.truncate(len);
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the requested resource: the path plus `?query` when present.
    pub fn resource(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{q}", self.path),
            None => self.path.clone(),
        }
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the request body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the number of body bytes the request announces: 0 without a
    /// `Content-Length`, otherwise its value.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidContentLength`] if the header does not
    /// parse, or if repeated headers disagree. The body boundary is then
    /// unknown and the connection cannot be read any further.
    pub fn body_length(&self) -> Result<usize, RequestError> {
        let mut announced = None;
        for raw in self.headers.get_all("content-length") {
            let len = raw
                .trim()
                .parse::<usize>()
                .map_err(|_| RequestError::InvalidContentLength(raw.to_owned()))?;
            if announced.is_some_and(|prev| prev != len) {
                return Err(RequestError::InvalidContentLength(raw.to_owned()));
            }
            announced = Some(len);
        }
        Ok(announced.unwrap_or(0))
    }

    /// Serializes the request for `host` in HTTP/1.1 wire format.
    ///
    /// Adds `Host` and `Content-Length` unless already set.
    pub fn into_bytes(self, host: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64 + self.body.len());

        buf.put(format!("{} {} HTTP/1.{}\r\n", self.method, self.resource(), self.version).as_bytes());
        if !self.headers.contains("host") {
            buf.put(format!("Host: {host}\r\n").as_bytes());
        }
        buf.put(self.headers.to_string().as_bytes());
        if !self.headers.contains("content-length") {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put(&b"\r\n"[..]);
        buf.put(self.body);
        buf
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn query_kept_apart_from_path() {
        let raw = b"GET /search?q=rust&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust&page=2"));
        assert_eq!(req.resource(), "/search?q=rust&page=2");
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn connection_close() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn http10_defaults_to_close() {
        let raw = b"GET / HTTP/1.0\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn body_truncated_to_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET / HTTP/1.1\r\n";
        let (mut req, body_offset) = Request::parse(raw).unwrap();
        assert_eq!(req.body_length().unwrap(), 5);
        assert_eq!(&raw[body_offset..body_offset + 5], b"hello");
        req.truncate_body(5);
        assert_eq!(req.body_bytes().as_ref(), b"hello");
    }

    #[test]
    fn body_length_rejects_malformed_header() {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.body_length().unwrap(), 0);

        let (req, _) = Request::parse(b"POST / HTTP/1.1\r\nContent-Length: 3x\r\n\r\nabc").unwrap();
        assert!(matches!(req.body_length(), Err(RequestError::InvalidContentLength(v)) if v == "3x"));

        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabcd";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(matches!(req.body_length(), Err(RequestError::InvalidContentLength(_))));

        let raw = b"POST / HTTP/1.1\r\nContent-Length: 4\r\nContent-Length: 4\r\n\r\nabcd";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.body_length().unwrap(), 4);
    }

    #[test]
    fn serialized_request_parses_back() {
        let wire = Request::new(Method::Post, "submit?x=1")
            .header("Connection", "close")
            .body("payload")
            .into_bytes("localhost:8080");

        let (req, offset) = Request::parse(&wire).unwrap();
        assert_eq!(req.method(), &Method::Post);
        assert_eq!(req.resource(), "/submit?x=1");
        assert_eq!(req.headers().get("host"), Some("localhost:8080"));
        assert_eq!(req.body_length().unwrap(), 7);
        assert!(!req.is_keep_alive());
        assert_eq!(&wire[offset..], b"payload");
    }
}
