//! HTTP/1.1 responses.
//!
//! The server builds a [`Response`] with the fluent API and serializes it
//! with [`Response::into_bytes`]; the client reads one back with
//! [`Response::parse`].

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, StatusCode};

/// Errors that can occur while parsing a response head.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing status code")]
    MissingStatus,
}

/// An HTTP/1.1 response.
///
/// # Examples
///
/// ```
/// use pledge::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    const MAX_HEADERS: usize = 64;

    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Parses a response head from `buf`.
    ///
    /// Returns the response with an empty body and the offset at which the
    /// body begins. The caller reads the body and attaches it with
    /// [`Response::with_body`].
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`] — the head has not fully arrived.
    /// - [`ResponseError::Parse`] — the data is not an HTTP/1.x response.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(ResponseError::Incomplete),
        };

        let code = raw.code.ok_or(ResponseError::MissingStatus)?;
        let status = StatusCode::from_wire(code);
        let headers = Headers::from_raw(raw.headers);
        let keep_alive = match headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => raw.version == Some(1),
        };

        Ok((
            Self {
                status,
                headers,
                body: Bytes::new(),
                keep_alive,
            },
            body_offset,
        ))
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the body bytes.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    /// Returns the body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns `true` if the peer asked to keep the connection open.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written).
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_bytes(mut self) -> BytesMut {
        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }
        let body = std::mem::take(&mut self.body);
        let mut buf = self.head_bytes(body.len() as u64);
        buf.put(body);
        buf
    }

    /// Serializes the status line and headers only, announcing a body of
    /// `content_length` bytes that the caller streams separately.
    pub fn head_bytes(mut self, content_length: u64) -> BytesMut {
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);
        self.headers.remove("content-length");

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(self.headers.to_string().as_bytes());
        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::Ok).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn no_body_no_content_type() {
        let r = Response::new(StatusCode::NoContent);
        let s = to_string(r.into_bytes());
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::Ok).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
        assert!(!s.contains("keep-alive"));
    }

    #[test]
    fn head_announces_streamed_length() {
        let r = Response::new(StatusCode::Ok).header("Content-Type", "application/octet-stream");
        let s = to_string(r.head_bytes(1024));
        assert!(s.contains("Content-Length: 1024\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn parse_head_and_offset() {
        let wire = Response::new(StatusCode::NotFound).body("gone").into_bytes();
        let (resp, offset) = Response::parse(&wire).unwrap();
        assert_eq!(resp.status(), StatusCode::NotFound);
        assert_eq!(resp.headers().content_length(), Some(4));
        assert!(resp.is_keep_alive());
        assert_eq!(&wire[offset..], b"gone");
    }

    #[test]
    fn parse_partial_head() {
        assert!(matches!(
            Response::parse(b"HTTP/1.1 200 OK\r\nContent-Le"),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn parse_unnamed_status() {
        let (resp, _) = Response::parse(b"HTTP/1.1 418 I'm a teapot\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(resp.status(), StatusCode::Other(418));
        assert_eq!(resp.status().as_u16(), 418);
    }

    #[test]
    fn unnamed_status_serializes_with_empty_reason() {
        let s = to_string(Response::new(StatusCode::Other(299)).into_bytes());
        assert!(s.starts_with("HTTP/1.1 299 \r\n"));
    }
}
