//! The handler's half of a request: a one-shot [`ResponseWriter`].
//!
//! A handler consumes the writer with exactly one of [`ResponseWriter::send`],
//! [`ResponseWriter::serve_file`] or [`ResponseWriter::fail`]. The writer
//! settles a server-side [`Promise`] that the connection task awaits, so a
//! handler may also move the writer to another thread and reply later.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Error;
use crate::http::{Headers, Response, StatusCode};
use crate::promise::Promise;

/// What the connection task should put on the wire.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Message {
        response: Response,
        written: Promise<usize>,
    },
    File {
        response: Response,
        path: PathBuf,
        transferred: Promise<u64>,
    },
}

/// Sends the single response for one request.
///
/// Dropping a writer without replying answers `500 Internal Server Error`.
#[derive(Debug)]
pub struct ResponseWriter {
    reply: Option<Promise<Reply>>,
    headers: Headers,
    keep_alive: bool,
}

impl ResponseWriter {
    pub(crate) fn new(keep_alive: bool) -> (Self, Promise<Reply>) {
        let reply = Promise::new();
        let writer = Self {
            reply: Some(reply.clone()),
            headers: Headers::new(),
            keep_alive,
        };
        (writer, reply)
    }

    /// Adds a header to whichever response is sent.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    /// Replies with `status` and a text body.
    ///
    /// The returned promise resolves with the number of bytes written once
    /// the response is flushed, or rejects if the connection breaks.
    pub fn send(self, status: StatusCode, body: impl Into<String>) -> Promise<usize> {
        self.send_response(Response::new(status).body(body))
    }

    /// Replies with a prepared response. Headers added through
    /// [`ResponseWriter::header`] are appended to it.
    pub fn send_response(mut self, response: Response) -> Promise<usize> {
        let written = Promise::new();
        let response = self.finish(response);
        self.deliver(Reply::Message {
            response,
            written: written.clone(),
        });
        written
    }

    /// Streams the file at `path` as a `200 OK` body.
    ///
    /// The returned promise resolves with the number of body bytes
    /// transferred. If the file cannot be opened the client receives
    /// `404 Not Found` and the promise rejects.
    pub fn serve_file(mut self, path: impl AsRef<Path>) -> Promise<u64> {
        let path = path.as_ref().to_path_buf();
        if !self.headers.contains("content-type") {
            self.headers.insert("Content-Type", content_type_for(&path));
        }
        let transferred = Promise::new();
        let response = self.finish(Response::new(StatusCode::Ok));
        self.deliver(Reply::File {
            response,
            path,
            transferred: transferred.clone(),
        });
        transferred
    }

    /// Reports a handler failure; the client receives
    /// `500 Internal Server Error`.
    pub fn fail(mut self, reason: impl Into<String>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.reject(Error::Handler(reason.into()));
        }
    }

    fn finish(&mut self, mut response: Response) -> Response {
        for (name, value) in self.headers.iter() {
            response.add_header(name, value);
        }
        response.keep_alive(self.keep_alive)
    }

    fn deliver(&mut self, reply: Reply) {
        if let Some(pending) = self.reply.take() {
            let _ = pending.resolve(reply);
        }
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            warn!("response writer dropped without a reply");
            let _ = reply.reject(Error::Handler(
                "handler returned without sending a response".to_owned(),
            ));
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_settles_reply_once() {
        let (mut writer, reply) = ResponseWriter::new(true);
        writer.header("X-Trace", "1");
        let written = writer.send(StatusCode::Ok, "hi");

        match reply.peek() {
            Some(Ok(Reply::Message { response, .. })) => {
                assert_eq!(response.status(), StatusCode::Ok);
                assert_eq!(response.headers().get("x-trace"), Some("1"));
                assert_eq!(response.text(), "hi");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(!written.is_settled());
    }

    #[test]
    fn dropped_writer_rejects() {
        let (writer, reply) = ResponseWriter::new(true);
        drop(writer);
        assert!(matches!(reply.peek(), Some(Err(Error::Handler(_)))));
    }

    #[test]
    fn fail_rejects_with_reason() {
        let (writer, reply) = ResponseWriter::new(false);
        writer.fail("database offline");
        assert!(matches!(reply.peek(), Some(Err(Error::Handler(m))) if m == "database offline"));
    }

    #[test]
    fn file_content_type_from_extension() {
        let (writer, reply) = ResponseWriter::new(true);
        let _ = writer.serve_file("/srv/site/index.HTML");
        match reply.peek() {
            Some(Ok(Reply::File { response, path, .. })) => {
                assert_eq!(path, PathBuf::from("/srv/site/index.HTML"));
                assert_eq!(
                    response.headers().get("content-type"),
                    Some("text/html; charset=utf-8")
                );
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }
}
