//! The per-connection request loop, run on the worker that owns the
//! connection.
//!
//! HTTP/1.1 connections are persistent by default: we loop, reading one
//! request per iteration, until the peer closes the connection or signals
//! `Connection: close`. Requests on one connection are handled strictly one
//! after another.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use super::pool::WorkerId;
use super::writer::{Reply, ResponseWriter};
use crate::error::Error;
use crate::handler::Handler;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::promise::Promise;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// A connection bound to one worker.
pub(crate) struct Connection {
    pub(crate) peer: SocketAddr,
    pub(crate) worker: WorkerId,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) max_request_size: usize,
    /// Set when the pool shuts down; no further requests are handled.
    pub(crate) stopping: Arc<AtomicBool>,
}

impl Connection {
    pub(crate) async fn serve(self, mut stream: TcpStream) -> Result<(), Error> {
        let Connection {
            peer,
            worker,
            handler,
            max_request_size,
            stopping,
        } = self;
        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

        loop {
            let bytes_read = stream.read_buf(&mut buf).await?;

            if bytes_read == 0 {
                debug!(%peer, worker, "connection closed by peer");
                break;
            }

            if buf.len() > max_request_size {
                warn!(%peer, worker, "request too large, sending 413");
                let response = Response::new(StatusCode::PayloadTooLarge)
                    .body("Request entity too large")
                    .keep_alive(false);
                write_flush(&mut stream, &response.into_bytes()).await?;
                break;
            }

            let (mut request, body_offset) = match Request::parse(&buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => continue,
                Err(e) => {
                    warn!(%peer, worker, error = %e, "bad request, sending 400");
                    write_flush(&mut stream, &bad_request(&e)).await?;
                    break;
                }
            };

            // An unreadable length leaves the next request's start unknown.
            let content_length = match request.body_length() {
                Ok(len) => len,
                Err(e) => {
                    warn!(%peer, worker, error = %e, "bad request, sending 400");
                    write_flush(&mut stream, &bad_request(&e)).await?;
                    break;
                }
            };
            let total_needed = body_offset + content_length;
            if buf.len() < total_needed {
                continue;
            }
            request.truncate_body(content_length);
            let _ = buf.split_to(total_needed);

            if stopping.load(Ordering::SeqCst) {
                debug!(%peer, worker, "pool stopping, closing connection");
                break;
            }

            let keep_alive = request.is_keep_alive();

            debug!(
                %peer,
                worker,
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );

            let (writer, reply) = ResponseWriter::new(keep_alive);
            // Runs on the worker thread; a slow handler stalls this worker only.
            let invoked = panic::catch_unwind(AssertUnwindSafe(|| handler.on_request(&request, writer)));
            if invoked.is_err() {
                error!(%peer, worker, path = %request.path(), "handler panicked");
            }

            respond(&mut stream, reply, keep_alive).await?;

            if !keep_alive {
                debug!(%peer, worker, "Connection: close, shutting down");
                break;
            }
        }

        Ok(())
    }
}

/// Writes whatever the handler replied with.
async fn respond(
    stream: &mut TcpStream,
    reply: Promise<Reply>,
    keep_alive: bool,
) -> Result<(), Error> {
    match reply.await {
        Ok(Reply::Message { response, written }) => {
            let bytes = response.into_bytes();
            match write_flush(stream, &bytes).await {
                Ok(()) => {
                    let _ = written.resolve(bytes.len());
                    Ok(())
                }
                Err(e) => {
                    let _ = written.reject(e.clone());
                    Err(e)
                }
            }
        }
        Ok(Reply::File {
            response,
            path,
            transferred,
        }) => {
            let file = match File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open file, sending 404");
                    let _ = transferred.reject(e.into());
                    let response = Response::new(StatusCode::NotFound)
                        .body("Not Found")
                        .keep_alive(keep_alive);
                    return write_flush(stream, &response.into_bytes()).await;
                }
            };
            match stream_file(stream, file, response, &path).await {
                Ok(sent) => {
                    let _ = transferred.resolve(sent);
                    Ok(())
                }
                Err(e) => {
                    let _ = transferred.reject(e.clone());
                    Err(e)
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "handler failed, sending 500");
            let response = Response::new(StatusCode::InternalServerError)
                .body(format!("Internal Server Error: {e}"))
                .keep_alive(keep_alive);
            write_flush(stream, &response.into_bytes()).await
        }
    }
}

/// Streams `file` after the response head. Returns the body bytes sent.
async fn stream_file(
    stream: &mut TcpStream,
    file: File,
    response: Response,
    path: &Path,
) -> Result<u64, Error> {
    let len = file.metadata().await?.len();
    write_flush(stream, &response.head_bytes(len)).await?;

    let mut body = file.take(len);
    let sent = tokio::io::copy(&mut body, stream).await?;
    stream.flush().await?;

    if sent < len {
        // The file shrank underneath us; the announced length is now a lie.
        return Err(Error::Protocol(format!(
            "{} shrank while streaming: sent {sent} of {len} bytes",
            path.display()
        )));
    }
    debug!(path = %path.display(), bytes = sent, "file streamed");
    Ok(sent)
}

fn bad_request(e: &RequestError) -> BytesMut {
    Response::new(StatusCode::BadRequest)
        .body(format!("Bad Request: {e}"))
        .keep_alive(false)
        .into_bytes()
}

async fn write_flush(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), Error> {
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}
