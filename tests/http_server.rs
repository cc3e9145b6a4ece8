//! End-to-end tests: a real endpoint on an ephemeral port, driven by the
//! promise-based client with bounded waits.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use pledge::handler::{DelayedHandler, FileHandler, SlowPathHandler};
use pledge::server::DispatchPolicy;
use pledge::{
    Barrier, Client, ClientOptions, Endpoint, FailurePolicy, Handler, Promise, Request, Response,
    ResponseWriter, ServerError, ServerOptions, StatusCode, WaitOutcome, when_all,
};
use tracing_subscriber::EnvFilter;

const SPECIAL_PAGE: &str = "/specialpage";
const SLOW: Duration = Duration::from_secs(3);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start_server<H: Handler>(options: ServerOptions, handler: H) -> Endpoint {
    init_tracing();
    let server = Endpoint::bind("localhost:0", options, handler).expect("bind");
    server.serve_threaded().expect("serve");
    server
}

fn address(server: &Endpoint) -> String {
    format!("localhost:{}", server.port())
}

/// Sends `requests` GETs for `page`, waits at most `budget` for all of them,
/// and returns how many came back `200 OK` in that time.
fn client_logic(requests: usize, server: &str, page: &str, budget: Duration) -> usize {
    let client = Client::new(server, ClientOptions::default()).expect("client");
    let rb = client.get(page);
    let counter = Arc::new(AtomicUsize::new(0));

    let responses: Vec<Promise<Response>> = (0..requests)
        .map(|_| {
            let response = rb.send();
            let counter = Arc::clone(&counter);
            let _ = response.then(
                move |resp| {
                    if resp.status() == StatusCode::Ok {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                },
                FailurePolicy::Ignore,
            );
            response
        })
        .collect();

    let all = when_all(responses);
    let _ = Barrier::new(&all).wait_for(budget);

    client.shutdown();
    counter.load(Ordering::SeqCst)
}

#[test]
fn client_disconnection_on_timeout_from_single_threaded_server() {
    let server = start_server(ServerOptions::default(), DelayedHandler::new(SLOW));

    let counter = client_logic(1, &address(&server), "/", Duration::from_secs(2));

    server.shutdown();
    assert_eq!(counter, 0);
}

#[test]
fn client_multiple_requests_disconnection_on_timeout_from_single_threaded_server() {
    let server = start_server(ServerOptions::default(), DelayedHandler::new(SLOW));

    let counter = client_logic(3, &address(&server), "/", Duration::from_secs(2));

    server.shutdown();
    assert_eq!(counter, 0);
}

#[test]
fn multiple_clients_with_requests_to_multithreaded_server() {
    let server = start_server(
        ServerOptions::default().threads(3),
        DelayedHandler::new(Duration::ZERO),
    );
    let addr = address(&server);

    let first = {
        let addr = addr.clone();
        thread::spawn(move || client_logic(4, &addr, "/", Duration::from_secs(6)))
    };
    let second = thread::spawn(move || client_logic(5, &addr, "/", Duration::from_secs(6)));

    let res1 = first.join().unwrap();
    let res2 = second.join().unwrap();

    server.shutdown();
    assert_eq!(res1, 4);
    assert_eq!(res2, 5);
}

#[test]
fn multiple_clients_with_different_requests_to_multithreaded_server() {
    let server = start_server(
        ServerOptions::default().threads(3),
        SlowPathHandler::new(SPECIAL_PAGE, SLOW),
    );
    let addr = address(&server);

    let slow = {
        let addr = addr.clone();
        thread::spawn(move || client_logic(1, &addr, SPECIAL_PAGE, Duration::from_secs(1)))
    };
    let fast = thread::spawn(move || client_logic(2, &addr, "/", Duration::from_secs(6)));

    let res1 = slow.join().unwrap();
    let res2 = fast.join().unwrap();

    server.shutdown();
    assert_eq!(res1, 0);
    assert_eq!(res2, 2);
}

#[test]
fn server_with_static_file() {
    let data = "Hello, World!";
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(data.as_bytes()).unwrap();
    file.flush().unwrap();

    let server = start_server(
        ServerOptions::default(),
        FileHandler::new(file.path(), FailurePolicy::Ignore),
    );

    let client = Client::new(address(&server), ClientOptions::default()).unwrap();
    let response = client.get("/").send();
    let result = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);
    let _ = response.then(
        move |resp| {
            if resp.status() == StatusCode::Ok {
                *slot.lock().unwrap() = Some(resp.body_bytes().clone());
            }
        },
        FailurePolicy::Propagate,
    );

    let _ = Barrier::new(&response).wait_for(Duration::from_secs(2));

    client.shutdown();
    server.shutdown();

    let body = result.lock().unwrap().take().expect("no response body");
    assert_eq!(body.as_ref(), data.as_bytes());
}

#[test]
fn missing_file_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(
        ServerOptions::default(),
        FileHandler::new(dir.path().join("absent.txt"), FailurePolicy::Ignore),
    );

    let client = Client::new(address(&server), ClientOptions::default()).unwrap();
    let response = client.get("/").send();
    let outcome = Barrier::new(&response).wait_for(Duration::from_secs(2));

    client.shutdown();
    server.shutdown();
    match outcome {
        WaitOutcome::Ready(resp) => assert_eq!(resp.status(), StatusCode::NotFound),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn concurrent_handlers_never_exceed_pool_size() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        move |_req: &Request, writer: ResponseWriter| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            running.fetch_sub(1, Ordering::SeqCst);
            let _ = writer.send(StatusCode::Ok, "done");
        }
    };
    let server = start_server(ServerOptions::default().threads(2), handler);

    let ok = client_logic(6, &address(&server), "/", Duration::from_secs(5));

    server.shutdown();
    assert_eq!(ok, 6);
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
}

#[test]
fn handler_failures_answer_500() {
    let handler = |req: &Request, writer: ResponseWriter| {
        if req.path() == "/fail" {
            writer.fail("backend unavailable");
        }
        // Any other path drops the writer without replying.
    };
    let server = start_server(
        ServerOptions::default().dispatch(DispatchPolicy::LeastLoaded),
        handler,
    );

    let client = Client::new(address(&server), ClientOptions::default()).unwrap();
    let all = when_all([client.get("/fail").send(), client.get("/silent").send()]);
    let outcome = Barrier::new(&all).wait_for(Duration::from_secs(2));

    client.shutdown();
    server.shutdown();
    match outcome {
        WaitOutcome::Ready(responses) => {
            assert_eq!(responses[0].status(), StatusCode::InternalServerError);
            assert!(responses[0].text().contains("backend unavailable"));
            assert_eq!(responses[1].status(), StatusCode::InternalServerError);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn request_body_reaches_handler() {
    let handler = |req: &Request, writer: ResponseWriter| {
        let body = String::from_utf8_lossy(req.body_bytes()).into_owned();
        let _ = writer.send(StatusCode::Ok, body.to_uppercase());
    };
    let server = start_server(ServerOptions::default(), handler);

    let client = Client::new(address(&server), ClientOptions::default()).unwrap();
    let response = client.post("/shout").body("quiet please").send();
    let outcome = Barrier::new(&response).wait_for(Duration::from_secs(2));

    client.shutdown();
    server.shutdown();
    match outcome {
        WaitOutcome::Ready(resp) => assert_eq!(resp.text(), "QUIET PLEASE"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn malformed_content_length_closes_without_handling() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        move |req: &Request, writer: ResponseWriter| {
            seen.lock().unwrap().push(req.path().to_owned());
            let _ = writer.send(StatusCode::Ok, "handled");
        }
    };
    let server = start_server(ServerOptions::default(), handler);

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
        .write_all(
            b"POST /a HTTP/1.1\r\nHost: localhost\r\nContent-Length: 3x\r\n\r\n\
              GET /hidden HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .unwrap();
    let mut reply = Vec::new();
    let _ = stream.read_to_end(&mut reply);

    drop(stream);
    server.shutdown();
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got {reply:?}");
    assert_eq!(reply.matches("HTTP/1.1").count(), 1, "got {reply:?}");
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn keep_alive_serves_sequential_requests_on_one_connection() {
    let server = start_server(ServerOptions::default(), DelayedHandler::new(Duration::ZERO));
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    for _ in 0..2 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        let response = loop {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed a keep-alive connection");
            buf.extend_from_slice(&chunk[..n]);
            if let Ok((head, offset)) = Response::parse(&buf) {
                let len = head.headers().content_length().unwrap();
                if buf.len() >= offset + len {
                    break head.with_body(buf[offset..offset + len].to_vec());
                }
            }
        };
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.text(), "Hello, World!");
        assert!(response.is_keep_alive());
    }

    drop(stream);
    server.shutdown();
}

#[test]
fn endpoint_lifecycle() {
    let server = start_server(ServerOptions::default(), DelayedHandler::default());
    assert_ne!(server.port(), 0);
    assert!(matches!(server.serve_threaded(), Err(ServerError::NotBound)));
    server.shutdown();
    server.shutdown();
    assert!(matches!(server.serve_threaded(), Err(ServerError::NotBound)));

    let err = Endpoint::bind("localhost:0", ServerOptions::default().threads(0), DelayedHandler::default());
    assert!(matches!(err, Err(ServerError::InvalidOptions(_))));
}
