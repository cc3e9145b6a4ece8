//! Runs a five-worker server with one slow page, then fires one slow and
//! four fast requests at it and reports what came back in time. Least-loaded
//! dispatch keeps the fast connections off the worker busy with the slow one.
//!
//! ```text
//! RUST_LOG=pledge=debug cargo run --example slow_server
//! ```

use std::time::Duration;

use pledge::handler::SlowPathHandler;
use pledge::server::DispatchPolicy;
use pledge::{
    Barrier, Client, ClientOptions, Endpoint, FailurePolicy, Promise, Response, ServerOptions,
    WaitOutcome, when_all,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slow_server=info,pledge=info")),
        )
        .init();

    let server = Endpoint::bind(
        "localhost:0",
        ServerOptions::default()
            .threads(5)
            .dispatch(DispatchPolicy::LeastLoaded)
            .install_signal_handler(true),
        SlowPathHandler::new("/specialpage", Duration::from_secs(3)),
    )?;
    server.serve_threaded()?;

    let client = Client::new(format!("localhost:{}", server.port()), ClientOptions::default())?;

    let slow = client.get("/specialpage").send();
    let fast: Vec<Promise<Response>> = (0..4).map(|_| client.get("/").send()).collect();
    for response in &fast {
        let _ = response.then(
            |resp| info!(status = %resp.status(), body = %resp.text(), "fast page"),
            FailurePolicy::Ignore,
        );
    }

    match Barrier::new(&when_all(fast)).wait_for(Duration::from_secs(2)) {
        WaitOutcome::Ready(responses) => info!(count = responses.len(), "fast pages done"),
        WaitOutcome::Failed(e) => info!(error = %e, "fast pages failed"),
        WaitOutcome::TimedOut => info!("fast pages timed out"),
    }

    // The slow page needs 3s; give up on it after one.
    let outcome = Barrier::new(&slow).wait_for(Duration::from_secs(1));
    info!(timed_out = outcome.is_timed_out(), "slow page");

    client.shutdown();
    server.shutdown();
    Ok(())
}
