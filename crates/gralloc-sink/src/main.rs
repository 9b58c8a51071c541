//! gralloc-sink
//!
//! Stand-in for the display process: listens on the frame endpoint, accepts
//! one frame per connection, logs what it received and acknowledges it.

use anyhow::{Context, Result, bail};
use gralloc_ipc::{FrameSink, IpcError, endpoint_path};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Args {
    endpoint: PathBuf,
    /// Receive frames but never reply, to exercise client timeouts
    silent: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        endpoint: endpoint_path(),
        silent: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--endpoint" | "-e" => {
                args.endpoint = iter.next().context("--endpoint needs a path")?.into();
            }
            "--silent" => args.silent = true,
            "--help" | "-h" => {
                println!("usage: gralloc-sink [--endpoint PATH] [--silent]");
                std::process::exit(0);
            }
            other => bail!("unknown argument {:?}", other),
        }
    }
    Ok(args)
}

/// Accept frames until the listener fails
fn serve(sink: FrameSink, silent: bool) -> Result<()> {
    let mut frames: u64 = 0;
    loop {
        let frame = match sink.accept_frame() {
            Ok(frame) => frame,
            Err(IpcError::MissingDescriptor) => {
                warn!("Frame request without a descriptor, dropping connection");
                continue;
            }
            Err(e @ (IpcError::TimedOut | IpcError::Closed)) => {
                debug!("Client gave up before sending: {}", e);
                continue;
            }
            Err(e) => return Err(e).context("Failed to accept frame"),
        };

        frames += 1;
        let size = File::from(frame.fd().try_clone_to_owned()?)
            .metadata()
            .map(|meta| meta.len())
            .unwrap_or(0);
        info!("Frame {}: {} bytes", frames, size);

        if silent {
            drop(frame);
            continue;
        }
        if let Err(e) = frame.ack() {
            warn!("Failed to acknowledge frame {}: {}", frames, e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gralloc_sink=info,gralloc_ipc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    let sink = FrameSink::bind(&args.endpoint)
        .with_context(|| format!("Failed to bind {:?}", args.endpoint))?
        .with_request_timeout(Duration::from_secs(5));
    info!("Starting frame sink on {:?}", sink.path());

    // accept() blocks, so the loop gets its own thread; it is abandoned on shutdown
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let silent = args.silent;
    std::thread::Builder::new()
        .name("frame-sink".into())
        .spawn(move || {
            let _ = done_tx.send(serve(sink, silent));
        })
        .context("Failed to spawn sink thread")?;

    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            Ok(())
        }
        served = done_rx => served.unwrap_or_else(|_| bail!("sink thread exited unexpectedly")),
    };

    let _ = std::fs::remove_file(&args.endpoint);
    if let Err(e) = &result {
        error!("Frame sink failed: {:#}", e);
    }
    result
}
