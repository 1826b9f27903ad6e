//! pause - block until the process is asked to stop
//!
//! Placeholder entrypoint for containers that only need to hold a network
//! namespace or compartment open.

use std::io;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser)]
#[command(name = "pause")]
#[command(about = "Wait for a shutdown signal and exit")]
#[command(version)]
struct Cli {}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    Cli::parse();

    match wait_for_shutdown().await {
        Ok(()) => {
            eprintln!("Shutting down, got signal");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ERROR: Could not set control handler");
            tracing::debug!("signal registration failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(windows)]
async fn wait_for_shutdown() -> io::Result<()> {
    use tokio::signal::windows::{ctrl_break, ctrl_c};

    let mut interrupt = ctrl_c()?;
    let mut brk = ctrl_break()?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = brk.recv() => {}
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}
