//! ministackctl - reconcile a Mac mini LLM server with its declared state
//!
//! The engine is synchronous and runs on the blocking pool; the async side
//! only waits for it and turns Ctrl-C into a stop request honored between
//! actions.

use anyhow::{Context, Result};
use clap::Parser;
use ministackctl::cli::Cli;
use ministackctl::commands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let stop = Arc::new(AtomicBool::new(false));

    let worker_stop = Arc::clone(&stop);
    let mut engine = tokio::task::spawn_blocking(move || commands::run(&cli, worker_stop));

    let code = tokio::select! {
        joined = &mut engine => joined.context("Engine task panicked")??,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, stopping after the current action");
            stop.store(true, Ordering::SeqCst);
            engine.await.context("Engine task panicked")??
        }
    };

    std::process::exit(code);
}
