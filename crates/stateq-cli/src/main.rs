#![warn(missing_docs)]

//! `stateq`: query Terraform and OpenTofu state wherever it is stored.

mod cli;
mod rootdir;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_env("STATEQ_LOG").unwrap_or_else(|_| EnvFilter::new("error")))
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling in-flight requests");
            on_interrupt.cancel();
        }
    });

    cli.run(cancel).await
}
