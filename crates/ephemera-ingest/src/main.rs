#![warn(missing_docs)]

//! Ephemera ingestion tool

use anyhow::Result;
use clap::Parser;
use ephemera_ingest::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "eph-ingest starting");
    cli.run().await
}
