//! sift - dataset curation engine
//!
//! Usage:
//!   sift dataset create local docs items.json   Create a dataset
//!   sift dataset select local docs --limit 10   Stream rows as JSON
//!   sift signal local docs pii text             Run a signal
//!   sift embed local docs hash128 text          Compute embeddings
//!   sift concept train local spam hash128       Train a concept
//!   sift --help                                 Show all commands

use anyhow::Result;
use clap::Parser;

use sift::cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("sift=info".parse()?),
        )
        .init();

    execute(cli).await?;
    Ok(())
}
