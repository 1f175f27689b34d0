//! repoqa CLI: ask questions against indexed documentation repositories.
//!
//! Indexes local repository checkouts into a document index and answers
//! queries through the five-step pipeline, streaming progress as it runs.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
