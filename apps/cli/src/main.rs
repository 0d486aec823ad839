//! Shelfscrape CLI — e-commerce product extraction pipeline.
//!
//! Discovers category pages on a storefront, derives per-domain extraction
//! schemas, and persists the extracted products.

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
