//! Binary entry point.

use clap::Parser;
use corral::cli::Cli;
use corral::process::entry;

fn main() -> miette::Result<()> {
    // A re-executed stage takes over before anything else initializes; it
    // never returns here.
    entry::dispatch();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cli.execute()?;
    Ok(())
}
