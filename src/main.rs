//! pgforge CLI — build PostgreSQL and provision primary, FDW, and replica
//! clusters.

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = pgforge::cli::Args::parse();
    if let Err(e) = pgforge::cli::dispatch(args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
