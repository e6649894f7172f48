//! dockhandctl - issue commands to dockhand agents

use clap::Parser;
use dockhand_cli::cli::Cli;
use dockhand_cli::{commands, output};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    if let Err(e) = cli.run().await {
        if json {
            match output::format_error(&format!("{e:#}"), &commands::error_code(&e)) {
                Ok(body) => println!("{body}"),
                Err(_) => eprintln!("Error: {e:#}"),
            }
        } else {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(commands::exit_code(&e));
    }
}
