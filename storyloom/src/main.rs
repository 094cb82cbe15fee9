//! Headless command-line driver for storyloom.
//!
//! ```bash
//! cargo run -p storyloom -- analyze --project novel.json
//! cargo run -p storyloom -- write --project novel.json --chapter 4 \
//!     --instruction "Mara confronts Ilya at the docks" --auto-fix
//! ```

mod cli;
mod commands;

use cli::{parse_args, print_help, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match parse_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Run `storyloom help` for usage.");
            std::process::exit(2);
        }
    };

    if config.command == Command::Help {
        print_help();
        return Ok(());
    }

    if std::env::var("ANTHROPIC_API_KEY").is_err()
        && !matches!(config.command, Command::Estimate | Command::Export)
    {
        eprintln!("Warning: ANTHROPIC_API_KEY is not set; oracle calls will be skipped.");
    }

    commands::run(config).await
}
