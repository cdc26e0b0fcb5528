//! imirror CLI entry point.

use clap::Parser;

use imirror_cli::commands::{dispatch, load_config, Cli};
use imirror_cli::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(cli.log_format, cli.debug, &config.paths.logs_dir) {
        eprintln!("Error: failed to initialize logging: {e}");
        std::process::exit(1);
    }

    match dispatch(cli, config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
