use bundlectl::cli::Cli;
use bundlectl::commands;
use bundlectl::UpdaterError;
use clap::Parser;
use std::process;

fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Execute command, mapping failures onto the numeric exit-code set
    if let Err(err) = commands::execute(cli) {
        eprintln!("Error: {err:#}");
        let code = err
            .downcast_ref::<UpdaterError>()
            .map(UpdaterError::code)
            .unwrap_or(27);
        process::exit(code);
    }
}
