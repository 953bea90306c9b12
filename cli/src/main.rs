use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

const LOG_FILE_NAME: &str = "frifetch.log";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let default_filter = if cli.verbose {
        "libfrifetch=debug,frifetch=debug"
    } else {
        "libfrifetch=info,frifetch=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _guard = match &cli.log_dir {
        Some(dir) => {
            let f_appender = tracing_appender::rolling::hourly(dir, LOG_FILE_NAME);
            let (non_blk, guard) = tracing_appender::non_blocking(f_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blk)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
