//! # Procbroker - Main Entry Point
//!
//! Entry point for the `procbroker` binary. The main function:
//! 1. Parses command-line arguments (these control logging behavior too).
//! 2. Initializes structured logging with tracing.
//! 3. Resolves `BrokerConfig` from the parsed arguments.
//! 4. Constructs the `Broker` and starts it, spawning and supervising the
//!    configured service set.
//! 5. Waits for a shutdown signal (Ctrl-C or SIGTERM) and tears the broker
//!    down cleanly.

use anyhow::Result;
use clap::Parser;
use procbroker::cli::Args;
use procbroker::config::BrokerConfig;
use procbroker::Broker;
use tracing::info;

use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments first, as they control logging behavior.
    let args = Args::parse();

    // Configure logging level based on verbosity flags.
    // This level applies to both the log file and stdout.
    // - default: INFO
    // -v: DEBUG
    // -vv and more: TRACE
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Configure the detailed log layer (file or stderr).
    // The guard must be kept alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("procbroker.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "procbroker.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // This layer sends clean, user-facing output to stdout, unless --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    // Keep the logging guard alive for the duration of the program; dropping
    // it immediately would silently stop file logging.
    let _log_guard = guard;

    info!("starting procbroker");

    let config = BrokerConfig::from_args(&args);
    let broker = Broker::new(config);

    broker.start().await?;
    info!("broker started, supervising configured service set");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    broker.shutdown().await;
    info!("procbroker shut down cleanly");

    Ok(())
}

/// Wait for either Ctrl-C or, on unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
