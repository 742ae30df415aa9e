use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use hwtune::cli::{render_devices, render_verify, Args, Command};
use hwtune::config::Config;
use hwtune::daemon::Daemon;
use hwtune::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_level.as_deref());

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };
    let mut daemon = match Daemon::new(config) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "cannot initialize plugins");
            return ExitCode::FAILURE;
        }
    };

    match args.command() {
        Command::Run => {
            info!(config = %args.config.display(), "hwtune starting");
            daemon.run_until(shutdown_signal()).await;
            ExitCode::SUCCESS
        }
        Command::Verify { ignore_missing } => {
            let reports = daemon.verify(ignore_missing).await;
            print!("{}", render_verify(&reports));
            if reports.iter().all(|r| r.passed) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Devices { json } => {
            let devices = daemon.devices();
            if json {
                match serde_json::to_string_pretty(&devices) {
                    Ok(text) => println!("{text}"),
                    Err(e) => {
                        error!(error = %e, "cannot serialize device list");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print!("{}", render_devices(&devices));
            }
            ExitCode::SUCCESS
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
