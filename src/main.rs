use std::path::PathBuf;

use clap::Parser;
use pruner::{
    config::PrunerConfig,
    daemon::{self, Daemon},
    lock::LockIdentity,
    observability,
};

/// CLI arguments for the pruner daemon
#[derive(Parser, Debug)]
#[command(version, about = "Retention pruner for metrics and scaling history", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the pruner (default)
    Run,
    /// Create the pruner's tables in every configured database and exit
    Migrate,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let Some(config_path) = args.config else {
        eprintln!("Error: missing required --config <path>");
        std::process::exit(1);
    };

    let config = match PrunerConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = observability::init_tracing(&config.logging) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    match args.command {
        Some(Command::Migrate) => run_migrate(&config, &config_path).await,
        Some(Command::Run) | None => run_daemon(&config, &config_path).await,
    }
}

async fn run_daemon(config: &PrunerConfig, config_path: &std::path::Path) {
    let identity = LockIdentity::generate();
    tracing::info!(
        config_file = %config_path.display(),
        identity = %identity,
        version = env!("CARGO_PKG_VERSION"),
        "Starting pruner"
    );

    let daemon = match Daemon::connect(config, identity).await {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start pruner");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match daemon.run(shutdown_signal()).await {
        Ok(()) => {
            tracing::info!("Pruner exited");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!(error = %e, "Pruner exited with failure");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_migrate(config: &PrunerConfig, config_path: &std::path::Path) {
    tracing::info!(
        config_file = %config_path.display(),
        "Running database migrations"
    );

    match daemon::migrate(config).await {
        Ok(()) => {
            tracing::info!("Database migrations completed successfully");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!(error = %e, "Database migrations failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping members");
}
