use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use pep_proxy::{
    action::ExtractorRegistry,
    config::{ConfigError, PepConfig},
    observability,
    pipeline::{Pipeline, standard_builder},
    proxy::ProxyServer,
};

/// CLI arguments for the PEP proxy
#[derive(Parser, Debug)]
#[command(version, about = "Policy Enforcement Point reverse proxy", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the config file
    #[arg(short, long, global = true, default_value = "pep.toml")]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the proxy (default)
    Serve,
    /// Validate the configuration and print the pipeline stage order
    Check,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match PepConfig::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                args.config.display(),
                e
            );
            std::process::exit(1);
        }
    };

    match args.command.unwrap_or(Command::Serve) {
        Command::Check => run_check(&config),
        Command::Serve => run_server(config, &args.config).await,
    }
}

fn build_pipeline(config: &PepConfig) -> Result<Pipeline, ConfigError> {
    let client = config.server.http_client.build_client()?;
    let registry = ExtractorRegistry::with_builtin();
    Ok(standard_builder(config, &registry, client)?.build())
}

fn run_check(config: &PepConfig) {
    match build_pipeline(config) {
        Ok(pipeline) => {
            println!("Configuration OK");
            println!("Dialect: {}", config.pipeline.dialect);
            println!("Pipeline: {}", pipeline.stage_names().join(" -> "));
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_server(config: PepConfig, config_path: &std::path::Path) {
    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {e}");
        std::process::exit(1);
    }

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics: {e}");
    }

    tracing::info!(
        config_file = %config_path.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting PEP proxy"
    );

    let pipeline = match build_pipeline(&config) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build pipeline");
            std::process::exit(1);
        }
    };
    tracing::info!(
        dialect = %config.pipeline.dialect,
        stages = %pipeline.stage_names().join(" -> "),
        "Pipeline ready"
    );

    let handle = match ProxyServer::start(Arc::new(config), pipeline).await {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start listeners");
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    handle.stop().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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

    tracing::info!("Shutdown signal received, draining in-flight requests...");
}
