//! Ferrogate - CLI entry point

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use ferrogate::{Config, Gateway, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable overriding the log level (debug|info|warn|error)
const LOG_LEVEL_ENV: &str = "FERROGATE_LOG_LEVEL";

#[derive(Parser, Debug)]
#[command(name = "ferrogate")]
#[command(version = VERSION)]
#[command(about = "Adaptive-scoring HTTP reverse-proxy load balancer")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.toml")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("ferrogate-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn log_level_from_env() -> &'static str {
    match std::env::var(LOG_LEVEL_ENV).unwrap_or_default().trim().to_lowercase().as_str() {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("ferrogate={}", log_level_from_env()).parse()?),
        )
        .init();

    let args = Args::parse();
    info!("ferrogate v{}", VERSION);
    info!("loading configuration from {}", args.config.display());

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {}", err);
            std::process::exit(1);
        }
    };

    if args.test {
        info!("configuration test passed");
        return Ok(());
    }

    if config.gateway.admin_api_enabled && config.gateway.admin_api_token.is_empty() {
        error!("admin_api_enabled requires admin_api_token");
        std::process::exit(1);
    }

    let gateway = match Gateway::new(config, args.config.clone()) {
        Ok(gateway) => gateway,
        Err(err) => {
            error!("failed to initialize gateway: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = gateway.run().await {
        error!("gateway error: {}", err);
        std::process::exit(1);
    }

    Ok(())
}
