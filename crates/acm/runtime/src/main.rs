//! ACM Runtime - automation composition supervision daemon
//!
//! The daemon provides:
//! - Layered configuration (defaults, file, `ACM_` environment)
//! - Structured logging through `tracing`
//! - A supervisor wired to an in-process bus, with its message consumer and
//!   supervision sweep running until shutdown
//! - Optional simulated participants and a demo composition

#![deny(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod demo;
mod error;
mod server;

use config::RuntimeConfig;
use server::Runtime;

/// ACM Runtime CLI
#[derive(Parser)]
#[command(name = "acmd")]
#[command(about = "ACM Runtime - automation composition supervision daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ACM_CONFIG")]
    config: Option<String>,

    /// Log level
    #[arg(long, env = "ACM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "ACM_LOG_JSON")]
    json: bool,

    /// Attach this many simulated participants and deploy a demo composition
    #[arg(long, default_value_t = 0)]
    simulate: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RuntimeConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading configuration {:?}", cli.config))?;

    // Override with CLI args
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        simulate = cli.simulate,
        "Starting acmd"
    );

    Runtime::new(config)
        .run(cli.simulate)
        .await
        .context("runtime failed")
}
