//! Reverse tunnel broker
//!
//! Accepts control connections from internal clients and exposes the ports
//! they register to external users.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use revtun_lib::BrokerBuilder;

use crate::config::BrokerSettings;

/// Reverse tunnel broker - exposes ports for clients behind NAT
#[derive(Parser, Debug)]
#[command(name = "revtun-broker")]
#[command(about = "Run a reverse tunnel broker", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Control listener address for internal clients [default: 0.0.0.0:7000]
    #[arg(long, env = "REVTUN_BIND")]
    bind: Option<String>,

    /// Shared secret clients must present when registering
    #[arg(long, env = "REVTUN_PASSWORD")]
    password: Option<String>,

    /// Address exposed ports are bound on [default: 0.0.0.0]
    #[arg(long, env = "REVTUN_PUBLIC_IP")]
    public_ip: Option<IpAddr>,

    /// Seconds without any frame before a control connection counts a miss [default: 30]
    #[arg(long, env = "REVTUN_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Missed idle windows tolerated before a control connection is dropped [default: 5]
    #[arg(long, env = "REVTUN_IDLE_RETRIES")]
    idle_retries: Option<u32>,

    /// Seconds a DATA frame may wait on a slow external connection [default: 10]
    #[arg(long, env = "REVTUN_WRITE_TIMEOUT")]
    write_timeout: Option<u64>,

    /// JSON config file; command line values take precedence
    #[arg(long, env = "REVTUN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long, env = "REVTUN_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    fn settings(&self) -> BrokerSettings {
        BrokerSettings {
            bind: self.bind.clone(),
            password: self.password.clone(),
            public_ip: self.public_ip,
            idle_timeout_secs: self.idle_timeout,
            idle_retry_limit: self.idle_retries,
            write_timeout_secs: self.write_timeout,
            read_chunk_size: None,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_settings = match &cli.config {
        Some(path) => BrokerSettings::load(path)?,
        None => BrokerSettings::default(),
    };
    let settings = cli.settings().merge(file_settings);

    init_logging(settings.log_level.as_deref().unwrap_or("info"))?;
    info!(
        "Starting revtun-broker {} (commit {})",
        env!("GIT_TAG"),
        env!("GIT_HASH")
    );

    let config = settings.into_broker_config()?;
    let broker = BrokerBuilder::from_config(config)
        .bind()
        .await
        .context("Failed to start broker")?;
    let shutdown = broker.shutdown_token();
    let mut run = tokio::spawn(broker.run());

    tokio::select! {
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping broker..."),
                Err(err) => error!("Error listening for shutdown signal: {}", err),
            }
            shutdown.cancel();
        }
        finished = &mut run => {
            finished.context("Broker task failed")??;
            return Ok(());
        }
    }

    run.await.context("Broker task failed")??;
    info!("Broker stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    Ok(())
}
