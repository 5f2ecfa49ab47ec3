//! Registry server binary.

use std::net::SocketAddr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use registry::{EventPump, Notification, Registry, RegistryBuilder, RegistryConfig};
use serde::Deserialize;
use storage::{IndexConfig, ObjectEvent, StorageConfig};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Artifact registry backing store
#[derive(Debug, Parser)]
#[command(name = "registry-server", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "REGISTRY_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the read path and index changes as they happen
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:5000")]
        listen: SocketAddr,
    },

    /// Handle one notification batch, read from a file or stdin
    Process {
        /// The notification JSON; stdin if omitted
        file: Option<Utf8PathBuf>,
    },
}

/// Everything the binary reads from its configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct ServerConfig {
    registry: RegistryConfig,
    storage: Option<StorageConfig>,
    index: Option<IndexConfig>,
}

impl ServerConfig {
    async fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("reading configuration from {path}"))?;
        toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing configuration in {path}"))
    }

    /// Build the registry, subscribing to object store changes before
    /// anything can write.
    async fn build(self) -> Result<(Registry, Option<broadcast::Receiver<ObjectEvent>>)> {
        let storage = self
            .storage
            .unwrap_or_else(|| StorageConfig::Memory {
                bucket: self.registry.bucket.clone(),
            })
            .build()
            .await
            .wrap_err("building object store")?;
        let events = storage.subscribe();
        let index = self
            .index
            .unwrap_or(IndexConfig::Memory)
            .build(&self.registry.tables.specs())
            .await
            .wrap_err("building index store")?;

        let registry = RegistryBuilder::new(storage, index)
            .config(self.registry)
            .build();
        Ok((registry, events))
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_error::ErrorLayer::default());

    if json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

/// Feed in-process change notifications to the lifecycle handler.
fn spawn_event_pump(registry: &Registry, events: Option<broadcast::Receiver<ObjectEvent>>) {
    let Some(events) = events else {
        tracing::warn!("object store has no change notifications, nothing will be indexed");
        return;
    };

    tokio::spawn(EventPump::new(registry.handler().clone()).run(events));
}

async fn serve(config: ServerConfig, listen: SocketAddr) -> Result<()> {
    let (registry, events) = config.build().await?;
    spawn_event_pump(&registry, events);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .wrap_err_with(|| format!("binding {listen}"))?;
    tracing::info!("registry listening on http://{listen}");

    axum::serve(listener, registry.router())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {err}");
            }
        })
        .await
        .wrap_err("serving")?;
    Ok(())
}

async fn process(config: ServerConfig, file: Option<&Utf8Path>) -> Result<()> {
    let data = match file {
        Some(path) => tokio::fs::read(path)
            .await
            .wrap_err_with(|| format!("reading {path}"))?,
        None => {
            let mut data = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut data)
                .await
                .wrap_err("reading stdin")?;
            data
        }
    };

    let notification = Notification::from_slice(&data).wrap_err("parsing notification")?;
    let (registry, _) = config.build().await?;
    let outcomes = notification.dispatch(registry.handler()).await?;
    for outcome in outcomes {
        tracing::info!(?outcome, "processed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = ServerConfig::load(args.config.as_deref()).await?;
    match args.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Process { file } => process(config, file.as_deref()).await,
    }
}
