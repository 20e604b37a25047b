mod cache;
mod config;
mod messages;
mod proxy;
mod server;
mod upstream;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheStore, MemoryStore, SqliteStore};
use crate::config::{Config, LoggingConfig, StorageBackend};
use crate::proxy::CacheProxy;
use crate::upstream::HttpClient;

#[derive(Parser, Debug)]
#[command(name = "storefront-cache")]
#[command(about = "Caching proxy applying service-worker cache strategies to a storefront")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Address to listen on
  #[arg(short, long)]
  listen: Option<String>,

  /// Origin that same-origin requests are forwarded to
  #[arg(short, long)]
  origin: Option<String>,

  /// Keep caches in memory instead of SQLite
  #[arg(long)]
  ephemeral: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line wins over the file
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  if let Some(origin) = args.origin {
    config.upstream.origin = origin;
  }
  if args.ephemeral {
    config.cache.storage = StorageBackend::Memory;
  }

  let _log_guard = init_tracing(&config.logging)?;

  info!("Starting storefront-cache v{}", env!("CARGO_PKG_VERSION"));

  let fetcher = Arc::new(HttpClient::new(&config.upstream)?);

  match config.cache.storage {
    StorageBackend::Sqlite => {
      let storage = SqliteStore::open_at(config.cache.path.as_deref())?;
      run(config, Arc::new(storage), fetcher).await
    }
    StorageBackend::Memory => run(config, Arc::new(MemoryStore::new()), fetcher).await,
  }
}

/// Install and activate the worker, then serve until shutdown.
async fn run<S: CacheStore>(config: Config, storage: Arc<S>, fetcher: Arc<HttpClient>) -> Result<()> {
  let proxy = Arc::new(CacheProxy::new(&config, storage, fetcher)?);
  proxy.start().await?;

  let addr: SocketAddr = config
    .listen
    .parse()
    .map_err(|e| eyre!("Invalid listen address '{}': {}", config.listen, e))?;
  let listener = tokio::net::TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

  server::serve(listener, proxy, &config.control_path).await
}

/// Log to stderr, or to a daily-rotated file when a directory is configured.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  match &logging.directory {
    Some(directory) => {
      let appender = tracing_appender::rolling::daily(directory, "storefront-cache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
      Ok(None)
    }
  }
}
