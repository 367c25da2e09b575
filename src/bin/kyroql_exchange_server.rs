//! KyroQL Exchange server
//!
//! Runs the exchange over HTTP/WebSocket, backed by the write-ahead log when a
//! data directory is configured and by memory otherwise.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kyroql_exchange::storage::persistent::{PersistentConfig, PersistentStore};
use kyroql_exchange::transport::{serve, shutdown_signal};
use kyroql_exchange::{Exchange, ExchangeConfig, InMemoryStore, Store};

#[derive(Debug, Parser)]
#[command(name = "kyroql-exchange-server")]
#[command(about = "Knowledge exchange server for worker fleets")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "KYROQL_EXCHANGE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(short, long, env = "KYROQL_EXCHANGE_LISTEN")]
    listen_addr: Option<String>,

    /// Data directory for the write-ahead log (overrides config file)
    #[arg(short, long, env = "KYROQL_EXCHANGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "KYROQL_EXCHANGE_LOG")]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, env = "KYROQL_EXCHANGE_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &ExchangeConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    let Some(dir) = &config.store.data_dir else {
        tracing::warn!("no data directory configured; knowledge will not survive restarts");
        return Ok(Arc::new(InMemoryStore::new()));
    };
    let persistent = PersistentConfig {
        sync_on_write: config.store.sync_on_write,
        lock_timeout_ms: config.store.lock_timeout_ms,
    };
    let store = PersistentStore::open(dir, &persistent)?;
    tracing::info!(
        dir = %dir.display(),
        items = store.item_count()?,
        wal_bytes = store.wal_size_bytes()?,
        "opened persistent store"
    );
    Ok(Arc::new(store))
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ExchangeConfig::load_or_default(cli.config.as_deref())?;
    if let Some(addr) = cli.listen_addr {
        config.server.listen_addr = addr;
    }
    if let Some(dir) = cli.data_dir {
        config.store.data_dir = Some(dir);
    }
    if let Some(level) = cli.log_level {
        config.server.log_level = level;
    }
    config.server.log_json |= cli.log_json;

    init_tracing(&config.server.log_level, config.server.log_json);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting kyroql-exchange-server");

    let store = open_store(&config)?;
    let listen_addr = config.server.listen_addr.clone();
    let exchange = Arc::new(Exchange::start(config, store)?);

    let served = serve(Arc::clone(&exchange), &listen_addr, shutdown_signal()).await;

    // Flush pending batches and stop background threads off the async runtime.
    let closing = Arc::clone(&exchange);
    tokio::task::spawn_blocking(move || closing.shutdown()).await?;
    tracing::info!(stats = ?exchange.stats(), "exchange stopped");

    served.map_err(Into::into)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("kyroql-exchange-server: {e}");
            ExitCode::FAILURE
        }
    }
}
