use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{LogFormat, RatekeeperConfig, StorageBackend, StorageConfig};
use ratekeeper::http::{router, HttpServer};
use ratekeeper::ratelimit::RateLimiter;
use ratekeeper::storage::{MemoryStorage, RedisStorage, RedisStorageConfig, Storage};

/// Request rate limiting service.
#[derive(Parser, Debug)]
#[command(name = "ratekeeper", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment file supplying variables the process environment leaves unset
    #[arg(long, default_value = "config.env")]
    env_file: PathBuf,

    /// Listen address, overriding the configuration
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Storage backend (memory or redis), overriding the configuration
    #[arg(long)]
    backend: Option<StorageBackend>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RatekeeperConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RatekeeperConfig::default(),
    };
    let env_file_found = args.env_file.is_file();
    let mut config = if env_file_found {
        config.with_env_file(&args.env_file)?
    } else {
        config.with_env()
    };
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(backend) = args.backend {
        config.storage.backend = backend;
    }

    init_tracing(config.logging.format);
    if !env_file_found {
        warn!(
            path = %args.env_file.display(),
            "Environment file not found, using process environment only"
        );
    }

    info!("Starting Ratekeeper Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        addr = %config.server.addr,
        backend = ?config.storage.backend,
        ip_requests_per_second = config.rate_limiting.ip_requests_per_second,
        ip_block_minutes = config.rate_limiting.ip_block_minutes,
        token_requests_per_second = config.rate_limiting.token_requests_per_second,
        token_block_minutes = config.rate_limiting.token_block_minutes,
        "Configuration loaded"
    );

    let storage = build_storage(&config.storage).await?;
    let rate_limiter = Arc::new(RateLimiter::new(
        Arc::clone(&storage),
        config.rate_limiting.clone(),
    ));
    info!("Rate limiter initialized");

    let app = router(rate_limiter, config.server.check_timeout());
    let server = HttpServer::bind(config.server.addr, app)
        .await
        .with_context(|| format!("binding {}", config.server.addr))?;

    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = storage.close().await {
        warn!(error = %e, "Failed to close storage");
    }

    served?;
    info!("Ratekeeper Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn build_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Memory => {
            let storage = MemoryStorage::new();
            storage.start_sweeper(config.sweep_interval());
            info!("Using in-memory storage");
            Ok(Arc::new(storage))
        }
        StorageBackend::Redis => {
            let redis_config = RedisStorageConfig {
                key_prefix: String::new(),
                connect_timeout: config.redis.connect_timeout(),
            };
            let storage = RedisStorage::connect_with_config(config.redis.connection_info(), redis_config)
                .await
                .with_context(|| {
                    format!(
                        "failed to connect to Redis at {}:{}",
                        config.redis.host, config.redis.port
                    )
                })?;
            Ok(Arc::new(storage))
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
