use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{StoreBackend, StoreConfig, TurnstileConfig};
use turnstile::http::{admin_router, application_router, Admission, HttpServer};
use turnstile::ratelimit::{AdmissionStats, RateLimiter, Tier};
use turnstile::store::{CounterStore, MemoryCounterStore, RedisCounterStore};

/// How often the in-memory store drops expired counters.
const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "turnstile", version)]
#[command(about = "Distributed request-rate admission control for HTTP services")]
struct Args {
    /// YAML configuration file; TURNSTILE__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Keep counters in process memory instead of Redis
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Turnstile admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if args.memory_store {
        config.store.backend = StoreBackend::Memory;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let store = build_store(&config.store).await?;
    let stats = Arc::new(AdmissionStats::new());

    let ip_limiter = Arc::new(
        RateLimiter::new(store.clone(), config.policies.policy(Tier::Ip)?)
            .with_observer(stats.clone()),
    );
    let token_limiter = Arc::new(
        RateLimiter::new(store.clone(), config.policies.policy(Tier::Token)?)
            .with_observer(stats.clone()),
    );
    info!(
        ip = ?ip_limiter.policy(),
        token = ?token_limiter.policy(),
        "Rate limiters initialized"
    );

    let admission = Admission::from_config(&config.server, ip_limiter, token_limiter)?;
    let application = HttpServer::new(
        "application",
        config.server.listen_addr,
        application_router(admission.clone()),
    );
    let admin = HttpServer::new(
        "admin",
        config.server.admin_addr,
        admin_router(admission, stats),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let served = tokio::try_join!(
        application.serve_with_shutdown(wait_for_shutdown(shutdown_rx.clone())),
        admin.serve_with_shutdown(wait_for_shutdown(shutdown_rx)),
    );

    store.close().await?;
    served?;

    info!("Turnstile admission service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisCounterStore::connect(config.redis_options()).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory counters; limits are not shared between instances");
            let store = Arc::new(MemoryCounterStore::new());

            let purged = Arc::downgrade(&store);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MEMORY_PURGE_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    match purged.upgrade() {
                        Some(store) => {
                            store.purge_expired();
                        }
                        None => break,
                    }
                }
            });

            Ok(store)
        }
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
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
