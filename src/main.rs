//! Gateway entry point: load configuration, verify backing services, serve.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use edgegate::config::Config;
use edgegate::control_plane::ControlPlaneClient;
use edgegate::registry::TunnelRegistry;
use edgegate::routes;
use edgegate::slug_cache::SlugCache;
use edgegate::state::{generate_pod_id, AppState};
use edgegate::store::CoordinationStore;

/// Reverse-tunnel edge gateway.
#[derive(Parser)]
#[command(name = "edgegate", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let pod_id = generate_pod_id();
    info!("edgegate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Pod id: {pod_id}");
    info!("Listening on {}", config.server.listen);

    let store = if config.control_plane.mock {
        // Development mode keeps everything in-process
        info!("Using in-memory coordination store (mock mode)");
        CoordinationStore::in_memory()
    } else {
        CoordinationStore::connect(&config.store.redis_url)
            .await
            .unwrap_or_else(|e| panic!("Failed to connect to coordination store: {e}"))
    };

    let control_plane = ControlPlaneClient::from_config(&config.control_plane);

    let ownership_ttl = std::time::Duration::from_secs(config.tunnel.ownership_ttl_secs);
    let slug_ttl = std::time::Duration::from_secs(config.slug_cache.ttl_secs);

    let state = AppState {
        config: Arc::new(config),
        pod_id: Arc::from(pod_id.as_str()),
        start_time: Instant::now(),
        registry: TunnelRegistry::new(&pod_id, store.clone(), ownership_ttl),
        slug_cache: SlugCache::new(slug_ttl),
        control_plane: Arc::new(control_plane),
        ready: Arc::new(AtomicBool::new(false)),
    };

    // Startup connectivity checks gate the readiness probe; liveness stays up
    // regardless so orchestrators don't restart a pod waiting on its backends.
    match store.ping().await {
        Ok(()) => match state.control_plane.verify().await {
            Ok(()) => {
                state.ready.store(true, Ordering::Relaxed);
                info!("Startup checks passed, gateway ready");
            }
            Err(e) => warn!("Control plane verification failed, staying not-ready: {e}"),
        },
        Err(e) => warn!("Coordination store ping failed, staying not-ready: {e}"),
    }

    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Release every ownership key now so peer pods can accept reconnecting
    // agents without waiting out the TTL.
    info!("Shutting down...");
    state.registry.shutdown().await;
    info!("Goodbye");
}
