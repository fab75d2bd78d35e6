use axum::Router;
use edge_cache::cache::{EvictionPolicy, MemoryCache};
use edge_cache::config::EdgeConfig;
use edge_cache::disk::DiskCache;
use edge_cache::handlers::{cdn_handler, AppState};
use edge_cache::origin::OriginDispatcher;
use edge_cache::ring::HashRing;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("Starting edge cache core v{}", env!("CARGO_PKG_VERSION"));

    let config = EdgeConfig::load_from_env();

    if config.has_mismatched_tls_env() {
        warn!(
            "only one of EDGE_TLS_CERT_FILE/EDGE_TLS_KEY_FILE is set; TLS listener disabled"
        );
    }

    let memory = Arc::new(MemoryCache::new(config.max_memory_bytes, Duration::from_secs(600)));
    if config.eviction_policy_lfu {
        memory.set_eviction_policy(EvictionPolicy::Lfu);
    }

    let disk = match &config.disk_cache_dir {
        Some(dir) => Some(Arc::new(
            DiskCache::new(dir, config.disk_cache_max_bytes)
                .map_err(|e| anyhow::anyhow!("failed to initialize disk cache at {dir}: {e}"))?,
        )),
        None => None,
    };

    let ring = if config.origins.len() > 1 {
        Some(Arc::new(HashRing::new(&config.origins, config.hash_replicas)))
    } else {
        None
    };

    let dispatcher = Arc::new(OriginDispatcher::new(
        config.origins.clone(),
        config.shield_url.clone(),
        config.origin_url.clone(),
        ring,
        config.upstream_timeout,
        config.upstream_insecure_tls,
    )?);

    let state = AppState {
        memory: memory.clone(),
        disk,
        dispatcher,
        coalescer: edge_cache::coalesce::RequestCoalescer::new(1024),
    };

    memory.clone().start_cleanup();

    let app = build_router(state);

    let addr = listen_addr(&config.listen_addr)?;
    info!(%addr, "listening");

    if config.tls_enabled() {
        serve_tls(addr, app, &config, memory).await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(memory))
            .await?;
    }

    info!("server shutdown complete");
    Ok(())
}

/// Serves over TLS 1.2+ via `axum-server`'s rustls acceptor, matching the
/// original binary's `tls.Config{MinVersion: tls.VersionTLS12}`.
async fn serve_tls(
    addr: std::net::SocketAddr,
    app: Router,
    config: &EdgeConfig,
    memory: Arc<MemoryCache>,
) -> anyhow::Result<()> {
    let cert_file = config.tls_cert_file.as_ref().expect("tls_enabled checked both files are set");
    let key_file = config.tls_key_file.as_ref().expect("tls_enabled checked both files are set");

    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_file, key_file)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS cert/key: {e}"))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal(memory).await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

/// The original binary listens on `:PORT`-style addresses (no host). We
/// accept that shorthand by prefixing an unspecified host.
fn listen_addr(raw: &str) -> anyhow::Result<std::net::SocketAddr> {
    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    normalized
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid EDGE_LISTEN_ADDR {raw:?}: {e}"))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .fallback(cdn_handler)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn shutdown_signal(memory: Arc<MemoryCache>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining memory cache");
    memory.shutdown();
}
