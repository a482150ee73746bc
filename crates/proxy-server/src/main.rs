mod admin;
mod config;
mod proxy;
mod telemetry;
mod upstream;

use admin::{flush_handler, flush_tag_handler, invalidate_handler, stats_handler, AdminState};
use arc_swap::ArcSwapOption;
use axum::http::HeaderName;
use axum::routing::{any, get, post};
use axum::Router;
use config::Config;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use proxy::{proxy_handler, AppState, Filter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tamis_cache::{FilterCache, ResourceAddress, ResourceLoader};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use upstream::HttpLoader;

/// How often expired documents are swept out of the in-process stores.
const EXPIRE_INTERVAL: Duration = Duration::from_secs(600);

/// Upper bound for serving one admin request.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    telemetry::init();

    // Load config
    let config = if Path::new("config.toml").exists() {
        match Config::load(Path::new("config.toml")) {
            Ok(c) => {
                tracing::info!("loaded config from config.toml");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load config.toml, using defaults");
                Config::default_config()
            }
        }
    } else {
        tracing::info!("no config.toml found, using defaults");
        Config::default_config()
    };

    // Install Prometheus metrics recorder
    let prom_handle = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to install prometheus recorder");
            return;
        }
    };
    telemetry::describe_metrics();

    let tag_header = match HeaderName::try_from(config.upstream.tag_header.as_str()) {
        Ok(name) => name,
        Err(e) => {
            tracing::error!(error = %e, header = %config.upstream.tag_header, "invalid tag header");
            return;
        }
    };

    // Upstream client shared by the origin and the filter
    let client = Client::builder(TokioExecutor::new()).build_http();
    let loader = Arc::new(HttpLoader::new(
        client,
        Duration::from_millis(config.upstream.timeout_ms),
    ));

    let http_cache = config.build_http_cache(loader.clone()).map(Arc::new);
    let filter = config.upstream.filter_url.as_ref().map(|url| Filter {
        address: ResourceAddress::Http(url.clone()),
        cache: config
            .filter_cache
            .enabled
            .then(|| FilterCache::new(config.filter_cache_config(), loader.clone())),
    });

    let state = Arc::new(AppState {
        http_cache: ArcSwapOption::from(http_cache),
        filter,
        loader,
        upstream_url: config.upstream.url.clone(),
        tag_header,
    });

    // Shutdown token for graceful shutdown
    let shutdown = CancellationToken::new();

    // Build admin router (separate port)
    let admin_router = Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/flush", post(flush_handler))
        .route("/api/flush-tag", post(flush_tag_handler))
        .route("/api/invalidate", post(invalidate_handler))
        .route(
            "/metrics",
            get(move || {
                let h = prom_handle.clone();
                async move { h.render() }
            }),
        )
        .layer(TimeoutLayer::new(ADMIN_TIMEOUT))
        .with_state(AdminState {
            app: Arc::clone(&state),
            started: Instant::now(),
        });

    // Build proxy router (main port)
    let proxy_router = Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(Arc::clone(&state));

    let proxy_addr = config.server.listen_addr.clone();
    let admin_addr = config.server.admin_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        admin = %admin_addr,
        upstream = %config.upstream.url,
        filter = ?config.upstream.filter_url,
        http_cache = config.http_cache.enabled,
        backend = ?config.http_cache.backend,
        max_size_bytes = config.http_cache.max_size_bytes,
        "tamis proxy starting"
    );

    let proxy_listener = match tokio::net::TcpListener::bind(&proxy_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %proxy_addr, "failed to bind proxy listener");
            return;
        }
    };
    let admin_listener = match tokio::net::TcpListener::bind(&admin_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %admin_addr, "failed to bind admin listener");
            return;
        }
    };

    tokio::spawn(expire_sweeper(Arc::clone(&state), shutdown.clone()));

    // Spawn config file watcher
    spawn_config_watcher(PathBuf::from("config.toml"), config, Arc::clone(&state));

    // Spawn shutdown signal handler
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    // Run both servers with graceful shutdown
    let proxy_future = axum::serve(proxy_listener, proxy_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let admin_future = axum::serve(admin_listener, admin_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = admin_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "admin server error");
            }
        }
    }

    // servers have drained; abandon running fills
    shutdown.cancel();
    if let Some(cache) = state.http_cache.load_full() {
        cache.close().await;
    }
    if let Some(cache) = state.filter.as_ref().and_then(|f| f.cache.as_ref()) {
        cache.close().await;
    }

    tracing::info!("tamis proxy shut down");
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "no SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Periodically drop expired documents from the in-process stores.
async fn expire_sweeper(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(EXPIRE_INTERVAL);
    // the first tick fires immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let http = state
            .http_cache
            .load_full()
            .map_or(0, |cache| cache.expire_sweep());
        let filter = state
            .filter
            .as_ref()
            .and_then(|f| f.cache.as_ref())
            .map_or(0, |cache| cache.expire_sweep());
        tracing::debug!(http, filter, "expired documents swept");
    }
}

/// Spawn a filesystem watcher on config.toml that applies safe config changes at runtime.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, state: Arc<AppState>) {
    let current_config = Arc::new(Mutex::new(initial_config));
    let runtime = tokio::runtime::Handle::current();

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let mut current = current_config.lock();
                        let loader: Arc<dyn ResourceLoader> = state.loader.clone();
                        let replaced =
                            config::reload(&mut current, new_config, &state.http_cache, loader);
                        if let Some(replaced) = replaced {
                            runtime.spawn(async move { replaced.close().await });
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config.toml");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch config.toml");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
