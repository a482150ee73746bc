use crate::proxy::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tamis_cache::CacheStats;

/// State of the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
pub struct CacheReport {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub hit_rate: f64,
}

impl From<CacheStats> for CacheReport {
    fn from(stats: CacheStats) -> Self {
        Self {
            hit_rate: stats.hit_rate(),
            stats,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub http_cache: Option<CacheReport>,
    pub filter_cache: Option<CacheReport>,
}

/// GET /api/stats: one-shot stats endpoint.
pub async fn stats_handler(State(state): State<AdminState>) -> Json<StatsResponse> {
    let app = &state.app;
    let filter_cache = app
        .filter
        .as_ref()
        .and_then(|f| f.cache.as_ref())
        .map(|cache| cache.stats().into());
    Json(StatsResponse {
        uptime_seconds: state.started.elapsed().as_secs(),
        http_cache: app.http_cache.load_full().map(|cache| cache.stats().into()),
        filter_cache,
    })
}

/// POST /api/flush: drop everything from both caches.
pub async fn flush_handler(State(state): State<AdminState>) -> impl IntoResponse {
    if let Some(cache) = state.app.http_cache.load_full() {
        cache.flush().await;
    }
    if let Some(cache) = state.app.filter.as_ref().and_then(|f| f.cache.as_ref()) {
        cache.flush();
    }
    tracing::info!("caches flushed");
    Json(serde_json::json!({"flushed": true}))
}

#[derive(Deserialize)]
pub struct FlushTagRequest {
    pub tag: String,
}

/// POST /api/flush-tag: drop every document stored with a tag.
pub async fn flush_tag_handler(
    State(state): State<AdminState>,
    Json(body): Json<FlushTagRequest>,
) -> impl IntoResponse {
    if body.tag.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "empty tag"})),
        );
    }

    let http = state
        .app
        .http_cache
        .load_full()
        .map_or(0, |cache| cache.flush_tag(&body.tag));
    let filter = state
        .app
        .filter
        .as_ref()
        .and_then(|f| f.cache.as_ref())
        .map_or(0, |cache| cache.flush_tag(&body.tag));
    tracing::info!(tag = %body.tag, http, filter, "tag flushed");

    (
        StatusCode::OK,
        Json(serde_json::json!({"tag": body.tag, "removed": http + filter})),
    )
}

#[derive(Deserialize)]
pub struct InvalidateRequest {
    /// Path and query as the client requests it.
    pub path: String,
}

/// POST /api/invalidate: remove every stored variant of one resource.
pub async fn invalidate_handler(
    State(state): State<AdminState>,
    Json(body): Json<InvalidateRequest>,
) -> impl IntoResponse {
    if !body.path.starts_with('/') {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "path must start with '/'"})),
        );
    }

    let address = state.app.upstream_address(&body.path);
    if let Some(cache) = state.app.http_cache.load_full() {
        cache.invalidate(&address).await;
    }
    tracing::info!(upstream = %address.id(), "resource invalidated");

    (
        StatusCode::OK,
        Json(serde_json::json!({"invalidated": address.id()})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::HttpLoader;
    use arc_swap::ArcSwapOption;
    use axum::body::Body;
    use axum::http::{HeaderName, Request};
    use axum::routing::{get, post};
    use axum::Router;
    use http_body_util::BodyExt;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::time::Duration;
    use tamis_cache::{HttpCache, HttpCacheConfig};
    use tower::ServiceExt;

    fn admin() -> Router {
        let client = Client::builder(TokioExecutor::new()).build_http();
        let loader = Arc::new(HttpLoader::new(client, Duration::from_secs(1)));
        let cache = HttpCache::new(HttpCacheConfig::default(), loader.clone());
        let app = Arc::new(AppState {
            http_cache: ArcSwapOption::from_pointee(cache),
            filter: None,
            loader,
            upstream_url: "http://origin".into(),
            tag_header: HeaderName::from_static("x-cache-tag"),
        });
        Router::new()
            .route("/api/stats", get(stats_handler))
            .route("/api/flush", post(flush_handler))
            .route("/api/flush-tag", post(flush_tag_handler))
            .route("/api/invalidate", post(invalidate_handler))
            .with_state(AdminState {
                app,
                started: Instant::now(),
            })
    }

    async fn call(request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = admin().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn stats() {
        let request = Request::get("/api/stats").body(Body::empty()).unwrap();
        let (status, json) = call(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["http_cache"]["hits"], 0);
        assert_eq!(json["http_cache"]["hit_rate"], 0.0);
        assert!(json["filter_cache"].is_null());
    }

    #[tokio::test]
    async fn flush_and_tag_flush() {
        let (status, json) = call(post_json("/api/flush", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["flushed"], true);

        let (status, json) =
            call(post_json("/api/flush-tag", serde_json::json!({"tag": "site-1"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["removed"], 0);

        let (status, _) = call(post_json("/api/flush-tag", serde_json::json!({"tag": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalidate_builds_upstream_uri() {
        let (status, json) =
            call(post_json("/api/invalidate", serde_json::json!({"path": "/foo?x=1"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["invalidated"], "http://origin/foo?x=1");

        let (status, _) =
            call(post_json("/api/invalidate", serde_json::json!({"path": "foo"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn report_flattens_stats() {
        let report = CacheReport::from(CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["hits"], 3);
        assert_eq!(json["hit_rate"], 0.75);
    }
}
