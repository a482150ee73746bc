use crate::upstream::{self, HttpLoader};
use arc_swap::ArcSwapOption;
use axum::body::Body as AxumBody;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use axum::response::IntoResponse;
use std::sync::Arc;
use std::time::Instant;
use tamis_cache::{
    FilterCache, HttpCache, LoaderError, Request, ResourceAddress, ResourceLoader, Response,
};

/// Content filter applied to successful GET responses.
pub struct Filter {
    pub address: ResourceAddress,
    /// `None` runs the filter on every response.
    pub cache: Option<FilterCache>,
}

/// Shared application state passed to all handlers.
pub struct AppState {
    /// `None` while caching is disabled.
    pub http_cache: ArcSwapOption<HttpCache>,
    pub filter: Option<Filter>,
    pub loader: Arc<HttpLoader>,
    pub upstream_url: String,
    pub tag_header: HeaderName,
}

impl AppState {
    /// The origin address serving this request path.
    pub fn upstream_address(&self, path_and_query: &str) -> ResourceAddress {
        ResourceAddress::Http(format!(
            "{}{}",
            self.upstream_url.trim_end_matches('/'),
            path_and_query
        ))
    }

    async fn load(&self, request: Request) -> Result<Response, LoaderError> {
        match self.http_cache.load_full() {
            Some(cache) => cache.request(request).await,
            None => self.loader.request(request).await,
        }
    }

    async fn apply_filter(
        &self,
        filter: &Filter,
        source: &ResourceAddress,
        request_headers: HeaderMap,
        response: Response,
        tag: Option<String>,
    ) -> Result<Response, LoaderError> {
        let source_id = source_version(&response.headers)
            .map(|version| format!("{}@{version}", source.id()));
        match &filter.cache {
            Some(cache) => {
                cache
                    .request(
                        filter.address.clone(),
                        source_id.as_deref(),
                        request_headers,
                        response.body,
                        tag,
                    )
                    .await
            }
            None => {
                let request = Request {
                    method: Method::POST,
                    address: filter.address.clone(),
                    headers: request_headers,
                    body: Some(response.body),
                    tag,
                };
                self.loader.request(request).await
            }
        }
    }
}

/// What identifies this version of a source document.
fn source_version(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::ETAG)
        .or_else(|| headers.get(header::LAST_MODIFIED))
        .and_then(|v| v.to_str().ok())
}

/// Main proxy handler. Routes the request through the HTTP cache (or straight
/// to the origin when caching is off), then through the content filter.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<AxumBody>,
) -> axum::response::Response {
    let start = Instant::now();
    let (parts, body) = req.into_parts();
    let address =
        state.upstream_address(parts.uri.path_and_query().map_or("/", |pq| pq.as_str()));

    let mut headers = parts.headers;
    let tag = headers
        .remove(&state.tag_header)
        .and_then(|v| v.to_str().ok().map(str::to_string));
    let filter_headers = state.filter.as_ref().map(|_| headers.clone());

    let request = Request {
        method: parts.method.clone(),
        address: address.clone(),
        body: upstream::from_axum(body, &headers),
        headers,
        tag: tag.clone(),
    };

    let mut response = match state.load(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, upstream = %address.id(), "upstream request failed");
            return bad_gateway();
        }
    };

    if let (Some(filter), Some(request_headers)) = (&state.filter, filter_headers) {
        if parts.method == Method::GET && response.status == StatusCode::OK {
            response = match state
                .apply_filter(filter, &address, request_headers, response, tag)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, filter = %filter.address.id(), "filter failed");
                    return bad_gateway();
                }
            };
        }
    }

    tracing::debug!(
        method = %parts.method,
        upstream = %address.id(),
        status = response.status.as_u16(),
        latency_us = start.elapsed().as_micros(),
        "request served"
    );

    into_axum_response(response)
}

fn bad_gateway() -> axum::response::Response {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}

fn into_axum_response(response: Response) -> axum::response::Response {
    let Response {
        status,
        mut headers,
        body,
    } = response;
    upstream::strip_hop_by_hop(&mut headers);

    let mut out = axum::response::Response::new(upstream::into_axum(body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{any, get, post};
    use axum::Router;
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tamis_cache::{FilterCacheConfig, HttpCacheConfig};
    use tower::ServiceExt;

    #[derive(Default)]
    struct Calls {
        page: AtomicUsize,
        filter: AtomicUsize,
    }

    async fn origin(calls: Arc<Calls>) -> SocketAddr {
        let page_calls = calls.clone();
        let filter_calls = calls;
        let app = Router::new()
            .route(
                "/page",
                get(move |headers: HeaderMap| {
                    let calls = page_calls.clone();
                    async move {
                        calls.page.fetch_add(1, Ordering::SeqCst);
                        let tagged = headers.contains_key("x-cache-tag").to_string();
                        (
                            [
                                ("cache-control", "max-age=60".to_string()),
                                ("etag", "\"v1\"".to_string()),
                                ("x-tag-forwarded", tagged),
                            ],
                            "page body",
                        )
                    }
                }),
            )
            .route(
                "/filter",
                post(move |body: Bytes| {
                    let calls = filter_calls.clone();
                    async move {
                        calls.filter.fetch_add(1, Ordering::SeqCst);
                        String::from_utf8_lossy(&body).to_uppercase()
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn state(upstream_url: String, filter: Option<Filter>, cached: bool) -> Arc<AppState> {
        let client = Client::builder(TokioExecutor::new()).build_http();
        let loader = Arc::new(HttpLoader::new(client, Duration::from_secs(5)));
        let cache = cached.then(|| {
            Arc::new(HttpCache::new(HttpCacheConfig::default(), loader.clone()))
        });
        Arc::new(AppState {
            http_cache: ArcSwapOption::from(cache),
            filter,
            loader,
            upstream_url,
            tag_header: HeaderName::from_static("x-cache-tag"),
        })
    }

    fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
    }

    async fn get_text(state: &Arc<AppState>, path: &str) -> (StatusCode, HeaderMap, String) {
        let request = axum::http::Request::get(path)
            .header("x-cache-tag", "site-1")
            .body(AxumBody::empty())
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn repeated_get_is_served_from_cache() {
        let calls = Arc::new(Calls::default());
        let addr = origin(calls.clone()).await;
        let state = state(format!("http://{addr}/"), None, true);

        let (status, headers, body) = get_text(&state, "/page").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "page body");
        assert_eq!(headers["x-tag-forwarded"], "false");

        let cache = state.http_cache.load_full().unwrap();
        wait_for(|| cache.stats().stores == 1).await;

        let (_, _, body) = get_text(&state, "/page").await;
        assert_eq!(body, "page body");
        assert_eq!(calls.page.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);

        assert_eq!(cache.flush_tag("site-1"), 1);
    }

    #[tokio::test]
    async fn disabled_cache_always_forwards() {
        let calls = Arc::new(Calls::default());
        let addr = origin(calls.clone()).await;
        let state = state(format!("http://{addr}"), None, false);

        get_text(&state, "/page").await;
        get_text(&state, "/page").await;
        assert_eq!(calls.page.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn filter_output_is_cached() {
        let calls = Arc::new(Calls::default());
        let addr = origin(calls.clone()).await;
        let client = Client::builder(TokioExecutor::new()).build_http();
        let filter_loader = Arc::new(HttpLoader::new(client, Duration::from_secs(5)));
        let filter = Filter {
            address: ResourceAddress::Http(format!("http://{addr}/filter")),
            cache: Some(FilterCache::new(FilterCacheConfig::default(), filter_loader)),
        };
        let state = state(format!("http://{addr}"), Some(filter), true);

        let (status, _, body) = get_text(&state, "/page").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "PAGE BODY");

        let filter_cache = state.filter.as_ref().and_then(|f| f.cache.clone()).unwrap();
        wait_for(|| filter_cache.stats().stores == 1).await;

        let (_, _, body) = get_text(&state, "/page").await;
        assert_eq!(body, "PAGE BODY");
        assert_eq!(calls.filter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let state = state(format!("http://{addr}"), None, true);

        let (status, _, body) = get_text(&state, "/page").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body, "Bad Gateway");
    }

    #[test]
    fn source_version_prefers_etag() {
        let mut headers = HeaderMap::new();
        assert_eq!(source_version(&headers), None);
        headers.insert("last-modified", "Tue, 01 Jan 2030 00:00:00 GMT".parse().unwrap());
        assert_eq!(source_version(&headers), Some("Tue, 01 Jan 2030 00:00:00 GMT"));
        headers.insert("etag", "\"v1\"".parse().unwrap());
        assert_eq!(source_version(&headers), Some("\"v1\""));
    }
}
