//! Cache for the output of content filters.
//!
//! A filter transforms a source document, so its output only depends on the
//! source version, the filter and the user the source was rendered for. The
//! key is built from exactly those three; nothing varies and nothing is
//! revalidated.

use crate::age::AgeLimiter;
use crate::body::{self, Body};
use crate::document::{CacheInfo, Document};
use crate::error::LoaderError;
use crate::heap::HeapStore;
use crate::loader::{Request, ResourceAddress, ResourceLoader, Response};
use crate::rfc;
use crate::stats::{CacheStats, Counters, Outcome};
use http::header::{self, HeaderMap};
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FilterCacheConfig {
    pub max_size: usize,
    pub body_size_limit: usize,
    /// Lifetime of outputs that carry no `Expires`.
    pub default_ttl: Duration,
    pub fill_timeout: Duration,
    /// Request header naming the user a source was rendered for.
    pub user_header: String,
    pub age_limiter: AgeLimiter,
}

impl Default for FilterCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 32 * 1024 * 1024,
            body_size_limit: 512 * 1024,
            default_ttl: Duration::from_secs(3600),
            fill_timeout: Duration::from_secs(60),
            user_header: "x-cm4all-beng-user".into(),
            age_limiter: AgeLimiter::default(),
        }
    }
}

/// Decide whether a filter response may be stored, and until when.
fn evaluate(
    status: StatusCode,
    headers: &HeaderMap,
    body_size: Option<u64>,
    config: &FilterCacheConfig,
    now: SystemTime,
) -> Option<SystemTime> {
    if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
        return None;
    }

    if body_size.is_some_and(|size| size > config.body_size_limit as u64) {
        return None;
    }

    if let Some(cc) = rfc::joined_header(headers, header::CACHE_CONTROL) {
        if rfc::list_contains(&cc, "no-store") {
            return None;
        }
    }

    let origin_now = rfc::header_str(headers, "date")
        .and_then(rfc::parse_date)
        .unwrap_or(now);
    let expires = rfc::header_str(headers, "expires")
        .and_then(rfc::parse_date)
        .map(|t| rfc::translate_time(t, origin_now, now));
    match expires {
        Some(expires) => {
            if expires < now {
                warn!("invalid 'expires' header");
            }
            Some(expires)
        }
        None => Some(now + config.default_ttl),
    }
}

struct Inner {
    loader: Arc<dyn ResourceLoader>,
    store: HeapStore,
    config: FilterCacheConfig,
    counters: Counters,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct FilterCache {
    inner: Arc<Inner>,
}

impl FilterCache {
    pub fn new(config: FilterCacheConfig, loader: Arc<dyn ResourceLoader>) -> Self {
        let store = HeapStore::new(
            config.max_size,
            config.body_size_limit,
            config.age_limiter.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                loader,
                store,
                config,
                counters: Counters::new("tamis_filter_cache"),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn key(&self, filter: &ResourceAddress, source_id: &str, headers: &HeaderMap) -> String {
        let user = rfc::header_str(headers, &self.inner.config.user_header).unwrap_or("");
        format!("{source_id}|{user}|{}", filter.id())
    }

    /// Run `body` through `filter`, or answer from the cache.
    ///
    /// `source_id` identifies the exact version of the source document;
    /// without it the output cannot be cached and the filter always runs.
    pub async fn request(
        &self,
        filter: ResourceAddress,
        source_id: Option<&str>,
        headers: HeaderMap,
        body: Body,
        tag: Option<String>,
    ) -> Result<Response, LoaderError> {
        let key = source_id.map(|id| self.key(&filter, id, &headers));
        let request = Request {
            method: Method::POST,
            address: filter,
            headers,
            body: Some(body),
            tag,
        };

        let Some(key) = key else {
            self.inner.counters.record(Outcome::Skip);
            return self.inner.loader.request(request).await;
        };

        if let Some(document) = self.inner.store.get(&key, &request.headers) {
            debug!(key = %key, "filter cache hit");
            self.inner.counters.record(Outcome::Hit);
            return Ok(Response::new(
                document.status,
                document.headers.clone(),
                Body::from_document(document),
            ));
        }

        debug!(key = %key, "filter cache miss");
        self.inner.counters.record(Outcome::Miss);
        let tag = request.tag.clone();
        let response = self.inner.loader.request(request).await?;

        let Some(expires) = evaluate(
            response.status,
            &response.headers,
            response.body.size_hint(),
            &self.inner.config,
            SystemTime::now(),
        ) else {
            debug!(key = %key, status = %response.status, "filter output not cacheable");
            return Ok(response);
        };

        let Response {
            status,
            headers,
            body,
        } = response;
        let (client, fill) = body::tee(body);

        let inner = Arc::clone(&self.inner);
        let fill_headers = headers.clone();
        self.inner.tracker.spawn(async move {
            let config = &inner.config;
            let result =
                body::fill(fill, config.body_size_limit, config.fill_timeout, &inner.cancel).await;
            match result {
                Ok(body) => {
                    let info = CacheInfo {
                        expires: Some(expires),
                        ..CacheInfo::default()
                    };
                    let document = Document {
                        info,
                        vary: None,
                        status,
                        headers: fill_headers,
                        body,
                        tag,
                    };
                    if inner.store.put(&key, document) {
                        debug!(key = %key, "filter output stored");
                        inner.counters.record(Outcome::Store);
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "filter cache fill aborted");
                    inner.counters.record(Outcome::FillAbort);
                }
            }
        });

        Ok(Response::new(status, headers, client))
    }

    pub fn flush(&self) {
        self.inner.store.flush();
    }

    pub fn flush_tag(&self, tag: &str) -> usize {
        self.inner.store.flush_tag(tag)
    }

    pub fn expire_sweep(&self) -> usize {
        self.inner.store.expire(SystemTime::now())
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot(self.inner.store.stats())
    }

    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{body_text, header, http_date, ScriptedLoader};

    const HOUR: Duration = Duration::from_secs(3600);

    fn filter() -> ResourceAddress {
        ResourceAddress::Http("http://filter/xslt".into())
    }

    fn output(body: &'static str) -> Response {
        Response::new(StatusCode::OK, HeaderMap::new(), Body::from(body))
    }

    fn setup() -> (Arc<ScriptedLoader>, FilterCache) {
        let loader = Arc::new(ScriptedLoader::new(|| output("filtered")));
        let cache = FilterCache::new(FilterCacheConfig::default(), loader.clone());
        (loader, cache)
    }

    async fn run(cache: &FilterCache, source_id: Option<&str>, headers: HeaderMap) -> Response {
        cache
            .request(filter(), source_id, headers, Body::from("<source/>"), None)
            .await
            .unwrap()
    }

    async fn stored(cache: &FilterCache, n: u64) {
        for _ in 0..200 {
            if cache.stats().stores >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} stores, stats {:?}", cache.stats());
    }

    #[test]
    fn evaluation() {
        let config = FilterCacheConfig::default();
        let now = SystemTime::now();
        let none = HeaderMap::new();

        assert_eq!(evaluate(StatusCode::OK, &none, Some(10), &config, now), Some(now + HOUR));
        assert!(evaluate(StatusCode::NO_CONTENT, &none, Some(0), &config, now).is_some());
        assert!(evaluate(StatusCode::NOT_FOUND, &none, Some(10), &config, now).is_none());
        assert!(evaluate(StatusCode::OK, &none, Some(1 << 20), &config, now).is_none());
        let h = header(&[("cache-control", "max-age=60, no-store")]);
        assert!(evaluate(StatusCode::OK, &h, None, &config, now).is_none());
        // only no-store keeps a filter output out of the cache
        for cc in ["no-cache", "private", "private=\"set-cookie\""] {
            let h = header(&[("cache-control", cc)]);
            assert!(evaluate(StatusCode::OK, &h, None, &config, now).is_some(), "{cc}");
        }

        // origin clock 60 s behind
        let origin_now = now - Duration::from_secs(60);
        let mut h = HeaderMap::new();
        h.insert("date", http_date(origin_now));
        h.insert("expires", http_date(origin_now + Duration::from_secs(600)));
        let expires = evaluate(StatusCode::OK, &h, None, &config, now).unwrap();
        let expected = now + Duration::from_secs(600);
        let delta = expires
            .duration_since(expected)
            .unwrap_or_else(|e| e.duration());
        assert!(delta <= Duration::from_secs(1), "{delta:?}");
    }

    #[tokio::test]
    async fn output_is_cached_per_source_and_user() {
        let (loader, cache) = setup();
        let alice = || header(&[("x-cm4all-beng-user", "alice")]);
        let bob = || header(&[("x-cm4all-beng-user", "bob")]);

        assert_eq!(body_text(run(&cache, Some("doc@v1"), alice()).await.body).await, "filtered");
        stored(&cache, 1).await;
        assert_eq!(body_text(run(&cache, Some("doc@v1"), alice()).await.body).await, "filtered");
        assert_eq!(loader.calls(), 1);

        run(&cache, Some("doc@v1"), bob()).await;
        run(&cache, Some("doc@v2"), alice()).await;
        assert_eq!(loader.calls(), 3);

        let seen = loader.last().unwrap();
        assert_eq!(seen.method, Method::POST);
        assert_eq!(seen.address, filter());
        assert_eq!(seen.body.as_deref(), Some(&b"<source/>"[..]));
    }

    #[tokio::test]
    async fn no_source_id_bypasses() {
        let (loader, cache) = setup();
        run(&cache, None, HeaderMap::new()).await;
        run(&cache, None, HeaderMap::new()).await;
        assert_eq!(loader.calls(), 2);
        assert_eq!(cache.stats().skips, 2);
    }

    #[tokio::test]
    async fn no_cache_output_is_still_stored() {
        let loader = Arc::new(ScriptedLoader::new(|| {
            let headers = header(&[("cache-control", "no-cache, private")]);
            Response::new(StatusCode::OK, headers, Body::from("filtered"))
        }));
        let cache = FilterCache::new(FilterCacheConfig::default(), loader.clone());

        run(&cache, Some("doc@v1"), HeaderMap::new()).await;
        stored(&cache, 1).await;
        let response = run(&cache, Some("doc@v1"), HeaderMap::new()).await;
        assert_eq!(body_text(response.body).await, "filtered");
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn no_store_output_is_not_stored() {
        let loader = Arc::new(ScriptedLoader::new(|| {
            let headers = header(&[("cache-control", "no-store")]);
            Response::new(StatusCode::OK, headers, Body::from("filtered"))
        }));
        let cache = FilterCache::new(FilterCacheConfig::default(), loader.clone());

        run(&cache, Some("doc@v1"), HeaderMap::new()).await;
        run(&cache, Some("doc@v1"), HeaderMap::new()).await;
        assert_eq!(loader.calls(), 2);
        assert_eq!(cache.stats().stores, 0);
    }

    #[tokio::test]
    async fn uncacheable_output_passes_through() {
        let (loader, cache) = setup();
        loader.push(Response::new(StatusCode::BAD_GATEWAY, HeaderMap::new(), Body::from("err")));
        let response = run(&cache, Some("doc@v1"), HeaderMap::new()).await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(body_text(response.body).await, "err");

        run(&cache, Some("doc@v1"), HeaderMap::new()).await;
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn flush_and_tags() {
        let (loader, cache) = setup();
        cache
            .request(filter(), Some("a"), HeaderMap::new(), Body::Empty, Some("t".into()))
            .await
            .unwrap();
        run(&cache, Some("b"), HeaderMap::new()).await;
        stored(&cache, 2).await;

        assert_eq!(cache.flush_tag("t"), 1);
        assert_eq!(cache.stats().entries, 1);
        cache.flush();
        assert_eq!(cache.stats().entries, 0);

        run(&cache, Some("b"), HeaderMap::new()).await;
        assert_eq!(loader.calls(), 3);
        cache.close().await;
    }
}
