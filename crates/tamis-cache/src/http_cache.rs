use crate::age::AgeLimiter;
use crate::body::{self, Body};
use crate::document::{CacheInfo, Document};
use crate::error::LoaderError;
use crate::heap::HeapStore;
use crate::kv::KvClient;
use crate::loader::{Request, ResourceAddress, ResourceLoader, Response};
use crate::remote::RemoteStore;
use crate::rfc::{self, Precondition};
use crate::stats::{CacheStats, Counters, Outcome};
use async_trait::async_trait;
use http::header::{HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tamis_store::StoreStats;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpCacheConfig {
    /// Byte budget of the in-process store.
    pub max_size: usize,
    /// Larger responses are never stored.
    pub body_size_limit: usize,
    /// A fill still running after this long is abandoned.
    pub fill_timeout: Duration,
    /// Honor `no-cache`/`no-store` in requests.
    pub obey_no_cache: bool,
    pub age_limiter: AgeLimiter,
}

impl Default for HttpCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024,
            body_size_limit: 256 * 1024,
            fill_timeout: Duration::from_secs(60),
            obey_no_cache: true,
            age_limiter: AgeLimiter::default(),
        }
    }
}

enum Backend {
    Heap(HeapStore),
    Remote(RemoteStore),
}

impl Backend {
    async fn get(&self, key: &str, request_headers: &HeaderMap) -> Option<Arc<Document>> {
        match self {
            Backend::Heap(heap) => heap.get(key, request_headers),
            Backend::Remote(remote) => remote.get(key, request_headers).await,
        }
    }

    async fn put(&self, key: &str, document: Document) -> bool {
        match self {
            Backend::Heap(heap) => heap.put(key, document),
            Backend::Remote(remote) => match remote.put(key, &document).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "remote cache store failed");
                    false
                }
            },
        }
    }

    async fn remove(&self, key: &str, document: &Arc<Document>) {
        match self {
            Backend::Heap(heap) => {
                heap.remove(key, document);
            }
            Backend::Remote(remote) => {
                if let Err(e) = remote.remove(key, document).await {
                    warn!(key = %key, error = %e, "remote cache remove failed");
                }
            }
        }
    }

    async fn remove_matching(&self, key: &str, request_headers: &HeaderMap) {
        match self {
            Backend::Heap(heap) => {
                heap.remove_matching(key, request_headers);
            }
            Backend::Remote(remote) => {
                if let Err(e) = remote.remove_matching(key, request_headers).await {
                    warn!(key = %key, error = %e, "remote cache invalidation failed");
                }
            }
        }
    }

    async fn remove_key(&self, key: &str) {
        match self {
            Backend::Heap(heap) => {
                heap.remove_key(key);
            }
            Backend::Remote(remote) => {
                if let Err(e) = remote.remove_uri(key).await {
                    warn!(key = %key, error = %e, "remote cache invalidation failed");
                }
            }
        }
    }

    async fn flush(&self) {
        match self {
            Backend::Heap(heap) => heap.flush(),
            Backend::Remote(remote) => {
                if let Err(e) = remote.flush().await {
                    warn!(error = %e, "remote cache flush failed");
                }
            }
        }
    }

    fn flush_tag(&self, tag: &str) -> usize {
        match self {
            Backend::Heap(heap) => heap.flush_tag(tag),
            Backend::Remote(_) => {
                warn!(tag = %tag, "tag flush is not supported by the remote backend");
                0
            }
        }
    }

    fn expire(&self, now: SystemTime) -> usize {
        match self {
            Backend::Heap(heap) => heap.expire(now),
            // the backend expires records by itself
            Backend::Remote(_) => 0,
        }
    }

    fn stats(&self) -> StoreStats {
        match self {
            Backend::Heap(heap) => heap.stats(),
            Backend::Remote(_) => StoreStats::default(),
        }
    }
}

struct Inner {
    loader: Arc<dyn ResourceLoader>,
    backend: Backend,
    config: HttpCacheConfig,
    counters: Counters,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Caching [`ResourceLoader`] wrapper for GET responses.
///
/// Cacheable responses are teed: the client streams one branch while a
/// background task collects the other and stores it. The fill never
/// delays or fails the client response.
#[derive(Clone)]
pub struct HttpCache {
    inner: Arc<Inner>,
}

impl HttpCache {
    /// Cache in process memory.
    pub fn new(config: HttpCacheConfig, loader: Arc<dyn ResourceLoader>) -> Self {
        let heap = HeapStore::new(
            config.max_size,
            config.body_size_limit,
            config.age_limiter.clone(),
        );
        Self::with_backend(config, loader, |_| Backend::Heap(heap))
    }

    /// Cache in a shared key/value backend.
    pub fn remote(
        config: HttpCacheConfig,
        loader: Arc<dyn ResourceLoader>,
        kv: Arc<dyn KvClient>,
    ) -> Self {
        let limiter = config.age_limiter.clone();
        Self::with_backend(config, loader, |tracker| {
            Backend::Remote(RemoteStore::new(kv, limiter, tracker.clone()))
        })
    }

    fn with_backend(
        config: HttpCacheConfig,
        loader: Arc<dyn ResourceLoader>,
        backend: impl FnOnce(&TaskTracker) -> Backend,
    ) -> Self {
        let tracker = TaskTracker::new();
        Self {
            inner: Arc::new(Inner {
                loader,
                backend: backend(&tracker),
                config,
                counters: Counters::new("tamis_http_cache"),
                tracker,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &HttpCacheConfig {
        &self.inner.config
    }

    async fn forward(&self, request: Request) -> Result<Response, LoaderError> {
        self.inner.counters.record(Outcome::Skip);
        self.inner.loader.request(request).await
    }

    async fn handle(&self, request: Request) -> Result<Response, LoaderError> {
        let Some(key) = request
            .address
            .cache_key()
            .filter(|key| key.len() <= rfc::MAX_KEY_LENGTH)
        else {
            return self.forward(request).await;
        };

        let info = rfc::evaluate_request(
            &request.method,
            &request.address,
            &request.headers,
            request.body.is_some(),
            self.inner.config.obey_no_cache,
        );
        let Some(info) = info else {
            if rfc::request_invalidates(&request.method) {
                debug!(key = %key, method = %request.method, "invalidating");
                self.inner.backend.remove_matching(&key, &request.headers).await;
            }
            return self.forward(request).await;
        };

        match self.inner.backend.get(&key, &request.headers).await {
            Some(document) => self.found(key, info, request, document).await,
            None if info.only_if_cached => {
                debug!(key = %key, "only-if-cached miss");
                self.inner.counters.record(Outcome::Miss);
                Ok(Response::empty(StatusCode::GATEWAY_TIMEOUT))
            }
            None => {
                debug!(key = %key, "miss");
                self.inner.counters.record(Outcome::Miss);
                self.miss(key, info, request).await
            }
        }
    }

    async fn found(
        &self,
        key: String,
        info: CacheInfo,
        request: Request,
        document: Arc<Document>,
    ) -> Result<Response, LoaderError> {
        if info.only_if_cached || document.is_fresh(SystemTime::now()) {
            debug!(key = %key, "hit");
            self.inner.counters.record(Outcome::Hit);
            return Ok(serve(document, &request.headers));
        }

        debug!(key = %key, "revalidating");
        self.revalidate(key, info, request, document).await
    }

    async fn miss(
        &self,
        key: String,
        info: CacheInfo,
        request: Request,
    ) -> Result<Response, LoaderError> {
        let request_headers = request.headers.clone();
        let tag = request.tag.clone();
        let response = self.inner.loader.request(request).await?;
        Ok(self.store_response(key, info, request_headers, tag, response))
    }

    /// Ask the origin whether a stale document is still current.
    async fn revalidate(
        &self,
        key: String,
        info: CacheInfo,
        mut request: Request,
        document: Arc<Document>,
    ) -> Result<Response, LoaderError> {
        let client_headers = request.headers.clone();
        let tag = request.tag.clone();

        let validator = |value: &Option<String>| {
            value
                .as_deref()
                .and_then(|v| HeaderValue::from_str(v).ok())
        };
        if let Some(last_modified) = validator(&document.info.last_modified) {
            request.headers.insert(IF_MODIFIED_SINCE, last_modified);
        }
        if let Some(etag) = validator(&document.info.etag) {
            request.headers.insert(IF_NONE_MATCH, etag);
        }

        let response = self.inner.loader.request(request).await?;

        if response.status == StatusCode::NOT_MODIFIED {
            debug!(key = %key, "not modified");
            let now = SystemTime::now();
            let document = match rfc::not_modified_expires(&response.headers, now) {
                Some(expires) if expires >= now => {
                    let refreshed = document.refreshed(expires, &response.headers);
                    self.inner.backend.put(&key, refreshed.clone()).await;
                    Arc::new(refreshed)
                }
                _ => document,
            };
            self.inner.counters.record(Outcome::Hit);
            return Ok(serve(document, &client_headers));
        }

        if rfc::prefer_cached(&document, &response.headers) {
            debug!(key = %key, "matching etag, using cached copy");
            self.inner.counters.record(Outcome::Hit);
            return Ok(serve(document, &client_headers));
        }

        self.inner.backend.remove(&key, &document).await;
        self.inner.counters.record(Outcome::Miss);
        Ok(self.store_response(key, info, client_headers, tag, response))
    }

    /// Hand the response to the client, storing a copy if it is cacheable.
    fn store_response(
        &self,
        key: String,
        mut info: CacheInfo,
        request_headers: HeaderMap,
        tag: Option<String>,
        response: Response,
    ) -> Response {
        let accepted = rfc::evaluate_response(
            &mut info,
            response.status,
            &response.headers,
            response.body.size_hint(),
            self.inner.config.body_size_limit as u64,
            SystemTime::now(),
        );
        if !accepted {
            debug!(key = %key, status = %response.status, "not cacheable");
            return response;
        }

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
                    let document = Document::new(info, &request_headers, status, fill_headers, body)
                        .with_tag(tag);
                    if inner.backend.put(&key, document).await {
                        debug!(key = %key, "stored");
                        inner.counters.record(Outcome::Store);
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "cache fill aborted");
                    inner.counters.record(Outcome::FillAbort);
                }
            }
        });

        Response::new(status, headers, client)
    }

    /// Remove every stored variant of `address`.
    pub async fn invalidate(&self, address: &ResourceAddress) {
        if let Some(key) = address.cache_key() {
            self.inner.backend.remove_key(&key).await;
        }
    }

    pub async fn flush(&self) {
        self.inner.backend.flush().await;
    }

    /// Drop every document stored with `tag`.
    pub fn flush_tag(&self, tag: &str) -> usize {
        self.inner.backend.flush_tag(tag)
    }

    /// Drop documents whose lifetime ended.
    pub fn expire_sweep(&self) -> usize {
        self.inner.backend.expire(SystemTime::now())
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot(self.inner.backend.stats())
    }

    /// Abandon all running fills and background jobs and wait for them.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

/// Answer a request from a stored document.
fn serve(document: Arc<Document>, request_headers: &HeaderMap) -> Response {
    match rfc::check_preconditions(request_headers, &document) {
        Precondition::Failed => Response::empty(StatusCode::PRECONDITION_FAILED),
        Precondition::NotModified => {
            Response::new(StatusCode::NOT_MODIFIED, document.headers.clone(), Body::Empty)
        }
        Precondition::Serve => Response::new(
            document.status,
            document.headers.clone(),
            Body::from_document(document),
        ),
    }
}

#[async_trait]
impl ResourceLoader for HttpCache {
    async fn request(&self, request: Request) -> Result<Response, LoaderError> {
        self.handle(request).await
    }
}
