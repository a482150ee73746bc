//! In-process resource loader for orchestrator tests.

use crate::body::Body;
use crate::error::LoaderError;
use crate::loader::{Request, ResourceAddress, ResourceLoader, Response};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// What the loader saw of one request.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub address: ResourceAddress,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Builds a response on every call.
type Responder = Box<dyn Fn() -> Response + Send + Sync>;

/// Answers requests from a queue of scripted responses, falling back to a
/// default responder, and records every request.
pub struct ScriptedLoader {
    queue: Mutex<VecDeque<Response>>,
    fallback: Responder,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedLoader {
    pub fn new(fallback: impl Fn() -> Response + Send + Sync + 'static) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Box::new(fallback),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Serve `response` for the next request only.
    pub fn push(&self, response: Response) {
        self.queue.lock().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn last(&self) -> Option<SeenRequest> {
        self.seen.lock().last().cloned()
    }
}

#[async_trait]
impl ResourceLoader for ScriptedLoader {
    async fn request(&self, request: Request) -> Result<Response, LoaderError> {
        let body = match request.body {
            Some(body) => Some(body.collect(usize::MAX).await.map_err(|e| {
                LoaderError::Upstream(e.to_string())
            })?),
            None => None,
        };
        self.seen.lock().push(SeenRequest {
            method: request.method,
            address: request.address,
            headers: request.headers,
            body,
        });

        let scripted = self.queue.lock().pop_front();
        Ok(scripted.unwrap_or_else(|| (self.fallback)()))
    }
}

/// A loader whose origin is down.
pub struct FailingLoader;

#[async_trait]
impl ResourceLoader for FailingLoader {
    async fn request(&self, _request: Request) -> Result<Response, LoaderError> {
        Err(LoaderError::Upstream("connection refused".into()))
    }
}

pub fn http_date(t: SystemTime) -> HeaderValue {
    // always a valid header value
    HeaderValue::from_str(&httpdate::fmt_http_date(t)).unwrap()
}

/// `200` with `Date: now` and `Expires: now + ttl`.
pub fn fresh_response(body: &'static str, ttl: Duration) -> Response {
    let now = SystemTime::now();
    let mut headers = HeaderMap::new();
    headers.insert("date", http_date(now));
    headers.insert("expires", http_date(now + ttl));
    Response::new(StatusCode::OK, headers, Body::Full(Bytes::from_static(body.as_bytes())))
}

pub fn header(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.append(*name, HeaderValue::from_str(value).unwrap());
    }
    map
}

pub async fn body_text(body: Body) -> String {
    let bytes = body.collect(usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
