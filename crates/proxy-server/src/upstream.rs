//! Origin access over hyper, and body conversion between axum and the cache.

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use axum::http::{header, HeaderMap, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::BodyExt;
use hyper::body::Body as _;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use std::io::ErrorKind;
use std::time::Duration;
use tamis_cache::{
    Body, BodyError, LoaderError, Request, ResourceAddress, ResourceLoader, Response,
};

pub type HttpClient = Client<HttpConnector, AxumBody>;

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// A client request body, or `None` if the client sent none.
pub fn from_axum(body: AxumBody, headers: &HeaderMap) -> Option<Body> {
    if body.is_end_stream() {
        return None;
    }
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(BodyError::stream));
    Some(Body::from_stream(stream, content_length(headers)))
}

fn from_incoming(body: Incoming, headers: &HeaderMap) -> Body {
    if body.is_end_stream() {
        return Body::Empty;
    }
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(BodyError::stream));
    Body::from_stream(stream, content_length(headers))
}

pub fn into_axum(body: Body) -> AxumBody {
    match body {
        Body::Empty => AxumBody::empty(),
        Body::Full(bytes) => AxumBody::from(bytes),
        stream => AxumBody::from_stream(stream.into_stream()),
    }
}

/// Fetches HTTP and application addresses with a pooled hyper client, and
/// local addresses from the filesystem.
pub struct HttpLoader {
    client: HttpClient,
    timeout: Duration,
}

impl HttpLoader {
    /// `timeout` bounds the wait for the response head, not the body.
    pub fn new(client: HttpClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn fetch(&self, uri: &str, request: Request) -> Result<Response, LoaderError> {
        let mut builder = axum::http::Request::builder()
            .method(request.method)
            .uri(uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = request.headers;
            strip_hop_by_hop(headers);
            headers.remove(header::HOST);
        }
        let body = request.body.map_or_else(AxumBody::empty, into_axum);
        let upstream = builder
            .body(body)
            .map_err(|e| LoaderError::Address(format!("{uri}: {e}")))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(upstream))
            .await
            .map_err(|_| LoaderError::Timeout(self.timeout))?
            .map_err(|e| LoaderError::Upstream(e.to_string()))?;

        let (parts, incoming) = response.into_parts();
        let mut headers = parts.headers;
        let body = from_incoming(incoming, &headers);
        strip_hop_by_hop(&mut headers);
        Ok(Response::new(parts.status, headers, body))
    }

    async fn read_file(path: &str) -> Result<Response, LoaderError> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Response::new(
                StatusCode::OK,
                HeaderMap::new(),
                Body::Full(Bytes::from(data)),
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Response::empty(StatusCode::NOT_FOUND)),
            Err(e) => Err(LoaderError::Upstream(format!("{path}: {e}"))),
        }
    }
}

#[async_trait]
impl ResourceLoader for HttpLoader {
    async fn request(&self, request: Request) -> Result<Response, LoaderError> {
        match request.address.clone() {
            ResourceAddress::Local(path) => Self::read_file(&path).await,
            ResourceAddress::Http(uri) | ResourceAddress::App(uri) => {
                self.fetch(&uri, request).await
            }
        }
    }
}
