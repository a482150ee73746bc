use crate::body::Body;
use crate::error::LoaderError;
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};

/// Where a resource is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceAddress {
    /// A file on the local filesystem. Never cached by the HTTP cache.
    Local(String),
    /// An absolute URL on a networked HTTP origin.
    Http(String),
    /// A URI served by a local application process.
    App(String),
}

impl ResourceAddress {
    /// Key under which responses for this address are stored.
    pub fn cache_key(&self) -> Option<String> {
        match self {
            ResourceAddress::Local(_) => None,
            ResourceAddress::Http(uri) => Some(uri.clone()),
            ResourceAddress::App(uri) => Some(format!("app:{uri}")),
        }
    }

    /// Stable identity of this address, used to build filter cache keys.
    pub fn id(&self) -> String {
        match self {
            ResourceAddress::Local(path) => format!("file:{path}"),
            ResourceAddress::Http(uri) => uri.clone(),
            ResourceAddress::App(uri) => format!("app:{uri}"),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ResourceAddress::Http(_))
    }

    pub fn has_query_string(&self) -> bool {
        match self {
            ResourceAddress::Local(_) => false,
            ResourceAddress::Http(uri) | ResourceAddress::App(uri) => uri.contains('?'),
        }
    }
}

/// A request for a resource.
pub struct Request {
    pub method: Method,
    pub address: ResourceAddress,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    /// Opaque tag remembered by stored documents, for grouped invalidation.
    pub tag: Option<String>,
}

impl Request {
    pub fn get(address: ResourceAddress, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            address,
            headers,
            body: None,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// A response head plus body stream. Served responses look the same whether
/// they came from a cache or from the origin.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// A response without body.
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), Body::Empty)
    }
}

/// Fetches resources from their origin.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn request(&self, request: Request) -> Result<Response, LoaderError>;
}
