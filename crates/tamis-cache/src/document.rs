use crate::rfc;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Captured request header values named by a response's `Vary` header,
/// keyed by lowercase header name.
pub type VaryMap = BTreeMap<String, String>;

/// Cacheability facts about one request/response pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheInfo {
    /// The response comes from a networked origin, so its `Date` header is
    /// required to translate `Expires` into the local clock.
    pub is_remote: bool,
    /// The request carried `Cache-Control: only-if-cached`.
    pub only_if_cached: bool,
    pub has_query_string: bool,
    /// Absolute expiry in local clock terms.
    pub expires: Option<SystemTime>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    /// Raw `Vary` response header value.
    pub vary: Option<String>,
}

/// One stored response, for one Vary-variant of a cache key.
///
/// Immutable once built. Readers hold it through an `Arc`, so a document that
/// is evicted while a client is still streaming it lives on until the last
/// reader is done.
#[derive(Debug, Clone)]
pub struct Document {
    pub info: CacheInfo,
    /// `None` when the response had no `Vary` header.
    pub vary: Option<VaryMap>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// `None` is an explicitly empty body, which is distinct from a
    /// zero-length one.
    pub body: Option<Bytes>,
    pub tag: Option<String>,
}

impl Document {
    /// Build a document, capturing the request headers named by
    /// `info.vary`.
    pub fn new(
        info: CacheInfo,
        request_headers: &HeaderMap,
        status: StatusCode,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Self {
        let vary = info
            .vary
            .as_deref()
            .map(|vary| rfc::copy_vary(vary, request_headers));

        Self {
            info,
            vary,
            status,
            headers,
            body,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    /// Whether this document may be served for a request with these headers.
    pub fn fits(&self, request_headers: &HeaderMap) -> bool {
        self.vary
            .as_ref()
            .map_or(true, |vary| rfc::vary_fits(vary, request_headers))
    }

    /// Whether this document may be served for a request that produced the
    /// captured `other` Vary values. Used to find the variant a new document
    /// replaces.
    pub fn fits_vary(&self, other: Option<&VaryMap>) -> bool {
        let Some(vary) = &self.vary else {
            return true;
        };
        vary.iter().all(|(name, value)| {
            let current = other
                .and_then(|o| o.get(name))
                .map_or("", String::as_str);
            value == current
        })
    }

    /// Still usable without revalidation at `now`.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.info.expires.is_some_and(|expires| expires >= now)
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }

    /// Approximate number of bytes this document occupies.
    pub fn size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len() + 2)
            .sum();
        let vary: usize = self
            .vary
            .iter()
            .flatten()
            .map(|(name, value)| name.len() + value.len() + 2)
            .sum();
        std::mem::size_of::<Self>() + headers + vary + self.body_len()
    }

    /// Copy of this document after a `304 Not Modified`: the new expiry and
    /// the `Expires`/`Cache-Control` headers of the 304 response replace the
    /// stored ones.
    pub fn refreshed(&self, expires: SystemTime, response_headers: &HeaderMap) -> Self {
        let mut document = self.clone();
        document.info.expires = Some(expires);
        for name in [http::header::EXPIRES, http::header::CACHE_CONTROL] {
            document.headers.remove(&name);
            for value in response_headers.get_all(&name) {
                document.headers.append(name.clone(), value.clone());
            }
        }
        document
    }
}
