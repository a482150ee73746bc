use crate::age::AgeLimiter;
use crate::document::Document;
use http::HeaderMap;
use std::sync::Arc;
use std::time::SystemTime;
use tamis_store::{CacheItem, ShardedStore, StoreStats};

/// A document as held by the in-process store.
pub struct HeapEntry {
    pub document: Arc<Document>,
    expires: SystemTime,
    size: usize,
}

impl CacheItem for HeapEntry {
    fn size(&self) -> usize {
        self.size
    }

    fn expires(&self) -> SystemTime {
        self.expires
    }

    fn tag(&self) -> Option<&str> {
        self.document.tag.as_deref()
    }
}

/// In-process, size-bounded document store keyed by cache key, holding one
/// entry per Vary-variant.
pub struct HeapStore {
    store: ShardedStore<HeapEntry>,
    limiter: AgeLimiter,
}

impl HeapStore {
    pub fn new(max_size: usize, max_item_size: usize, limiter: AgeLimiter) -> Self {
        Self {
            store: ShardedStore::new(max_size, max_item_size),
            limiter,
        }
    }

    /// The variant of `key` fitting these request headers.
    pub fn get(&self, key: &str, request_headers: &HeaderMap) -> Option<Arc<Document>> {
        self.store
            .get_match(key, SystemTime::now(), |entry| {
                entry.document.fits(request_headers)
            })
            .map(|entry| entry.document.clone())
    }

    /// Store a document, replacing the variant with the same Vary values.
    /// Returns false if the document does not fit in the store.
    pub fn put(&self, key: &str, document: Document) -> bool {
        let expires = self.limiter.calc_expires(&document.info, SystemTime::now());
        let entry = HeapEntry {
            size: document.size(),
            document: Arc::new(document),
            expires,
        };

        let vary = entry.document.vary.clone();
        self.store.put_match(key.to_string(), entry, |old| {
            old.document.fits_vary(vary.as_ref())
        })
    }

    /// Remove exactly this document, if it is still stored.
    pub fn remove(&self, key: &str, document: &Arc<Document>) -> bool {
        // entries are only ever compared by identity
        let probe = self
            .store
            .get_match(key, SystemTime::now(), |entry| {
                Arc::ptr_eq(&entry.document, document)
            });
        match probe {
            Some(entry) => self.store.remove_item(key, &entry),
            None => false,
        }
    }

    /// Remove every variant of `key` that fits these request headers.
    pub fn remove_matching(&self, key: &str, request_headers: &HeaderMap) -> usize {
        self.store
            .remove_match(key, |entry| entry.document.fits(request_headers))
    }

    /// Remove every variant of `key`.
    pub fn remove_key(&self, key: &str) -> usize {
        self.store.remove_match(key, |_| true)
    }

    pub fn flush(&self) {
        self.store.flush();
    }

    pub fn flush_tag(&self, tag: &str) -> usize {
        self.store.remove_if(|_, entry| entry.tag() == Some(tag))
    }

    /// Drop everything that expired before `now`.
    pub fn expire(&self, now: SystemTime) -> usize {
        self.store.expire(now)
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::CacheInfo;
    use bytes::Bytes;
    use http::{HeaderValue, StatusCode};
    use std::time::Duration;

    fn store() -> HeapStore {
        HeapStore::new(1 << 20, 64 << 10, AgeLimiter::default())
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn document(vary: Option<&str>, request: &HeaderMap, body: &'static str) -> Document {
        let info = CacheInfo {
            expires: Some(SystemTime::now() + Duration::from_secs(600)),
            vary: vary.map(str::to_string),
            ..CacheInfo::default()
        };
        Document::new(
            info,
            request,
            StatusCode::OK,
            HeaderMap::new(),
            Some(Bytes::from_static(body.as_bytes())),
        )
    }

    #[test]
    fn put_then_get() {
        let store = store();
        let request = HeaderMap::new();
        assert!(store.put("/foo", document(None, &request, "hello")));

        let found = store.get("/foo", &request).unwrap();
        assert_eq!(found.body.as_deref(), Some(&b"hello"[..]));
        assert!(store.get("/bar", &request).is_none());
    }

    #[test]
    fn variants_are_isolated() {
        let store = store();
        let gzip = headers(&[("accept-encoding", "gzip")]);
        let plain = HeaderMap::new();
        store.put("/foo", document(Some("accept-encoding"), &gzip, "zipped"));
        store.put("/foo", document(Some("accept-encoding"), &plain, "plain"));

        assert_eq!(store.get("/foo", &gzip).unwrap().body.as_deref(), Some(&b"zipped"[..]));
        assert_eq!(store.get("/foo", &plain).unwrap().body.as_deref(), Some(&b"plain"[..]));
        assert!(store.get("/foo", &headers(&[("accept-encoding", "br")])).is_none());
        assert_eq!(store.stats().entries, 2);
    }

    #[test]
    fn same_variant_is_replaced() {
        let store = store();
        let gzip = headers(&[("accept-encoding", "gzip")]);
        store.put("/foo", document(Some("accept-encoding"), &gzip, "old"));
        store.put("/foo", document(Some("accept-encoding"), &gzip, "new"));

        assert_eq!(store.stats().entries, 1);
        assert_eq!(store.get("/foo", &gzip).unwrap().body.as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn remove_by_identity() {
        let store = store();
        let request = HeaderMap::new();
        store.put("/foo", document(None, &request, "a"));
        let first = store.get("/foo", &request).unwrap();

        store.put("/foo", document(None, &request, "b"));
        assert!(!store.remove("/foo", &first), "already replaced");

        let second = store.get("/foo", &request).unwrap();
        assert!(store.remove("/foo", &second));
        assert!(store.get("/foo", &request).is_none());
        // the borrowed copy outlives its removal
        assert_eq!(second.body.as_deref(), Some(&b"b"[..]));
    }

    #[test]
    fn remove_matching_and_tags() {
        let store = store();
        let gzip = headers(&[("accept-encoding", "gzip")]);
        let plain = HeaderMap::new();
        store.put("/foo", document(Some("accept-encoding"), &gzip, "z"));
        store.put("/foo", document(Some("accept-encoding"), &plain, "p"));
        store.put(
            "/bar",
            document(None, &plain, "b").with_tag(Some("site-1".into())),
        );

        assert_eq!(store.remove_matching("/foo", &gzip), 1);
        assert!(store.get("/foo", &plain).is_some());

        assert_eq!(store.flush_tag("site-1"), 1);
        assert!(store.get("/bar", &plain).is_none());

        store.flush();
        assert_eq!(store.stats().entries, 0);
    }

    #[test]
    fn age_limit_caps_lifetime() {
        let store = store();
        let request = headers(&[("x-cm4all-beng-user", "alice")]);
        let mut doc = document(Some("x-cm4all-beng-user"), &request, "mine");
        doc.info.expires = Some(SystemTime::now() + Duration::from_secs(86400));
        store.put("/foo", doc);

        assert_eq!(store.expire(SystemTime::now() + Duration::from_secs(60)), 0);
        assert_eq!(store.expire(SystemTime::now() + Duration::from_secs(301)), 1);
    }

    #[test]
    fn oversized_documents_are_rejected() {
        let store = HeapStore::new(1024, 1024, AgeLimiter::default());
        let request = HeaderMap::new();
        let mut doc = document(None, &request, "");
        doc.body = Some(Bytes::from(vec![0u8; 4096]));
        assert!(!store.put("/big", doc));
    }
}
