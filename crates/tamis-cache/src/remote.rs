use crate::age::AgeLimiter;
use crate::choice::{self, ChoiceIndex};
use crate::codec;
use crate::document::Document;
use crate::error::KvError;
use crate::kv::KvClient;
use crate::rfc;
use http::HeaderMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Document store in a shared key/value backend.
///
/// Documents without Vary values live under `"<uri> 00000000"`; every other
/// variant has its own key, found through the [`ChoiceIndex`]. The backend
/// is optional for serving: every failure is logged and reported as a miss.
pub struct RemoteStore {
    kv: Arc<dyn KvClient>,
    choice: Arc<ChoiceIndex>,
    limiter: AgeLimiter,
    tracker: TaskTracker,
}

impl RemoteStore {
    /// `tracker` runs background choice cleanups.
    pub fn new(kv: Arc<dyn KvClient>, limiter: AgeLimiter, tracker: TaskTracker) -> Self {
        Self {
            choice: Arc::new(ChoiceIndex::new(kv.clone())),
            kv,
            limiter,
            tracker,
        }
    }

    pub async fn get(&self, uri: &str, request_headers: &HeaderMap) -> Option<Arc<Document>> {
        match self.lookup(uri, request_headers).await {
            Ok(document) => document.map(Arc::new),
            Err(e) => {
                warn!(uri = %uri, error = %e, "remote cache lookup failed");
                None
            }
        }
    }

    async fn lookup(
        &self,
        uri: &str,
        request_headers: &HeaderMap,
    ) -> Result<Option<Document>, KvError> {
        if let Some(document) = self.load(&choice::vary_key(uri, None), request_headers).await? {
            return Ok(Some(document));
        }

        let now = SystemTime::now();
        let lookup = self.choice.get(uri, request_headers, now).await?;
        if lookup.unclean {
            self.spawn_cleanup(uri, now);
        }

        match lookup.key {
            Some(key) => self.load(&key, request_headers).await,
            None => Ok(None),
        }
    }

    /// Fetch and decode one document, if it fits the request.
    async fn load(&self, key: &str, request_headers: &HeaderMap) -> Result<Option<Document>, KvError> {
        let Some(data) = self.kv.get(key).await? else {
            return Ok(None);
        };

        match codec::decode_document(data) {
            Ok(document) if document.fits(request_headers) => Ok(Some(document)),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!(key = %key, error = %e, "discarding malformed document");
                Ok(None)
            }
        }
    }

    fn spawn_cleanup(&self, uri: &str, now: SystemTime) {
        let choice = self.choice.clone();
        let uri = uri.to_string();
        self.tracker.spawn(async move {
            if let Err(e) = choice.cleanup(&uri, now).await {
                warn!(uri = %uri, error = %e, "choice cleanup failed");
            }
        });
    }

    pub async fn put(&self, uri: &str, document: &Document) -> Result<(), KvError> {
        let vary = document.vary.as_ref().filter(|vary| !vary.is_empty());
        let key = choice::vary_key(uri, vary);

        let now = SystemTime::now();
        let expires = self.limiter.calc_expires(&document.info, now);
        let ttl = expires.duration_since(now).unwrap_or(Duration::ZERO);
        self.kv.set(&key, codec::encode_document(document), ttl).await?;

        if let Some(vary) = vary {
            let record = ChoiceIndex::prepare(uri, Some(expires), vary);
            self.choice.commit(record).await?;
        }
        Ok(())
    }

    /// Remove the stored copy of this document.
    pub async fn remove(&self, uri: &str, document: &Document) -> Result<(), KvError> {
        let vary = document.vary.as_ref().filter(|vary| !vary.is_empty());
        self.kv.delete(&choice::vary_key(uri, vary)).await.map(drop)
    }

    /// Forget every variant of `uri`.
    pub async fn remove_uri(&self, uri: &str) -> Result<(), KvError> {
        self.kv.delete(&choice::vary_key(uri, None)).await?;
        self.choice.delete(uri).await.map(drop)
    }

    /// Remove every variant of `uri` fitting these request headers.
    pub async fn remove_matching(&self, uri: &str, request_headers: &HeaderMap) -> Result<(), KvError> {
        self.kv.delete(&choice::vary_key(uri, None)).await?;

        let doomed = self
            .choice
            .filter(uri, SystemTime::now(), |entry| {
                !entry
                    .vary
                    .as_ref()
                    .map_or(true, |vary| rfc::vary_fits(vary, request_headers))
            })
            .await?;

        for entry in doomed {
            self.kv.delete(&choice::vary_key(uri, entry.vary.as_ref())).await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), KvError> {
        self.kv.flush().await
    }
}
