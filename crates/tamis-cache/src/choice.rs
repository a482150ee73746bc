//! Index of the Vary-variants stored for one URI in the key/value backend.
//!
//! The choice record under `"<uri> choice"` is a concatenation of
//! `(magic, expires, vary)` tuples, newest first. Each tuple names the
//! document key `"<uri> <hash of vary>"`. Writers never compare-and-swap, so
//! concurrent commits may lose tuples or leave duplicates behind; lookups
//! report such records as unclean and [`ChoiceIndex::cleanup`] repairs them.

use crate::codec::{self, ChoiceEntry, Reader};
use crate::document::VaryMap;
use crate::error::KvError;
use crate::kv::KvClient;
use crate::rfc;
use ahash::AHashSet;
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Lifetime of a choice record in the backend.
pub const CHOICE_TTL: Duration = Duration::from_secs(600);

const ABBREVIATE_THRESHOLD: usize = 232;
const ABBREVIATE_KEEP: usize = 200;

fn djb_hash(s: &str) -> u32 {
    s.bytes()
        .fold(5381u32, |h, c| h.wrapping_mul(33) ^ u32::from(c))
}

/// Order-independent hash of captured Vary values; 0 when there are none.
pub fn vary_hash(vary: Option<&VaryMap>) -> u32 {
    vary.into_iter()
        .flatten()
        .fold(0, |h, (name, value)| h ^ djb_hash(name) ^ djb_hash(value))
}

/// Shorten URIs that would make overlong backend keys, replacing the tail
/// with its digest.
pub fn abbreviate(uri: &str) -> std::borrow::Cow<'_, str> {
    if uri.len() < ABBREVIATE_THRESHOLD {
        return uri.into();
    }

    let mut cut = ABBREVIATE_KEEP;
    while !uri.is_char_boundary(cut) {
        cut -= 1;
    }
    let (head, tail) = uri.split_at(cut);
    format!("{head}~{}", hex::encode(Sha256::digest(tail.as_bytes()))).into()
}

/// Backend key of the document for `uri` with these Vary values.
pub fn vary_key(uri: &str, vary: Option<&VaryMap>) -> String {
    format!("{} {:08x}", abbreviate(uri), vary_hash(vary))
}

pub fn choice_key(uri: &str) -> String {
    format!("{} choice", abbreviate(uri))
}

/// Result of [`ChoiceIndex::get`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChoiceLookup {
    /// Document key of the first live variant fitting the request.
    pub key: Option<String>,
    /// The record contains garbage, duplicates or expired tuples.
    pub unclean: bool,
}

/// One serialized tuple waiting to be committed.
#[derive(Debug, Clone)]
pub struct ChoiceRecord {
    uri: String,
    data: Bytes,
}

fn is_expired(entry: &ChoiceEntry, now: SystemTime) -> bool {
    entry.expires.is_some_and(|expires| expires < now)
}

pub struct ChoiceIndex {
    kv: Arc<dyn KvClient>,
}

impl ChoiceIndex {
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    /// Find the document key of the variant fitting `request_headers`.
    pub async fn get(
        &self,
        uri: &str,
        request_headers: &HeaderMap,
        now: SystemTime,
    ) -> Result<ChoiceLookup, KvError> {
        let mut lookup = ChoiceLookup::default();
        let Some(data) = self.kv.get(&choice_key(uri)).await? else {
            return Ok(lookup);
        };

        let mut reader = Reader::new(data);
        let mut seen = AHashSet::new();
        loop {
            let entry = match codec::decode_choice(&mut reader) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(_) => {
                    lookup.unclean = true;
                    break;
                }
            };

            let hash = vary_hash(entry.vary.as_ref());
            if hash != 0 && !seen.insert(hash) {
                // an older tuple for the same variant, or a collision
                lookup.unclean = true;
            } else if is_expired(&entry, now) {
                lookup.unclean = true;
            } else if lookup.key.is_none()
                && entry
                    .vary
                    .as_ref()
                    .map_or(true, |vary| rfc::vary_fits(vary, request_headers))
            {
                lookup.key = Some(vary_key(uri, entry.vary.as_ref()));
            }

            if lookup.key.is_some() && lookup.unclean {
                break;
            }
        }

        Ok(lookup)
    }

    pub fn prepare(uri: &str, expires: Option<SystemTime>, vary: &VaryMap) -> ChoiceRecord {
        ChoiceRecord {
            uri: uri.to_string(),
            data: codec::encode_choice(expires, vary),
        }
    }

    /// Put the tuple in front of the existing record, creating the record
    /// if there is none.
    pub async fn commit(&self, record: ChoiceRecord) -> Result<(), KvError> {
        let key = choice_key(&record.uri);
        if self.kv.prepend(&key, record.data.clone()).await? {
            return Ok(());
        }
        if !self.kv.add(&key, record.data, CHOICE_TTL).await? {
            // someone else created it in the meantime; the tuple is lost
            // until the next commit for this variant
            tracing::debug!(key = %key, "choice record appeared concurrently");
        }
        Ok(())
    }

    /// Rewrite the record keeping live, unique tuples for which `keep`
    /// returns true. Returns the tuples rejected by `keep`.
    ///
    /// A tuple that cannot be decoded ends the record; it and everything
    /// after it are dropped.
    pub async fn filter(
        &self,
        uri: &str,
        now: SystemTime,
        mut keep: impl FnMut(&ChoiceEntry) -> bool + Send,
    ) -> Result<Vec<ChoiceEntry>, KvError> {
        let key = choice_key(uri);
        let Some(data) = self.kv.get(&key).await? else {
            return Ok(Vec::new());
        };

        let total = data.len();
        let mut reader = Reader::new(data.clone());
        let mut seen = AHashSet::new();
        let mut kept = BytesMut::with_capacity(total);
        let mut rejected = Vec::new();

        loop {
            let start = total - reader.remaining();
            let entry = match codec::decode_choice(&mut reader) {
                Ok(Some(entry)) => entry,
                Ok(None) | Err(_) => break,
            };
            let end = total - reader.remaining();

            if !seen.insert(vary_hash(entry.vary.as_ref())) || is_expired(&entry, now) {
                continue;
            }
            if !keep(&entry) {
                rejected.push(entry);
                continue;
            }
            kept.extend_from_slice(&data[start..end]);
        }

        if kept.len() == total {
            return Ok(rejected);
        }

        if kept.is_empty() {
            self.kv.delete(&key).await?;
        } else {
            self.kv.replace(&key, kept.freeze(), CHOICE_TTL).await?;
        }
        Ok(rejected)
    }

    /// Drop expired and duplicate tuples.
    pub async fn cleanup(&self, uri: &str, now: SystemTime) -> Result<(), KvError> {
        self.filter(uri, now, |_| true).await.map(drop)
    }

    /// Remove the whole record. The documents it pointed to are left to
    /// expire in the backend.
    pub async fn delete(&self, uri: &str) -> Result<bool, KvError> {
        self.kv.delete(&choice_key(uri)).await
    }
}
