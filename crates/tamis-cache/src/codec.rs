//! Binary records stored in the key/value backend.
//!
//! All integers are big-endian. Strings are a `u32` length followed by
//! UTF-8 bytes; a string map is a `u32` pair count followed by the pairs.
//! Response header values are length-prefixed raw bytes.
//! Absent timestamps are stored as `u64::MAX`.

use crate::document::{CacheInfo, Document, VaryMap};
use crate::error::DecodeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const CHOICE_MAGIC: u32 = 4;
pub const DOCUMENT_MAGIC: u32 = 1;

const NO_TIME: u64 = u64::MAX;

pub fn put_time(buf: &mut BytesMut, t: Option<SystemTime>) {
    let secs = t
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(NO_TIME, |d| d.as_secs());
    buf.put_u64(secs);
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn put_map<'a>(buf: &mut BytesMut, pairs: impl ExactSizeIterator<Item = (&'a str, &'a str)>) {
    buf.put_u32(pairs.len() as u32);
    for (name, value) in pairs {
        put_string(buf, name);
        put_string(buf, value);
    }
}

/// Header values are written as raw bytes, they need not be UTF-8.
fn put_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    buf.put_u32(headers.len() as u32);
    for (name, value) in headers {
        put_string(buf, name.as_str());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
}

fn put_vary(buf: &mut BytesMut, vary: Option<&VaryMap>) {
    match vary {
        Some(vary) => put_map(buf, vary.iter().map(|(n, v)| (n.as_str(), v.as_str()))),
        None => buf.put_u32(0),
    }
}

/// Cursor over a stored record.
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn into_rest(self) -> Bytes {
        self.buf
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated);
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn time(&mut self) -> Result<Option<SystemTime>, DecodeError> {
        let secs = self.u64()?;
        if secs == NO_TIME {
            return Ok(None);
        }
        Ok(UNIX_EPOCH.checked_add(Duration::from_secs(secs)))
    }

    pub fn bytes(&mut self, n: usize) -> Result<Bytes, DecodeError> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Utf8)
    }

    pub fn pairs(&mut self) -> Result<Vec<(String, String)>, DecodeError> {
        let count = self.u32()? as usize;
        // every pair needs at least two length prefixes
        self.need(count.saturating_mul(8))?;
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.string()?;
            let value = self.string()?;
            pairs.push((name, value));
        }
        Ok(pairs)
    }

    pub fn headers(&mut self) -> Result<HeaderMap, DecodeError> {
        let count = self.u32()? as usize;
        self.need(count.saturating_mul(8))?;
        let mut headers = HeaderMap::with_capacity(count);
        for _ in 0..count {
            let name = self.string()?;
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| DecodeError::Header(name.clone()))?;
            let len = self.u32()? as usize;
            let value = HeaderValue::from_maybe_shared(self.bytes(len)?)
                .map_err(|_| DecodeError::Header(name.as_str().to_string()))?;
            headers.append(name, value);
        }
        Ok(headers)
    }

    /// An empty map decodes as `None`.
    pub fn vary(&mut self) -> Result<Option<VaryMap>, DecodeError> {
        let pairs = self.pairs()?;
        if pairs.is_empty() {
            return Ok(None);
        }
        Ok(Some(pairs.into_iter().collect()))
    }
}

/// One entry of a choice record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceEntry {
    pub expires: Option<SystemTime>,
    pub vary: Option<VaryMap>,
}

pub fn encode_choice(expires: Option<SystemTime>, vary: &VaryMap) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32(CHOICE_MAGIC);
    put_time(&mut buf, expires);
    put_vary(&mut buf, Some(vary));
    buf.freeze()
}

/// Decode the next choice entry. Returns `Ok(None)` at the end of the
/// record or when the next entry does not start with the choice magic.
pub fn decode_choice(reader: &mut Reader) -> Result<Option<ChoiceEntry>, DecodeError> {
    if reader.is_empty() {
        return Ok(None);
    }
    if reader.u32()? != CHOICE_MAGIC {
        return Ok(None);
    }
    let expires = reader.time()?;
    let vary = reader.vary()?;
    Ok(Some(ChoiceEntry { expires, vary }))
}

/// Serialize a document as `u32 header length | header | body`.
pub fn encode_document(document: &Document) -> Bytes {
    let mut header = BytesMut::with_capacity(256);
    header.put_u32(DOCUMENT_MAGIC);
    put_time(&mut header, document.info.expires);
    put_vary(&mut header, document.vary.as_ref());
    header.put_u16(document.status.as_u16());

    put_headers(&mut header, &document.headers);

    put_string(&mut header, document.tag.as_deref().unwrap_or(""));
    header.put_u8(u8::from(document.body.is_some()));

    let body = document.body.as_ref().map_or(&[][..], |b| &b[..]);
    let mut buf = BytesMut::with_capacity(4 + header.len() + body.len());
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(body);
    buf.freeze()
}

/// Parse a stored document. The body shares memory with `data`.
pub fn decode_document(data: Bytes) -> Result<Document, DecodeError> {
    let mut reader = Reader::new(data);
    let header_len = reader.u32()? as usize;
    let mut header = Reader::new(reader.bytes(header_len)?);

    let magic = header.u32()?;
    if magic != DOCUMENT_MAGIC {
        return Err(DecodeError::Magic(magic));
    }

    let expires = header.time()?;
    let vary = header.vary()?;

    let status = header.u16()?;
    let status = StatusCode::from_u16(status).map_err(|_| DecodeError::Status(status))?;

    let headers = header.headers()?;

    let tag = Some(header.string()?).filter(|t| !t.is_empty());
    let has_body = header.u8()? != 0;
    let body = has_body.then(|| reader.into_rest());

    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let info = CacheInfo {
        expires,
        last_modified: text("last-modified"),
        etag: text("etag"),
        vary: text("vary"),
        ..CacheInfo::default()
    };

    Ok(Document {
        info,
        vary,
        status,
        headers,
        body,
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vary(pairs: &[(&str, &str)]) -> VaryMap {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn document() -> Document {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("etag", HeaderValue::from_static("\"abc\""));
        headers.insert("vary", HeaderValue::from_static("accept-encoding"));
        Document {
            info: CacheInfo {
                expires: Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
                ..CacheInfo::default()
            },
            vary: Some(vary(&[("accept-encoding", "gzip")])),
            status: StatusCode::OK,
            headers,
            body: Some(Bytes::from_static(b"hello")),
            tag: Some("site-1".into()),
        }
    }

    #[test]
    fn document_survives_storage() {
        let original = document();
        let decoded = decode_document(encode_document(&original)).unwrap();

        assert_eq!(decoded.status, original.status);
        assert_eq!(decoded.headers, original.headers);
        assert_eq!(decoded.body, original.body);
        assert_eq!(decoded.vary, original.vary);
        assert_eq!(decoded.tag, original.tag);
        assert_eq!(decoded.info.expires, original.info.expires);
        assert_eq!(decoded.info.etag.as_deref(), Some("\"abc\""));
        assert_eq!(decoded.info.vary.as_deref(), Some("accept-encoding"));
    }

    #[test]
    fn opaque_header_values_are_kept() {
        let mut doc = document();
        let latin1 = HeaderValue::from_bytes(b"attachment; filename=caf\xE9.txt").unwrap();
        assert!(latin1.to_str().is_err());
        doc.headers.insert("content-disposition", latin1.clone());
        doc.headers.append("x-multi", HeaderValue::from_static("one"));
        doc.headers.append("x-multi", HeaderValue::from_static("two"));

        let decoded = decode_document(encode_document(&doc)).unwrap();
        assert_eq!(decoded.headers.get("content-disposition"), Some(&latin1));
        assert_eq!(decoded.headers.get_all("x-multi").iter().count(), 2);
        assert_eq!(decoded.headers, doc.headers);
    }

    #[test]
    fn empty_body_differs_from_zero_length() {
        let mut doc = document();
        doc.body = None;
        assert_eq!(decode_document(encode_document(&doc)).unwrap().body, None);

        doc.body = Some(Bytes::new());
        assert_eq!(
            decode_document(encode_document(&doc)).unwrap().body,
            Some(Bytes::new())
        );
    }

    #[test]
    fn truncated_document_is_rejected() {
        let encoded = encode_document(&document());
        assert!(decode_document(encoded.slice(..12)).is_err());
        assert_eq!(decode_document(Bytes::new()).unwrap_err(), DecodeError::Truncated);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u32(99);
        assert_eq!(decode_document(buf.freeze()).unwrap_err(), DecodeError::Magic(99));
    }

    #[test]
    fn choice_entries_concatenate() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut record = BytesMut::new();
        record.put_slice(&encode_choice(Some(now), &vary(&[("accept", "a")])));
        record.put_slice(&encode_choice(None, &vary(&[("accept", "b")])));

        let mut reader = Reader::new(record.freeze());
        let first = decode_choice(&mut reader).unwrap().unwrap();
        assert_eq!(first.expires, Some(now));
        assert_eq!(first.vary, Some(vary(&[("accept", "a")])));
        let second = decode_choice(&mut reader).unwrap().unwrap();
        assert_eq!(second.expires, None);
        assert!(decode_choice(&mut reader).unwrap().is_none());
    }

    #[test]
    fn garbage_choice_fails() {
        let mut buf = BytesMut::new();
        buf.put_u32(CHOICE_MAGIC);
        buf.put_u64(0);
        buf.put_u32(1000);
        let mut reader = Reader::new(buf.freeze());
        assert_eq!(decode_choice(&mut reader).unwrap_err(), DecodeError::Truncated);
    }
}
