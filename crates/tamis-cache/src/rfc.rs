//! Caching rules of RFC 2616 / RFC 7234.

use crate::document::{CacheInfo, Document, VaryMap};
use crate::loader::ResourceAddress;
use http::header::{self, HeaderMap};
use http::{Method, StatusCode};
use std::time::{Duration, SystemTime};
use tracing::warn;

/// Requests whose cache key is longer than this bypass the cache.
pub const MAX_KEY_LENGTH: usize = 8192;

/// Split a comma separated header list into trimmed, non-empty items.
pub fn list_items(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

pub fn list_contains(value: &str, wanted: &str) -> bool {
    list_items(value).any(|item| item.eq_ignore_ascii_case(wanted))
}

/// All non-empty values of a header joined with `", "`, or `None` when
/// there are none.
pub fn joined_header(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    let mut joined: Option<String> = None;
    for value in headers.get_all(name) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match &mut joined {
            Some(s) => {
                s.push_str(", ");
                s.push_str(value);
            }
            None => joined = Some(value.to_string()),
        }
    }
    joined
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn parse_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value.trim()).ok()
}

/// Check whether a request could produce a cacheable response.
///
/// Returns `None` if the cache must be bypassed entirely.
pub fn evaluate_request(
    method: &Method,
    address: &ResourceAddress,
    headers: &HeaderMap,
    has_body: bool,
    obey_no_cache: bool,
) -> Option<CacheInfo> {
    // RFC 2616 13.11 "Write-Through Mandatory"
    if *method != Method::GET || has_body {
        return None;
    }

    if headers.contains_key(header::RANGE) {
        return None;
    }

    // RFC 2616 14.8: a shared cache must not reuse responses to
    // authorized requests
    if headers.contains_key(header::AUTHORIZATION) {
        return None;
    }

    let mut info = CacheInfo::default();

    match joined_header(headers, header::CACHE_CONTROL) {
        Some(cc) => {
            for item in list_items(&cc) {
                if obey_no_cache && (item == "no-cache" || item == "no-store") {
                    return None;
                }
                if item == "only-if-cached" {
                    info.only_if_cached = true;
                }
            }
        }
        None => {
            if obey_no_cache && header_str(headers, "pragma") == Some("no-cache") {
                return None;
            }
        }
    }

    info.is_remote = address.is_remote();
    info.has_query_string = address.has_query_string();
    Some(info)
}

/// RFC 2616 13.10 "Invalidation After Updates or Deletions"
pub fn request_invalidates(method: &Method) -> bool {
    *method == Method::PUT || *method == Method::DELETE || *method == Method::POST
}

/// Translate a timestamp from the origin's clock into ours.
pub(crate) fn translate_time(t: SystemTime, origin_now: SystemTime, now: SystemTime) -> SystemTime {
    match now.duration_since(origin_now) {
        Ok(ahead) => t + ahead,
        Err(behind) => t.checked_sub(behind.duration()).unwrap_or(t),
    }
}

/// Check whether a response may be stored, filling in the freshness facts
/// of `info`.
///
/// `body_size` is the announced body length, if known.
pub fn evaluate_response(
    info: &mut CacheInfo,
    status: StatusCode,
    headers: &HeaderMap,
    body_size: Option<u64>,
    size_limit: u64,
    now: SystemTime,
) -> bool {
    if status != StatusCode::OK {
        return false;
    }

    if body_size.is_some_and(|size| size > size_limit) {
        return false;
    }

    if let Some(cc) = joined_header(headers, header::CACHE_CONTROL) {
        for item in list_items(&cc) {
            if item.starts_with("private") || item == "no-cache" || item == "no-store" {
                return false;
            }

            // RFC 2616 14.9.3
            if let Some(seconds) = item.strip_prefix("max-age=") {
                if let Ok(seconds) = seconds.trim_matches('"').parse::<u64>() {
                    if seconds > 0 {
                        info.expires = Some(now + Duration::from_secs(seconds));
                    }
                }
            }
        }
    }

    let origin_now = if info.is_remote {
        // without the origin's clock, Expires cannot be interpreted
        match header_str(headers, "date").and_then(parse_date) {
            Some(date) => date,
            None => return false,
        }
    } else {
        now
    };

    // RFC 2616 14.9.3: max-age overrides Expires
    if info.expires.is_none() {
        info.expires = header_str(headers, "expires")
            .and_then(parse_date)
            .map(|t| translate_time(t, origin_now, now));
        if info.expires.is_some_and(|expires| expires < now) {
            warn!("invalid 'expires' header");
        }
    }

    // RFC 2616 13.9: responses to query URIs are not fresh without an
    // explicit expiration time, so they are not stored at all
    if info.has_query_string && info.expires.is_none() {
        return false;
    }

    info.last_modified = header_str(headers, "last-modified").map(str::to_string);
    info.etag = header_str(headers, "etag").map(str::to_string);

    info.vary = joined_header(headers, header::VARY);
    if info.vary.as_deref().is_some_and(|vary| list_contains(vary, "*")) {
        // RFC 2616 13.6: "Vary: *" always fails to match
        return false;
    }

    info.expires.is_some() || info.last_modified.is_some() || info.etag.is_some()
}

/// New expiry announced by a `304 Not Modified` answer to a revalidation,
/// from `max-age` or from `Expires` shifted by the `Date` offset.
pub fn not_modified_expires(headers: &HeaderMap, now: SystemTime) -> Option<SystemTime> {
    let max_age = joined_header(headers, header::CACHE_CONTROL).and_then(|cc| {
        list_items(&cc)
            .filter_map(|item| item.strip_prefix("max-age="))
            .filter_map(|seconds| seconds.trim_matches('"').parse::<u64>().ok())
            .find(|&seconds| seconds > 0)
    });
    if let Some(seconds) = max_age {
        return Some(now + Duration::from_secs(seconds));
    }

    let origin_now = header_str(headers, "date").and_then(parse_date).unwrap_or(now);
    header_str(headers, "expires")
        .and_then(parse_date)
        .map(|t| translate_time(t, origin_now, now))
}

/// Capture the request header values named by a `Vary` list.
pub fn copy_vary(vary: &str, request_headers: &HeaderMap) -> VaryMap {
    list_items(vary)
        .map(|name| {
            let name = name.to_ascii_lowercase();
            let value = joined_header(request_headers, name.as_str()).unwrap_or_default();
            (name, value)
        })
        .collect()
}

/// Every captured value must equal the current request header; an absent
/// header counts as the empty string.
pub fn vary_fits(vary: &VaryMap, request_headers: &HeaderMap) -> bool {
    vary.iter().all(|(name, value)| {
        *value == joined_header(request_headers, name.as_str()).unwrap_or_default()
    })
}

/// The origin sent a full response carrying the ETag of the stored copy:
/// the resource has not changed, so the cached copy may be served.
pub fn prefer_cached(document: &Document, response_headers: &HeaderMap) -> bool {
    let Some(etag) = document.info.etag.as_deref() else {
        return false;
    };
    header_str(response_headers, "etag") == Some(etag)
}

/// Outcome of checking client preconditions against a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Serve,
    NotModified,
    Failed,
}

fn etag_list_matches(list: &str, response_headers: &HeaderMap) -> bool {
    if list.trim() == "*" {
        return true;
    }
    header_str(response_headers, "etag").is_some_and(|etag| list_items(list).any(|i| i == etag))
}

/// Evaluate `If-Match`, `If-None-Match`, `If-Modified-Since` and
/// `If-Unmodified-Since` against the stored response headers.
pub fn check_preconditions(request_headers: &HeaderMap, document: &Document) -> Precondition {
    let stored = &document.headers;
    let mut ignore_if_modified_since = false;

    if let Some(list) = header_str(request_headers, "if-match") {
        if !etag_list_matches(list, stored) {
            return Precondition::Failed;
        }
    }

    if let Some(list) = header_str(request_headers, "if-none-match") {
        if etag_list_matches(list, stored) {
            return Precondition::NotModified;
        }
        // RFC 2616 14.26
        ignore_if_modified_since = true;
    }

    let last_modified = header_str(stored, "last-modified");

    if !ignore_if_modified_since {
        if let (Some(ims), Some(lm)) = (header_str(request_headers, "if-modified-since"), last_modified) {
            if ims == lm {
                return Precondition::NotModified;
            }
            if let (Some(ims), Some(lm)) = (parse_date(ims), parse_date(lm)) {
                if lm <= ims {
                    return Precondition::NotModified;
                }
            }
        }
    }

    if let (Some(iums), Some(lm)) = (header_str(request_headers, "if-unmodified-since"), last_modified) {
        if let (Some(iums), Some(lm)) = (parse_date(iums), parse_date(lm)) {
            if lm > iums {
                return Precondition::Failed;
            }
        }
    }

    Precondition::Serve
}
