use crate::document::CacheInfo;
use crate::rfc;
use std::time::{Duration, SystemTime};

const UNVARIED_LIMIT: Duration = Duration::from_secs(7 * 24 * 3600);
const VARIED_LIMIT: Duration = Duration::from_secs(3600);
const SESSION_LIMIT: Duration = Duration::from_secs(5 * 60);
const WIDGET_LIMIT: Duration = Duration::from_secs(30 * 60);

/// Used when the response carried no expiry at all.
const DEFAULT_EXPIRY: Duration = Duration::from_secs(3600);

/// Caps how long a stored document may live, based on how personal it is.
///
/// A response that varies on the per-session marker header only ever serves
/// one user, so it ages quickly; per-widget-instance responses a little
/// slower; anything else that varies gets an hour.
#[derive(Debug, Clone)]
pub struct AgeLimiter {
    session_header: String,
    widget_header: String,
}

impl Default for AgeLimiter {
    fn default() -> Self {
        Self::new("x-cm4all-beng-user", "x-cm4all-widget-id")
    }
}

impl AgeLimiter {
    pub fn new(session_header: impl Into<String>, widget_header: impl Into<String>) -> Self {
        Self {
            session_header: session_header.into(),
            widget_header: widget_header.into(),
        }
    }

    pub fn session_header(&self) -> &str {
        &self.session_header
    }

    pub fn age_limit(&self, info: &CacheInfo) -> Duration {
        let Some(vary) = info.vary.as_deref() else {
            return UNVARIED_LIMIT;
        };

        if rfc::list_contains(vary, &self.session_header) {
            SESSION_LIMIT
        } else if rfc::list_contains(vary, &self.widget_header) {
            WIDGET_LIMIT
        } else {
            VARIED_LIMIT
        }
    }

    /// Point in time at which a stored document must be dropped.
    ///
    /// An expiry that already passed is returned unchanged.
    pub fn calc_expires(&self, info: &CacheInfo, now: SystemTime) -> SystemTime {
        let expires = info.expires.unwrap_or(now + DEFAULT_EXPIRY);
        if expires < now {
            return expires;
        }
        expires.min(now + self.age_limit(info))
    }
}
