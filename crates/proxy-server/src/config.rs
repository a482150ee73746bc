use arc_swap::ArcSwapOption;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tamis_cache::{
    AgeLimiter, FilterCacheConfig, HttpCache, HttpCacheConfig, ResourceLoader, RespKv,
};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub http_cache: HttpCacheSection,
    #[serde(default)]
    pub filter_cache: FilterCacheSection,
    #[serde(default)]
    pub age_limit: AgeLimitSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Content filter applied to successful GET responses.
    #[serde(default)]
    pub filter_url: Option<String>,
    /// Request header carrying the cache tag. Stripped before forwarding.
    #[serde(default = "default_tag_header")]
    pub tag_header: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Heap,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpCacheSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_http_max_size")]
    pub max_size_bytes: usize,
    #[serde(default = "default_enabled")]
    pub obey_no_cache: bool,
    #[serde(default = "default_http_body_limit")]
    pub body_size_limit: usize,
    #[serde(default = "default_fill_timeout")]
    pub fill_timeout_secs: u64,
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_remote_addr")]
    pub remote_addr: String,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterCacheSection {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_filter_max_size")]
    pub max_size_bytes: usize,
    #[serde(default = "default_filter_body_limit")]
    pub body_size_limit: usize,
    #[serde(default = "default_filter_ttl")]
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgeLimitSection {
    #[serde(default = "default_session_header")]
    pub session_header: String,
    #[serde(default = "default_widget_header")]
    pub widget_header: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
                timeout_ms: default_timeout_ms(),
                filter_url: None,
                tag_header: default_tag_header(),
            },
            http_cache: HttpCacheSection::default(),
            filter_cache: FilterCacheSection::default(),
            age_limit: AgeLimitSection::default(),
        }
    }

    pub fn age_limiter(&self) -> AgeLimiter {
        AgeLimiter::new(
            self.age_limit.session_header.clone(),
            self.age_limit.widget_header.clone(),
        )
    }

    pub fn http_cache_config(&self) -> HttpCacheConfig {
        HttpCacheConfig {
            max_size: self.http_cache.max_size_bytes,
            body_size_limit: self.http_cache.body_size_limit,
            fill_timeout: Duration::from_secs(self.http_cache.fill_timeout_secs),
            obey_no_cache: self.http_cache.obey_no_cache,
            age_limiter: self.age_limiter(),
        }
    }

    pub fn filter_cache_config(&self) -> FilterCacheConfig {
        FilterCacheConfig {
            max_size: self.filter_cache.max_size_bytes,
            body_size_limit: self.filter_cache.body_size_limit,
            default_ttl: Duration::from_secs(self.filter_cache.default_ttl_secs),
            user_header: self.age_limit.session_header.clone(),
            fill_timeout: Duration::from_secs(self.http_cache.fill_timeout_secs),
            age_limiter: self.age_limiter(),
        }
    }

    /// The HTTP cache this config describes, or `None` if it is disabled.
    pub fn build_http_cache(&self, loader: Arc<dyn ResourceLoader>) -> Option<HttpCache> {
        if !self.http_cache.enabled {
            return None;
        }
        let config = self.http_cache_config();
        let cache = match self.http_cache.backend {
            Backend::Heap => HttpCache::new(config, loader),
            Backend::Remote => {
                let kv = RespKv::new(
                    self.http_cache.remote_addr.clone(),
                    Duration::from_millis(self.http_cache.remote_timeout_ms),
                );
                HttpCache::remote(config, loader, Arc::new(kv))
            }
        };
        Some(cache)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

impl Default for HttpCacheSection {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_bytes: default_http_max_size(),
            obey_no_cache: default_enabled(),
            body_size_limit: default_http_body_limit(),
            fill_timeout_secs: default_fill_timeout(),
            backend: default_backend(),
            remote_addr: default_remote_addr(),
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

impl Default for FilterCacheSection {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_bytes: default_filter_max_size(),
            body_size_limit: default_filter_body_limit(),
            default_ttl_secs: default_filter_ttl(),
        }
    }
}

impl Default for AgeLimitSection {
    fn default() -> Self {
        Self {
            session_header: default_session_header(),
            widget_header: default_widget_header(),
        }
    }
}

/// Compare old and new config and apply what can change at runtime.
///
/// - Size changes → WARN log, ignore (restart required)
/// - Request handling, fill timeout, age limits or backend changed →
///   rebuild the HTTP cache (contents dropped)
///
/// Returns the replaced cache so the caller can close it.
pub fn diff_and_apply(
    old: &Config,
    new: &Config,
    cache_swap: &ArcSwapOption<HttpCache>,
    loader: Arc<dyn ResourceLoader>,
) -> Option<Arc<HttpCache>> {
    if old.http_cache.max_size_bytes != new.http_cache.max_size_bytes
        || old.filter_cache.max_size_bytes != new.filter_cache.max_size_bytes
    {
        tracing::warn!(
            old_http = old.http_cache.max_size_bytes,
            new_http = new.http_cache.max_size_bytes,
            old_filter = old.filter_cache.max_size_bytes,
            new_filter = new.filter_cache.max_size_bytes,
            "cache size change ignored, restart to resize"
        );
    }

    let (o, n) = (&old.http_cache, &new.http_cache);
    let rebuild = o.enabled != n.enabled
        || o.obey_no_cache != n.obey_no_cache
        || o.body_size_limit != n.body_size_limit
        || o.fill_timeout_secs != n.fill_timeout_secs
        || o.backend != n.backend
        || o.remote_addr != n.remote_addr
        || o.remote_timeout_ms != n.remote_timeout_ms
        || old.age_limit != new.age_limit;
    if !rebuild {
        return None;
    }

    // keep the size the process started with
    let mut effective = new.clone();
    effective.http_cache.max_size_bytes = old.http_cache.max_size_bytes;

    let replacement = effective.build_http_cache(loader).map(Arc::new);
    tracing::info!(
        enabled = n.enabled,
        backend = ?n.backend,
        obey_no_cache = n.obey_no_cache,
        fill_timeout_secs = n.fill_timeout_secs,
        "config reloaded: HTTP cache rebuilt, contents dropped"
    );
    cache_swap.swap(replacement)
}

/// Apply `new` over `current` and remember it as the running config.
///
/// Cache sizes are fixed at startup, so the remembered config keeps the
/// sizes of `current` and a later rebuild still uses them.
pub fn reload(
    current: &mut Config,
    mut new: Config,
    cache_swap: &ArcSwapOption<HttpCache>,
    loader: Arc<dyn ResourceLoader>,
) -> Option<Arc<HttpCache>> {
    let replaced = diff_and_apply(current, &new, cache_swap, loader);
    new.http_cache.max_size_bytes = current.http_cache.max_size_bytes;
    new.filter_cache.max_size_bytes = current.filter_cache.max_size_bytes;
    *current = new;
    replaced
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_addr() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_tag_header() -> String {
    "x-cache-tag".to_string()
}
fn default_enabled() -> bool {
    true
}
fn default_http_max_size() -> usize {
    64 * 1024 * 1024
}
fn default_http_body_limit() -> usize {
    256 * 1024
}
fn default_fill_timeout() -> u64 {
    60
}
fn default_backend() -> Backend {
    Backend::Heap
}
fn default_remote_addr() -> String {
    "127.0.0.1:6379".to_string()
}
fn default_remote_timeout_ms() -> u64 {
    1000
}
fn default_filter_max_size() -> usize {
    32 * 1024 * 1024
}
fn default_filter_body_limit() -> usize {
    512 * 1024
}
fn default_filter_ttl() -> u64 {
    3600
}
fn default_session_header() -> String {
    "x-cm4all-beng-user".to_string()
}
fn default_widget_header() -> String {
    "x-cm4all-widget-id".to_string()
}
