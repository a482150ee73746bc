use metrics::{describe_counter, Unit};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the JSON tracing subscriber. `RUST_LOG` overrides the `info` default.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for (prefix, cache) in [
            ("tamis_http_cache", "HTTP cache"),
            ("tamis_filter_cache", "filter cache"),
        ] {
            describe_counter!(
                format!("{prefix}_hit_total"),
                Unit::Count,
                format!("Requests answered from the {cache}.")
            );
            describe_counter!(
                format!("{prefix}_miss_total"),
                Unit::Count,
                format!("Cacheable requests the {cache} had to forward.")
            );
            describe_counter!(
                format!("{prefix}_skip_total"),
                Unit::Count,
                format!("Requests that bypassed the {cache}.")
            );
            describe_counter!(
                format!("{prefix}_store_total"),
                Unit::Count,
                format!("Responses stored in the {cache}.")
            );
            describe_counter!(
                format!("{prefix}_fill_abort_total"),
                Unit::Count,
                format!("Abandoned {cache} fills.")
            );
        }
    });
}
