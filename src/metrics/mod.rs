//! Metrics module
//!
//! Prometheus counters for requests, downloads and sweeps, kept in a
//! dedicated registry and exposed by the admin server at `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::domain::Origin;
use crate::error::{Error, Result};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("booru_cdn_requests_total", "Inbound requests by route and outcome");
    let vec = IntCounterVec::new(opts, &["route", "outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register booru_cdn_requests_total");
    vec
});

static DOWNLOADS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "booru_cdn_downloads_total",
        "Cache fills by origin and outcome (hit, downloaded, failed)",
    );
    let vec = IntCounterVec::new(opts, &["origin", "outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register booru_cdn_downloads_total");
    vec
});

static SWEEP_FILES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "booru_cdn_sweep_files_total",
        "Files visited by the eviction sweep by origin and result",
    );
    let vec = IntCounterVec::new(opts, &["origin", "result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register booru_cdn_sweep_files_total");
    vec
});

static LOCK_TABLE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "booru_cdn_lock_table_entries",
        "Live entries in the per-key download lock table",
    )
    .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register booru_cdn_lock_table_entries");
    gauge
});

pub fn record_request(route: &str, outcome: &str) {
    REQUESTS_TOTAL.with_label_values(&[route, outcome]).inc();
}

pub fn record_download(origin: Origin, outcome: &str) {
    DOWNLOADS_TOTAL
        .with_label_values(&[origin.as_str(), outcome])
        .inc();
}

pub fn record_sweep(origin: Origin, scanned: u64, deleted: u64, failed: u64) {
    let kept = scanned.saturating_sub(deleted + failed);
    for (result, count) in [("deleted", deleted), ("failed", failed), ("kept", kept)] {
        SWEEP_FILES_TOTAL
            .with_label_values(&[origin.as_str(), result])
            .inc_by(count);
    }
}

pub fn set_lock_table_entries(entries: usize) {
    LOCK_TABLE_ENTRIES.set(entries as i64);
}

/// Render all metrics in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    Ok(buffer)
}

/// Content type of [`gather`] output.
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        record_request("media", "redirect");
        record_download(Origin::Danbooru, "downloaded");
        record_sweep(Origin::Rule34, 5, 2, 1);
        set_lock_table_entries(3);

        let text = String::from_utf8(gather().unwrap()).unwrap();
        assert!(text.contains("booru_cdn_requests_total{outcome=\"redirect\",route=\"media\"}"));
        assert!(text.contains("booru_cdn_downloads_total{origin=\"danbooru\",outcome=\"downloaded\"}"));
        assert!(text.contains("booru_cdn_sweep_files_total{origin=\"rule34\",result=\"kept\"}"));
        assert!(text.contains("booru_cdn_lock_table_entries 3"));
    }

    #[test]
    fn test_content_type_is_text_format() {
        assert!(content_type().starts_with("text/plain"));
    }
}
