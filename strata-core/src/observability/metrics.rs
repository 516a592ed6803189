//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration
//! - `_bytes` suffix for sizes

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Build metrics
    describe_histogram!("strata_build_duration_seconds", "Image build duration");
    describe_counter!("strata_builds_total", "Total number of successful builds");
    describe_counter!("strata_build_failures_total", "Total number of build failures (by reason)");
    describe_counter!("strata_steps_executed_total", "Build steps executed (by instruction)");

    // Cache metrics
    describe_counter!("strata_cache_hits_total", "Layer cache hits");
    describe_counter!("strata_cache_misses_total", "Layer cache misses");
    describe_counter!("strata_cache_evictions_total", "Layers evicted from the cache");
    describe_histogram!("strata_layer_size_bytes", "Size of produced layers");

    // Container metrics
    describe_counter!("strata_containers_started_total", "Containers started");
}

pub fn record_build(duration_secs: f64) {
    histogram!("strata_build_duration_seconds").record(duration_secs);
    counter!("strata_builds_total").increment(1);
}

pub fn record_build_failure(reason: &'static str) {
    counter!("strata_build_failures_total", "reason" => reason).increment(1);
}

pub fn record_step(instruction: &'static str) {
    counter!("strata_steps_executed_total", "instruction" => instruction).increment(1);
}

pub fn record_cache_lookup(hit: bool) {
    if hit {
        counter!("strata_cache_hits_total").increment(1);
    } else {
        counter!("strata_cache_misses_total").increment(1);
    }
}

pub fn record_cache_eviction(count: u64) {
    counter!("strata_cache_evictions_total").increment(count);
}

pub fn record_layer_size(bytes: u64) {
    histogram!("strata_layer_size_bytes").record(bytes as f64);
}

pub fn record_container_started() {
    counter!("strata_containers_started_total").increment(1);
}
