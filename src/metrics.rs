use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub struct ProxyMetrics {
    registry: Registry,
    requests_total: IntCounter,
    blocked_total: IntCounter,
    upstream_responses_total: IntCounter,
    upstream_failures_total: IntCounter,
    cache_hits_total: IntCounter,
    cache_misses_total: IntCounter,
    store_errors_total: IntCounter,
    profiles_created_total: IntCounter,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let requests_total = counter(
            "rabbitdns_requests_total",
            "Total number of DoH queries received",
        )?;
        let blocked_total = counter(
            "rabbitdns_blocked_total",
            "Number of queries answered with a synthetic refusal",
        )?;
        let upstream_responses_total = counter(
            "rabbitdns_upstream_responses_total",
            "Number of answers fetched from upstream resolvers",
        )?;
        let upstream_failures_total = counter(
            "rabbitdns_upstream_failures_total",
            "Number of upstream requests that failed or returned non-200",
        )?;
        let cache_hits_total = counter(
            "rabbitdns_cache_hits_total",
            "Number of answers served from cache",
        )?;
        let cache_misses_total = counter(
            "rabbitdns_cache_misses_total",
            "Number of cache lookups that missed",
        )?;
        let store_errors_total = counter(
            "rabbitdns_store_errors_total",
            "Number of cache or profile store operations that failed",
        )?;
        let profiles_created_total = counter(
            "rabbitdns_profiles_created_total",
            "Number of profiles accepted by the profile endpoint",
        )?;

        Ok(Self {
            registry,
            requests_total,
            blocked_total,
            upstream_responses_total,
            upstream_failures_total,
            cache_hits_total,
            cache_misses_total,
            store_errors_total,
            profiles_created_total,
        })
    }

    pub fn inc_request(&self) {
        self.requests_total.inc();
    }

    pub fn inc_blocked(&self) {
        self.blocked_total.inc();
    }

    pub fn inc_upstream_response(&self) {
        self.upstream_responses_total.inc();
    }

    pub fn inc_upstream_failure(&self) {
        self.upstream_failures_total.inc();
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    pub fn inc_store_error(&self) {
        self.store_errors_total.inc();
    }

    pub fn inc_profile_created(&self) {
        self.profiles_created_total.inc();
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits_total.get()
    }

    pub fn blocked(&self) -> u64 {
        self.blocked_total.get()
    }

    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counters() {
        let metrics = ProxyMetrics::new().expect("metrics");
        metrics.inc_request();
        metrics.inc_cache_hit();
        metrics.inc_cache_hit();
        let rendered = String::from_utf8(metrics.render().expect("render")).expect("utf8");
        assert!(rendered.contains("rabbitdns_requests_total 1"));
        assert!(rendered.contains("rabbitdns_cache_hits_total 2"));
        assert_eq!(metrics.cache_hits(), 2);
    }
}
