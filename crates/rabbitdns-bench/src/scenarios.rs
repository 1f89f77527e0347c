use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct QueryScenario {
    pub name: &'static str,
    pub description: &'static str,
    pub names: &'static [&'static str],
    pub record_type: &'static str,
    pub default_iterations: u32,
}

const QUERY_SCENARIOS: &[QueryScenario] = &[
    QueryScenario {
        name: "popular",
        description: "Handful of high-traffic names; measures cold upstream vs warm cache.",
        names: &[
            "example.com",
            "wikipedia.org",
            "github.com",
            "cloudflare.com",
            "rust-lang.org",
        ],
        record_type: "A",
        default_iterations: 10,
    },
    QueryScenario {
        name: "ipv6",
        description: "AAAA lookups against dual-stack hosts.",
        names: &["google.com", "facebook.com", "netflix.com"],
        record_type: "AAAA",
        default_iterations: 10,
    },
    QueryScenario {
        name: "mail",
        description: "MX lookups; larger answers exercise the streaming path.",
        names: &["gmail.com", "outlook.com", "proton.me"],
        record_type: "MX",
        default_iterations: 5,
    },
];

pub fn default_query_scenario() -> &'static QueryScenario {
    &QUERY_SCENARIOS[0]
}

pub fn query_scenarios() -> &'static [QueryScenario] {
    QUERY_SCENARIOS
}

pub fn find_query_scenario(name: &str) -> Option<&'static QueryScenario> {
    let needle = name.trim();
    if needle.is_empty() {
        return None;
    }
    QUERY_SCENARIOS
        .iter()
        .find(|scenario| scenario.name.eq_ignore_ascii_case(needle))
}

/// Names placed on the block-list by the profile scenario.
pub const PROFILE_BLOCKED: &[&str] = &[
    "ads.example.com",
    "tracker.example.net",
    "telemetry.example.org",
];

/// Names the profile scenario expects to be forwarded.
pub const PROFILE_ALLOWED: &[&str] = &["example.com", "wikipedia.org"];

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct LatencySummary {
    pub samples: usize,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

/// Nearest-rank percentiles over the recorded samples. `None` when empty.
pub fn summarise(samples: &[Duration]) -> Option<LatencySummary> {
    if samples.is_empty() {
        return None;
    }
    let mut millis: Vec<f64> = samples
        .iter()
        .map(|sample| sample.as_secs_f64() * 1000.0)
        .collect();
    millis.sort_by(f64::total_cmp);

    let rank = |percentile: f64| {
        let index = ((percentile / 100.0) * millis.len() as f64).ceil() as usize;
        millis[index.clamp(1, millis.len()) - 1]
    };

    Some(LatencySummary {
        samples: millis.len(),
        min_ms: millis[0],
        mean_ms: millis.iter().sum::<f64>() / millis.len() as f64,
        p50_ms: rank(50.0),
        p95_ms: rank(95.0),
        max_ms: millis[millis.len() - 1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_scenarios_case_insensitively() {
        assert_eq!(find_query_scenario("IPv6").map(|s| s.name), Some("ipv6"));
        assert!(find_query_scenario("").is_none());
        assert!(find_query_scenario("missing").is_none());
        assert_eq!(default_query_scenario().name, "popular");
        assert_eq!(query_scenarios().len(), 3);
    }

    #[test]
    fn summary_uses_nearest_rank() {
        let samples: Vec<Duration> = (1..=20).map(Duration::from_millis).collect();
        let summary = summarise(&samples).expect("summary");
        assert_eq!(summary.samples, 20);
        assert_eq!(summary.min_ms, 1.0);
        assert_eq!(summary.p50_ms, 10.0);
        assert_eq!(summary.p95_ms, 19.0);
        assert_eq!(summary.max_ms, 20.0);
        assert!((summary.mean_ms - 10.5).abs() < 1e-9);
    }

    #[test]
    fn empty_samples_have_no_summary() {
        assert!(summarise(&[]).is_none());
    }

    #[test]
    fn profile_lists_do_not_overlap() {
        assert!(PROFILE_ALLOWED.iter().all(|name| !PROFILE_BLOCKED.contains(name)));
    }
}
