use std::{env, time::Duration};

use concierge_core::policy::{MutationPolicies, QueryConfig, QueryOptions, RetryPolicy};

/// Session configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of cache entries (default: 1,000)
    pub cache_max_entries: usize,
    /// Seconds between retention sweeps (default: 60)
    pub cache_gc_interval_seconds: u64,
    /// Stale time of namespaces without their own policy (default: 60)
    pub cache_stale_seconds: u64,
    /// Retain time of namespaces without their own policy (default: 300)
    pub cache_retain_seconds: u64,
    /// Retries of a failed read (default: 3)
    pub query_retry_count: u32,
    /// Retries of a failed create or update (default: 2)
    pub mutation_retry_count: u32,
    /// First retry delay in milliseconds (default: 1,000)
    pub retry_base_delay_ms: u64,
    /// Retry delay cap in milliseconds (default: 30,000)
    pub retry_max_delay_ms: u64,
    /// Remote gateway URL; the in-memory gateway is used when unset.
    pub gateway_url: Option<String>,
    pub gateway_api_key: Option<String>,
    /// Change relay URL (default: `{gateway_url}/realtime/v1/events`)
    pub change_feed_url: Option<String>,
    /// Request timeout in seconds (default: 30)
    pub gateway_timeout_seconds: u64,
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CACHE_MAX_ENTRIES` - Maximum cache entries (default: 1,000)
    /// - `CACHE_GC_INTERVAL_SECONDS` - Retention sweep period (default: 60)
    /// - `CACHE_STALE_SECONDS` - Default stale time (default: 60)
    /// - `CACHE_RETAIN_SECONDS` - Default retain time (default: 300)
    /// - `QUERY_RETRY_COUNT` - Read retries (default: 3)
    /// - `MUTATION_RETRY_COUNT` - Write retries (default: 2)
    /// - `RETRY_BASE_DELAY_MS` - First retry delay (default: 1,000)
    /// - `RETRY_MAX_DELAY_MS` - Retry delay cap (default: 30,000)
    /// - `GATEWAY_URL`, `GATEWAY_API_KEY` - Remote gateway (optional)
    /// - `CHANGE_FEED_URL` - Change relay (optional)
    /// - `GATEWAY_TIMEOUT_SECONDS` - Request timeout (default: 30)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            cache_max_entries: parsed(&lookup, "CACHE_MAX_ENTRIES", 1_000),
            cache_gc_interval_seconds: parsed(&lookup, "CACHE_GC_INTERVAL_SECONDS", 60),
            cache_stale_seconds: parsed(&lookup, "CACHE_STALE_SECONDS", 60),
            cache_retain_seconds: parsed(&lookup, "CACHE_RETAIN_SECONDS", 300),
            query_retry_count: parsed(&lookup, "QUERY_RETRY_COUNT", 3),
            mutation_retry_count: parsed(&lookup, "MUTATION_RETRY_COUNT", 2),
            retry_base_delay_ms: parsed(&lookup, "RETRY_BASE_DELAY_MS", 1_000),
            retry_max_delay_ms: parsed(&lookup, "RETRY_MAX_DELAY_MS", 30_000),
            gateway_url: lookup("GATEWAY_URL").filter(|v| !v.is_empty()),
            gateway_api_key: lookup("GATEWAY_API_KEY").filter(|v| !v.is_empty()),
            change_feed_url: lookup("CHANGE_FEED_URL").filter(|v| !v.is_empty()),
            gateway_timeout_seconds: parsed(&lookup, "GATEWAY_TIMEOUT_SECONDS", 30),
        }
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.cache_gc_interval_seconds.max(1))
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_seconds)
    }

    fn retry(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy::exponential(
            max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Options of namespaces without their own policy.
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions::new(
            Duration::from_secs(self.cache_stale_seconds),
            Duration::from_secs(self.cache_retain_seconds),
        )
        .retry(self.retry(self.query_retry_count))
    }

    /// Per-namespace freshness policies.
    pub fn query_config(&self) -> QueryConfig {
        QueryConfig::standard(self.query_options())
    }

    pub fn mutation_policies(&self) -> MutationPolicies {
        MutationPolicies::new(self.retry(self.mutation_retry_count))
    }

    /// Change relay URL, derived from the gateway URL when not set.
    pub fn change_feed_url(&self) -> Option<String> {
        self.change_feed_url.clone().or_else(|| {
            self.gateway_url
                .as_ref()
                .map(|url| format!("{}/realtime/v1/events", url.trim_end_matches('/')))
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = config(&[]);

        assert_eq!(config.cache_max_entries, 1_000);
        assert_eq!(config.gc_interval(), Duration::from_secs(60));
        assert_eq!(config.query_retry_count, 3);
        assert_eq!(config.mutation_retry_count, 2);
        assert_eq!(config.gateway_url, None);
        assert_eq!(config.change_feed_url(), None);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = config(&[
            ("CACHE_MAX_ENTRIES", "50"),
            ("QUERY_RETRY_COUNT", "not a number"),
            ("GATEWAY_URL", "https://demo.example.com/"),
        ]);

        assert_eq!(config.cache_max_entries, 50);
        assert_eq!(config.query_retry_count, 3);
        assert_eq!(
            config.change_feed_url().as_deref(),
            Some("https://demo.example.com/realtime/v1/events")
        );
    }

    #[test]
    fn test_query_options() {
        let config = config(&[("CACHE_STALE_SECONDS", "10"), ("RETRY_BASE_DELAY_MS", "200")]);
        let options = config.query_options();

        assert_eq!(options.stale_time, Duration::from_secs(10));
        assert_eq!(options.retain_time, Duration::from_secs(300));
        assert_eq!(options.retry.max_retries, 3);
        assert_eq!(options.retry.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delete_retries_are_capped() {
        let policies = config(&[("MUTATION_RETRY_COUNT", "5")]).mutation_policies();
        assert_eq!(policies.update.max_retries, 5);
        assert_eq!(policies.delete.max_retries, 1);
    }
}
