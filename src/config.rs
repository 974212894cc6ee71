//! Run configuration and process-level defaults.
//!
//! A [`RunConfig`] is immutable once a run starts. Zero means "unlimited"
//! for the crawl limits (depth, pages, time budget, links per page) and
//! "unset, use the default" everywhere else.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub seed_url: String,

    // Limits. Zero = unlimited.
    pub max_depth: u32,
    pub max_pages: u64,
    pub time_budget_secs: u64,
    pub max_links_per_page: usize,

    // Concurrency.
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,

    // Politeness.
    pub user_agent: String,
    pub respect_robots: bool,
    pub robots_ttl_secs: u64,

    // HTTP timing.
    pub request_timeout_secs: u64,
    pub header_timeout_secs: u64,
    pub tls_handshake_timeout_secs: u64,
    pub idle_conn_timeout_secs: u64,
    pub max_body_bytes: u64,

    // Retry.
    pub retry_max: u32,
    pub retry_base_delay_ms: u64,

    // Circuit breaker.
    pub circuit_trip_count: u32,
    pub circuit_reset_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed_url: String::new(),
            max_depth: 0,
            max_pages: 0,
            time_budget_secs: 0,
            max_links_per_page: 0,
            global_concurrency: 0,
            per_host_concurrency: 0,
            user_agent: String::new(),
            respect_robots: true,
            robots_ttl_secs: 0,
            request_timeout_secs: 0,
            header_timeout_secs: 0,
            tls_handshake_timeout_secs: 0,
            idle_conn_timeout_secs: 0,
            max_body_bytes: 0,
            retry_max: 0,
            retry_base_delay_ms: 0,
            circuit_trip_count: 0,
            circuit_reset_secs: 0,
        }
    }
}

impl RunConfig {
    /// Fill unset fields from the given defaults and clamp values the engine
    /// cannot run with. Limits (depth/pages/budget/links) keep their zero
    /// meaning of "unlimited" and are not defaulted here.
    pub fn normalized(mut self, defaults: &CrawlerDefaults) -> Self {
        if self.global_concurrency == 0 {
            self.global_concurrency = defaults.global_concurrency;
        }
        if self.per_host_concurrency == 0 {
            self.per_host_concurrency = defaults.per_host_concurrency;
        }
        if self.user_agent.is_empty() {
            self.user_agent = defaults.user_agent.clone();
        }
        if self.robots_ttl_secs == 0 {
            self.robots_ttl_secs = defaults.robots_ttl_secs;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = defaults.request_timeout_secs;
        }
        if self.header_timeout_secs == 0 {
            self.header_timeout_secs = defaults.header_timeout_secs;
        }
        if self.tls_handshake_timeout_secs == 0 {
            self.tls_handshake_timeout_secs = defaults.tls_handshake_timeout_secs;
        }
        if self.idle_conn_timeout_secs == 0 {
            self.idle_conn_timeout_secs = defaults.idle_conn_timeout_secs;
        }
        if self.max_body_bytes == 0 {
            self.max_body_bytes = defaults.max_body_bytes;
        }
        if self.retry_base_delay_ms == 0 {
            self.retry_base_delay_ms = defaults.retry_base_delay_ms;
        }
        if self.circuit_trip_count == 0 {
            self.circuit_trip_count = defaults.circuit_trip_count;
        }
        if self.circuit_reset_secs == 0 {
            self.circuit_reset_secs = defaults.circuit_reset_secs;
        }
        self.global_concurrency = self.global_concurrency.max(1);
        self.per_host_concurrency = self.per_host_concurrency.max(1);
        self
    }

    pub fn time_budget(&self) -> Option<Duration> {
        (self.time_budget_secs > 0).then(|| Duration::from_secs(self.time_budget_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs.max(1))
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs.max(1))
    }

    pub fn idle_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_conn_timeout_secs.max(1))
    }

    pub fn robots_ttl(&self) -> Duration {
        Duration::from_secs(self.robots_ttl_secs.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.max(1))
    }

    pub fn circuit_reset(&self) -> Duration {
        Duration::from_secs(self.circuit_reset_secs.max(1))
    }
}

/// Process-level defaults applied to every run whose config leaves the
/// corresponding field unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerDefaults {
    pub max_depth: u32,
    pub max_pages: u64,
    pub time_budget_secs: u64,
    pub max_links_per_page: usize,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub user_agent: String,
    pub respect_robots: bool,
    pub request_timeout_secs: u64,
    pub header_timeout_secs: u64,
    pub tls_handshake_timeout_secs: u64,
    pub idle_conn_timeout_secs: u64,
    pub max_body_bytes: u64,
    pub robots_ttl_secs: u64,
    pub retry_max: u32,
    pub retry_base_delay_ms: u64,
    pub circuit_trip_count: u32,
    pub circuit_reset_secs: u64,
}

impl Default for CrawlerDefaults {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_pages: 5000,
            time_budget_secs: 600,
            max_links_per_page: 200,
            global_concurrency: 64,
            per_host_concurrency: 4,
            user_agent: "crawlcore/0.1".to_string(),
            respect_robots: true,
            request_timeout_secs: 15,
            header_timeout_secs: 10,
            tls_handshake_timeout_secs: 8,
            idle_conn_timeout_secs: 90,
            max_body_bytes: 1 << 20,
            robots_ttl_secs: 24 * 60 * 60,
            retry_max: 2,
            retry_base_delay_ms: 300,
            circuit_trip_count: 5,
            circuit_reset_secs: 30,
        }
    }
}

impl CrawlerDefaults {
    /// Apply the limit defaults too. Used by the run manager when creating a
    /// run from a sparse request; the engine itself treats zero limits as
    /// unlimited and never calls this.
    pub fn apply_limits(&self, mut cfg: RunConfig) -> RunConfig {
        if cfg.max_depth == 0 {
            cfg.max_depth = self.max_depth;
        }
        if cfg.max_pages == 0 {
            cfg.max_pages = self.max_pages;
        }
        if cfg.time_budget_secs == 0 {
            cfg.time_budget_secs = self.time_budget_secs;
        }
        if cfg.max_links_per_page == 0 {
            cfg.max_links_per_page = self.max_links_per_page;
        }
        if cfg.retry_max == 0 {
            cfg.retry_max = self.retry_max;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_fills_unset_fields() {
        let defaults = CrawlerDefaults::default();
        let cfg = RunConfig {
            seed_url: "http://example.com/".into(),
            global_concurrency: 8,
            ..Default::default()
        }
        .normalized(&defaults);

        assert_eq!(cfg.global_concurrency, 8);
        assert_eq!(cfg.per_host_concurrency, defaults.per_host_concurrency);
        assert_eq!(cfg.user_agent, defaults.user_agent);
        assert_eq!(cfg.max_body_bytes, 1 << 20);
        // Limits stay unlimited unless explicitly defaulted.
        assert_eq!(cfg.max_pages, 0);
        assert!(cfg.time_budget().is_none());
    }

    #[test]
    fn apply_limits_fills_crawl_bounds() {
        let defaults = CrawlerDefaults::default();
        let cfg = defaults.apply_limits(RunConfig::default());
        assert_eq!(cfg.max_depth, 3);
        assert_eq!(cfg.max_pages, 5000);
        assert_eq!(cfg.retry_max, 2);
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let defaults = CrawlerDefaults {
            global_concurrency: 0,
            per_host_concurrency: 0,
            ..Default::default()
        };
        let cfg = RunConfig::default().normalized(&defaults);
        assert_eq!(cfg.global_concurrency, 1);
        assert_eq!(cfg.per_host_concurrency, 1);
    }
}
