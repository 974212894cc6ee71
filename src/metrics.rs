//! Process-wide counters for the metrics scrape endpoint.
//!
//! These accumulate across runs and are safe for concurrent increment from
//! any worker. The telemetry module handles per-run, per-frame aggregation;
//! this is the coarse always-on view.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Metrics {
    /// Pages fetched successfully, all runs.
    pub pages_fetched: AtomicU64,
    /// Fetch errors by class.
    fetch_errors: DashMap<&'static str, AtomicU64>,

    // Queue depth gauges, refreshed each telemetry frame.
    pub frontier_depth: AtomicUsize,
    pub fetch_depth: AtomicUsize,
    pub parse_depth: AtomicUsize,
}

pub type SharedMetrics = Arc<Metrics>;

impl Metrics {
    pub fn new() -> SharedMetrics {
        Arc::new(Self::default())
    }

    pub fn record_page(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, class: &'static str) {
        self.fetch_errors
            .entry(class)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self, class: &str) -> u64 {
        self.fetch_errors
            .get(class)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_queue_depths(&self, frontier: usize, fetch: usize, parse: usize) {
        self.frontier_depth.store(frontier, Ordering::Relaxed);
        self.fetch_depth.store(fetch, Ordering::Relaxed);
        self.parse_depth.store(parse, Ordering::Relaxed);
    }

    /// Render in the text exposition format the scrape endpoint serves.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "crawler_pages_fetched_total {}\n",
            self.pages_fetched.load(Ordering::Relaxed)
        ));
        let mut classes: Vec<(&'static str, u64)> = self
            .fetch_errors
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        classes.sort_by_key(|(class, _)| *class);
        for (class, count) in classes {
            out.push_str(&format!(
                "crawler_fetch_errors_total{{class=\"{class}\"}} {count}\n"
            ));
        }
        for (stage, depth) in [
            ("frontier", self.frontier_depth.load(Ordering::Relaxed)),
            ("fetch", self.fetch_depth.load(Ordering::Relaxed)),
            ("parse", self.parse_depth.load(Ordering::Relaxed)),
        ] {
            out.push_str(&format!(
                "crawler_queue_depth{{stage=\"{stage}\"}} {depth}\n"
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors;

    #[test]
    fn counts_pages_and_errors() {
        let m = Metrics::new();
        m.record_page();
        m.record_page();
        m.record_error(errors::TIMEOUT);
        m.record_error(errors::TIMEOUT);
        m.record_error(errors::DNS);

        assert_eq!(m.pages_fetched.load(Ordering::Relaxed), 2);
        assert_eq!(m.error_count(errors::TIMEOUT), 2);
        assert_eq!(m.error_count(errors::DNS), 1);
        assert_eq!(m.error_count(errors::TLS), 0);
    }

    #[test]
    fn render_includes_all_series() {
        let m = Metrics::new();
        m.record_page();
        m.record_error(errors::STATUS);
        m.set_queue_depths(3, 2, 1);

        let text = m.render();
        assert!(text.contains("crawler_pages_fetched_total 1"));
        assert!(text.contains("crawler_fetch_errors_total{class=\"status\"} 1"));
        assert!(text.contains("crawler_queue_depth{stage=\"frontier\"} 3"));
    }
}
