//! Units of work flowing through the pipeline.

use std::time::{Instant, SystemTime};
use tokio::sync::OwnedSemaphorePermit;
use url::Url;

/// Global + per-host permit held by a task from dequeue until its fetch
/// completes. Dropping the pair releases both, so every exit path (success,
/// error, cancellation) releases exactly once.
#[derive(Debug)]
pub struct PermitPair {
    pub _global: OwnedSemaphorePermit,
    pub _host: OwnedSemaphorePermit,
}

/// A URL scheduled for fetching.
#[derive(Debug)]
pub struct Task {
    pub url: Url,
    pub canonical: String,
    pub host: String,
    pub depth: u32,
    pub retries: u32,
    /// Earliest allowed dispatch time; `None` means immediately.
    pub not_before: Option<Instant>,
    /// Host the link pointing at this URL was found on, for edge records.
    pub source_host: Option<String>,
    pub discovered_at: SystemTime,
    /// Present only between dequeue and fetch completion.
    pub permits: Option<PermitPair>,
}

impl Task {
    pub fn new(
        url: Url,
        canonical: String,
        host: String,
        depth: u32,
        source_host: Option<String>,
    ) -> Self {
        Self {
            url,
            canonical,
            host,
            depth,
            retries: 0,
            not_before: None,
            source_host,
            discovered_at: SystemTime::now(),
            permits: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        match self.not_before {
            Some(at) => at <= now,
            None => true,
        }
    }
}

/// Fetched HTML handed to the parse workers.
#[derive(Debug)]
pub struct ParseJob {
    pub base: Url,
    pub host: String,
    pub depth: u32,
    pub body: Vec<u8>,
}
