//! Per-host robots.txt cache with single-flight fetching.
//!
//! The scheduler consults this cache synchronously inside its dispatch
//! critical section, so `allowed` never blocks: a miss marks the entry
//! Fetching, spawns the fetch in the background, and reports "not ready".
//! Callers park the task briefly and retry instead of holding anything
//! across the network round trip.

use crate::canonical::host_key;
use dashmap::DashMap;
use robotstxt::DefaultMatcher;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

const DEFAULT_FETCH_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsState {
    Unknown,
    Fetching,
    Ready,
    Error,
}

impl RobotsState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RobotsState::Unknown => "unknown",
            RobotsState::Fetching => "fetching",
            RobotsState::Ready => "ready",
            RobotsState::Error => "error",
        }
    }
}

impl fmt::Display for RobotsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a cache lookup. `ready == false` means the rules are still in
/// flight and the caller must defer, not deny.
#[derive(Debug, Clone, Copy)]
pub struct RobotsDecision {
    pub allowed: bool,
    pub ready: bool,
    pub state: RobotsState,
}

#[derive(Debug, Clone)]
struct RobotsEntry {
    state: RobotsState,
    /// Raw robots.txt body; `None` means "allow all".
    body: Option<String>,
    expires: Option<Instant>,
}

pub struct RobotsCache {
    entries: DashMap<String, RobotsEntry>,
    client: reqwest::Client,
    user_agent: String,
    ttl: Duration,
    fetch_sem: Arc<tokio::sync::Semaphore>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            client,
            user_agent: user_agent.into(),
            ttl,
            fetch_sem: Arc::new(tokio::sync::Semaphore::new(DEFAULT_FETCH_CONCURRENCY)),
        }
    }

    /// Check whether `url` is allowed. Never blocks; spawns a background
    /// fetch when the host's rules are missing or expired. Must be called
    /// from within a tokio runtime.
    pub fn allowed(self: &Arc<Self>, url: &Url) -> RobotsDecision {
        let host = host_key(url);
        let now = Instant::now();

        {
            let entry = self.entries.entry(host.clone());
            use dashmap::mapref::entry::Entry;
            match entry {
                Entry::Occupied(mut occ) => {
                    let e = occ.get();
                    let fresh = e.expires.map(|at| now < at).unwrap_or(false);
                    if e.state != RobotsState::Fetching && fresh {
                        let allowed = match &e.body {
                            Some(body) => DefaultMatcher::default().one_agent_allowed_by_robots(
                                body,
                                &self.user_agent,
                                url.as_str(),
                            ),
                            None => true,
                        };
                        return RobotsDecision {
                            allowed,
                            ready: true,
                            state: e.state,
                        };
                    }
                    if e.state == RobotsState::Fetching {
                        return RobotsDecision {
                            allowed: false,
                            ready: false,
                            state: RobotsState::Fetching,
                        };
                    }
                    // Expired; refetch under the same single-flight flag.
                    occ.get_mut().state = RobotsState::Fetching;
                }
                Entry::Vacant(vac) => {
                    vac.insert(RobotsEntry {
                        state: RobotsState::Fetching,
                        body: None,
                        expires: None,
                    });
                }
            }
        }

        let cache = Arc::clone(self);
        let scheme = url.scheme().to_string();
        tokio::spawn(async move {
            cache.fetch(host, scheme).await;
        });

        RobotsDecision {
            allowed: false,
            ready: false,
            state: RobotsState::Fetching,
        }
    }

    pub fn state(&self, host: &str) -> RobotsState {
        self.entries
            .get(host)
            .map(|e| e.state)
            .unwrap_or(RobotsState::Unknown)
    }

    async fn fetch(self: Arc<Self>, host: String, scheme: String) {
        let _permit = match self.fetch_sem.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        let robots_url = format!("{scheme}://{host}/robots.txt");
        let result = self
            .client
            .get(&robots_url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await;

        let (body, state) = match result {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(text) => (Some(text), RobotsState::Ready),
                Err(err) => {
                    tracing::debug!(host = %host, error = %err, "robots.txt body read failed");
                    (None, RobotsState::Error)
                }
            },
            // Missing robots.txt means no rules: allow all.
            Ok(resp)
                if resp.status() == reqwest::StatusCode::NOT_FOUND
                    || resp.status() == reqwest::StatusCode::GONE =>
            {
                (None, RobotsState::Ready)
            }
            Ok(resp) => {
                tracing::debug!(host = %host, status = %resp.status(), "robots.txt fetch failed");
                (None, RobotsState::Error)
            }
            Err(err) => {
                tracing::debug!(host = %host, error = %err, "robots.txt fetch failed");
                (None, RobotsState::Error)
            }
        };

        self.finish(&host, body, state);
    }

    fn finish(&self, host: &str, body: Option<String>, state: RobotsState) {
        if let Some(mut entry) = self.entries.get_mut(host) {
            entry.body = body;
            entry.state = state;
            entry.expires = Some(Instant::now() + self.ttl);
        }
    }

    /// Test hook: install rules directly without a network fetch.
    #[cfg(test)]
    pub(crate) fn seed(&self, host: &str, body: Option<String>, state: RobotsState) {
        self.entries.insert(
            host.to_string(),
            RobotsEntry {
                state,
                body,
                expires: Some(Instant::now() + self.ttl),
            },
        );
    }
}
