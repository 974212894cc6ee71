//! HTTP fetch workers.
//!
//! Workers pull permitted tasks off the fetch channel, perform a single GET
//! with a hard deadline, classify the outcome, and route the result: HTML
//! bodies to the parse channel, redirects and retries back to the
//! scheduler, and one page record per terminal outcome to the storage sink.
//! Redirects are never followed by the client so that dedup and robots
//! checks apply to every hop.

use crate::canonical::{canonicalize, host_key};
use crate::config::RunConfig;
use crate::dedup::Deduper;
use crate::engine::StopSignal;
use crate::errors;
use crate::metrics::SharedMetrics;
use crate::scheduler::Scheduler;
use crate::storage::{PageRecord, RunId, SinkEvent};
use crate::task::{ParseJob, Task};
use crate::telemetry::{EdgeEvent, FetchEvent};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, LOCATION, RETRY_AFTER};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timeout")]
    Timeout,

    #[error("dns resolution failed")]
    Dns,

    #[error("tls negotiation failed: {0}")]
    Tls(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to build http client: {0}")]
    ClientBuild(String),
}

impl FetchError {
    pub fn class(&self) -> &'static str {
        match self {
            FetchError::Timeout => errors::TIMEOUT,
            FetchError::Dns => errors::DNS,
            FetchError::Tls(_) => errors::TLS,
            FetchError::Network(_) | FetchError::ClientBuild(_) => errors::FETCH,
        }
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return FetchError::Timeout;
        }
        let chain = error_chain(&error);
        if error.is_connect()
            && (chain.contains("dns")
                || chain.contains("name resolution")
                || chain.contains("no such host")
                || chain.contains("failed to lookup"))
        {
            return FetchError::Dns;
        }
        if chain.contains("certificate")
            || chain.contains("tls")
            || chain.contains("ssl")
            || chain.contains("handshake")
        {
            return FetchError::Tls(chain);
        }
        FetchError::Network(chain)
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(err) = source {
        parts.push(err.to_string());
        source = err.source();
    }
    parts.join(": ").to_lowercase()
}

/// Build the per-run HTTP client. Redirects are handled by the engine, not
/// the client; body decompression stays on so content-length limits apply
/// to the decoded stream reqwest hands us.
pub fn build_client(cfg: &RunConfig) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .user_agent(cfg.user_agent.clone())
        .timeout(cfg.request_timeout())
        .read_timeout(cfg.header_timeout())
        .connect_timeout(cfg.tls_handshake_timeout())
        .pool_idle_timeout(cfg.idle_conn_timeout())
        .pool_max_idle_per_host(cfg.per_host_concurrency.max(8))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| FetchError::ClientBuild(e.to_string()))
}

pub fn is_html_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.starts_with("text/html") || lower.starts_with("application/xhtml+xml")
}

/// Parse a `Retry-After` header value: delta seconds or an HTTP-date.
/// Anything unparseable, and dates in the past, come back as zero.
pub fn parse_retry_after(value: &str) -> Duration {
    let value = value.trim();
    if value.is_empty() {
        return Duration::ZERO;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    if let Ok(at) = httpdate::parse_http_date(value) {
        return at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
    }
    Duration::ZERO
}

/// Retry delay: `base * 2^retries`, capped, with `Retry-After` overriding.
fn backoff_delay(base: Duration, retries: u32, retry_after: Option<Duration>) -> Duration {
    let mut delay = base.saturating_mul(1u32 << retries.min(16));
    if let Some(after) = retry_after {
        if !after.is_zero() {
            delay = after;
        }
    }
    delay.min(MAX_RETRY_DELAY)
}

enum BodyOutcome {
    Complete(Vec<u8>, u64),
    TooLarge(u64),
    Failed(u64, String),
}

/// Read at most `cap` body bytes, stopping as soon as the cap is exceeded so
/// a huge response costs one extra chunk, not the whole body.
async fn collect_limited<S, E>(mut stream: S, cap: u64) -> BodyOutcome
where
    S: futures_util::Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut data: Vec<u8> = Vec::new();
    let mut total: u64 = 0;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                total += bytes.len() as u64;
                if total > cap {
                    return BodyOutcome::TooLarge(total);
                }
                data.extend_from_slice(&bytes);
            }
            Err(err) => return BodyOutcome::Failed(total, err.to_string()),
        }
    }
    BodyOutcome::Complete(data, total)
}

/// Consume and discard a body, counting bytes up to one past the cap.
async fn drain_limited<S, E>(mut stream: S, cap: u64) -> (u64, Option<String>)
where
    S: futures_util::Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut total: u64 = 0;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                total += bytes.len() as u64;
                if total > cap {
                    return (total, Some(errors::SIZE_LIMIT.to_string()));
                }
            }
            Err(err) => return (total, Some(err.to_string())),
        }
    }
    (total, None)
}

struct FetchOutcome {
    status: Option<u16>,
    content_type: Option<String>,
    body: Option<Vec<u8>>,
    latency_ms: u64,
    size: u64,
    reused: bool,
    err_class: Option<&'static str>,
    err_message: Option<String>,
}

pub(crate) struct Fetcher {
    pub(crate) run_id: RunId,
    pub(crate) cfg: RunConfig,
    pub(crate) client: reqwest::Client,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) deduper: Arc<Deduper>,
    pub(crate) enqueue_tx: mpsc::Sender<Task>,
    pub(crate) parse_tx: mpsc::Sender<ParseJob>,
    pub(crate) sink_tx: mpsc::Sender<SinkEvent>,
    pub(crate) fetch_events: mpsc::Sender<FetchEvent>,
    pub(crate) edge_events: mpsc::Sender<EdgeEvent>,
    pub(crate) pages_fetched: Arc<AtomicU64>,
    pub(crate) metrics: SharedMetrics,
    pub(crate) stop: StopSignal,
    /// Completion time of the last fetch per host, for the connection-reuse
    /// heuristic surfaced in telemetry.
    pub(crate) host_last_done: DashMap<String, Instant>,
}

impl Fetcher {
    /// Worker loop. Multiple workers share one receiver behind a mutex.
    pub(crate) async fn run(self: Arc<Self>, rx: Arc<Mutex<mpsc::Receiver<Task>>>) {
        loop {
            let task = tokio::select! {
                _ = self.stop.cancelled() => return,
                task = async { rx.lock().await.recv().await } => match task {
                    Some(t) => t,
                    None => return,
                },
            };
            self.handle(task).await;
        }
    }

    async fn handle(&self, mut task: Task) {
        // The permit pair rides inside the task and is released when the
        // task drops, whichever way this function exits.
        if self.cfg.max_pages > 0 && self.pages_fetched.load(Ordering::SeqCst) >= self.cfg.max_pages
        {
            return;
        }

        let reused = self.connection_likely_reused(&task.host);
        let started = Instant::now();
        let response = self.client.get(task.url.clone()).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let resp = match response {
            Ok(resp) => resp,
            Err(err) => {
                let fe = FetchError::from_reqwest(err);
                let class = fe.class();
                let message = fe.to_string();
                if self.try_retry(&mut task, class, &message, None).await {
                    return;
                }
                self.record_fetch(
                    task,
                    FetchOutcome {
                        status: None,
                        content_type: None,
                        body: None,
                        latency_ms,
                        size: 0,
                        reused,
                        err_class: Some(class),
                        err_message: Some(message),
                    },
                )
                .await;
                return;
            }
        };

        let status = resp.status();
        let status_code = status.as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.host_last_done.insert(task.host.clone(), Instant::now());

        if status.is_redirection() {
            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let (size, _) = drain_limited(resp.bytes_stream(), self.cfg.max_body_bytes).await;
            if let Some(location) = location {
                self.follow_redirect(&task, &location).await;
            }
            self.record_fetch(
                task,
                FetchOutcome {
                    status: Some(status_code),
                    content_type,
                    body: None,
                    latency_ms,
                    size,
                    reused,
                    err_class: None,
                    err_message: None,
                },
            )
            .await;
            return;
        }

        if status_code == 429 {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(parse_retry_after);
            let (size, _) = drain_limited(resp.bytes_stream(), self.cfg.max_body_bytes).await;
            if self
                .try_retry(&mut task, errors::STATUS, "too_many_requests", retry_after)
                .await
            {
                return;
            }
            self.record_fetch(
                task,
                FetchOutcome {
                    status: Some(status_code),
                    content_type,
                    body: None,
                    latency_ms,
                    size,
                    reused,
                    err_class: Some(errors::STATUS),
                    err_message: Some("too_many_requests".to_string()),
                },
            )
            .await;
            return;
        }

        if status.is_server_error() {
            let (size, _) = drain_limited(resp.bytes_stream(), self.cfg.max_body_bytes).await;
            if self
                .try_retry(&mut task, errors::STATUS, &status.to_string(), None)
                .await
            {
                return;
            }
            self.record_fetch(
                task,
                FetchOutcome {
                    status: Some(status_code),
                    content_type,
                    body: None,
                    latency_ms,
                    size,
                    reused,
                    err_class: Some(errors::STATUS),
                    err_message: Some(status.to_string()),
                },
            )
            .await;
            return;
        }

        if status.is_client_error() {
            let (size, _) = drain_limited(resp.bytes_stream(), self.cfg.max_body_bytes).await;
            self.record_fetch(
                task,
                FetchOutcome {
                    status: Some(status_code),
                    content_type,
                    body: None,
                    latency_ms,
                    size,
                    reused,
                    err_class: Some(errors::STATUS),
                    err_message: Some(status.to_string()),
                },
            )
            .await;
            return;
        }

        let is_html = content_type
            .as_deref()
            .map(is_html_content_type)
            .unwrap_or(false);
        let below_depth_cap = self.cfg.max_depth == 0 || task.depth < self.cfg.max_depth;

        if is_html && below_depth_cap {
            match collect_limited(resp.bytes_stream(), self.cfg.max_body_bytes).await {
                BodyOutcome::Complete(body, size) => {
                    self.record_fetch(
                        task,
                        FetchOutcome {
                            status: Some(status_code),
                            content_type,
                            body: Some(body),
                            latency_ms,
                            size,
                            reused,
                            err_class: None,
                            err_message: None,
                        },
                    )
                    .await;
                }
                BodyOutcome::TooLarge(size) => {
                    self.record_fetch(
                        task,
                        FetchOutcome {
                            status: Some(status_code),
                            content_type,
                            body: None,
                            latency_ms,
                            size,
                            reused,
                            err_class: Some(errors::SIZE_LIMIT),
                            err_message: Some("max_body_bytes".to_string()),
                        },
                    )
                    .await;
                }
                BodyOutcome::Failed(size, message) => {
                    self.record_fetch(
                        task,
                        FetchOutcome {
                            status: Some(status_code),
                            content_type,
                            body: None,
                            latency_ms,
                            size,
                            reused,
                            err_class: Some(errors::FETCH),
                            err_message: Some(message),
                        },
                    )
                    .await;
                }
            }
            return;
        }

        // Non-HTML or at the depth cap: discard the body but account for it.
        let (size, err) = drain_limited(resp.bytes_stream(), self.cfg.max_body_bytes).await;
        let (err_class, err_message) = match err {
            Some(msg) if msg == errors::SIZE_LIMIT => {
                (Some(errors::SIZE_LIMIT), Some("max_body_bytes".to_string()))
            }
            Some(msg) => (Some(errors::FETCH), Some(msg)),
            None => (None, None),
        };
        self.record_fetch(
            task,
            FetchOutcome {
                status: Some(status_code),
                content_type,
                body: None,
                latency_ms,
                size,
                reused,
                err_class,
                err_message,
            },
        )
        .await;
    }

    /// Re-enqueue with backoff when the class is retryable and budget
    /// remains. The failed attempt counts against the host breaker and
    /// leaves a supplemental error row, but no page record and no telemetry
    /// error: a retried attempt is not yet user-visible in the stream.
    async fn try_retry(
        &self,
        task: &mut Task,
        class: &'static str,
        message: &str,
        retry_after: Option<Duration>,
    ) -> bool {
        if !errors::is_retryable(class) || task.retries >= self.cfg.retry_max {
            return false;
        }
        if let Some(state) = self.scheduler.host_state(&task.host) {
            state.on_result(false);
        }
        let _ = self.sink_tx.try_send(SinkEvent::Error {
            run_id: self.run_id,
            host: task.host.clone(),
            url: task.url.to_string(),
            class,
            message: message.to_string(),
        });

        let mut retry = Task::new(
            task.url.clone(),
            task.canonical.clone(),
            task.host.clone(),
            task.depth,
            task.source_host.clone(),
        );
        retry.discovered_at = task.discovered_at;
        retry.retries = task.retries + 1;
        let delay = backoff_delay(self.cfg.retry_base_delay(), retry.retries, retry_after);
        retry.not_before = Some(Instant::now() + delay);
        tracing::debug!(url = %retry.url, retries = retry.retries, delay_ms = delay.as_millis() as u64, class, "retrying");

        // Release this attempt's permits before the task re-enters the
        // frontier; the scheduler grants a fresh pair on redispatch.
        task.permits = None;
        tokio::select! {
            _ = self.stop.cancelled() => {}
            result = self.enqueue_tx.send(retry) => {
                if result.is_err() {
                    tracing::trace!("enqueue channel closed, dropping retry");
                }
            }
        }
        true
    }

    async fn record_fetch(&self, task: Task, out: FetchOutcome) {
        match out.err_class {
            None => {
                let fetched = self.pages_fetched.fetch_add(1, Ordering::SeqCst) + 1;
                self.metrics.record_page();
                if self.cfg.max_pages > 0 && fetched >= self.cfg.max_pages {
                    self.stop.stop("max_pages");
                }
            }
            Some(class) => self.metrics.record_error(class),
        }

        let _ = self.fetch_events.try_send(FetchEvent {
            host: task.host.clone(),
            latency_ms: out.latency_ms,
            bytes: out.size,
            reused_conn: out.reused,
            err_class: out.err_class,
        });

        let success = out.err_class.is_none() && out.status.unwrap_or(600) < 500;
        if let Some(state) = self.scheduler.host_state(&task.host) {
            state.on_result(success);
        }

        if let Some(err_class) = out.err_class {
            let _ = self.sink_tx.try_send(SinkEvent::Error {
                run_id: self.run_id,
                host: task.host.clone(),
                url: task.url.to_string(),
                class: err_class,
                message: out.err_message.clone().unwrap_or_default(),
            });
        }

        let below_depth_cap = self.cfg.max_depth == 0 || task.depth < self.cfg.max_depth;
        if let Some(body) = out.body {
            if below_depth_cap {
                let _ = self.parse_tx.try_send(ParseJob {
                    base: task.url.clone(),
                    host: task.host.clone(),
                    depth: task.depth,
                    body,
                });
            }
        }

        let _ = self.sink_tx.try_send(SinkEvent::Page(PageRecord {
            run_id: self.run_id,
            url: task.url.to_string(),
            canonical_url: task.canonical.clone(),
            host: task.host.clone(),
            depth: task.depth,
            status_code: out.status,
            content_type: out.content_type,
            fetch_ms: out.latency_ms,
            size_bytes: out.size,
            error_class: out.err_class.map(str::to_string),
            error_message: out.err_message,
            discovered_at: task.discovered_at,
            fetched_at: Some(SystemTime::now()),
        }));
        // Task drops here, releasing its permit pair.
    }

    async fn follow_redirect(&self, task: &Task, location: &str) {
        let resolved = match task.url.join(location) {
            Ok(url) => url,
            Err(err) => {
                tracing::trace!(location, error = %err, "unresolvable redirect");
                return;
            }
        };
        let (canonical, parsed) = match canonicalize(resolved.as_str()) {
            Ok(pair) => pair,
            Err(_) => return,
        };
        if self.deduper.seen(&canonical) {
            return;
        }
        let host = host_key(&parsed);
        // Redirects keep the depth of the original task.
        let child = Task::new(parsed, canonical, host.clone(), task.depth, Some(task.host.clone()));

        if host != task.host {
            let _ = self.edge_events.try_send(EdgeEvent {
                src: task.host.clone(),
                dst: host.clone(),
            });
            let _ = self.sink_tx.try_send(SinkEvent::Edge {
                run_id: self.run_id,
                src: task.host.clone(),
                dst: host,
                count: 1,
            });
        }

        tokio::select! {
            _ = self.stop.cancelled() => {}
            result = self.enqueue_tx.send(child) => {
                if result.is_err() {
                    tracing::trace!("enqueue channel closed, dropping redirect target");
                }
            }
        }
    }

    fn connection_likely_reused(&self, host: &str) -> bool {
        self.host_last_done
            .get(host)
            .map(|done| done.elapsed() < self.cfg.idle_conn_timeout())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    fn chunks(parts: &[&'static [u8]]) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(parse_retry_after(""), Duration::ZERO);
        assert_eq!(parse_retry_after("5"), Duration::from_secs(5));
        assert_eq!(
            parse_retry_after("Mon, 01 Jan 2001 00:00:00 GMT"),
            Duration::ZERO
        );
        assert_eq!(parse_retry_after("not-a-date"), Duration::ZERO);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(10);
        assert_eq!(backoff_delay(base, 1, None), Duration::from_millis(20));
        assert_eq!(backoff_delay(base, 2, None), Duration::from_millis(40));
        assert_eq!(backoff_delay(base, 30, None), MAX_RETRY_DELAY);
        // Retry-After overrides the exponential delay.
        assert_eq!(
            backoff_delay(base, 1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        // A zero Retry-After does not.
        assert_eq!(
            backoff_delay(base, 1, Some(Duration::ZERO)),
            Duration::from_millis(20)
        );
    }

    #[tokio::test]
    async fn body_over_cap_is_size_limited() {
        match collect_limited(chunks(&[b"hello"]), 4).await {
            BodyOutcome::TooLarge(size) => assert!(size > 4),
            _ => panic!("expected size_limit"),
        }
    }

    #[tokio::test]
    async fn body_at_cap_is_complete() {
        match collect_limited(chunks(&[b"hi", b"yo"]), 4).await {
            BodyOutcome::Complete(data, size) => {
                assert_eq!(data, b"hiyo");
                assert_eq!(size, 4);
            }
            _ => panic!("expected complete body"),
        }
    }

    #[tokio::test]
    async fn drain_counts_and_flags_overflow() {
        let (size, err) = drain_limited(chunks(&[b"aaaa"]), 8).await;
        assert_eq!(size, 4);
        assert!(err.is_none());

        let (size, err) = drain_limited(chunks(&[b"aaaa", b"bbbb", b"c"]), 8).await;
        assert!(size > 8);
        assert_eq!(err.as_deref(), Some(errors::SIZE_LIMIT));
    }

    #[test]
    fn html_content_types() {
        assert!(is_html_content_type("text/html"));
        assert!(is_html_content_type("TEXT/HTML; charset=utf-8"));
        assert!(is_html_content_type("application/xhtml+xml"));
        assert!(!is_html_content_type("application/json"));
        assert!(!is_html_content_type("image/png"));
    }

    #[test]
    fn client_builds_from_normalized_config() {
        let cfg = RunConfig {
            seed_url: "http://example.com/".into(),
            ..Default::default()
        }
        .normalized(&crate::config::CrawlerDefaults::default());
        assert!(build_client(&cfg).is_ok());
    }
}
