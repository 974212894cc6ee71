//! The run engine: one instance per crawl run.
//!
//! Owns every pipeline stage and the channels between them. All workers are
//! long-lived tasks that select against the run's cancellation token, so a
//! stop from any source (user, page limit, time budget) drains the whole
//! pipeline cooperatively.

use crate::canonical::canonicalize;
use crate::config::{CrawlerDefaults, RunConfig};
use crate::dedup::Deduper;
use crate::fetcher::{self, Fetcher};
use crate::metrics::SharedMetrics;
use crate::parser::Parser;
use crate::robots::RobotsCache;
use crate::scheduler::Scheduler;
use crate::semaphore::Semaphore;
use crate::storage::{RunId, RunStatus, SinkEvent, Store};
use crate::task::{ParseJob, Task};
use crate::telemetry::Telemetry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SINK_BUFFER: usize = 2048;
const FRONTIER_CAP_PER_WORKER: usize = 200;
const STAGE_CAP_PER_WORKER: usize = 4;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Fetch(#[from] fetcher::FetchError),
}

/// Cancellation token plus the reason the run stopped. The first stop call
/// wins; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stop(&self, reason: &str) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.token.cancel();
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

pub struct Engine {
    run_id: RunId,
    cfg: RunConfig,
    store: Arc<dyn Store>,
    telemetry: Arc<Telemetry>,
    metrics: SharedMetrics,
    stop: StopSignal,
    deduper: Arc<Deduper>,
    scheduler: Arc<Scheduler>,
    robots: Option<Arc<RobotsCache>>,
    client: reqwest::Client,
    enqueue_tx: mpsc::Sender<Task>,
    fetch_tx: mpsc::Sender<Task>,
    parse_tx: mpsc::Sender<ParseJob>,
    sink_tx: mpsc::Sender<SinkEvent>,
    fetch_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    parse_rx: Mutex<Option<mpsc::Receiver<ParseJob>>>,
    sink_rx: Mutex<Option<mpsc::Receiver<SinkEvent>>>,
    pages_fetched: Arc<AtomicU64>,
    started: AtomicBool,
}

impl Engine {
    pub fn new(
        run_id: RunId,
        cfg: RunConfig,
        store: Arc<dyn Store>,
        telemetry: Arc<Telemetry>,
        metrics: SharedMetrics,
    ) -> Result<Arc<Self>, EngineError> {
        let cfg = cfg.normalized(&CrawlerDefaults::default());

        let frontier_cap = cfg.global_concurrency * FRONTIER_CAP_PER_WORKER;
        let stage_cap = cfg.global_concurrency * STAGE_CAP_PER_WORKER;

        let (enqueue_tx, enqueue_rx) = mpsc::channel::<Task>(frontier_cap);
        let (fetch_tx, fetch_rx) = mpsc::channel::<Task>(stage_cap);
        let (parse_tx, parse_rx) = mpsc::channel::<ParseJob>(stage_cap);
        let (sink_tx, sink_rx) = mpsc::channel::<SinkEvent>(SINK_BUFFER);

        let client = fetcher::build_client(&cfg)?;
        let robots = cfg
            .respect_robots
            .then(|| Arc::new(RobotsCache::new(client.clone(), cfg.user_agent.clone(), cfg.robots_ttl())));

        let scheduler = Scheduler::new(
            run_id,
            frontier_cap,
            Semaphore::new(cfg.global_concurrency),
            cfg.per_host_concurrency,
            cfg.circuit_trip_count,
            cfg.circuit_reset(),
            robots.clone(),
            enqueue_rx,
            fetch_tx.clone(),
            sink_tx.clone(),
            telemetry.fetch_events(),
        );

        Ok(Arc::new(Self {
            run_id,
            cfg,
            store,
            telemetry,
            metrics,
            stop: StopSignal::new(),
            deduper: Arc::new(Deduper::default()),
            scheduler,
            robots,
            client,
            enqueue_tx,
            fetch_tx,
            parse_tx,
            sink_tx,
            fetch_rx: Mutex::new(Some(fetch_rx)),
            parse_rx: Mutex::new(Some(parse_rx)),
            sink_rx: Mutex::new(Some(sink_rx)),
            pages_fetched: Arc::new(AtomicU64::new(0)),
            started: AtomicBool::new(false),
        }))
    }

    /// Spawn all workers and seed the frontier. Must be called from within
    /// a tokio runtime; returns immediately.
    pub fn start(self: &Arc<Self>, seed: &str) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!(run_id = %self.run_id, "engine already started");
            return;
        }
        let token = self.stop.token().clone();

        // Telemetry needs live views of the queues and host table.
        {
            let scheduler = Arc::clone(&self.scheduler);
            let fetch_tx = self.fetch_tx.clone();
            let parse_tx = self.parse_tx.clone();
            self.telemetry.set_queue_getter(Box::new(move || {
                (
                    scheduler.frontier_size(),
                    channel_depth(&fetch_tx),
                    channel_depth(&parse_tx),
                )
            }));
            let scheduler = Arc::clone(&self.scheduler);
            self.telemetry
                .set_host_getter(Box::new(move || scheduler.snapshot_host_states()));
            if let Some(robots) = &self.robots {
                self.telemetry.set_robots(Arc::clone(robots));
            }
            tokio::spawn(
                Arc::clone(&self.telemetry).run(token.clone(), Arc::clone(&self.metrics)),
            );
        }

        tokio::spawn(Arc::clone(&self.scheduler).run(token.clone()));
        tokio::spawn(Self::storage_loop(
            Arc::clone(&self.store),
            self.sink_rx.lock().take(),
            token.clone(),
        ));
        tokio::spawn(Self::monitor_stop(
            Arc::clone(&self.store),
            self.run_id,
            self.stop.clone(),
        ));

        let fetch_workers = self.cfg.global_concurrency.max(4);
        if let Some(rx) = self.fetch_rx.lock().take() {
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            let fetcher = Arc::new(Fetcher {
                run_id: self.run_id,
                cfg: self.cfg.clone(),
                client: self.client.clone(),
                scheduler: Arc::clone(&self.scheduler),
                deduper: Arc::clone(&self.deduper),
                enqueue_tx: self.enqueue_tx.clone(),
                parse_tx: self.parse_tx.clone(),
                sink_tx: self.sink_tx.clone(),
                fetch_events: self.telemetry.fetch_events(),
                edge_events: self.telemetry.edge_events(),
                pages_fetched: Arc::clone(&self.pages_fetched),
                metrics: Arc::clone(&self.metrics),
                stop: self.stop.clone(),
                host_last_done: DashMap::new(),
            });
            for _ in 0..fetch_workers {
                tokio::spawn(Arc::clone(&fetcher).run(Arc::clone(&rx)));
            }
        }

        let parse_workers = (self.cfg.global_concurrency / 2).max(2);
        if let Some(rx) = self.parse_rx.lock().take() {
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            let parser = Arc::new(Parser {
                run_id: self.run_id,
                max_depth: self.cfg.max_depth,
                max_links_per_page: self.cfg.max_links_per_page,
                deduper: Arc::clone(&self.deduper),
                enqueue_tx: self.enqueue_tx.clone(),
                sink_tx: self.sink_tx.clone(),
                fetch_events: self.telemetry.fetch_events(),
                edge_events: self.telemetry.edge_events(),
                stop: self.stop.clone(),
            });
            for _ in 0..parse_workers {
                tokio::spawn(Arc::clone(&parser).run(Arc::clone(&rx)));
            }
        }

        if let Some(budget) = self.cfg.time_budget() {
            let stop = self.stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(budget) => stop.stop("time_budget"),
                }
            });
        }

        self.seed(seed);
    }

    fn seed(self: &Arc<Self>, seed: &str) {
        let (canonical, parsed) = match canonicalize(seed) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(seed, error = %err, "seed url rejected");
                self.stop.stop("invalid_seed");
                return;
            }
        };
        if self.deduper.seen(&canonical) {
            return;
        }
        let host = crate::canonical::host_key(&parsed);
        let task = Task::new(parsed, canonical, host, 0, None);

        // Seeding is the one enqueue allowed to wait for frontier space.
        let enqueue_tx = self.enqueue_tx.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                result = enqueue_tx.send(task) => {
                    if result.is_err() {
                        tracing::warn!("scheduler gone before seed enqueue");
                    }
                }
            }
        });
    }

    async fn storage_loop(
        store: Arc<dyn Store>,
        rx: Option<mpsc::Receiver<SinkEvent>>,
        token: CancellationToken,
    ) {
        let mut rx = match rx {
            Some(rx) => rx,
            None => return,
        };
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return,
                event = rx.recv() => match event {
                    Some(ev) => ev,
                    None => return,
                },
            };
            let result = match event {
                SinkEvent::Page(rec) => store.insert_page(rec).await,
                SinkEvent::Error {
                    run_id,
                    host,
                    url,
                    class,
                    message,
                } => store.insert_error(run_id, &host, &url, class, &message).await,
                SinkEvent::Edge {
                    run_id,
                    src,
                    dst,
                    count,
                } => store.upsert_edge(run_id, &src, &dst, count).await,
            };
            if let Err(err) = result {
                // Sink errors are observational, never fatal.
                tracing::warn!(error = %err, "storage write failed");
            }
        }
    }

    async fn monitor_stop(store: Arc<dyn Store>, run_id: RunId, stop: StopSignal) {
        stop.cancelled().await;
        let reason = stop.reason();
        if let Err(err) = store
            .update_run_status(
                run_id,
                RunStatus::Stopped,
                None,
                Some(SystemTime::now()),
                reason.as_deref(),
            )
            .await
        {
            tracing::warn!(error = %err, "failed to mark run stopped");
        }
    }

    pub fn stop(&self) {
        self.stop.stop("user");
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched.load(Ordering::SeqCst)
    }

    /// Resolves when the run has stopped, whatever the cause.
    pub async fn done(&self) {
        self.stop.cancelled().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Why the run stopped, once it has.
    pub fn stop_reason(&self) -> Option<String> {
        self.stop.reason()
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.cfg
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

fn channel_depth<T>(tx: &mpsc::Sender<T>) -> usize {
    tx.max_capacity().saturating_sub(tx.capacity())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn stop_signal_first_reason_wins() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());
        assert_eq!(stop.reason(), None);

        stop.stop("max_pages");
        stop.stop("user");
        assert!(stop.is_stopped());
        assert_eq!(stop.reason().as_deref(), Some("max_pages"));
    }

    #[tokio::test]
    async fn invalid_seed_stops_run() {
        let store = Arc::new(MemoryStore::new());
        let telemetry = Telemetry::new();
        let metrics = crate::metrics::Metrics::new();
        let run_id = store.create_run(RunConfig::default()).await.unwrap();
        let engine = Engine::new(
            run_id,
            RunConfig::default(),
            store.clone(),
            telemetry,
            metrics,
        )
        .unwrap();

        engine.start("ftp://not-crawlable.test/");
        engine.done().await;
        assert!(engine.is_stopped());

        // The monitor records the stop; poll briefly for it.
        for _ in 0..50 {
            let run = store.get_run(run_id).await.unwrap();
            if run.status == RunStatus::Stopped {
                assert_eq!(run.stop_reason.as_deref(), Some("invalid_seed"));
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("run never marked stopped");
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let telemetry = Telemetry::new();
        let metrics = crate::metrics::Metrics::new();
        let run_id = store.create_run(RunConfig::default()).await.unwrap();
        let engine = Engine::new(
            run_id,
            RunConfig {
                time_budget_secs: 1,
                ..Default::default()
            },
            store,
            telemetry,
            metrics,
        )
        .unwrap();

        engine.start("http://a.invalid/");
        engine.start("http://b.invalid/");
        engine.stop();
        engine.done().await;
    }
}
