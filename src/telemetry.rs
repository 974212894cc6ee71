//! Live telemetry: event aggregation and 200 ms frame publication.
//!
//! Fetch and edge events arrive on bounded channels; a single aggregator
//! task folds them into per-host stats and emits one [`Frame`] per interval
//! to every subscriber. Fan-out is non-blocking: a slow subscriber misses
//! frames rather than stalling the aggregator.

use crate::metrics::SharedMetrics;
use crate::robots::RobotsCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const FRAME_INTERVAL: Duration = Duration::from_millis(200);
const EVENT_BUFFER: usize = 2048;
const SUBSCRIBER_BUFFER: usize = 8;
const LATENCY_WINDOW: usize = 200;
const MAX_FRAME_HOSTS: usize = 25;
const MAX_FRAME_ERROR_CLASSES: usize = 10;

/// One fetch outcome, successful or not.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub host: String,
    pub latency_ms: u64,
    pub bytes: u64,
    pub reused_conn: bool,
    pub err_class: Option<&'static str>,
}

/// A host-to-host discovery.
#[derive(Debug, Clone)]
pub struct EdgeEvent {
    pub src: String,
    pub dst: String,
}

/// Scheduler-side host view injected per frame.
#[derive(Debug, Clone)]
pub struct HostSnapshot {
    pub host: String,
    pub inflight: usize,
    pub circuit: &'static str,
}

type QueueGetter = Box<dyn Fn() -> (usize, usize, usize) + Send + Sync>;
type HostGetter = Box<dyn Fn() -> Vec<HostSnapshot> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    /// Milliseconds since the Unix epoch.
    pub ts: u64,
    pub throughput: Throughput,
    pub queues: QueueDepths,
    pub errors: Vec<ErrorCount>,
    pub hosts: Vec<HostFrame>,
    pub graph_delta: GraphDelta,
}

#[derive(Debug, Clone, Serialize)]
pub struct Throughput {
    pub pages_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    pub frontier: usize,
    pub fetch: usize,
    pub parse: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorCount {
    pub class: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostFrame {
    pub host: String,
    pub inflight: usize,
    pub p95_ms: u64,
    pub error_rate: f64,
    pub reuse_rate: f64,
    pub robots_state: String,
    pub circuit_state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphDelta {
    pub nodes: Vec<String>,
    pub edges: Vec<(String, String, u64)>,
}

pub struct Telemetry {
    fetch_tx: mpsc::Sender<FetchEvent>,
    edge_tx: mpsc::Sender<EdgeEvent>,
    fetch_rx: Mutex<Option<mpsc::Receiver<FetchEvent>>>,
    edge_rx: Mutex<Option<mpsc::Receiver<EdgeEvent>>>,
    queue_getter: Mutex<Option<QueueGetter>>,
    host_getter: Mutex<Option<HostGetter>>,
    robots: Mutex<Option<Arc<RobotsCache>>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Frame>>>,
    next_id: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        let (fetch_tx, fetch_rx) = mpsc::channel(EVENT_BUFFER);
        let (edge_tx, edge_rx) = mpsc::channel(EVENT_BUFFER);
        Arc::new(Self {
            fetch_tx,
            edge_tx,
            fetch_rx: Mutex::new(Some(fetch_rx)),
            edge_rx: Mutex::new(Some(edge_rx)),
            queue_getter: Mutex::new(None),
            host_getter: Mutex::new(None),
            robots: Mutex::new(None),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn fetch_events(&self) -> mpsc::Sender<FetchEvent> {
        self.fetch_tx.clone()
    }

    pub fn edge_events(&self) -> mpsc::Sender<EdgeEvent> {
        self.edge_tx.clone()
    }

    pub fn set_queue_getter(&self, getter: QueueGetter) {
        *self.queue_getter.lock() = Some(getter);
    }

    pub fn set_host_getter(&self, getter: HostGetter) {
        *self.host_getter.lock() = Some(getter);
    }

    pub fn set_robots(&self, robots: Arc<RobotsCache>) {
        *self.robots.lock() = Some(robots);
    }

    /// Register a frame subscriber. Dropping the returned subscription
    /// unregisters it.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().insert(id, tx);
        Subscription {
            id,
            receiver: rx,
            telemetry: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    /// Aggregator loop. Runs until the token cancels.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, metrics: SharedMetrics) {
        let mut fetch_rx = match self.fetch_rx.lock().take() {
            Some(rx) => rx,
            None => {
                tracing::warn!("telemetry aggregator started twice");
                return;
            }
        };
        let mut edge_rx = match self.edge_rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };

        let mut agg = Aggregator::default();
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                Some(ev) = fetch_rx.recv() => agg.on_fetch(ev),
                Some(ev) = edge_rx.recv() => agg.on_edge(ev),
                _ = ticker.tick() => {
                    let frame = self.build_frame(&mut agg, &metrics);
                    self.publish(frame);
                }
            }
        }
    }

    fn build_frame(&self, agg: &mut Aggregator, metrics: &SharedMetrics) -> Frame {
        let (frontier, fetch, parse) = self
            .queue_getter
            .lock()
            .as_ref()
            .map(|g| g())
            .unwrap_or((0, 0, 0));
        metrics.set_queue_depths(frontier, fetch, parse);

        let snapshots: HashMap<String, (usize, &'static str)> = self
            .host_getter
            .lock()
            .as_ref()
            .map(|g| g())
            .unwrap_or_default()
            .into_iter()
            .map(|s| (s.host, (s.inflight, s.circuit)))
            .collect();
        let robots = self.robots.lock().clone();

        let mut hosts: Vec<HostFrame> = agg
            .hosts
            .iter()
            .map(|(host, stats)| {
                let (inflight, circuit) = snapshots
                    .get(host)
                    .copied()
                    .unwrap_or((0, "closed"));
                let robots_state = robots
                    .as_ref()
                    .map(|r| r.state(host).as_str())
                    .unwrap_or("unknown");
                HostFrame {
                    host: host.clone(),
                    inflight,
                    p95_ms: p95(&stats.latencies),
                    error_rate: rate(stats.errs, stats.reqs),
                    reuse_rate: rate(stats.reuse, stats.reqs),
                    robots_state: robots_state.to_string(),
                    circuit_state: circuit.to_string(),
                }
            })
            .collect();
        hosts.sort_by(|a, b| b.inflight.cmp(&a.inflight).then(a.host.cmp(&b.host)));
        hosts.truncate(MAX_FRAME_HOSTS);

        let mut errors: Vec<ErrorCount> = agg
            .error_counts
            .drain()
            .map(|(class, count)| ErrorCount {
                class: class.to_string(),
                count,
            })
            .collect();
        errors.sort_by(|a, b| b.count.cmp(&a.count).then(a.class.cmp(&b.class)));
        errors.truncate(MAX_FRAME_ERROR_CLASSES);

        let nodes: Vec<String> = agg.nodes_seen.drain().collect();
        let edges: Vec<(String, String, u64)> = agg
            .edges_seen
            .drain()
            .map(|((src, dst), count)| (src, dst, count))
            .collect();

        let pages_per_sec = agg.interval_pages as f64 / FRAME_INTERVAL.as_secs_f64();
        agg.interval_pages = 0;
        // Latency rings survive across frames; the counters feeding the
        // rates are per-frame.
        for stats in agg.hosts.values_mut() {
            stats.reqs = 0;
            stats.errs = 0;
            stats.reuse = 0;
        }

        Frame {
            ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            throughput: Throughput { pages_per_sec },
            queues: QueueDepths {
                frontier,
                fetch,
                parse,
            },
            errors,
            hosts,
            graph_delta: GraphDelta { nodes, edges },
        }
    }

    fn publish(&self, frame: Frame) {
        let subscribers = self.subscribers.lock();
        for tx in subscribers.values() {
            let _ = tx.try_send(frame.clone());
        }
    }
}

/// Frame stream handle; unregisters itself on drop.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Frame>,
    telemetry: Arc<Telemetry>,
}

impl Subscription {
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.telemetry.unsubscribe(self.id);
    }
}

#[derive(Default)]
struct HostAgg {
    latencies: VecDeque<u64>,
    reqs: u64,
    errs: u64,
    reuse: u64,
}

#[derive(Default)]
struct Aggregator {
    hosts: HashMap<String, HostAgg>,
    error_counts: HashMap<&'static str, u64>,
    nodes_seen: HashSet<String>,
    edges_seen: HashMap<(String, String), u64>,
    interval_pages: u64,
}

impl Aggregator {
    fn on_fetch(&mut self, ev: FetchEvent) {
        let stats = self.hosts.entry(ev.host).or_default();
        stats.reqs += 1;
        match ev.err_class {
            Some(class) => {
                stats.errs += 1;
                *self.error_counts.entry(class).or_insert(0) += 1;
            }
            None => self.interval_pages += 1,
        }
        if ev.reused_conn {
            stats.reuse += 1;
        }
        if ev.latency_ms > 0 {
            stats.latencies.push_back(ev.latency_ms);
            while stats.latencies.len() > LATENCY_WINDOW {
                stats.latencies.pop_front();
            }
        }
    }

    fn on_edge(&mut self, ev: EdgeEvent) {
        if ev.src.is_empty() || ev.dst.is_empty() {
            return;
        }
        self.nodes_seen.insert(ev.src.clone());
        self.nodes_seen.insert(ev.dst.clone());
        *self.edges_seen.entry((ev.src, ev.dst)).or_insert(0) += 1;
    }
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Copy, sort, index by `floor((n - 1) * 0.95)`.
fn p95(samples: &VecDeque<u64>) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let idx = ((sorted.len() - 1) as f64 * 0.95).floor() as usize;
    sorted[idx]
}
