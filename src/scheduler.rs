//! Per-host fair dispatch over the crawl frontier.
//!
//! The frontier is a set of per-host FIFO queues plus a round-robin cursor
//! over the hosts that currently have work. Each tick runs one dispatch
//! round of at most `len(hosts)` visits, so scheduling latency stays bounded
//! no matter how deep individual queues get.
//!
//! The one invariant everything else leans on: the scheduler never blocks
//! while holding permits. If the fetch channel is full, permits are released
//! before the task is parked back at the front of its queue.

use crate::host_state::HostState;
use crate::robots::RobotsCache;
use crate::semaphore::Semaphore;
use crate::storage::{PageRecord, RunId, SinkEvent};
use crate::task::{PermitPair, Task};
use crate::telemetry::{FetchEvent, HostSnapshot};
use crate::errors;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One dispatch round per tick.
const TICK: Duration = Duration::from_millis(5);
/// Park applied to a head task whose circuit breaker denies dispatch.
const CIRCUIT_PARK: Duration = Duration::from_millis(500);
/// Park applied while robots rules for the host are still in flight.
const ROBOTS_PARK: Duration = Duration::from_millis(750);
/// Park applied when the fetch channel is full.
const BACKPRESSURE_PARK: Duration = Duration::from_millis(200);

struct Frontier {
    queues: HashMap<String, VecDeque<Task>>,
    hosts: Vec<String>,
    cursor: usize,
    size: usize,
    states: HashMap<String, Arc<HostState>>,
}

impl Frontier {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
            hosts: Vec::new(),
            cursor: 0,
            size: 0,
            states: HashMap::new(),
        }
    }

    fn advance(&mut self) {
        self.cursor += 1;
    }

    fn remove_host_at_cursor(&mut self) {
        let host = self.hosts.remove(self.cursor);
        self.queues.remove(&host);
        if self.cursor >= self.hosts.len() {
            self.cursor = 0;
        }
    }

    fn park_head(&mut self, host: &str, until: Instant) {
        if let Some(task) = self.queues.get_mut(host).and_then(|q| q.front_mut()) {
            task.not_before = Some(until);
        }
    }

    fn pop_head(&mut self, host: &str) -> Option<Task> {
        let task = self.queues.get_mut(host)?.pop_front()?;
        self.size -= 1;
        Some(task)
    }
}

enum Visit {
    Next,
    StopRound,
}

pub struct Scheduler {
    run_id: RunId,
    frontier_limit: usize,
    global: Semaphore,
    per_host: usize,
    trip_count: u32,
    circuit_reset: Duration,
    robots: Option<Arc<RobotsCache>>,
    in_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    out_tx: mpsc::Sender<Task>,
    sink_tx: mpsc::Sender<SinkEvent>,
    fetch_events: mpsc::Sender<FetchEvent>,
    inner: RwLock<Frontier>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        frontier_limit: usize,
        global: Semaphore,
        per_host: usize,
        trip_count: u32,
        circuit_reset: Duration,
        robots: Option<Arc<RobotsCache>>,
        in_rx: mpsc::Receiver<Task>,
        out_tx: mpsc::Sender<Task>,
        sink_tx: mpsc::Sender<SinkEvent>,
        fetch_events: mpsc::Sender<FetchEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            frontier_limit,
            global,
            per_host,
            trip_count,
            circuit_reset,
            robots,
            in_rx: Mutex::new(Some(in_rx)),
            out_tx,
            sink_tx,
            fetch_events,
            inner: RwLock::new(Frontier::new()),
        })
    }

    /// Scheduler task: drains the enqueue channel and runs one dispatch
    /// round per tick until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut in_rx = match self.in_rx.lock().take() {
            Some(rx) => rx,
            None => {
                tracing::warn!("scheduler started twice");
                return;
            }
        };

        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                Some(task) = in_rx.recv() => self.enqueue(task),
                _ = ticker.tick() => self.schedule(),
            }
        }
    }

    /// Add a task to its host queue. Non-blocking; silently drops when the
    /// frontier is at capacity (upstream backpressure makes this rare).
    pub fn enqueue(&self, task: Task) {
        let mut f = self.inner.write();
        if self.frontier_limit > 0 && f.size >= self.frontier_limit {
            tracing::trace!(url = %task.url, "frontier full, dropping task");
            return;
        }
        let host = task.host.clone();
        // Invariant: a host has a queue entry iff it is in the rotation.
        if !f.queues.contains_key(&host) {
            f.hosts.push(host.clone());
            f.queues.insert(host.clone(), VecDeque::new());
        }
        if !f.states.contains_key(&host) {
            f.states.insert(
                host.clone(),
                Arc::new(HostState::new(
                    host.clone(),
                    self.per_host,
                    self.trip_count,
                    self.circuit_reset,
                )),
            );
        }
        f.size += 1;
        if let Some(queue) = f.queues.get_mut(&host) {
            queue.push_back(task);
        }
    }

    /// One fair round: visit at most `len(hosts)` hosts, dispatching at most
    /// one task per host.
    fn schedule(&self) {
        let mut f = self.inner.write();
        if f.hosts.is_empty() {
            return;
        }
        let now = Instant::now();
        let rounds = f.hosts.len();
        for _ in 0..rounds {
            if f.hosts.is_empty() {
                return;
            }
            if f.cursor >= f.hosts.len() {
                f.cursor = 0;
            }
            match self.visit_host(&mut f, now) {
                Visit::Next => {}
                Visit::StopRound => return,
            }
        }
    }

    fn visit_host(&self, f: &mut Frontier, now: Instant) -> Visit {
        let host = f.hosts[f.cursor].clone();

        if f.queues.get(&host).map(|q| q.is_empty()).unwrap_or(true) {
            f.remove_host_at_cursor();
            return Visit::Next;
        }

        let head_ready = f
            .queues
            .get(&host)
            .and_then(|q| q.front())
            .map(|t| t.ready(now))
            .unwrap_or(false);
        if !head_ready {
            f.advance();
            return Visit::Next;
        }

        let state = match f.states.get(&host) {
            Some(s) => Arc::clone(s),
            None => {
                f.advance();
                return Visit::Next;
            }
        };
        if !state.allow() {
            f.park_head(&host, now + CIRCUIT_PARK);
            f.advance();
            return Visit::Next;
        }

        // Global saturation ends the whole round.
        let global_permit = match self.global.try_acquire() {
            Some(p) => p,
            None => return Visit::StopRound,
        };
        let host_permit = match state.semaphore.try_acquire() {
            Some(p) => p,
            None => {
                drop(global_permit);
                f.advance();
                return Visit::Next;
            }
        };

        if let Some(robots) = &self.robots {
            let url = f.queues.get(&host).and_then(|q| q.front()).map(|t| t.url.clone());
            if let Some(url) = url {
                let decision = robots.allowed(&url);
                if !decision.ready {
                    drop(host_permit);
                    drop(global_permit);
                    f.park_head(&host, now + ROBOTS_PARK);
                    f.advance();
                    return Visit::Next;
                }
                if !decision.allowed {
                    drop(host_permit);
                    drop(global_permit);
                    if let Some(task) = f.pop_head(&host) {
                        self.record_robots_denied(task);
                    }
                    f.advance();
                    return Visit::Next;
                }
            }
        }

        let mut task = match f.pop_head(&host) {
            Some(t) => t,
            None => {
                drop(host_permit);
                drop(global_permit);
                f.advance();
                return Visit::Next;
            }
        };
        task.permits = Some(PermitPair {
            _global: global_permit,
            _host: host_permit,
        });

        if let Err(err) = self.out_tx.try_send(task) {
            // Fetch queue full (or closing): release permits first, then
            // park the task back at the front of its queue.
            let mut task = match err {
                mpsc::error::TrySendError::Full(t) => t,
                mpsc::error::TrySendError::Closed(t) => t,
            };
            task.permits = None;
            task.not_before = Some(now + BACKPRESSURE_PARK);
            f.size += 1;
            if let Some(queue) = f.queues.get_mut(&host) {
                queue.push_front(task);
            }
        }

        f.advance();
        Visit::Next
    }

    fn record_robots_denied(&self, task: Task) {
        tracing::debug!(url = %task.url, "robots denied, dropping");
        let _ = self.fetch_events.try_send(FetchEvent {
            host: task.host.clone(),
            latency_ms: 0,
            bytes: 0,
            reused_conn: false,
            err_class: Some(errors::ROBOTS_DENIED),
        });
        let _ = self.sink_tx.try_send(SinkEvent::Error {
            run_id: self.run_id,
            host: task.host.clone(),
            url: task.url.to_string(),
            class: errors::ROBOTS_DENIED,
            message: String::new(),
        });
        let _ = self.sink_tx.try_send(SinkEvent::Page(PageRecord {
            run_id: self.run_id,
            url: task.url.to_string(),
            canonical_url: task.canonical,
            host: task.host,
            depth: task.depth,
            status_code: None,
            content_type: None,
            fetch_ms: 0,
            size_bytes: 0,
            error_class: Some(errors::ROBOTS_DENIED.to_string()),
            error_message: None,
            discovered_at: task.discovered_at,
            fetched_at: None,
        }));
    }

    pub fn frontier_size(&self) -> usize {
        self.inner.read().size
    }

    pub fn host_state(&self, host: &str) -> Option<Arc<HostState>> {
        self.inner.read().states.get(host).cloned()
    }

    pub fn snapshot_host_states(&self) -> Vec<HostSnapshot> {
        self.inner
            .read()
            .states
            .values()
            .map(|state| HostSnapshot {
                host: state.host().to_string(),
                inflight: state.inflight(),
                circuit: state.circuit_state().as_str(),
            })
            .collect()
    }
}
