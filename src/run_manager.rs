//! Tracks live runs and drives their lifecycle transitions.
//!
//! The surrounding API layer calls into this; the manager owns the mapping
//! from run id to live engine + telemetry, persists status transitions, and
//! falls back to storage for runs that are no longer in memory.

use crate::config::{CrawlerDefaults, RunConfig};
use crate::engine::{Engine, EngineError};
use crate::metrics::SharedMetrics;
use crate::storage::{RunId, RunRow, RunStatus, StorageError, Store};
use crate::telemetry::Telemetry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunManagerError {
    #[error("run not found")]
    RunNotFound,

    #[error("run already started")]
    AlreadyStarted,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// In-memory view of a run this manager owns. Mirrors the stored row so
/// reads on live runs skip storage entirely.
struct RunHandle {
    config: RunConfig,
    status: RunStatus,
    created_at: SystemTime,
    started_at: Option<SystemTime>,
    stopped_at: Option<SystemTime>,
    stop_reason: Option<String>,
    engine: Option<Arc<Engine>>,
    telemetry: Option<Arc<Telemetry>>,
}

pub struct RunManager {
    store: Arc<dyn Store>,
    defaults: CrawlerDefaults,
    metrics: SharedMetrics,
    runs: Arc<Mutex<HashMap<RunId, RunHandle>>>,
}

impl RunManager {
    pub fn new(store: Arc<dyn Store>, defaults: CrawlerDefaults, metrics: SharedMetrics) -> Self {
        Self {
            store,
            defaults,
            metrics,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persist a new run in `created` state with defaults applied.
    pub async fn create_run(&self, cfg: RunConfig) -> Result<RunId, RunManagerError> {
        let cfg = self.defaults.apply_limits(cfg).normalized(&self.defaults);
        let id = self.store.create_run(cfg.clone()).await?;
        self.runs.lock().insert(
            id,
            RunHandle {
                config: cfg,
                status: RunStatus::Created,
                created_at: SystemTime::now(),
                started_at: None,
                stopped_at: None,
                stop_reason: None,
                engine: None,
                telemetry: None,
            },
        );
        Ok(id)
    }

    /// Build telemetry + engine for a created run and start crawling.
    pub async fn start_run(&self, id: RunId) -> Result<(), RunManagerError> {
        let config = {
            let runs = self.runs.lock();
            let handle = runs.get(&id).ok_or(RunManagerError::RunNotFound)?;
            if handle.engine.is_some() {
                return Err(RunManagerError::AlreadyStarted);
            }
            handle.config.clone()
        };

        let telemetry = Telemetry::new();
        let engine = Engine::new(
            id,
            config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&telemetry),
            Arc::clone(&self.metrics),
        )?;

        let started_at = SystemTime::now();
        self.store
            .update_run_status(id, RunStatus::Running, Some(started_at), None, None)
            .await?;

        engine.start(&config.seed_url);

        {
            let mut runs = self.runs.lock();
            if let Some(handle) = runs.get_mut(&id) {
                handle.status = RunStatus::Running;
                handle.started_at = Some(started_at);
                handle.engine = Some(Arc::clone(&engine));
                handle.telemetry = Some(telemetry);
            }
        }

        // Keep the in-memory view current when the engine stops itself
        // (page limit, time budget); the store row is handled by the
        // engine's own stop monitor.
        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            engine.done().await;
            let mut runs = runs.lock();
            if let Some(handle) = runs.get_mut(&id) {
                handle.status = RunStatus::Stopped;
                if handle.stopped_at.is_none() {
                    handle.stopped_at = Some(SystemTime::now());
                }
                if handle.stop_reason.is_none() {
                    handle.stop_reason = engine.stop_reason();
                }
            }
        });
        Ok(())
    }

    /// Idempotent: stopping a stopped or never-started run only records the
    /// status.
    pub async fn stop_run(&self, id: RunId) -> Result<(), RunManagerError> {
        let engine = {
            let runs = self.runs.lock();
            let handle = runs.get(&id).ok_or(RunManagerError::RunNotFound)?;
            handle.engine.clone()
        };
        if let Some(engine) = &engine {
            engine.stop();
        }
        // An engine that already stopped on its own keeps its reason.
        let reason = engine
            .as_ref()
            .and_then(|e| e.stop_reason())
            .unwrap_or_else(|| "user".to_string());
        let stopped_at = SystemTime::now();

        {
            let mut runs = self.runs.lock();
            if let Some(handle) = runs.get_mut(&id) {
                handle.status = RunStatus::Stopped;
                if handle.stopped_at.is_none() {
                    handle.stopped_at = Some(stopped_at);
                }
                if handle.stop_reason.is_none() {
                    handle.stop_reason = Some(reason.clone());
                }
            }
        }

        self.store
            .update_run_status(
                id,
                RunStatus::Stopped,
                None,
                Some(stopped_at),
                Some(&reason),
            )
            .await?;
        Ok(())
    }

    /// Live runs come from memory; finished or foreign runs from storage.
    pub async fn get_run(&self, id: RunId) -> Result<RunRow, RunManagerError> {
        if let Some(handle) = self.runs.lock().get(&id) {
            return Ok(RunRow {
                id,
                config: handle.config.clone(),
                status: handle.status,
                created_at: handle.created_at,
                started_at: handle.started_at,
                stopped_at: handle.stopped_at,
                stop_reason: handle.stop_reason.clone(),
            });
        }
        Ok(self.store.get_run(id).await?)
    }

    pub fn engine_for(&self, id: RunId) -> Option<Arc<Engine>> {
        self.runs.lock().get(&id).and_then(|h| h.engine.clone())
    }

    pub fn telemetry_for(&self, id: RunId) -> Option<Arc<Telemetry>> {
        self.runs.lock().get(&id).and_then(|h| h.telemetry.clone())
    }
}
