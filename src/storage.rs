//! Storage sink consumed by the engine.
//!
//! The engine only ever talks to the [`Store`] trait; submissions are
//! best-effort and a backend error is logged, never fatal. The in-memory
//! implementation here is complete and is what tests and the CLI run
//! against. A relational backend implements the same trait elsewhere.

use crate::config::RunConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: RunId,
    pub config: RunConfig,
    pub status: RunStatus,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub stopped_at: Option<SystemTime>,
    pub stop_reason: Option<String>,
}

/// One row per terminal fetch outcome (success or final failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub run_id: RunId,
    pub url: String,
    pub canonical_url: String,
    pub host: String,
    pub depth: u32,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub fetch_ms: u64,
    pub size_bytes: u64,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub discovered_at: SystemTime,
    pub fetched_at: Option<SystemTime>,
}

impl PageRecord {
    pub fn is_success(&self) -> bool {
        self.error_class.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub run_id: RunId,
    pub host: String,
    pub url: String,
    pub class: String,
    pub message: String,
    pub at: SystemTime,
}

/// Best-effort submission to the storage writer. Producers use a bounded
/// channel and drop on full; storage is observational, not authoritative.
#[derive(Debug)]
pub enum SinkEvent {
    Page(PageRecord),
    Error {
        run_id: RunId,
        host: String,
        url: String,
        class: &'static str,
        message: String,
    },
    Edge {
        run_id: RunId,
        src: String,
        dst: String,
        count: u64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub pages_fetched: u64,
    pub pages_failed: u64,
    pub unique_hosts: u64,
    pub total_bytes: u64,
    pub last_fetched_at: Option<SystemTime>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_run(&self, cfg: RunConfig) -> StorageResult<RunId>;

    async fn update_run_status(
        &self,
        id: RunId,
        status: RunStatus,
        started_at: Option<SystemTime>,
        stopped_at: Option<SystemTime>,
        stop_reason: Option<&str>,
    ) -> StorageResult<()>;

    async fn get_run(&self, id: RunId) -> StorageResult<RunRow>;

    async fn insert_page(&self, rec: PageRecord) -> StorageResult<()>;

    async fn insert_error(
        &self,
        id: RunId,
        host: &str,
        url: &str,
        class: &str,
        message: &str,
    ) -> StorageResult<()>;

    /// Additive on `(run, src, dst)`.
    async fn upsert_edge(&self, id: RunId, src: &str, dst: &str, count: u64) -> StorageResult<()>;

    /// Most recently fetched first, capped at `limit` (50 when zero).
    async fn list_pages(&self, id: RunId, limit: usize) -> StorageResult<Vec<PageRecord>>;

    async fn get_run_summary(&self, id: RunId) -> StorageResult<RunSummary>;
}

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<RunId, RunRow>,
    pages: Vec<PageRecord>,
    errors: Vec<ErrorRecord>,
    edges: HashMap<(RunId, String, String), u64>,
}

/// Volatile store backing tests and single-process runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test inspection helpers; not part of the `Store` contract.
    pub fn errors_for_run(&self, id: RunId) -> Vec<ErrorRecord> {
        self.inner
            .lock()
            .errors
            .iter()
            .filter(|e| e.run_id == id)
            .cloned()
            .collect()
    }

    pub fn edge_count(&self, id: RunId, src: &str, dst: &str) -> u64 {
        self.inner
            .lock()
            .edges
            .get(&(id, src.to_string(), dst.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn pages_for_run(&self, id: RunId) -> Vec<PageRecord> {
        self.inner
            .lock()
            .pages
            .iter()
            .filter(|p| p.run_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_run(&self, cfg: RunConfig) -> StorageResult<RunId> {
        let id = Uuid::new_v4();
        let row = RunRow {
            id,
            config: cfg,
            status: RunStatus::Created,
            created_at: SystemTime::now(),
            started_at: None,
            stopped_at: None,
            stop_reason: None,
        };
        self.inner.lock().runs.insert(id, row);
        Ok(id)
    }

    async fn update_run_status(
        &self,
        id: RunId,
        status: RunStatus,
        started_at: Option<SystemTime>,
        stopped_at: Option<SystemTime>,
        stop_reason: Option<&str>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let run = inner.runs.get_mut(&id).ok_or(StorageError::RunNotFound(id))?;
        run.status = status;
        if let Some(at) = started_at {
            run.started_at = Some(at);
        }
        if let Some(at) = stopped_at {
            run.stopped_at = Some(at);
        }
        if let Some(reason) = stop_reason {
            if !reason.is_empty() {
                run.stop_reason = Some(reason.to_string());
            }
        }
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> StorageResult<RunRow> {
        self.inner
            .lock()
            .runs
            .get(&id)
            .cloned()
            .ok_or(StorageError::RunNotFound(id))
    }

    async fn insert_page(&self, rec: PageRecord) -> StorageResult<()> {
        self.inner.lock().pages.push(rec);
        Ok(())
    }

    async fn insert_error(
        &self,
        id: RunId,
        host: &str,
        url: &str,
        class: &str,
        message: &str,
    ) -> StorageResult<()> {
        self.inner.lock().errors.push(ErrorRecord {
            run_id: id,
            host: host.to_string(),
            url: url.to_string(),
            class: class.to_string(),
            message: message.to_string(),
            at: SystemTime::now(),
        });
        Ok(())
    }

    async fn upsert_edge(&self, id: RunId, src: &str, dst: &str, count: u64) -> StorageResult<()> {
        *self
            .inner
            .lock()
            .edges
            .entry((id, src.to_string(), dst.to_string()))
            .or_insert(0) += count;
        Ok(())
    }

    async fn list_pages(&self, id: RunId, limit: usize) -> StorageResult<Vec<PageRecord>> {
        let limit = if limit == 0 { 50 } else { limit };
        let mut rows: Vec<PageRecord> = self
            .inner
            .lock()
            .pages
            .iter()
            .filter(|p| p.run_id == id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn get_run_summary(&self, id: RunId) -> StorageResult<RunSummary> {
        let inner = self.inner.lock();
        let mut summary = RunSummary::default();
        let mut hosts = std::collections::HashSet::new();
        for page in inner.pages.iter().filter(|p| p.run_id == id) {
            if page.is_success() {
                summary.pages_fetched += 1;
            } else {
                summary.pages_failed += 1;
            }
            if !page.host.is_empty() {
                hosts.insert(page.host.clone());
            }
            summary.total_bytes += page.size_bytes;
            if let Some(at) = page.fetched_at {
                if summary.last_fetched_at.map(|prev| at > prev).unwrap_or(true) {
                    summary.last_fetched_at = Some(at);
                }
            }
        }
        summary.unique_hosts = hosts.len() as u64;
        Ok(summary)
    }
}
