//! Bounded registry of background sync jobs.
//!
//! Sync requests accepted over HTTP run in the background; callers poll
//! the job id they got back. The registry keeps a fixed number of recent
//! jobs and evicts the oldest once full, so a long-running server never
//! grows an unbounded job table.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::SyncReport;

pub const DEFAULT_JOB_CAPACITY: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Completed { report: SyncReport },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    /// Human-readable scope, e.g. `"all"` or `"since 2025-05-01T00:00:00Z"`.
    pub scope: String,
    #[serde(flatten)]
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct State {
    order: VecDeque<Uuid>,
    jobs: HashMap<Uuid, JobRecord>,
}

pub struct JobRegistry {
    capacity: usize,
    state: Mutex<State>,
}

impl JobRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                order: VecDeque::new(),
                jobs: HashMap::new(),
            }),
        }
    }

    /// Register a new in-progress job, evicting the oldest entry if the
    /// registry is full.
    pub fn create(&self, scope: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        let record = JobRecord {
            id,
            scope: scope.into(),
            status: JobStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
        };

        let mut state = self.state.lock().unwrap();
        if state.order.len() >= self.capacity {
            if let Some(evicted) = state.order.pop_front() {
                state.jobs.remove(&evicted);
            }
        }
        state.order.push_back(id);
        state.jobs.insert(id, record);
        id
    }

    pub fn complete(&self, id: Uuid, report: SyncReport) {
        self.finish(id, JobStatus::Completed { report });
    }

    pub fn fail(&self, id: Uuid, error: impl Into<String>) {
        self.finish(
            id,
            JobStatus::Failed {
                error: error.into(),
            },
        );
    }

    fn finish(&self, id: Uuid, status: JobStatus) {
        let mut state = self.state.lock().unwrap();
        // The job may have been evicted while it ran; that is fine, the
        // caller just cannot poll it anymore.
        if let Some(record) = state.jobs.get_mut(&id) {
            record.status = status;
            record.finished_at = Some(Utc::now());
        }
    }

    pub fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.state.lock().unwrap().jobs.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().jobs.is_empty()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_CAPACITY)
    }
}
