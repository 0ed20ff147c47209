//! In-memory bookkeeping for download jobs.
//!
//! Every job started through the API gets an entry here before its background
//! task runs. The registry is the single shared structure between request
//! handlers and workers, so every access goes through one `RwLock`.

use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use uuid::Uuid;

pub type JobId = Uuid;

/// Percent reported to clients for failed jobs.
pub const FAILED_PERCENT: i32 = -1;

/// In-flight progress stops short of 100 so that a `finished` job at 100 always
/// has a file to fetch.
const MAX_IN_FLIGHT_PERCENT: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Downloading,
    Finished,
    Failed,
    /// Finished, served, and deleted from disk.
    Expired,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Expired
        )
    }
}

#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub percent: u8,
    pub file: Option<PathBuf>,
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn reported_percent(&self) -> i32 {
        match self.status {
            JobStatus::Failed => FAILED_PERCENT,
            _ => i32::from(self.percent),
        }
    }
}

#[derive(Debug)]
struct JobEntry {
    status: JobStatus,
    percent: u8,
    file: Option<PathBuf>,
    error: Option<String>,
    release_scheduled: bool,
    settled_at: Option<Instant>,
}

impl JobEntry {
    fn new() -> Self {
        Self {
            status: JobStatus::Pending,
            percent: 0,
            file: None,
            error: None,
            release_scheduled: false,
            settled_at: None,
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            status: self.status,
            percent: self.percent,
            file: self.file.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> JobId {
        let id = Uuid::new_v4();
        self.jobs.write().insert(id, JobEntry::new());
        id
    }

    pub fn mark_downloading(&self, id: JobId) {
        if let Some(entry) = self.jobs.write().get_mut(&id) {
            if entry.status == JobStatus::Pending {
                entry.status = JobStatus::Downloading;
            }
        }
    }

    /// Records the latest percent for a running job. Updates for finished or
    /// failed jobs are dropped.
    pub fn record_progress(&self, id: JobId, percent: u8) {
        if let Some(entry) = self.jobs.write().get_mut(&id) {
            if entry.status.is_terminal() {
                return;
            }
            entry.status = JobStatus::Downloading;
            entry.percent = percent.min(MAX_IN_FLIGHT_PERCENT);
        }
    }

    pub fn complete(&self, id: JobId, file: PathBuf) {
        if let Some(entry) = self.jobs.write().get_mut(&id) {
            entry.status = JobStatus::Finished;
            entry.percent = 100;
            entry.file = Some(file);
            entry.error = None;
            entry.settled_at = Some(Instant::now());
        }
    }

    pub fn fail(&self, id: JobId, message: impl Into<String>) {
        if let Some(entry) = self.jobs.write().get_mut(&id) {
            entry.status = JobStatus::Failed;
            entry.file = None;
            entry.error = Some(message.into());
            entry.settled_at = Some(Instant::now());
        }
    }

    pub fn snapshot(&self, id: JobId) -> Option<JobSnapshot> {
        self.jobs.read().get(&id).map(JobEntry::snapshot)
    }

    /// Percent as exposed by the progress endpoint: `-1` for failures and `0`
    /// for ids we have never seen.
    pub fn reported_percent(&self, id: JobId) -> i32 {
        self.snapshot(id)
            .map(|snapshot| snapshot.reported_percent())
            .unwrap_or(0)
    }

    pub fn ready_file(&self, id: JobId) -> Option<PathBuf> {
        let jobs = self.jobs.read();
        let entry = jobs.get(&id)?;
        match entry.status {
            JobStatus::Finished => entry.file.clone(),
            _ => None,
        }
    }

    /// Claims the right to schedule the post-download cleanup. Only the first
    /// caller for a finished job gets `true`.
    pub fn schedule_release(&self, id: JobId) -> bool {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&id) {
            Some(entry) if entry.file.is_some() && !entry.release_scheduled => {
                entry.release_scheduled = true;
                true
            }
            _ => false,
        }
    }

    /// Forgets the output file once it has been deleted from disk. The job
    /// then reports `expired` instead of `finished`.
    pub fn release_file(&self, id: JobId) -> Option<PathBuf> {
        let mut jobs = self.jobs.write();
        let entry = jobs.get_mut(&id)?;
        let file = entry.file.take();
        if entry.status == JobStatus::Finished {
            entry.status = JobStatus::Expired;
            entry.settled_at = Some(Instant::now());
        }
        file
    }

    /// Removes jobs that settled at least `retention` ago and returns their
    /// ids. Pending and downloading jobs are never pruned.
    pub fn prune_settled(&self, retention: Duration) -> Vec<JobId> {
        let mut jobs = self.jobs.write();
        let expired: Vec<JobId> = jobs
            .iter()
            .filter(|(_, entry)| {
                entry
                    .settled_at
                    .is_some_and(|settled| settled.elapsed() >= retention)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}
