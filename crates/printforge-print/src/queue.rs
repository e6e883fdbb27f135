// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent print job queue backed by a single JSON document.
//
// The queue keeps every job record plus the four membership lists (pending,
// active, completed, failed) in memory behind one lock, and snapshots the
// whole thing to disk on request.  Snapshots are written to a temporary file
// in the same directory and renamed into place, so a crash mid-write leaves
// the previous snapshot intact.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use printforge_core::error::{PrintforgeError, Result};
use printforge_core::types::{JobId, JobStatus, PrintJob, QueueState};

/// On-disk layout: `{ "state": {...}, "jobs": { id: job } }`.
#[derive(Serialize)]
struct QueueDocumentRef<'a> {
    state: &'a QueueState,
    jobs: &'a BTreeMap<JobId, PrintJob>,
}

#[derive(Deserialize)]
struct QueueDocument {
    state: QueueState,
    jobs: BTreeMap<JobId, PrintJob>,
}

/// Everything guarded by the queue lock.
#[derive(Debug, Default)]
struct QueueInner {
    state: QueueState,
    jobs: BTreeMap<JobId, PrintJob>,
}

impl QueueInner {
    /// Put `id` on the list matching `status`.
    fn route(&mut self, id: JobId, status: JobStatus, priority: i32) {
        match status {
            JobStatus::Pending | JobStatus::Retrying => {
                // Front insertion: the newest priority job runs next, so a
                // burst of priority jobs comes out in reverse order.
                if status == JobStatus::Pending && priority > 0 {
                    self.state.pending.insert(0, id);
                } else {
                    self.state.pending.push(id);
                }
            }
            JobStatus::Uploading | JobStatus::Starting | JobStatus::Printing => {
                self.state.active.push(id)
            }
            JobStatus::Completed => self.state.completed.push(id),
            JobStatus::Failed | JobStatus::Error | JobStatus::Cancelled => {
                self.state.failed.push(id)
            }
        }
        self.touch();
    }

    /// Remove `id` from `list`, returning whether it was there.
    fn take(list: &mut Vec<JobId>, id: &JobId) -> bool {
        match list.iter().position(|candidate| candidate == id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    fn take_from_any(&mut self, id: &JobId) {
        let state = &mut self.state;
        for list in [
            &mut state.pending,
            &mut state.active,
            &mut state.completed,
            &mut state.failed,
        ] {
            Self::take(list, id);
        }
    }

    fn touch(&mut self) {
        self.state.last_modified = Utc::now();
    }
}

/// Thread-safe, persistent print job queue.
///
/// All mutation goes through `&self` methods that take the internal lock;
/// callers only ever see clones of records and snapshots of the lists.
#[derive(Debug)]
pub struct PrintQueue {
    /// Snapshot location; `None` for a purely in-memory queue.
    path: Option<PathBuf>,
    inner: Mutex<QueueInner>,
}

impl PrintQueue {
    /// Open (or create) the queue stored at `path`.
    ///
    /// Creates the parent directory if needed and restores the previous
    /// snapshot when one exists.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                PrintforgeError::Queue(format!("create {}: {e}", parent.display()))
            })?;
        }

        let queue = Self {
            path: Some(path.clone()),
            inner: Mutex::new(QueueInner::default()),
        };

        if path.exists() {
            queue.load()?;
        }

        info!(total_jobs = queue.len(), "print queue opened");
        Ok(queue)
    }

    /// Queue with no backing file (useful for tests); `save` is a no-op.
    pub fn in_memory() -> Self {
        debug!("in-memory print queue created");
        Self {
            path: None,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Every mutation completes before the guard drops, so a poisoned lock
    /// still guards consistent lists.
    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a new job, placing it on the list that matches its status.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn enqueue(&self, job: PrintJob) -> Result<()> {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(PrintforgeError::DuplicateJob(job.id));
        }

        let (id, status, priority) = (job.id.clone(), job.status, job.priority);
        inner.jobs.insert(id.clone(), job);
        inner.route(id, status, priority);

        info!(
            status = %status,
            priority,
            queue_depth = inner.state.pending.len(),
            "job enqueued"
        );
        Ok(())
    }

    /// Move the next pending job to the active list and return it.
    ///
    /// Pending ids without a record are dropped along the way.
    #[instrument(skip(self))]
    pub fn dequeue(&self) -> Option<PrintJob> {
        let mut inner = self.lock();
        while !inner.state.pending.is_empty() {
            let id = inner.state.pending.remove(0);
            inner.touch();

            let Some(job) = inner.jobs.get(&id).cloned() else {
                warn!(job_id = %id, "pending job has no record; dropping it");
                continue;
            };

            inner.state.active.push(id);
            info!(job_id = %job.id, queue_depth = inner.state.pending.len(), "job dequeued");
            return Some(job);
        }
        None
    }

    /// Put a job back on the pending list as `Pending`.
    ///
    /// Used after a failed attempt that still has retries left; the job
    /// competes again under the usual FIFO / priority rules.  Returns
    /// `Ok(false)` without moving anything if the stored record is terminal.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn requeue(&self, mut job: PrintJob) -> Result<bool> {
        let mut inner = self.lock();
        match inner.jobs.get(&job.id) {
            None => return Err(PrintforgeError::JobNotFound(job.id)),
            Some(stored) if stored.is_terminal() => {
                debug!(status = %stored.status, "stored job is terminal; not requeued");
                return Ok(false);
            }
            Some(_) => {}
        }

        job.status = JobStatus::Pending;
        let (id, priority) = (job.id.clone(), job.priority);
        inner.take_from_any(&id);
        inner.jobs.insert(id.clone(), job);
        inner.route(id, JobStatus::Pending, priority);

        debug!(queue_depth = inner.state.pending.len(), "job requeued");
        Ok(true)
    }

    /// Clone of the stored record, if any.
    pub fn get_job(&self, id: &JobId) -> Option<PrintJob> {
        self.lock().jobs.get(id).cloned()
    }

    /// Replace the stored record for `job.id`.
    ///
    /// List membership is untouched; use `mark_*` / `requeue` for moves.
    pub fn update_job(&self, job: PrintJob) -> Result<()> {
        let mut inner = self.lock();
        let Some(slot) = inner.jobs.get_mut(&job.id) else {
            return Err(PrintforgeError::JobNotFound(job.id));
        };

        debug!(job_id = %job.id, status = %job.status, progress = job.progress, "job updated");
        *slot = job;
        inner.touch();
        Ok(())
    }

    /// Replace the stored record unless it has already gone terminal.
    ///
    /// Returns `Ok(false)` without writing when the stored record is
    /// terminal, e.g. cancelled while the caller was waiting on the device.
    pub fn update_unless_terminal(&self, job: PrintJob) -> Result<bool> {
        let mut inner = self.lock();
        let Some(slot) = inner.jobs.get_mut(&job.id) else {
            return Err(PrintforgeError::JobNotFound(job.id));
        };
        if slot.is_terminal() {
            debug!(
                job_id = %job.id,
                stored = %slot.status,
                "stored job is terminal; update skipped"
            );
            return Ok(false);
        }

        *slot = job;
        inner.touch();
        Ok(true)
    }

    /// Cancel a job that is not terminal and move it to failed.
    ///
    /// The check and the move happen under one lock.  Returns `false` if the
    /// job is unknown or already terminal, in which case nothing changes.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: &JobId, reason: &str) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(job) = inner.jobs.get_mut(id) else {
            return false;
        };
        if job.is_terminal() {
            debug!(status = %job.status, "job already terminal; not cancelled");
            return false;
        }

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        job.error_message = Some(reason.to_owned());
        inner.take_from_any(id);
        inner.state.failed.push(id.clone());
        inner.touch();
        info!(job_id = %id, reason, "job cancelled");
        true
    }

    /// Move a job from active (or pending) to completed.
    ///
    /// Returns `false` if the job is unknown or in neither list.
    #[instrument(skip(self))]
    pub fn mark_completed(&self, id: &JobId) -> bool {
        let mut inner = self.lock();
        if !inner.jobs.contains_key(id) {
            return false;
        }

        let state = &mut inner.state;
        if !QueueInner::take(&mut state.active, id) && !QueueInner::take(&mut state.pending, id) {
            return false;
        }
        state.completed.push(id.clone());

        if let Some(job) = inner.jobs.get_mut(id) {
            job.status = JobStatus::Completed;
        }
        inner.touch();
        info!(job_id = %id, "job completed");
        true
    }

    /// Move a job from active (or pending) to failed.
    ///
    /// The stored status becomes `Failed` unless the record already says
    /// `Cancelled` or `Error`, which are kept so the reason survives.
    #[instrument(skip(self))]
    pub fn mark_failed(&self, id: &JobId, reason: Option<&str>) -> bool {
        let mut inner = self.lock();
        if !inner.jobs.contains_key(id) {
            return false;
        }

        let state = &mut inner.state;
        if !QueueInner::take(&mut state.active, id) && !QueueInner::take(&mut state.pending, id) {
            return false;
        }
        state.failed.push(id.clone());

        if let Some(job) = inner.jobs.get_mut(id) {
            if !matches!(job.status, JobStatus::Cancelled | JobStatus::Error) {
                job.status = JobStatus::Failed;
            }
            if let Some(reason) = reason {
                job.error_message = Some(reason.to_owned());
            }
        }
        inner.touch();
        warn!(job_id = %id, reason = reason.unwrap_or(""), "job moved to failed");
        true
    }

    /// Copy of the four membership lists.
    pub fn get_state(&self) -> QueueState {
        self.lock().state.clone()
    }

    /// Every job whose stored status is `status`, oldest first.
    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<PrintJob> {
        let inner = self.lock();
        let mut jobs: Vec<PrintJob> = inner
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// Write the full queue to disk atomically.
    #[instrument(skip(self))]
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        // Hold the lock through the write so disk and memory agree.
        let inner = self.lock();
        write_snapshot(path, &inner)?;
        debug!(path = %path.display(), total_jobs = inner.jobs.len(), "queue saved");
        Ok(())
    }

    /// Replace the in-memory queue with the snapshot on disk.
    ///
    /// Nothing changes if the snapshot cannot be read or parsed.
    #[instrument(skip(self))]
    pub fn load(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let data = std::fs::read(path)
            .map_err(|e| PrintforgeError::Queue(format!("read {}: {e}", path.display())))?;
        let document: QueueDocument = serde_json::from_slice(&data)
            .map_err(|e| PrintforgeError::Queue(format!("parse {}: {e}", path.display())))?;

        if document.state.version > QueueState::SCHEMA_VERSION {
            return Err(PrintforgeError::Queue(format!(
                "{} has schema version {}, newest supported is {}",
                path.display(),
                document.state.version,
                QueueState::SCHEMA_VERSION
            )));
        }

        check_membership(&document.state, &document.jobs)
            .map_err(|e| PrintforgeError::Queue(format!("{}: {e}", path.display())))?;

        let mut inner = self.lock();
        inner.state = document.state;
        inner.jobs = document.jobs;

        info!(
            total_jobs = inner.jobs.len(),
            pending = inner.state.pending.len(),
            active = inner.state.active.len(),
            "queue loaded"
        );
        Ok(())
    }

    /// Drop old terminal jobs, keeping the newest `keep_count` completed and
    /// the newest `keep_count` failed. Returns how many were removed.
    #[instrument(skip(self))]
    pub fn clear_terminal_jobs(&self, keep_count: usize) -> usize {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut removed = 0;

        for list in [&mut inner.state.completed, &mut inner.state.failed] {
            if list.len() > keep_count {
                let excess = list.len() - keep_count;
                for id in list.drain(..excess) {
                    inner.jobs.remove(&id);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            inner.touch();
            info!(removed, "terminal jobs cleared");
        }
        removed
    }
}

/// Every listed id appears on exactly one list, every record is listed and
/// every id outside pending has a record.  Pending ids without a record are
/// tolerated; `dequeue` drops them.
fn check_membership(
    state: &QueueState,
    jobs: &BTreeMap<JobId, PrintJob>,
) -> std::result::Result<(), String> {
    let mut seen = BTreeSet::new();
    for id in state.all_ids() {
        if !seen.insert(id) {
            return Err(format!("job {id} is listed more than once"));
        }
    }
    let non_pending = state
        .active
        .iter()
        .chain(&state.completed)
        .chain(&state.failed);
    for id in non_pending {
        if !jobs.contains_key(id) {
            return Err(format!("job {id} is listed without a record"));
        }
    }
    if let Some(id) = jobs.keys().find(|id| !seen.contains(id)) {
        return Err(format!("job {id} has a record but is on no list"));
    }
    Ok(())
}

/// Serialize `inner` next to `path` and rename it into place.
fn write_snapshot(path: &Path, inner: &QueueInner) -> Result<()> {
    let queue_err = |e: &dyn std::fmt::Display| {
        PrintforgeError::Queue(format!("save {}: {e}", path.display()))
    };

    let document = QueueDocumentRef {
        state: &inner.state,
        jobs: &inner.jobs,
    };
    let bytes = serde_json::to_vec_pretty(&document).map_err(|e| queue_err(&e))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| queue_err(&e))?;
    tmp.write_all(&bytes).map_err(|e| queue_err(&e))?;
    tmp.as_file().sync_all().map_err(|e| queue_err(&e))?;
    tmp.persist(path).map_err(|e| queue_err(&e.error))?;
    Ok(())
}
