// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer agent: owns one device adapter and one queue, and runs the
// control loop that moves jobs from pending onto the printer and back out
// into completed or failed.
//
// Each loop iteration dispatches at most one job, refreshes every printing
// job from the device, applies the retry rules to failures and trims old
// terminal jobs once per cleanup interval.  The loop runs as its own tokio
// task; the public API may be called concurrently from any task.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use printforge_core::config::AgentConfig;
use printforge_core::error::{PrintforgeError, Result};
use printforge_core::integrity;
use printforge_core::types::{
    JobId, JobMetadata, JobStatus, PrintJob, PrinterState, PrinterStatus, QueueState,
};

use crate::device::DeviceAdapter;
use crate::queue::PrintQueue;

/// Progress at which an idle printer is taken to have finished the job.
const COMPLETION_THRESHOLD: f64 = 99.0;

const CANCEL_REASON: &str = "cancelled by user";

/// Handle to the running control loop.
struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared between the public API and the control loop task.
struct AgentInner {
    config: AgentConfig,
    device: Arc<dyn DeviceAdapter>,
    queue: Arc<PrintQueue>,
    /// `unix_secs / cleanup_interval_secs` of the last trim.
    last_cleanup_bucket: AtomicU64,
}

/// Background agent driving one printer from one queue.
pub struct PrinterAgent {
    inner: Arc<AgentInner>,
    running: AtomicBool,
    /// Serializes `start` and `stop`.
    worker: Mutex<Option<Worker>>,
}

impl PrinterAgent {
    /// Build an agent over an existing queue.
    ///
    /// Fails only if `config` is invalid.
    pub fn new(
        config: AgentConfig,
        device: Arc<dyn DeviceAdapter>,
        queue: Arc<PrintQueue>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            printer_id = %device.printer_id(),
            poll_interval_secs = config.status_poll_interval_secs,
            max_retries = config.max_retries,
            "printer agent created"
        );

        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                device,
                queue,
                last_cleanup_bucket: AtomicU64::new(0),
            }),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    /// Build an agent over the queue stored at `config.queue_path`.
    pub fn open(config: AgentConfig, device: Arc<dyn DeviceAdapter>) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(PrintQueue::open(&config.queue_path)?);
        Self::new(config, device, queue)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<PrintQueue> {
        &self.inner.queue
    }

    pub fn device(&self) -> &Arc<dyn DeviceAdapter> {
        &self.inner.device
    }

    // -- Job API -----------------------------------------------------------

    /// Validate, fingerprint and enqueue a new job, then persist the queue.
    #[instrument(skip(self, artifact, metadata), fields(artifact = %artifact.as_ref().display()))]
    pub fn submit_job(
        &self,
        artifact: impl AsRef<Path>,
        name: Option<String>,
        priority: i32,
        metadata: Option<JobMetadata>,
    ) -> Result<PrintJob> {
        let mut job = PrintJob::new(artifact.as_ref(), name, priority)?;
        job.max_retries = self.inner.config.max_retries;
        if let Some(metadata) = metadata {
            job.apply_metadata(metadata);
        }

        let (digest, bytes) = integrity::hash_file(&job.artifact)?;
        job.artifact_sha256 = Some(digest);
        job.artifact_bytes = bytes;

        self.inner.queue.enqueue(job.clone())?;
        self.inner.queue.save()?;

        info!(
            job_id = %job.id,
            name = %job.name,
            priority,
            bytes,
            "job submitted"
        );
        Ok(job)
    }

    pub fn get_job_status(&self, id: &JobId) -> Result<PrintJob> {
        self.inner
            .queue
            .get_job(id)
            .ok_or_else(|| PrintforgeError::JobNotFound(id.clone()))
    }

    /// Cancel a job that has not reached a terminal state.
    ///
    /// Returns `Ok(false)` if the job is unknown or already terminal, also
    /// when it finishes while the device cancel is in flight.  A job on the
    /// printer gets a device cancel first; if that fails the job is still
    /// cancelled here and the print has to be stopped by hand.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn cancel_job(&self, id: &JobId) -> Result<bool> {
        let Some(job) = self.inner.queue.get_job(id) else {
            return Ok(false);
        };
        if job.is_terminal() {
            debug!(status = %job.status, "job already terminal; nothing to cancel");
            return Ok(false);
        }

        let device = &self.inner.device;
        if matches!(job.status, JobStatus::Starting | JobStatus::Printing) && device.is_connected()
        {
            if let Err(e) = device.cancel().await {
                warn!(error = %e, "device cancel failed; cancelling job record anyway");
            }
        }

        if !self.inner.queue.cancel(id, CANCEL_REASON) {
            info!("job finished while cancelling; record left as is");
            return Ok(false);
        }
        self.inner.queue.save()?;

        info!("job cancelled");
        Ok(true)
    }

    /// Fresh status from the device.
    pub async fn get_printer_status(&self) -> Result<PrinterStatus> {
        let device = &self.inner.device;
        if !device.is_connected() {
            return Err(PrintforgeError::Connection(format!(
                "{} is not connected",
                device.printer_id()
            )));
        }
        device.status().await
    }

    pub fn get_queue_state(&self) -> QueueState {
        self.inner.queue.get_state()
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Connect to the printer and start the control loop.
    ///
    /// Does nothing if the loop is already running.
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            warn!("printer agent already running");
            return Ok(());
        }

        let timeout = self.inner.config.connection_timeout();
        match tokio::time::timeout(timeout, self.inner.device.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PrintforgeError::Connection(format!(
                    "connecting to {} timed out after {}s",
                    self.inner.device.printer_id(),
                    timeout.as_secs()
                )));
            }
        }

        self.inner.recover_interrupted();

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(Arc::clone(&self.inner), rx));
        *worker = Some(Worker { shutdown, handle });
        self.running.store(true, Ordering::SeqCst);

        info!(printer_id = %self.inner.device.printer_id(), "printer agent started");
        Ok(())
    }

    /// Stop the control loop, persist the queue and disconnect.
    ///
    /// Waits up to the configured stop timeout for the current iteration to
    /// finish.  A print already running on the device keeps running.
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        let Some(Worker { shutdown, mut handle }) = worker.take() else {
            debug!("printer agent not running");
            return;
        };
        self.running.store(false, Ordering::SeqCst);

        info!("stopping printer agent");
        let _ = shutdown.send(true);

        let timeout = self.inner.config.stop_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => debug!("control loop joined"),
            Ok(Err(e)) => error!(error = %e, "control loop task failed"),
            Err(_) => warn!(
                timeout_secs = timeout.as_secs(),
                "control loop did not stop in time; detaching it"
            ),
        }

        if let Err(e) = self.inner.queue.save() {
            error!(error = %e, "failed to save queue on shutdown");
        }
        self.inner.device.disconnect().await;
        info!("printer agent stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run a single control loop iteration on the caller's task.
    ///
    /// The adapter must already be connected.  Used by the CLI for one-shot
    /// processing and by tests to step the loop deterministically.
    pub async fn run_once(&self) -> Result<()> {
        self.inner.run_iteration().await
    }
}

/// Control loop body; exits only when the shutdown flag is raised.
async fn run_loop(inner: Arc<AgentInner>, mut shutdown: watch::Receiver<bool>) {
    info!("control loop started");

    while !*shutdown.borrow() {
        // Each iteration runs as its own task so a panic is contained.
        let iteration = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move { inner.run_iteration().await }
        });

        let pause = match iteration.await {
            Ok(Ok(())) => inner.config.status_poll_interval(),
            Ok(Err(e)) => {
                error!(error = %e, "control loop iteration failed");
                inner.config.error_backoff()
            }
            Err(e) => {
                error!(error = %e, "control loop iteration panicked");
                inner.config.error_backoff()
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("control loop stopped");
}

impl AgentInner {
    async fn run_iteration(&self) -> Result<()> {
        self.dispatch_next().await?;
        self.monitor_active().await?;
        self.housekeeping();
        Ok(())
    }

    /// Persist the queue; failures are retried on the next save.
    fn persist(&self) {
        if let Err(e) = self.queue.save() {
            error!(error = %e, "failed to save queue");
        }
    }

    // -- Dispatch ----------------------------------------------------------

    async fn dispatch_next(&self) -> Result<()> {
        let status = match self.device.status().await {
            Ok(status) => status,
            Err(e) if e.is_connection() => {
                warn!(error = %e, "printer unreachable; skipping dispatch");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !status.can_accept_job() {
            debug!(state = ?status.state, "printer busy; not dispatching");
            return Ok(());
        }
        if let Some(id) = self.awaiting_completion(&status) {
            debug!(job_id = %id, "printer still shows an unfinished job; not dispatching");
            return Ok(());
        }

        let Some(mut job) = self.queue.dequeue() else {
            return Ok(());
        };

        if let Err(e) = self.execute_job(&mut job).await {
            error!(job_id = %job.id, error = %e, "job dispatch failed");
            self.handle_failure(job, &e)?;
        }
        Ok(())
    }

    /// Upload and start `job`, saving after every status change.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn execute_job(&self, job: &mut PrintJob) -> Result<()> {
        job.printer_id = Some(self.device.printer_id().to_owned());
        let remote_name = job.remote_name();

        if !self.transition(job, JobStatus::Uploading)? {
            return Ok(());
        }
        self.device.upload(&job.artifact, &remote_name).await?;

        if !self.transition(job, JobStatus::Starting)? {
            return Ok(());
        }
        self.device.start_print(&remote_name).await?;

        job.started_at = Some(Utc::now());
        if self.transition(job, JobStatus::Printing)? {
            info!(remote_name = %remote_name, "job printing");
        } else if let Err(e) = self.device.cancel().await {
            // Cancelled while starting: the print must not outlive its job.
            warn!(error = %e, "could not stop print of cancelled job");
        }
        Ok(())
    }

    /// Write `status` onto `job` and the stored record.
    ///
    /// Returns `false` without writing if the stored record has gone
    /// terminal in the meantime (cancelled from the API).
    fn transition(&self, job: &mut PrintJob, status: JobStatus) -> Result<bool> {
        job.status = status;
        if !self.queue.update_unless_terminal(job.clone())? {
            info!(job_id = %job.id, "job finished elsewhere; abandoning dispatch");
            return Ok(false);
        }
        self.persist();
        debug!(job_id = %job.id, status = %status, "job status changed");
        Ok(true)
    }

    /// A printing job the device still reports, which monitoring has not
    /// closed yet.  Starting another print would overwrite its result.
    fn awaiting_completion(&self, status: &PrinterStatus) -> Option<JobId> {
        self.queue.get_state().active.into_iter().find(|id| {
            status.matches_job(id)
                && self
                    .queue
                    .get_job(id)
                    .is_some_and(|job| job.status == JobStatus::Printing)
        })
    }

    // -- Monitoring --------------------------------------------------------

    async fn monitor_active(&self) -> Result<()> {
        for id in self.queue.get_state().active {
            let Some(mut job) = self.queue.get_job(&id) else {
                continue;
            };
            if job.status != JobStatus::Printing {
                continue;
            }

            // A failed poll says nothing about the job itself.
            let status = match self.device.status().await {
                Ok(status) => status,
                Err(e) => {
                    warn!(
                        error = %e,
                        class = ?e.class(),
                        "status poll failed; skipping monitor pass"
                    );
                    return Ok(());
                }
            };

            if !status.matches_job(&job.id) {
                debug!(
                    job_id = %job.id,
                    current = ?status.current_job,
                    "printer reports another job"
                );
                continue;
            }

            if let Some(progress) = status.progress {
                job.progress = progress;
            }
            job.current_layer = status.current_layer.or(job.current_layer);
            job.total_layers = status.total_layers.or(job.total_layers);

            if status.state == PrinterState::Error {
                self.fail_with_device_error(job, &status)?;
            } else if status.state == PrinterState::Idle && job.progress >= COMPLETION_THRESHOLD {
                self.complete_job(job)?;
            } else {
                debug!(
                    job_id = %job.id,
                    progress = job.progress,
                    layer = ?job.current_layer,
                    "job progress"
                );
                if self.queue.update_unless_terminal(job)? {
                    self.persist();
                }
            }
        }
        Ok(())
    }

    fn complete_job(&self, mut job: PrintJob) -> Result<()> {
        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.progress = 100.0;
        job.completed_at = Some(now);
        job.actual_duration_secs = job
            .started_at
            .map(|started| (now - started).num_seconds().max(0) as u64);

        let id = job.id.clone();
        let duration = job.actual_duration_secs;
        if !self.queue.update_unless_terminal(job)? {
            info!(job_id = %id, "job finished elsewhere; completion ignored");
            return Ok(());
        }
        self.queue.mark_completed(&id);
        self.persist();

        info!(job_id = %id, duration_secs = ?duration, "job completed");
        Ok(())
    }

    fn fail_with_device_error(&self, mut job: PrintJob, status: &PrinterStatus) -> Result<()> {
        let message = status
            .error_message
            .clone()
            .unwrap_or_else(|| "printer reported an error".to_owned());

        job.status = JobStatus::Error;
        job.error_code = status.error_code.clone();
        job.error_message = Some(message.clone());
        job.error_history.push(message.clone());
        job.completed_at = Some(Utc::now());

        let id = job.id.clone();
        if !self.queue.update_unless_terminal(job)? {
            info!(job_id = %id, "job finished elsewhere; device error ignored");
            return Ok(());
        }
        self.queue.mark_failed(&id, None);
        self.persist();

        error!(
            job_id = %id,
            code = ?status.error_code,
            message = %message,
            "printer error; job stopped"
        );
        Ok(())
    }

    // -- Failure handling --------------------------------------------------

    /// Record a failed attempt and either requeue the job or fail it.
    ///
    /// Every write is conditional on the stored record still being live, so
    /// a job cancelled meanwhile keeps its cancelled state.
    fn handle_failure(&self, mut job: PrintJob, err: &PrintforgeError) -> Result<()> {
        let message = err.to_string();
        job.error_message = Some(message.clone());
        job.error_code = Some(err.code().to_owned());
        job.error_history.push(message.clone());
        job.status = JobStatus::Failed;
        job.retry_count = (job.retry_count + 1).min(job.max_retries);

        let id = job.id.clone();
        if job.can_retry() {
            job.status = JobStatus::Retrying;
            if !self.queue.update_unless_terminal(job.clone())? {
                info!(job_id = %id, error = %message, "ignoring failure of job finished elsewhere");
                return Ok(());
            }
            job.reset_progress();
            if !self.queue.requeue(job)? {
                info!(job_id = %id, "job finished before it could be requeued");
                return Ok(());
            }
            warn!(job_id = %id, error = %message, "job will be retried");
        } else {
            let attempts = job.retry_count;
            if !self.queue.update_unless_terminal(job)? {
                info!(job_id = %id, error = %message, "ignoring failure of job finished elsewhere");
                return Ok(());
            }
            self.queue.mark_failed(&id, Some(&message));
            error!(job_id = %id, attempts, error = %message, "job failed permanently");
        }

        self.persist();
        Ok(())
    }

    // -- Housekeeping ------------------------------------------------------

    /// Trim terminal jobs once per cleanup interval.
    fn housekeeping(&self) {
        let interval = self.config.cleanup_interval_secs.max(1);
        let bucket = u64::try_from(Utc::now().timestamp()).unwrap_or(0) / interval;
        if self.last_cleanup_bucket.swap(bucket, Ordering::SeqCst) == bucket {
            return;
        }

        let removed = self.queue.clear_terminal_jobs(self.config.keep_terminal_jobs);
        if removed > 0 {
            info!(removed, "old terminal jobs pruned");
            self.persist();
        }
    }

    /// Requeue jobs a previous run left in active before they reached the
    /// printer.  Printing jobs stay put and are picked up by monitoring.
    fn recover_interrupted(&self) {
        let mut recovered = 0;
        for id in self.queue.get_state().active {
            let Some(mut job) = self.queue.get_job(&id) else {
                continue;
            };
            if job.is_terminal() || job.status == JobStatus::Printing {
                continue;
            }

            warn!(job_id = %id, status = %job.status, "requeueing interrupted job");
            job.reset_progress();
            match self.queue.requeue(job) {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => error!(job_id = %id, error = %e, "failed to requeue interrupted job"),
            }
        }

        if recovered > 0 {
            self.persist();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use printforge_core::config::PrinterConfig;

    use super::*;
    use crate::device::classify_transport_error;
    use crate::retry::RetryPolicy;
    use crate::simulator::SimulatedPrinter;

    /// Parks one device call until the test releases it.
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    impl Gate {
        async fn pass(&self) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    /// Simulator front with scripted status failures and gated calls.
    struct ScriptedPrinter {
        sim: Arc<SimulatedPrinter>,
        /// One entry per status call: `Some(detail)` fails it, `None` passes.
        status_script: std::sync::Mutex<VecDeque<Option<&'static str>>>,
        upload_gate: Option<Arc<Gate>>,
        cancel_gate: Option<Arc<Gate>>,
    }

    impl ScriptedPrinter {
        fn new(sim: Arc<SimulatedPrinter>) -> Self {
            Self {
                sim,
                status_script: std::sync::Mutex::new(VecDeque::new()),
                upload_gate: None,
                cancel_gate: None,
            }
        }

        fn with_upload_gate(mut self, gate: Arc<Gate>) -> Self {
            self.upload_gate = Some(gate);
            self
        }

        fn with_cancel_gate(mut self, gate: Arc<Gate>) -> Self {
            self.cancel_gate = Some(gate);
            self
        }

        fn script_status(&self, script: impl IntoIterator<Item = Option<&'static str>>) {
            self.status_script.lock().expect("script lock").extend(script);
        }
    }

    #[async_trait]
    impl DeviceAdapter for ScriptedPrinter {
        fn printer_id(&self) -> &str {
            self.sim.printer_id()
        }

        async fn connect(&self) -> Result<()> {
            self.sim.connect().await
        }

        async fn disconnect(&self) {
            self.sim.disconnect().await
        }

        fn is_connected(&self) -> bool {
            self.sim.is_connected()
        }

        async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()> {
            if let Some(gate) = &self.upload_gate {
                gate.pass().await;
            }
            self.sim.upload(local_path, remote_name).await
        }

        async fn start_print(&self, remote_name: &str) -> Result<()> {
            self.sim.start_print(remote_name).await
        }

        async fn pause(&self) -> Result<()> {
            self.sim.pause().await
        }

        async fn resume(&self) -> Result<()> {
            self.sim.resume().await
        }

        async fn cancel(&self) -> Result<()> {
            if let Some(gate) = &self.cancel_gate {
                gate.pass().await;
            }
            self.sim.cancel().await
        }

        async fn status(&self) -> Result<PrinterStatus> {
            let scripted = self.status_script.lock().expect("script lock").pop_front();
            match scripted.flatten() {
                Some(detail) => Err(classify_transport_error(detail)),
                None => self.sim.status().await,
            }
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        sim: Arc<SimulatedPrinter>,
        agent: Arc<PrinterAgent>,
        artifact: PathBuf,
    }

    impl Harness {
        fn config(dir: &tempfile::TempDir) -> AgentConfig {
            AgentConfig {
                queue_path: dir.path().join("data").join("queue.json"),
                status_poll_interval_secs: 1.0,
                ..Default::default()
            }
        }

        fn build(
            config: impl FnOnce(&mut AgentConfig),
            device: impl FnOnce(Arc<SimulatedPrinter>) -> Arc<dyn DeviceAdapter>,
        ) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut agent_config = Self::config(&dir);
            config(&mut agent_config);

            let sim = Arc::new(
                SimulatedPrinter::new(&PrinterConfig::default()).with_upload_policy(
                    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
                ),
            );
            let agent = PrinterAgent::open(agent_config, device(sim.clone())).expect("agent");
            let agent = Arc::new(agent);

            let artifact = dir.path().join("bracket.gcode");
            std::fs::write(&artifact, "G28\nG1 X10 Y10 Z0.2 E1\n".repeat(50)).expect("write");

            Self {
                dir,
                sim,
                agent,
                artifact,
            }
        }

        fn with_config(config: impl FnOnce(&mut AgentConfig)) -> Self {
            Self::build(config, |sim| sim as Arc<dyn DeviceAdapter>)
        }

        /// Harness whose agent reaches the simulator through a `ScriptedPrinter`.
        async fn scripted(
            setup: impl FnOnce(ScriptedPrinter) -> ScriptedPrinter,
        ) -> (Self, Arc<ScriptedPrinter>) {
            let mut front = None;
            let h = Self::build(
                |_| {},
                |sim| {
                    let printer = Arc::new(setup(ScriptedPrinter::new(sim)));
                    front = Some(printer.clone());
                    printer as Arc<dyn DeviceAdapter>
                },
            );
            h.sim.connect().await.expect("connect");
            (h, front.expect("device built"))
        }

        fn new() -> Self {
            Self::with_config(|_| {})
        }

        async fn connected() -> Self {
            let h = Self::new();
            h.sim.connect().await.expect("connect");
            h
        }

        fn submit(&self, priority: i32) -> PrintJob {
            self.agent
                .submit_job(&self.artifact, None, priority, None)
                .expect("submit")
        }

        fn job(&self, id: &JobId) -> PrintJob {
            self.agent.get_job_status(id).expect("job exists")
        }

        fn reopen_queue(&self) -> PrintQueue {
            PrintQueue::open(&self.agent.config().queue_path).expect("reopen")
        }

        async fn tick(&self) {
            self.agent.run_once().await.expect("iteration");
        }
    }

    #[test]
    fn invalid_config_prevents_construction() {
        let sim: Arc<dyn DeviceAdapter> =
            Arc::new(SimulatedPrinter::new(&PrinterConfig::default()));
        let config = AgentConfig {
            status_poll_interval_secs: 0.0,
            ..Default::default()
        };
        let result = PrinterAgent::new(config, sim, Arc::new(PrintQueue::in_memory()));
        assert!(matches!(result, Err(PrintforgeError::Config(_))));
    }

    #[test]
    fn submit_records_and_persists_job() {
        let h = Harness::with_config(|c| c.max_retries = 5);
        let metadata = JobMetadata {
            customer_id: Some("cust-7".into()),
            design_id: Some("design-42".into()),
            description: Some("left bracket".into()),
            estimated_duration_secs: Some(5400),
        };
        let job = h
            .agent
            .submit_job(&h.artifact, Some("Bracket".into()), 0, Some(metadata))
            .expect("submit");

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.customer_id.as_deref(), Some("cust-7"));
        assert_eq!(job.estimated_duration_secs, Some(5400));
        assert_eq!(job.artifact_bytes, std::fs::metadata(&h.artifact).unwrap().len());
        let bytes = std::fs::read(&h.artifact).unwrap();
        assert_eq!(
            job.artifact_sha256.as_deref(),
            Some(integrity::hash_bytes(&bytes).as_str())
        );

        let reopened = h.reopen_queue();
        assert_eq!(reopened.get_job(&job.id), Some(job.clone()));
        assert_eq!(reopened.get_state().pending, vec![job.id]);
    }

    #[test]
    fn submit_rejects_unsupported_artifact() {
        let h = Harness::new();
        let stl = h.dir.path().join("part.stl");
        std::fs::write(&stl, b"solid part").expect("write");

        let err = h.agent.submit_job(&stl, None, 0, None).unwrap_err();
        assert!(matches!(err, PrintforgeError::InvalidArtifact { .. }));
        assert!(h.agent.get_queue_state().pending.is_empty());
    }

    #[test]
    fn unknown_job_is_not_found() {
        let h = Harness::new();
        let err = h.agent.get_job_status(&JobId::from("job_nope")).unwrap_err();
        assert!(matches!(err, PrintforgeError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn printer_status_requires_connection() {
        let h = Harness::new();
        assert!(h.agent.get_printer_status().await.unwrap_err().is_connection());

        h.sim.connect().await.expect("connect");
        let status = h.agent.get_printer_status().await.expect("status");
        assert_eq!(status.state, PrinterState::Idle);
    }

    #[tokio::test]
    async fn job_runs_to_completion() {
        let h = Harness::connected().await;
        let job = h.submit(0);

        h.tick().await;
        let printing = h.job(&job.id);
        assert_eq!(printing.status, JobStatus::Printing);
        assert!(printing.started_at.is_some());
        assert_eq!(printing.printer_id.as_deref(), Some("printer-01"));
        assert_eq!(h.agent.get_queue_state().active, vec![job.id.clone()]);
        assert_eq!(h.sim.current_file(), Some(job.remote_name()));
        assert_eq!(h.sim.stored_size(&job.remote_name()), Some(job.artifact_bytes));

        h.sim.advance(50.0);
        h.tick().await;
        let halfway = h.job(&job.id);
        assert_eq!(halfway.progress, 50.0);
        assert_eq!(halfway.current_layer, Some(100));

        h.sim.finish();
        h.tick().await;
        let done = h.job(&job.id);
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert!(done.completed_at.is_some());
        assert!(done.actual_duration_secs.is_some());

        let state = h.reopen_queue().get_state();
        assert_eq!(state.completed, vec![job.id]);
        assert!(state.active.is_empty());
    }

    #[tokio::test]
    async fn busy_printer_gets_no_new_job() {
        let h = Harness::connected().await;
        let first = h.submit(0);
        let second = h.submit(0);

        h.tick().await;
        h.tick().await;

        assert_eq!(h.job(&first.id).status, JobStatus::Printing);
        assert_eq!(h.job(&second.id).status, JobStatus::Pending);
        assert_eq!(h.agent.get_queue_state().pending, vec![second.id.clone()]);

        // the finished job is closed before the next one starts
        h.sim.finish();
        h.tick().await;
        assert_eq!(h.job(&first.id).status, JobStatus::Completed);
        assert_eq!(h.job(&second.id).status, JobStatus::Pending);
        h.tick().await;
        assert_eq!(h.job(&second.id).status, JobStatus::Printing);
    }

    #[tokio::test]
    async fn priority_job_dispatches_first() {
        let h = Harness::connected().await;
        let normal = h.submit(0);
        let urgent = h.submit(10);

        h.tick().await;

        assert_eq!(h.job(&urgent.id).status, JobStatus::Printing);
        assert_eq!(h.job(&normal.id).status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn offline_printer_skips_dispatch() {
        let h = Harness::connected().await;
        let job = h.submit(0);
        h.sim.set_online(false);

        h.tick().await;

        let stored = h.job(&job.id);
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn monitoring_blip_does_not_penalize_job() {
        let h = Harness::connected().await;
        let job = h.submit(0);
        h.tick().await;
        h.sim.advance(20.0);

        h.sim.set_online(false);
        h.tick().await;
        h.sim.set_online(true);

        let stored = h.job(&job.id);
        assert_eq!(stored.status, JobStatus::Printing);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.progress, 0.0);

        h.tick().await;
        assert_eq!(h.job(&job.id).progress, 20.0);
    }

    #[tokio::test]
    async fn monitor_poll_timeout_does_not_penalize_job() {
        let (h, printer) = Harness::scripted(|p| p).await;
        let job = h.submit(0);
        h.tick().await;
        h.sim.advance(40.0);

        // the dispatch poll answers, the monitor poll times out
        printer.script_status([None, Some("status request timed out")]);
        h.tick().await;

        let stored = h.job(&job.id);
        assert_eq!(stored.status, JobStatus::Printing);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.error_history.is_empty());
        assert_eq!(h.agent.get_queue_state().active, vec![job.id.clone()]);

        h.sim.finish();
        h.tick().await;
        assert_eq!(h.job(&job.id).status, JobStatus::Completed);
        assert_eq!(h.sim.upload_attempts(), 1);
    }

    #[tokio::test]
    async fn retries_until_budget_is_spent() {
        let h = Harness::connected().await;
        let job = h.submit(0);
        assert_eq!(job.max_retries, 3);

        for attempt in 1..=2 {
            h.sim.fail_next_start("printer rejected project file");
            h.tick().await;

            let stored = h.job(&job.id);
            assert_eq!(stored.status, JobStatus::Pending, "attempt {attempt}");
            assert_eq!(stored.retry_count, attempt);
            assert_eq!(stored.error_history.len(), attempt as usize);
            assert_eq!(stored.error_code.as_deref(), Some("command"));
            assert_eq!(h.agent.get_queue_state().pending, vec![job.id.clone()]);
        }

        h.sim.fail_next_start("printer rejected project file");
        h.tick().await;

        let stored = h.job(&job.id);
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert!(!stored.can_retry());
        let state = h.agent.get_queue_state();
        assert_eq!(state.failed, vec![job.id]);
        assert!(state.pending.is_empty());
        assert!(state.active.is_empty());
    }

    #[tokio::test]
    async fn zero_retry_budget_fails_immediately() {
        let h = Harness::with_config(|c| c.max_retries = 0);
        h.sim.connect().await.expect("connect");
        let job = h.submit(0);
        h.sim.fail_next_start("printer rejected project file");

        h.tick().await;

        let stored = h.job(&job.id);
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn transient_upload_failure_is_absorbed_by_adapter() {
        let h = Harness::connected().await;
        let job = h.submit(0);
        h.sim.truncate_next_upload();

        h.tick().await;

        let stored = h.job(&job.id);
        assert_eq!(stored.status, JobStatus::Printing);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(h.sim.upload_attempts(), 2);
    }

    #[tokio::test]
    async fn upload_auth_failure_counts_as_attempt() {
        let h = Harness::connected().await;
        let job = h.submit(0);
        h.sim.fail_next_upload("530 Login incorrect.");

        h.tick().await;

        let stored = h.job(&job.id);
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error_code.as_deref(), Some("authentication"));
        assert_eq!(h.sim.upload_attempts(), 1);
    }

    #[tokio::test]
    async fn device_error_marks_job_error() {
        let h = Harness::connected().await;
        let job = h.submit(0);
        h.tick().await;

        h.sim.raise_error("0300-8003", "filament runout");
        h.tick().await;

        let stored = h.job(&job.id);
        assert_eq!(stored.status, JobStatus::Error);
        assert!(stored.is_terminal());
        assert_eq!(stored.error_code.as_deref(), Some("0300-8003"));
        assert_eq!(stored.error_message.as_deref(), Some("filament runout"));
        assert_eq!(h.agent.get_queue_state().failed, vec![job.id]);
    }

    #[tokio::test]
    async fn cancel_pending_job_is_idempotent() {
        let h = Harness::connected().await;
        let job = h.submit(0);

        assert!(h.agent.cancel_job(&job.id).await.expect("cancel"));
        let cancelled = h.job(&job.id);
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.error_message.as_deref(), Some(CANCEL_REASON));

        assert!(!h.agent.cancel_job(&job.id).await.expect("second cancel"));
        assert_eq!(h.job(&job.id), cancelled);
        assert_eq!(h.agent.get_queue_state().failed, vec![job.id.clone()]);
        assert_eq!(h.sim.cancel_count(), 0);

        // cancelled jobs are never dispatched
        h.tick().await;
        assert_eq!(h.job(&job.id).status, JobStatus::Cancelled);
        assert_eq!(h.reopen_queue().get_state().failed, vec![job.id]);
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_false() {
        let h = Harness::new();
        assert!(!h.agent.cancel_job(&JobId::from("job_nope")).await.expect("cancel"));
    }

    #[tokio::test]
    async fn cancel_printing_job_stops_device() {
        let h = Harness::connected().await;
        let job = h.submit(0);
        h.tick().await;
        h.sim.fail_next_cancel("command timed out");

        assert!(h.agent.cancel_job(&job.id).await.expect("cancel"));

        assert_eq!(h.sim.cancel_count(), 1);
        assert_eq!(h.job(&job.id).status, JobStatus::Cancelled);
        assert!(h.agent.get_queue_state().active.is_empty());

        // monitoring leaves the cancelled job alone
        h.sim.finish();
        h.tick().await;
        assert_eq!(h.job(&job.id).status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_racing_completion_keeps_job_completed() {
        let gate = Arc::new(Gate::default());
        let (h, _) = Harness::scripted(|p| p.with_cancel_gate(gate.clone())).await;
        let job = h.submit(0);
        h.tick().await;

        let agent = h.agent.clone();
        let id = job.id.clone();
        let cancel = tokio::spawn(async move { agent.cancel_job(&id).await });
        gate.entered.notified().await;

        // the print finishes while the device cancel is in flight
        h.sim.finish();
        h.tick().await;
        assert_eq!(h.job(&job.id).status, JobStatus::Completed);

        gate.release.notify_one();
        assert!(!cancel.await.expect("join").expect("cancel"));

        assert_eq!(h.job(&job.id).status, JobStatus::Completed);
        let state = h.agent.get_queue_state();
        assert_eq!(state.completed, vec![job.id.clone()]);
        assert!(state.failed.is_empty());
        assert_eq!(h.reopen_queue().get_state().completed, vec![job.id]);
    }

    #[tokio::test]
    async fn cancel_during_upload_abandons_dispatch() {
        let gate = Arc::new(Gate::default());
        let (h, _) = Harness::scripted(|p| p.with_upload_gate(gate.clone())).await;
        let job = h.submit(0);

        let agent = h.agent.clone();
        let iteration = tokio::spawn(async move { agent.run_once().await });
        gate.entered.notified().await;
        assert_eq!(h.job(&job.id).status, JobStatus::Uploading);

        assert!(h.agent.cancel_job(&job.id).await.expect("cancel"));
        gate.release.notify_one();
        iteration.await.expect("join").expect("iteration");

        let stored = h.job(&job.id);
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(h.sim.current_file(), None);

        let state = h.agent.get_queue_state();
        assert!(state.pending.is_empty() && state.active.is_empty());
        assert_eq!(state.failed, vec![job.id.clone()]);
        assert_eq!(h.reopen_queue().get_job(&job.id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn completed_job_cannot_be_cancelled() {
        let h = Harness::connected().await;
        let job = h.submit(0);
        h.tick().await;
        h.sim.finish();
        h.tick().await;

        assert!(!h.agent.cancel_job(&job.id).await.expect("cancel"));
        assert_eq!(h.job(&job.id).status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn housekeeping_trims_terminal_jobs() {
        let h = Harness::with_config(|c| c.keep_terminal_jobs = 2);
        h.sim.connect().await.expect("connect");
        let jobs: Vec<_> = (0..4).map(|_| h.submit(0)).collect();
        for job in &jobs {
            h.agent.cancel_job(&job.id).await.expect("cancel");
        }

        // first iteration always trims; a second one in the same bucket doesn't
        h.tick().await;
        assert_eq!(h.agent.get_queue_state().failed, vec![jobs[2].id.clone(), jobs[3].id.clone()]);
        assert!(h.agent.get_job_status(&jobs[0].id).is_err());

        h.agent.cancel_job(&h.submit(0).id).await.expect("cancel");
        h.tick().await;
        assert_eq!(h.agent.get_queue_state().failed.len(), 3);
    }

    #[tokio::test]
    async fn start_rejects_bad_access_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let device: Arc<dyn DeviceAdapter> = Arc::new(
            SimulatedPrinter::new(&PrinterConfig::default()).with_expected_access_code("abcd1234"),
        );
        let agent = PrinterAgent::open(Harness::config(&dir), device).expect("agent");

        let err = agent.start().await.unwrap_err();
        assert!(matches!(err, PrintforgeError::Authentication(_)));
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn start_requeues_interrupted_jobs() {
        let h = Harness::new();
        let job = h.submit(0);
        let mut taken = h.agent.queue().dequeue().expect("dequeue");
        taken.status = JobStatus::Uploading;
        taken.progress = 10.0;
        h.agent.queue().update_job(taken).expect("update");
        // keep the loop from dispatching it straight away
        h.sim.fail_next_status("connection refused");

        h.agent.start().await.expect("start");
        h.agent.stop().await;

        let stored = h.reopen_queue().get_job(&job.id).expect("stored");
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.progress, 0.0);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn start_and_stop_lifecycle() {
        let h = Harness::new();
        let job = h.submit(0);

        h.agent.start().await.expect("start");
        h.agent.start().await.expect("second start is a no-op");
        assert!(h.agent.is_running());
        assert!(h.sim.is_connected());

        let mut printing = false;
        for _ in 0..200 {
            if h.job(&job.id).status == JobStatus::Printing {
                printing = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(printing, "control loop should dispatch the job");

        tokio::time::timeout(Duration::from_secs(5), h.agent.stop())
            .await
            .expect("stop wakes the sleeping loop");
        assert!(!h.agent.is_running());
        assert!(!h.sim.is_connected());
        // the print itself is left running on the device
        assert_eq!(h.sim.cancel_count(), 0);
        assert_eq!(
            h.reopen_queue().get_job(&job.id).map(|j| j.status),
            Some(JobStatus::Printing)
        );

        // stopping twice is harmless
        h.agent.stop().await;
    }
}
