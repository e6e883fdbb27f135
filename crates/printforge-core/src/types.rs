// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Printforge job queue and printer agent.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PrintforgeError, Result};

/// Unique identifier for a print job.
///
/// Generated ids look like `job_20260114_093512_1f2e3d4c`: a UTC timestamp
/// keeps them human-sortable and the random suffix keeps them unique.
/// Ids restored from disk or supplied by callers are treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("job_{timestamp}_{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kinds of printable artifact the agent knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Plain sliced G-code.
    Gcode,
    /// Sliced 3MF project (G-code plus plate metadata).
    Project,
}

impl ArtifactKind {
    /// Infer the artifact kind from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "gcode" | "gco" | "g" => Some(Self::Gcode),
            "3mf" => Some(Self::Project),
            _ => None,
        }
    }

    /// Extension used for the file once it lands on the printer.
    pub fn remote_extension(&self) -> &'static str {
        match self {
            Self::Gcode => "gcode",
            Self::Project => "3mf",
        }
    }
}

/// Lifecycle states of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, waiting for the printer.
    Pending,
    /// Artifact transfer to the printer in progress.
    Uploading,
    /// Start command sent.
    Starting,
    /// Printer is working on it.
    Printing,
    /// Failed, about to be queued again.
    Retrying,
    /// Successfully printed.
    Completed,
    /// Gave up after exhausting retries.
    Failed,
    /// Cancelled by the operator.
    Cancelled,
    /// Printer reported a fault; needs intervention.
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        Self::Pending,
        Self::Uploading,
        Self::Starting,
        Self::Printing,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Error,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Error
        )
    }

    /// States in which the job occupies the printer.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Uploading | Self::Starting | Self::Printing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Starting => "starting",
            Self::Printing => "printing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = PrintforgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PrintforgeError::Validation(format!("unknown job status: {s}")))
    }
}

/// Classification of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network blip, timeout or short upload; safe to retry automatically.
    Transient,
    /// Bad credentials, rejected command or invalid input; retrying won't help.
    Permanent,
}

/// Optional cross-references supplied at submission time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub customer_id: Option<String>,
    pub design_id: Option<String>,
    pub description: Option<String>,
    pub estimated_duration_secs: Option<u64>,
}

/// A complete print job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    /// Local path of the file to print.
    pub artifact: PathBuf,
    pub artifact_kind: ArtifactKind,
    /// SHA-256 of the artifact at submission time.
    #[serde(default)]
    pub artifact_sha256: Option<String>,
    #[serde(default)]
    pub artifact_bytes: u64,
    /// Printer the job was dispatched to.
    #[serde(default)]
    pub printer_id: Option<String>,

    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Higher runs sooner; anything above zero jumps the queue.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub design_id: Option<String>,

    pub status: JobStatus,
    /// Percentage in [0, 100]; only meaningful while printing.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_layer: Option<u32>,
    #[serde(default)]
    pub total_layers: Option<u32>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub actual_duration_secs: Option<u64>,

    /// Number of failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Attempts allowed before the job is failed for good.
    pub max_retries: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    /// Error message from each failed attempt, oldest first.
    #[serde(default)]
    pub error_history: Vec<String>,
}

impl PrintJob {
    /// Default retry budget for a new job.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Build a pending job for `artifact`.
    ///
    /// The artifact must exist, be a regular file and carry a recognised
    /// extension. `name` falls back to the file stem.
    pub fn new(artifact: impl Into<PathBuf>, name: Option<String>, priority: i32) -> Result<Self> {
        let artifact = artifact.into();
        let artifact_kind = validate_artifact(&artifact)?;
        let name = name.unwrap_or_else(|| {
            artifact
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "print".into())
        });

        Ok(Self {
            id: JobId::new(),
            artifact,
            artifact_kind,
            artifact_sha256: None,
            artifact_bytes: 0,
            printer_id: None,
            name,
            description: None,
            priority,
            customer_id: None,
            design_id: None,
            status: JobStatus::Pending,
            progress: 0.0,
            current_layer: None,
            total_layers: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration_secs: None,
            actual_duration_secs: None,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            error_message: None,
            error_code: None,
            error_history: Vec::new(),
        })
    }

    /// Copy caller-supplied cross-references onto the record.
    pub fn apply_metadata(&mut self, metadata: JobMetadata) {
        if metadata.customer_id.is_some() {
            self.customer_id = metadata.customer_id;
        }
        if metadata.design_id.is_some() {
            self.design_id = metadata.design_id;
        }
        if metadata.description.is_some() {
            self.description = metadata.description;
        }
        if metadata.estimated_duration_secs.is_some() {
            self.estimated_duration_secs = metadata.estimated_duration_secs;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status, JobStatus::Failed | JobStatus::Error)
            && self.retry_count < self.max_retries
    }

    /// File name used for this job on the printer's storage.
    pub fn remote_name(&self) -> String {
        format!("{}.{}", self.id, self.artifact_kind.remote_extension())
    }

    /// Forget everything learned from a previous attempt on the printer.
    pub fn reset_progress(&mut self) {
        self.progress = 0.0;
        self.current_layer = None;
        self.total_layers = None;
        self.started_at = None;
    }
}

/// Check that `path` is an existing regular file with a printable extension.
pub fn validate_artifact(path: &Path) -> Result<ArtifactKind> {
    let invalid = |reason: &str| PrintforgeError::InvalidArtifact {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    };

    let metadata = std::fs::metadata(path).map_err(|_| invalid("file not found"))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file"));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| invalid("missing file extension"))?;

    ArtifactKind::from_extension(ext)
        .ok_or_else(|| invalid(&format!("unsupported extension .{ext}")))
}

/// Operational state reported by the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterState {
    Idle,
    Printing,
    Paused,
    Error,
    /// Not reachable, or reporting something we don't understand.
    Offline,
    /// Calibration, firmware update and similar.
    Maintenance,
}

impl PrinterState {
    /// Map a raw firmware state string into a known state.
    ///
    /// Firmware adds new strings over time; anything unrecognised maps to
    /// `Offline` so that the agent stops dispatching instead of failing.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" | "standby" | "finish" | "finished" => Self::Idle,
            "running" | "printing" | "prepare" | "preparing" => Self::Printing,
            "pause" | "paused" => Self::Paused,
            "error" | "failed" | "fault" => Self::Error,
            "calibrating" | "upgrading" | "maintenance" => Self::Maintenance,
            _ => Self::Offline,
        }
    }
}

/// A single temperature sensor reading in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub current: f64,
    pub target: f64,
}

impl TemperatureReading {
    /// Whether the sensor has settled within `tolerance` °C of its target.
    pub fn is_stable(&self, tolerance: f64) -> bool {
        (self.current - self.target).abs() <= tolerance
    }
}

/// Snapshot of the printer as reported by the device adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub printer_id: String,
    pub state: PrinterState,
    pub online: bool,
    /// Name of the job the printer is working on (usually the remote file).
    pub current_job: Option<String>,
    pub progress: Option<f64>,
    pub current_layer: Option<u32>,
    pub total_layers: Option<u32>,
    pub time_remaining_secs: Option<u64>,
    pub nozzle_temp: Option<TemperatureReading>,
    pub bed_temp: Option<TemperatureReading>,
    pub chamber_temp: Option<TemperatureReading>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub firmware_version: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl PrinterStatus {
    /// Status for a printer that cannot be reached.
    pub fn offline(printer_id: impl Into<String>) -> Self {
        Self {
            printer_id: printer_id.into(),
            state: PrinterState::Offline,
            online: false,
            current_job: None,
            progress: None,
            current_layer: None,
            total_layers: None,
            time_remaining_secs: None,
            nozzle_temp: None,
            bed_temp: None,
            chamber_temp: None,
            error_code: None,
            error_message: None,
            firmware_version: None,
            last_updated: Utc::now(),
        }
    }

    pub fn can_accept_job(&self) -> bool {
        self.state == PrinterState::Idle && self.online
    }

    /// Whether the printer reports working on `job_id`.
    pub fn matches_job(&self, job_id: &JobId) -> bool {
        self.current_job
            .as_deref()
            .is_some_and(|current| current.contains(job_id.as_str()))
    }

    /// Build a status from a raw device report.
    ///
    /// Missing or mistyped fields become `None`; the report never fails to
    /// parse as a whole.
    pub fn from_report(printer_id: impl Into<String>, report: &serde_json::Value) -> Self {
        let text = |key: &str| {
            report
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_owned)
        };
        let number = |key: &str| report.get(key).and_then(|v| v.as_f64());
        let count = |key: &str| {
            report
                .get(key)
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok())
        };
        let temperature = |current: &str, target: &str| {
            Some(TemperatureReading {
                current: number(current)?,
                target: number(target)?,
            })
        };

        let state = text("print_status")
            .map(|raw| PrinterState::from_raw(&raw))
            .unwrap_or(PrinterState::Offline);

        Self {
            printer_id: printer_id.into(),
            state,
            online: true,
            current_job: text("subtask_name").filter(|s| !s.is_empty()),
            progress: number("print_percentage").map(|p| p.clamp(0.0, 100.0)),
            current_layer: count("layer_num"),
            total_layers: count("total_layer_num"),
            time_remaining_secs: report.get("mc_remaining_time").and_then(|v| v.as_u64()),
            nozzle_temp: temperature("nozzle_temp", "nozzle_target"),
            bed_temp: temperature("bed_temp", "bed_target"),
            chamber_temp: temperature("chamber_temp", "chamber_target"),
            error_code: report.get("print_error").and_then(|v| match v {
                serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) if n.as_u64() != Some(0) => Some(n.to_string()),
                _ => None,
            }),
            error_message: text("error_message"),
            firmware_version: text("sw_ver"),
            last_updated: Utc::now(),
        }
    }
}

/// Membership of every job id in the four queue lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    /// Waiting jobs, next to run first.
    pub pending: Vec<JobId>,
    /// Jobs currently occupying the printer.
    pub active: Vec<JobId>,
    pub completed: Vec<JobId>,
    /// Failed, errored and cancelled jobs.
    pub failed: Vec<JobId>,
    /// Schema version of the persisted document.
    pub version: u32,
    pub last_modified: DateTime<Utc>,
}

impl QueueState {
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            active: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            version: Self::SCHEMA_VERSION,
            last_modified: Utc::now(),
        }
    }

    pub fn total_jobs(&self) -> usize {
        self.pending.len() + self.active.len() + self.completed.len() + self.failed.len()
    }

    pub fn next_job(&self) -> Option<&JobId> {
        self.pending.first()
    }

    /// Every id across all four lists, in list order.
    pub fn all_ids(&self) -> impl Iterator<Item = &JobId> {
        self.pending
            .iter()
            .chain(&self.active)
            .chain(&self.completed)
            .chain(&self.failed)
    }
}

impl Default for QueueState {
    fn default() -> Self {
        Self::new()
    }
}
