// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-process printer simulator.
//
// Behaves like a LAN printer from the agent's point of view: it keeps a
// table of uploaded files, runs one print at a time and emits the same raw
// status report a real device would, which is parsed through
// `PrinterStatus::from_report`.  Faults can be queued up front so failure
// paths are reproducible without hardware.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use printforge_core::config::PrinterConfig;
use printforge_core::error::{PrintforgeError, Result};
use printforge_core::types::PrinterStatus;

use crate::device::{DeviceAdapter, classify_transport_error, verify_upload_size};
use crate::retry::RetryPolicy;

const FIRMWARE_VERSION: &str = "01.08.00.00-sim";
const TOTAL_LAYERS: u32 = 200;
const SECONDS_PER_PERCENT: f64 = 36.0;
const NOZZLE_PRINTING: f64 = 220.0;
const BED_PRINTING: f64 = 60.0;
const AMBIENT: f64 = 25.0;

// -- Raw firmware states ---------------------------------------------------

const RAW_IDLE: &str = "idle";
const RAW_RUNNING: &str = "running";
const RAW_PAUSED: &str = "pause";
const RAW_FINISHED: &str = "finish";
const RAW_ERROR: &str = "error";

/// Faults consumed one at a time by the matching operation.
#[derive(Debug, Default)]
struct Faults {
    connect: VecDeque<String>,
    upload: VecDeque<String>,
    truncated_uploads: u32,
    start: VecDeque<String>,
    status: VecDeque<String>,
    cancel: VecDeque<String>,
}

#[derive(Debug)]
struct SimState {
    online: bool,
    raw_state: &'static str,
    current_file: Option<String>,
    progress: f64,
    error_code: Option<String>,
    error_message: Option<String>,
    /// Remote file name to stored size in bytes.
    files: HashMap<String, u64>,
    /// Progress added every time status is polled while printing.
    auto_advance: Option<f64>,
    faults: Faults,
    upload_attempts: u32,
    cancels: u32,
}

impl SimState {
    fn can_start(&self) -> bool {
        matches!(self.raw_state, RAW_IDLE | RAW_FINISHED)
    }

    fn advance(&mut self, percent: f64) {
        if self.raw_state != RAW_RUNNING {
            return;
        }
        self.progress = (self.progress + percent).clamp(0.0, 100.0);
        if self.progress >= 100.0 {
            self.raw_state = RAW_FINISHED;
        }
    }

    fn report(&self) -> serde_json::Value {
        let heating = matches!(self.raw_state, RAW_RUNNING | RAW_PAUSED);
        let (nozzle, bed) = if heating {
            (NOZZLE_PRINTING, BED_PRINTING)
        } else {
            (0.0, 0.0)
        };
        let layer = (self.progress / 100.0 * f64::from(TOTAL_LAYERS)).round() as u32;
        let remaining = ((100.0 - self.progress) * SECONDS_PER_PERCENT).max(0.0) as u64;

        json!({
            "print_status": self.raw_state,
            "print_percentage": self.progress,
            "layer_num": layer,
            "total_layer_num": if self.current_file.is_some() { TOTAL_LAYERS } else { 0 },
            "mc_remaining_time": if heating { remaining } else { 0 },
            "subtask_name": self.current_file.clone().unwrap_or_default(),
            "nozzle_temp": if heating { nozzle } else { AMBIENT },
            "nozzle_target": nozzle,
            "bed_temp": if heating { bed } else { AMBIENT },
            "bed_target": bed,
            "print_error": self.error_code.clone().unwrap_or_default(),
            "error_message": self.error_message,
            "sw_ver": FIRMWARE_VERSION,
        })
    }
}

/// Simulated printer implementing `DeviceAdapter`.
#[derive(Debug)]
pub struct SimulatedPrinter {
    printer_id: String,
    host: String,
    access_code: String,
    /// Code the simulated device accepts; `None` accepts anything.
    expected_access_code: Option<String>,
    upload_policy: RetryPolicy,
    connected: AtomicBool,
    state: Mutex<SimState>,
}

impl SimulatedPrinter {
    pub fn new(config: &PrinterConfig) -> Self {
        Self {
            printer_id: config.printer_id.clone(),
            host: config.host.clone(),
            access_code: config.access_code.clone(),
            expected_access_code: None,
            upload_policy: RetryPolicy::default(),
            connected: AtomicBool::new(false),
            state: Mutex::new(SimState {
                online: true,
                raw_state: RAW_IDLE,
                current_file: None,
                progress: 0.0,
                error_code: None,
                error_message: None,
                files: HashMap::new(),
                auto_advance: None,
                faults: Faults::default(),
                upload_attempts: 0,
                cancels: 0,
            }),
        }
    }

    /// Retry policy applied to uploads.
    pub fn with_upload_policy(mut self, policy: RetryPolicy) -> Self {
        self.upload_policy = policy;
        self
    }

    /// Reject connections whose access code differs from `code`.
    pub fn with_expected_access_code(mut self, code: impl Into<String>) -> Self {
        self.expected_access_code = Some(code.into());
        self
    }

    fn sim(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PrintforgeError::Connection(format!(
                "{} is not connected",
                self.printer_id
            )));
        }
        Ok(())
    }

    // -- Fault injection ---------------------------------------------------

    pub fn fail_next_connect(&self, message: impl Into<String>) {
        self.sim().faults.connect.push_back(message.into());
    }

    /// Fail the next upload attempt (not the whole retried upload).
    pub fn fail_next_upload(&self, message: impl Into<String>) {
        self.sim().faults.upload.push_back(message.into());
    }

    /// Store only half of the next uploaded file.
    pub fn truncate_next_upload(&self) {
        self.sim().faults.truncated_uploads += 1;
    }

    pub fn fail_next_start(&self, message: impl Into<String>) {
        self.sim().faults.start.push_back(message.into());
    }

    pub fn fail_next_status(&self, message: impl Into<String>) {
        self.sim().faults.status.push_back(message.into());
    }

    pub fn fail_next_cancel(&self, message: impl Into<String>) {
        self.sim().faults.cancel.push_back(message.into());
    }

    // -- Device controls ---------------------------------------------------

    /// Take the printer off (or back onto) the network.
    pub fn set_online(&self, online: bool) {
        info!(printer_id = %self.printer_id, online, "simulated printer network change");
        self.sim().online = online;
    }

    /// Move the running print forward by `percent`.
    pub fn advance(&self, percent: f64) {
        self.sim().advance(percent);
    }

    /// Advance the running print by `percent` on every status poll.
    pub fn set_auto_advance(&self, percent: Option<f64>) {
        self.sim().auto_advance = percent;
    }

    /// Complete the running print immediately.
    pub fn finish(&self) {
        self.sim().advance(100.0);
    }

    /// Put the printer into its error state.
    pub fn raise_error(&self, code: impl Into<String>, message: impl Into<String>) {
        let mut sim = self.sim();
        sim.raw_state = RAW_ERROR;
        sim.error_code = Some(code.into());
        sim.error_message = Some(message.into());
        warn!(printer_id = %self.printer_id, code = ?sim.error_code, "simulated printer error");
    }

    /// Operator cleared the fault; the plate is empty again.
    pub fn clear_error(&self) {
        let mut sim = self.sim();
        sim.raw_state = RAW_IDLE;
        sim.error_code = None;
        sim.error_message = None;
        sim.current_file = None;
        sim.progress = 0.0;
    }

    // -- Inspection --------------------------------------------------------

    /// Stored size of `remote_name`, if it was uploaded.
    pub fn stored_size(&self, remote_name: &str) -> Option<u64> {
        self.sim().files.get(remote_name).copied()
    }

    pub fn upload_attempts(&self) -> u32 {
        self.sim().upload_attempts
    }

    pub fn cancel_count(&self) -> u32 {
        self.sim().cancels
    }

    pub fn current_file(&self) -> Option<String> {
        self.sim().current_file.clone()
    }

    /// One transfer attempt: store the file and verify its size.
    fn transfer_once(&self, remote_name: &str, local_size: u64) -> Result<()> {
        let mut sim = self.sim();
        sim.upload_attempts += 1;

        if !sim.online {
            return Err(PrintforgeError::Transient(format!(
                "data connection to {} timed out",
                self.host
            )));
        }
        if let Some(message) = sim.faults.upload.pop_front() {
            return Err(classify_transport_error(&message));
        }

        let stored = if sim.faults.truncated_uploads > 0 {
            sim.faults.truncated_uploads -= 1;
            local_size / 2
        } else {
            local_size
        };
        sim.files.insert(remote_name.to_owned(), stored);
        debug!(remote_name, stored, "simulated transfer finished");

        verify_upload_size(local_size, stored)
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedPrinter {
    fn printer_id(&self) -> &str {
        &self.printer_id
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut sim = self.sim();
            if let Some(message) = sim.faults.connect.pop_front() {
                return Err(classify_transport_error(&message));
            }
            if !sim.online {
                return Err(PrintforgeError::Connection(format!(
                    "{} is unreachable",
                    self.host
                )));
            }
        }
        if self
            .expected_access_code
            .as_deref()
            .is_some_and(|expected| expected != self.access_code)
        {
            return Err(PrintforgeError::Authentication(format!(
                "{} rejected the access code",
                self.printer_id
            )));
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(printer_id = %self.printer_id, host = %self.host, "connected to simulated printer");
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(printer_id = %self.printer_id, "disconnected from simulated printer");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        self.ensure_connected()?;
        let local_size = std::fs::metadata(local_path)
            .map_err(|e| PrintforgeError::InvalidArtifact {
                path: local_path.to_path_buf(),
                reason: e.to_string(),
            })?
            .len();

        self.upload_policy
            .run("upload", || {
                std::future::ready(self.transfer_once(remote_name, local_size))
            })
            .await?;

        info!(remote_name, bytes = local_size, "file uploaded");
        Ok(())
    }

    async fn start_print(&self, remote_name: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut sim = self.sim();

        if let Some(message) = sim.faults.start.pop_front() {
            return Err(classify_transport_error(&message));
        }
        if !sim.online {
            return Err(PrintforgeError::Connection(format!(
                "{} is unreachable",
                self.host
            )));
        }
        if !sim.files.contains_key(remote_name) {
            return Err(PrintforgeError::Command(format!(
                "{remote_name} not found on printer storage"
            )));
        }
        if !sim.can_start() {
            return Err(PrintforgeError::Command(format!(
                "printer is busy ({})",
                sim.raw_state
            )));
        }

        sim.raw_state = RAW_RUNNING;
        sim.current_file = Some(remote_name.to_owned());
        sim.progress = 0.0;
        info!(remote_name, "simulated print started");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.ensure_connected()?;
        let mut sim = self.sim();
        if sim.raw_state != RAW_RUNNING {
            return Err(PrintforgeError::Command("no print is running".into()));
        }
        sim.raw_state = RAW_PAUSED;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.ensure_connected()?;
        let mut sim = self.sim();
        if sim.raw_state != RAW_PAUSED {
            return Err(PrintforgeError::Command("no print is paused".into()));
        }
        sim.raw_state = RAW_RUNNING;
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.ensure_connected()?;
        let mut sim = self.sim();
        sim.cancels += 1;

        if let Some(message) = sim.faults.cancel.pop_front() {
            return Err(classify_transport_error(&message));
        }

        sim.raw_state = RAW_IDLE;
        sim.current_file = None;
        sim.progress = 0.0;
        info!(printer_id = %self.printer_id, "simulated print cancelled");
        Ok(())
    }

    async fn status(&self) -> Result<PrinterStatus> {
        self.ensure_connected()?;
        let mut sim = self.sim();

        if let Some(message) = sim.faults.status.pop_front() {
            return Err(classify_transport_error(&message));
        }
        if !sim.online {
            return Err(PrintforgeError::Connection(format!(
                "no status report from {}",
                self.host
            )));
        }
        if let Some(step) = sim.auto_advance {
            sim.advance(step);
        }

        Ok(PrinterStatus::from_report(&self.printer_id, &sim.report()))
    }
}
