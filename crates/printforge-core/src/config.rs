// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Application configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PrintforgeError, Result};

/// Persistent application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub printer: PrinterConfig,
    pub agent: AgentConfig,
}

impl AppConfig {
    /// Read settings from a JSON file.
    ///
    /// A missing file yields the defaults; a file that exists but does not
    /// parse is an error rather than being silently replaced.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data)
            .map_err(|e| PrintforgeError::Config(format!("{}: {e}", path.display())))
    }

    /// Write settings as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.printer.validate()?;
        self.agent.validate()
    }
}

/// MQTT control channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub port: u16,
    pub use_tls: bool,
    pub keepalive_secs: u64,
    pub timeout_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            port: 8883,
            use_tls: true,
            keepalive_secs: 60,
            timeout_secs: 30,
        }
    }
}

/// FTP upload channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpSettings {
    pub port: u16,
    pub use_tls: bool,
    pub timeout_secs: u64,
}

impl Default for FtpSettings {
    fn default() -> Self {
        Self {
            port: 990,
            use_tls: true,
            timeout_secs: 30,
        }
    }
}

/// Identity and connection details for the printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    pub printer_id: String,
    pub name: String,
    pub model: String,
    /// Hostname or IP address on the LAN.
    pub host: String,
    /// LAN access code shown on the printer's screen.
    pub access_code: String,
    pub serial: String,
    pub mqtt: MqttSettings,
    pub ftp: FtpSettings,
}

impl Default for PrinterConfig {
    /// Placeholder identity that passes validation; enough for the
    /// simulated printer, replace for real hardware.
    fn default() -> Self {
        Self {
            printer_id: "printer-01".into(),
            name: "Printer 1".into(),
            model: "Bambu Lab H2D".into(),
            host: "127.0.0.1".into(),
            access_code: "00000000".into(),
            serial: "0000000000".into(),
            mqtt: MqttSettings::default(),
            ftp: FtpSettings::default(),
        }
    }
}

impl PrinterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.printer_id.trim().is_empty() {
            return Err(PrintforgeError::Config("printer_id must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(PrintforgeError::Config("printer host must not be empty".into()));
        }
        if !(8..=16).contains(&self.access_code.len())
            || !self.access_code.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(PrintforgeError::Config(
                "access code must be 8-16 alphanumeric characters".into(),
            ));
        }
        if !(10..=20).contains(&self.serial.len()) {
            return Err(PrintforgeError::Config(
                "serial number must be 10-20 characters".into(),
            ));
        }
        if self.mqtt.port == 0 || self.ftp.port == 0 {
            return Err(PrintforgeError::Config("ports must be non-zero".into()));
        }
        check_range("mqtt.keepalive_secs", self.mqtt.keepalive_secs, 10, 3600)?;
        check_range("mqtt.timeout_secs", self.mqtt.timeout_secs, 5, 300)?;
        check_range("ftp.timeout_secs", self.ftp.timeout_secs, 5, 300)?;
        Ok(())
    }
}

/// Tuning for the background agent and its queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Location of the persisted queue document.
    pub queue_path: PathBuf,
    /// Seconds between control loop iterations.
    pub status_poll_interval_secs: f64,
    /// Failed attempts allowed per job before it is failed for good.
    pub max_retries: u32,
    /// First backoff delay for upload retries.
    pub retry_base_delay_secs: f64,
    /// Upper bound on a single upload backoff delay.
    pub retry_max_delay_secs: f64,
    /// Upload attempts per dispatch, including the first.
    pub upload_attempts: u32,
    pub connection_timeout_secs: u64,
    /// How often terminal jobs are trimmed.
    pub cleanup_interval_secs: u64,
    /// Completed and failed jobs kept (each) by the trim.
    pub keep_terminal_jobs: usize,
    /// Pause after an iteration fails unexpectedly.
    pub error_backoff_secs: f64,
    /// How long `stop` waits for the loop to finish.
    pub stop_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            queue_path: PathBuf::from("data/print_queue.json"),
            status_poll_interval_secs: 5.0,
            max_retries: 3,
            retry_base_delay_secs: 2.0,
            retry_max_delay_secs: 32.0,
            upload_attempts: 3,
            connection_timeout_secs: 30,
            cleanup_interval_secs: 3600,
            keep_terminal_jobs: 100,
            error_backoff_secs: 10.0,
            stop_timeout_secs: 60,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        check_range_f64(
            "status_poll_interval_secs",
            self.status_poll_interval_secs,
            1.0,
            60.0,
        )?;
        check_range("max_retries", self.max_retries, 0, 10)?;
        check_range_f64("retry_base_delay_secs", self.retry_base_delay_secs, 0.1, 60.0)?;
        check_range_f64(
            "retry_max_delay_secs",
            self.retry_max_delay_secs,
            self.retry_base_delay_secs,
            600.0,
        )?;
        check_range("upload_attempts", self.upload_attempts, 1, 10)?;
        check_range("connection_timeout_secs", self.connection_timeout_secs, 5, 300)?;
        check_range("cleanup_interval_secs", self.cleanup_interval_secs, 60, u64::MAX)?;
        check_range("keep_terminal_jobs", self.keep_terminal_jobs, 1, usize::MAX)?;
        check_range_f64("error_backoff_secs", self.error_backoff_secs, 0.0, 300.0)?;
        check_range("stop_timeout_secs", self.stop_timeout_secs, 1, 600)?;
        Ok(())
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.status_poll_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_base_delay_secs)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_max_delay_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.error_backoff_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

fn check_range<T>(name: &str, value: T, min: T, max: T) -> Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(PrintforgeError::Config(format!(
            "{name} = {value} is out of range [{min}, {max}]"
        )));
    }
    Ok(())
}

fn check_range_f64(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(PrintforgeError::Config(format!("{name} must be finite")));
    }
    check_range(name, value, min, max)
}
