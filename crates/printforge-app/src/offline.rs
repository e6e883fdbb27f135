// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Placeholder device for commands that only touch the queue.
//
// Every device operation fails with `Connection`; a hardware adapter is
// supplied by an embedding application, and `run --simulate` uses the
// in-process simulator instead.

use std::path::Path;

use async_trait::async_trait;

use printforge_core::error::{PrintforgeError, Result};
use printforge_core::types::PrinterStatus;
use printforge_print::DeviceAdapter;

/// Device adapter with no printer behind it.
pub struct OfflinePrinter {
    printer_id: String,
}

impl OfflinePrinter {
    pub fn new(printer_id: impl Into<String>) -> Self {
        Self {
            printer_id: printer_id.into(),
        }
    }

    fn unavailable(&self, operation: &str) -> PrintforgeError {
        tracing::debug!(operation, "device operation on offline printer");
        PrintforgeError::Connection(format!(
            "no device adapter for {} in this build (use `run --simulate`)",
            self.printer_id
        ))
    }
}

#[async_trait]
impl DeviceAdapter for OfflinePrinter {
    fn printer_id(&self) -> &str {
        &self.printer_id
    }

    async fn connect(&self) -> Result<()> {
        tracing::warn!("connect called on offline printer");
        Err(self.unavailable("connect"))
    }

    async fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        false
    }

    async fn upload(&self, _local_path: &Path, _remote_name: &str) -> Result<()> {
        Err(self.unavailable("upload"))
    }

    async fn start_print(&self, _remote_name: &str) -> Result<()> {
        Err(self.unavailable("start_print"))
    }

    async fn pause(&self) -> Result<()> {
        Err(self.unavailable("pause"))
    }

    async fn resume(&self) -> Result<()> {
        Err(self.unavailable("resume"))
    }

    async fn cancel(&self) -> Result<()> {
        Err(self.unavailable("cancel"))
    }

    async fn status(&self) -> Result<PrinterStatus> {
        Err(self.unavailable("status"))
    }
}
