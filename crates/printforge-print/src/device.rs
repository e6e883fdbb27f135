// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Device adapter contract.
//
// The agent talks to a printer only through `DeviceAdapter`.  A concrete
// adapter owns the transport (control channel, file transfer) and turns raw
// device reports into `PrinterStatus`.  Everything it returns is already
// mapped onto the shared failure taxonomy so the agent can decide between
// "skip this iteration", "retry the job" and "fail the job".

use std::path::Path;

use async_trait::async_trait;

use printforge_core::error::{PrintforgeError, Result};
use printforge_core::types::PrinterStatus;

/// Operations the agent needs from a physical (or simulated) printer.
///
/// Implementations must be safe to share between the control loop and
/// callers of the agent's public API.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Identifier of the printer behind this adapter.
    fn printer_id(&self) -> &str;

    /// Open the control channel. Bad credentials are `Authentication`.
    async fn connect(&self) -> Result<()>;

    /// Close all channels. Never fails.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Transfer `local_path` to printer storage as `remote_name`.
    ///
    /// Implementations retry transient transfer failures themselves and
    /// verify the stored size before returning `Ok`.
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()>;

    /// Start printing a previously uploaded file.
    async fn start_print(&self, remote_name: &str) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Abort the current print.
    async fn cancel(&self) -> Result<()>;

    /// Latest status. `Connection` if the printer cannot be reached.
    async fn status(&self) -> Result<PrinterStatus>;
}

/// Compare the printer's stored size with the local size.
pub fn verify_upload_size(expected: u64, actual: u64) -> Result<()> {
    if expected != actual {
        return Err(PrintforgeError::UploadMismatch { expected, actual });
    }
    Ok(())
}

/// Map a transport error message onto the failure taxonomy.
///
/// File transfer servers report bad credentials as reply code 530; control
/// channels tend to say "not authorized".
pub fn classify_transport_error(detail: &str) -> PrintforgeError {
    let lower = detail.to_ascii_lowercase();

    if lower.starts_with("530")
        || lower.contains("login incorrect")
        || lower.contains("not authorized")
        || lower.contains("authentication")
        || lower.contains("access code")
    {
        return PrintforgeError::Authentication(detail.to_owned());
    }

    if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("temporarily")
        || lower.starts_with("421")
        || lower.starts_with("425")
        || lower.starts_with("426")
    {
        return PrintforgeError::Transient(detail.to_owned());
    }

    if lower.contains("connection refused")
        || lower.contains("unreachable")
        || lower.contains("no route")
        || lower.contains("not connected")
    {
        return PrintforgeError::Connection(detail.to_owned());
    }

    PrintforgeError::Command(detail.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_match_is_ok() {
        verify_upload_size(4096, 4096).expect("sizes match");
    }

    #[test]
    fn size_mismatch_is_reported() {
        let err = verify_upload_size(4096, 2048).unwrap_err();
        assert!(matches!(
            err,
            PrintforgeError::UploadMismatch {
                expected: 4096,
                actual: 2048
            }
        ));
    }

    #[test]
    fn ftp_530_is_authentication() {
        assert!(matches!(
            classify_transport_error("530 Login incorrect."),
            PrintforgeError::Authentication(_)
        ));
    }

    #[test]
    fn timeouts_are_transient() {
        assert!(matches!(
            classify_transport_error("data connection timed out"),
            PrintforgeError::Transient(_)
        ));
        assert!(matches!(
            classify_transport_error("426 Connection closed; transfer aborted"),
            PrintforgeError::Transient(_)
        ));
    }

    #[test]
    fn refused_is_connection() {
        assert!(classify_transport_error("connection refused").is_connection());
    }

    #[test]
    fn anything_else_is_command() {
        assert!(matches!(
            classify_transport_error("sdcard not present"),
            PrintforgeError::Command(_)
        ));
    }
}
