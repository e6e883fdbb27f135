// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Printforge.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ErrorClass, JobId};

/// Top-level error type for all Printforge operations.
#[derive(Debug, Error)]
pub enum PrintforgeError {
    // -- Validation errors --
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("job already exists in queue: {0}")]
    DuplicateJob(JobId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("invalid configuration: {0}")]
    Config(String),

    // -- Device errors --
    #[error("printer connection failed: {0}")]
    Connection(String),

    #[error("printer authentication failed: {0}")]
    Authentication(String),

    #[error("transient printer failure: {0}")]
    Transient(String),

    #[error("upload size mismatch: expected {expected} bytes, printer has {actual}")]
    UploadMismatch { expected: u64, actual: u64 },

    #[error("printer rejected command: {0}")]
    Command(String),

    // -- Storage / persistence --
    #[error("queue persistence error: {0}")]
    Queue(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PrintforgeError {
    /// Whether this error means the printer could not be reached at all.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Classify this error for retry decisions.
    ///
    /// Only transient failures are retried; bad credentials, rejected
    /// commands and validation problems will not improve on a second try.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::UploadMismatch { .. } => ErrorClass::Transient,

            Self::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },

            Self::Validation(_)
            | Self::InvalidArtifact { .. }
            | Self::DuplicateJob(_)
            | Self::JobNotFound(_)
            | Self::Config(_)
            | Self::Connection(_)
            | Self::Authentication(_)
            | Self::Command(_)
            | Self::Queue(_)
            | Self::Serialization(_) => ErrorClass::Permanent,
        }
    }

    /// Short machine-readable code stored on failed job records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvalidArtifact { .. } => "invalid_artifact",
            Self::DuplicateJob(_) => "duplicate_job",
            Self::JobNotFound(_) => "job_not_found",
            Self::Config(_) => "config",
            Self::Connection(_) => "connection",
            Self::Authentication(_) => "authentication",
            Self::Transient(_) => "transient",
            Self::UploadMismatch { .. } => "upload_mismatch",
            Self::Command(_) => "command",
            Self::Queue(_) => "queue",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PrintforgeError>;
