//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::filter::{FilterErrorKind, FilterFailure};

/// Result type alias for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Every way an ingestion, or a read back of a stored artifact, can fail.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Declared or streamed size exceeds the tier's ceiling.
    #[error("Payload too large: {observed} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Configured ceiling in bytes.
        limit: u64,
        /// Bytes declared or observed when the ceiling was crossed.
        observed: u64,
    },

    /// One or more content filters rejected the upload.
    #[error("Rejected by content filters: {}", describe_failures(.failures))]
    FilterRejected {
        /// Every filter that failed, in descending priority order.
        failures: Vec<FilterFailure>,
    },

    /// A scan engine could not produce a verdict (crash, timeout, bad exit code).
    #[error("Scan engine failure: {0}")]
    ScanEngineFailure(String),

    /// The artifact is password protected and no password was supplied.
    #[error("Authentication required: artifact is password protected")]
    AuthenticationRequired,

    /// The supplied password does not match.
    #[error("Authentication failed: wrong password")]
    AuthenticationFailed,

    /// The client went away before the upload finished.
    #[error("Upload aborted by client after {received} bytes")]
    UploadAborted {
        /// Bytes written before the stream broke.
        received: u64,
    },

    /// Key derivation or cipher setup failed.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// The metadata catalog rejected or failed a request.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Configuration is invalid (bad regex, inverted bounds, ...).
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No artifact is recorded under the given token.
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Disk or stream I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Stable machine-readable kind, suitable for HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::PayloadTooLarge { .. } => "payload_too_large",
            IngestError::FilterRejected { .. } => "filter_rejected",
            IngestError::ScanEngineFailure(_) => "scan_engine_failure",
            IngestError::AuthenticationRequired => "authentication_required",
            IngestError::AuthenticationFailed => "authentication_failed",
            IngestError::UploadAborted { .. } => "upload_aborted",
            IngestError::Encryption(_) => "encryption_error",
            IngestError::Catalog(_) => "catalog_error",
            IngestError::Config(_) => "invalid_config",
            IngestError::NotFound(_) => "not_found",
            IngestError::Io(_) => "io_failure",
        }
    }

    /// Build the chain-level error from a set of filter failures.
    ///
    /// When every failure is an engine failure the upload was never judged on
    /// its content, so the error is reported as `ScanEngineFailure`.
    pub(crate) fn from_failures(failures: Vec<FilterFailure>) -> Self {
        let engine_only = !failures.is_empty()
            && failures
                .iter()
                .all(|f| f.kind == FilterErrorKind::ScanEngineFailure);
        if engine_only {
            IngestError::ScanEngineFailure(describe_failures(&failures))
        } else {
            IngestError::FilterRejected { failures }
        }
    }
}

fn describe_failures(failures: &[FilterFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.filter, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}
