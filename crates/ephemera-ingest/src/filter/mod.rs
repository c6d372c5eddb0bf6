//! Content filters applied to a stored upload before it is accepted.
//!
//! Filters are independent checks composed by [`chain::FilterChain`]. Each one
//! reports a [`Verdict`]; an `Err` from `check` counts as a hard failure of that
//! filter.

pub mod chain;
pub mod mime;
pub mod pattern;
pub mod scan;

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scan::ScanError;

pub use chain::{ChainReport, FilterChain};
pub use mime::MimeFilter;
pub use pattern::{AbuseEntry, AutoBlock, BlockAction, LoggingBlockAction, RejectionPatternFilter};
pub use scan::ScanFilter;

/// Priority of cheap checks that should run first.
pub const PRIORITY_HIGH: i32 = 100;
/// Priority of the malware scan.
pub const PRIORITY_MEDIUM: i32 = 50;
/// Priority of the content-type check.
pub const PRIORITY_LOW: i32 = 10;

/// The upload a filter inspects.
#[derive(Debug, Clone)]
pub struct FilterCandidate {
    /// Stored file on disk.
    pub path: PathBuf,
    /// Filename supplied by the client.
    pub original_name: String,
    /// Bytes on disk.
    pub size: u64,
    /// Network address of the uploader, when known.
    pub client_addr: Option<IpAddr>,
}

/// Category of a filter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterErrorKind {
    /// Filename matched the rejection pattern.
    RejectedName,
    /// Sniffed content type is denied.
    ForbiddenType,
    /// A scan engine reported a detection.
    MalwareDetected,
    /// A scan engine could not produce a verdict.
    ScanEngineFailure,
    /// A filter failed unexpectedly.
    Internal,
}

/// Outcome of one filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The upload is acceptable to this filter.
    Pass,
    /// The upload is rejected.
    Fail {
        /// Failure category.
        kind: FilterErrorKind,
        /// Human-readable reason.
        message: String,
    },
}

impl Verdict {
    /// Shorthand for a failing verdict.
    pub fn fail(kind: FilterErrorKind, message: impl Into<String>) -> Self {
        Verdict::Fail {
            kind,
            message: message.into(),
        }
    }

    /// Whether this is a pass.
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// One failed filter, as reported by the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterFailure {
    /// Name of the filter.
    pub filter: String,
    /// Failure category.
    pub kind: FilterErrorKind,
    /// Human-readable reason.
    pub message: String,
}

/// Unexpected error raised by a filter.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Reading the candidate failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A scan engine failed outside of its normal verdict reporting.
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl FilterError {
    /// Category recorded when this error fails a filter.
    pub fn kind(&self) -> FilterErrorKind {
        match self {
            FilterError::Scan(_) => FilterErrorKind::ScanEngineFailure,
            FilterError::Io(_) | FilterError::Other(_) => FilterErrorKind::Internal,
        }
    }
}

/// An accept/reject check over a stored upload.
#[async_trait]
pub trait ContentFilter: Send + Sync {
    /// Short name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Filters with higher priority are listed and started first.
    fn priority(&self) -> i32;

    /// Category reported when this filter rejects.
    fn error_kind(&self) -> FilterErrorKind;

    /// Inspect the candidate.
    async fn check(&self, candidate: &FilterCandidate) -> Result<Verdict, FilterError>;
}
