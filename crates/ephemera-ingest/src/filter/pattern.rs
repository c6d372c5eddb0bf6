//! Filename rejection pattern with repeat-offender auto-block.
//!
//! Every rejection from a known address bumps that address's [`AbuseEntry`] in a
//! shared [`TimedEvictionSet`]. Once the count passes the threshold inside one
//! window the external block action fires exactly once and the entry is dropped.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{ContentFilter, FilterCandidate, FilterError, FilterErrorKind, Verdict, PRIORITY_HIGH};
use crate::error::{IngestError, IngestResult};
use crate::eviction::TimedEvictionSet;
use crate::metrics::IngestMetrics;

/// Rejection count for one address inside the tracking window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbuseEntry {
    /// Offending address.
    pub address: IpAddr,
    /// Rejections recorded since the entry was created.
    pub failures: u32,
}

/// External "block this address" hook.
#[async_trait]
pub trait BlockAction: Send + Sync {
    /// Block `address`, optionally purging data it uploaded.
    async fn block_address(&self, address: IpAddr, purge_related_data: bool) -> anyhow::Result<()>;
}

/// Block action that only records the decision in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBlockAction;

#[async_trait]
impl BlockAction for LoggingBlockAction {
    async fn block_address(&self, address: IpAddr, purge_related_data: bool) -> anyhow::Result<()> {
        warn!(%address, purge_related_data, "address blocked");
        Ok(())
    }
}

/// Auto-block wiring for [`RejectionPatternFilter`].
#[derive(Clone)]
pub struct AutoBlock {
    tracker: Arc<TimedEvictionSet<AbuseEntry>>,
    action: Arc<dyn BlockAction>,
    threshold: u32,
    purge_related: bool,
    metrics: Option<Arc<IngestMetrics>>,
}

impl AutoBlock {
    /// Block an address once its rejections exceed `threshold` within the tracker's TTL.
    pub fn new(
        tracker: Arc<TimedEvictionSet<AbuseEntry>>,
        action: Arc<dyn BlockAction>,
        threshold: u32,
        purge_related: bool,
    ) -> Self {
        Self {
            tracker,
            action,
            threshold,
            purge_related,
            metrics: None,
        }
    }

    /// Count triggered blocks in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, address: IpAddr) {
        let (id, entry) = self.tracker.upsert(
            |e| e.address == address,
            || AbuseEntry {
                address,
                failures: 1,
            },
            |e| e.failures += 1,
        );

        if entry.failures <= self.threshold {
            debug!(%address, failures = entry.failures, "rejection recorded");
            return;
        }
        // Concurrent rejections may all see the breach; only the one that removes the entry escalates.
        if !self.tracker.delete(id) {
            return;
        }

        info!(%address, failures = entry.failures, "auto-block threshold exceeded");
        if let Some(metrics) = &self.metrics {
            metrics.record_auto_block();
        }
        let action = self.action.clone();
        let purge = self.purge_related;
        tokio::spawn(async move {
            if let Err(e) = action.block_address(address, purge).await {
                warn!(%address, error = %e, "block action failed");
            }
        });
    }
}

/// Rejects uploads whose original filename matches a regular expression.
#[derive(Clone)]
pub struct RejectionPatternFilter {
    pattern: Regex,
    auto_block: Option<AutoBlock>,
}

impl RejectionPatternFilter {
    /// Compile `pattern`.
    pub fn new(pattern: &str) -> IngestResult<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| IngestError::Config(format!("rejection pattern: {e}")))?;
        Ok(Self {
            pattern,
            auto_block: None,
        })
    }

    /// Enable auto-block for repeat offenders.
    pub fn with_auto_block(mut self, auto_block: AutoBlock) -> Self {
        self.auto_block = Some(auto_block);
        self
    }
}

#[async_trait]
impl ContentFilter for RejectionPatternFilter {
    fn name(&self) -> &str {
        "rejection_pattern"
    }

    fn priority(&self) -> i32 {
        PRIORITY_HIGH
    }

    fn error_kind(&self) -> FilterErrorKind {
        FilterErrorKind::RejectedName
    }

    async fn check(&self, candidate: &FilterCandidate) -> Result<Verdict, FilterError> {
        if !self.pattern.is_match(&candidate.original_name) {
            return Ok(Verdict::Pass);
        }
        if let (Some(auto_block), Some(address)) = (&self.auto_block, candidate.client_addr) {
            auto_block.record(address);
        }
        Ok(Verdict::fail(
            self.error_kind(),
            format!("filename {:?} is not allowed", candidate.original_name),
        ))
    }
}
