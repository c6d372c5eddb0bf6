//! Atomic counters for the ingestion pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Thread-safe ingestion counters, shared across concurrent requests.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    accepted: AtomicU64,
    bytes_stored: AtomicU64,
    rejected_size: AtomicU64,
    rejected_filter: AtomicU64,
    scan_failures: AtomicU64,
    aborted: AtomicU64,
    encrypted: AtomicU64,
    auto_blocks: AtomicU64,
}

/// Point-in-time copy of [`IngestMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestMetricsSnapshot {
    /// Uploads accepted and recorded.
    pub accepted: u64,
    /// Plaintext bytes of accepted uploads.
    pub bytes_stored: u64,
    /// Uploads over the size ceiling.
    pub rejected_size: u64,
    /// Uploads rejected by a content filter.
    pub rejected_filter: u64,
    /// Uploads failed because no scan verdict could be reached.
    pub scan_failures: u64,
    /// Uploads abandoned by the client.
    pub aborted: u64,
    /// Accepted uploads encrypted at rest.
    pub encrypted: u64,
    /// Addresses handed to the block action.
    pub auto_blocks: u64,
}

impl IngestMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted upload of `bytes` plaintext bytes.
    #[inline]
    pub fn record_accepted(&self, bytes: u64, encrypted: bool) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
        if encrypted {
            self.encrypted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a size rejection.
    #[inline]
    pub fn record_rejected_size(&self) {
        self.rejected_size.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a filter rejection.
    #[inline]
    pub fn record_rejected_filter(&self) {
        self.rejected_filter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a scan engine failure.
    #[inline]
    pub fn record_scan_failure(&self) {
        self.scan_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a client abort.
    #[inline]
    pub fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an auto-block escalation.
    #[inline]
    pub fn record_auto_block(&self) {
        self.auto_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            rejected_size: self.rejected_size.load(Ordering::Relaxed),
            rejected_filter: self.rejected_filter.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            encrypted: self.encrypted.load(Ordering::Relaxed),
            auto_blocks: self.auto_blocks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let m = IngestMetrics::new();
        m.record_accepted(100, false);
        m.record_accepted(50, true);
        m.record_rejected_size();
        m.record_auto_block();

        let s = m.snapshot();
        assert_eq!(s.accepted, 2);
        assert_eq!(s.bytes_stored, 150);
        assert_eq!(s.encrypted, 1);
        assert_eq!(s.rejected_size, 1);
        assert_eq!(s.auto_blocks, 1);
        assert_eq!(s.rejected_filter, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        let m = Arc::new(IngestMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_rejected_filter();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.snapshot().rejected_filter, 8000);
    }
}
