//! Anti-malware filter over every available scan engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use super::{ContentFilter, FilterCandidate, FilterError, FilterErrorKind, Verdict, PRIORITY_MEDIUM};
use crate::scan::{ScanEngine, ScanEngineRegistry, ScanError, ScanOutcome};

/// Runs every enabled engine and fails on any detection or engine error.
#[derive(Clone)]
pub struct ScanFilter {
    engines: Vec<Arc<dyn ScanEngine>>,
    timeout: Duration,
}

impl ScanFilter {
    /// Scan with the registry's available engines, bounding each call by `timeout`.
    pub fn new(registry: &ScanEngineRegistry, timeout: Duration) -> Self {
        Self {
            engines: registry.available(),
            timeout,
        }
    }

    /// Number of engines this filter runs.
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    async fn scan_one(
        &self,
        engine: &Arc<dyn ScanEngine>,
        candidate: &FilterCandidate,
    ) -> Result<ScanOutcome, ScanError> {
        match tokio::time::timeout(self.timeout, engine.scan(&candidate.path)).await {
            Ok(result) => result,
            Err(_) => Err(ScanError::Timeout {
                engine: engine.name().to_string(),
                after: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl ContentFilter for ScanFilter {
    fn name(&self) -> &str {
        "scan"
    }

    fn priority(&self) -> i32 {
        PRIORITY_MEDIUM
    }

    fn error_kind(&self) -> FilterErrorKind {
        FilterErrorKind::MalwareDetected
    }

    async fn check(&self, candidate: &FilterCandidate) -> Result<Verdict, FilterError> {
        let results = join_all(
            self.engines
                .iter()
                .map(|engine| async move { (engine.name(), self.scan_one(engine, candidate).await) }),
        )
        .await;

        let mut detections = Vec::new();
        let mut errors = Vec::new();
        for (engine, result) in results {
            match result {
                Ok(ScanOutcome::Clean) => debug!(engine, "scan clean"),
                Ok(ScanOutcome::Infected { signature }) => {
                    warn!(engine, %signature, name = %candidate.original_name, "malware detected");
                    detections.push(format!("{engine} detected {signature}"));
                }
                Err(e) => {
                    warn!(engine, error = %e, "scan engine failed");
                    errors.push(format!("{engine}: {e}"));
                }
            }
        }

        if !detections.is_empty() {
            detections.extend(errors);
            return Ok(Verdict::fail(self.error_kind(), detections.join("; ")));
        }
        if !errors.is_empty() {
            return Ok(Verdict::fail(FilterErrorKind::ScanEngineFailure, errors.join("; ")));
        }
        Ok(Verdict::Pass)
    }
}
