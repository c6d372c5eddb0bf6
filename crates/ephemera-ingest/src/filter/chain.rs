//! Priority-ordered filter chain with fail-fast cleanup.

use std::any::Any;
use std::cmp::Reverse;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, error, warn};

use super::{ContentFilter, FilterCandidate, FilterErrorKind, FilterFailure, Verdict};
use crate::error::{IngestError, IngestResult};
use crate::store::discard;

/// Result of running every filter once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    /// Filters that passed, in priority order.
    pub passed: Vec<String>,
    /// Filters that failed, in priority order.
    pub failures: Vec<FilterFailure>,
}

impl ChainReport {
    /// True when no filter failed.
    pub fn is_pass(&self) -> bool {
        self.failures.is_empty()
    }
}

/// An explicit, priority-sorted list of filters.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn ContentFilter>>,
}

impl FilterChain {
    /// Build a chain; filters are sorted once by descending priority.
    pub fn new(mut filters: Vec<Arc<dyn ContentFilter>>) -> Self {
        filters.sort_by_key(|f| Reverse(f.priority()));
        Self { filters }
    }

    /// Filter names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Number of registered filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the chain has no filters.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run all filters concurrently and collect every failure.
    ///
    /// A filter that panics is reported as an `Internal` failure.
    pub async fn run(&self, candidate: &FilterCandidate) -> ChainReport {
        let outcomes = join_all(self.filters.iter().map(|filter| async move {
            let outcome = AssertUnwindSafe(filter.check(candidate)).catch_unwind().await;
            (filter, outcome)
        }))
        .await;

        let mut report = ChainReport::default();
        for (filter, outcome) in outcomes {
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let message = format!("filter panicked: {}", panic_message(panic.as_ref()));
                    error!(filter = filter.name(), %message, "filter failed");
                    report.failures.push(FilterFailure {
                        filter: filter.name().to_string(),
                        kind: FilterErrorKind::Internal,
                        message,
                    });
                    continue;
                }
            };
            match outcome {
                Ok(Verdict::Pass) => report.passed.push(filter.name().to_string()),
                Ok(Verdict::Fail { kind, message }) => {
                    debug!(filter = filter.name(), ?kind, %message, "filter rejected upload");
                    report.failures.push(FilterFailure {
                        filter: filter.name().to_string(),
                        kind,
                        message,
                    });
                }
                Err(e) => {
                    error!(filter = filter.name(), error = %e, "filter failed");
                    report.failures.push(FilterFailure {
                        filter: filter.name().to_string(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Run the chain; on failure delete the candidate file and return the rejection.
    pub async fn enforce(&self, candidate: &FilterCandidate) -> IngestResult<ChainReport> {
        let report = self.run(candidate).await;
        if report.is_pass() {
            return Ok(report);
        }
        if let Err(e) = discard(&candidate.path).await {
            // The rejection still stands; surface the leftover file in logs.
            error!(path = %candidate.path.display(), error = %e, "failed to remove rejected upload");
        }
        warn!(
            name = %candidate.original_name,
            failures = report.failures.len(),
            "upload rejected by filter chain"
        );
        Err(IngestError::from_failures(report.failures))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterError, FilterErrorKind};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixed {
        name: &'static str,
        priority: i32,
        outcome: fn() -> Result<Verdict, FilterError>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, priority: i32, outcome: fn() -> Result<Verdict, FilterError>) -> Arc<Self> {
            Arc::new(Self {
                name,
                priority,
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ContentFilter for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn error_kind(&self) -> FilterErrorKind {
            FilterErrorKind::Internal
        }
        async fn check(&self, _candidate: &FilterCandidate) -> Result<Verdict, FilterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()
        }
    }

    fn pass() -> Result<Verdict, FilterError> {
        Ok(Verdict::Pass)
    }

    fn reject() -> Result<Verdict, FilterError> {
        Ok(Verdict::fail(FilterErrorKind::RejectedName, "nope"))
    }

    fn explode() -> Result<Verdict, FilterError> {
        Err(FilterError::Other("exploded".into()))
    }

    fn panics() -> Result<Verdict, FilterError> {
        panic!("filter bug")
    }

    fn candidate(path: PathBuf) -> FilterCandidate {
        FilterCandidate {
            path,
            original_name: "file.bin".into(),
            size: 4,
            client_addr: None,
        }
    }

    #[test]
    fn test_sorted_by_descending_priority() {
        let chain = FilterChain::new(vec![
            Fixed::new("low", 1, pass),
            Fixed::new("high", 100, pass),
            Fixed::new("mid", 50, pass),
        ]);
        assert_eq!(chain.names(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_collects_all_failures_and_runs_everything() {
        let low = Fixed::new("low", 1, reject);
        let mid = Fixed::new("mid", 50, pass);
        let high = Fixed::new("high", 100, reject);
        let chain = FilterChain::new(vec![low.clone(), mid.clone(), high.clone()]);

        let report = chain.run(&candidate(PathBuf::from("/nonexistent"))).await;

        assert_eq!(report.passed, vec!["mid".to_string()]);
        let failed: Vec<_> = report.failures.iter().map(|f| f.filter.as_str()).collect();
        assert_eq!(failed, vec!["high", "low"]);
        for f in [&low, &mid, &high] {
            assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_enforce_removes_file_on_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload");
        std::fs::write(&path, b"data").unwrap();
        let chain = FilterChain::new(vec![Fixed::new("reject", 1, reject)]);

        let err = chain.enforce(&candidate(path.clone())).await.unwrap_err();

        assert!(matches!(err, IngestError::FilterRejected { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_filter_error_is_hard_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload");
        std::fs::write(&path, b"data").unwrap();
        let chain = FilterChain::new(vec![Fixed::new("ok", 2, pass), Fixed::new("boom", 1, explode)]);

        let err = chain.enforce(&candidate(path.clone())).await.unwrap_err();

        match err {
            IngestError::FilterRejected { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].kind, FilterErrorKind::Internal);
                assert!(failures[0].message.contains("exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_panicking_filter_still_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload");
        std::fs::write(&path, b"data").unwrap();
        let ok = Fixed::new("ok", 2, pass);
        let chain = FilterChain::new(vec![ok.clone(), Fixed::new("buggy", 1, panics)]);

        let err = chain.enforce(&candidate(path.clone())).await.unwrap_err();

        match err {
            IngestError::FilterRejected { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].filter, "buggy");
                assert_eq!(failures[0].kind, FilterErrorKind::Internal);
                assert!(failures[0].message.contains("filter bug"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_enforce_on_missing_file_is_quiet() {
        let chain = FilterChain::new(vec![Fixed::new("reject", 1, reject)]);
        let err = chain
            .enforce(&candidate(PathBuf::from("/nonexistent/ephemera/upload")))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::FilterRejected { .. }));
    }

    #[tokio::test]
    async fn test_empty_chain_passes() {
        let chain = FilterChain::default();
        assert!(chain.is_empty());
        let report = chain
            .enforce(&candidate(PathBuf::from("/nonexistent")))
            .await
            .unwrap();
        assert!(report.is_pass());
    }
}
