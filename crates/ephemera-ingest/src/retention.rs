//! Size-dependent retention: bigger files expire sooner.
//!
//! For a size-limited tier the retention duration is
//! `min + (max - min) * (1 - r^3)` where `r = size / max_upload_size`.
//! Small and medium files (up to about half the ceiling) keep nearly the full
//! `max` retention; the curve drops steeply toward `min` as `r` approaches 1.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::SizeLimit;

/// Inclusive `[min, max]` retention bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionWindow {
    /// Retention for files at the size ceiling.
    pub min: Duration,
    /// Retention for empty files.
    pub max: Duration,
}

impl RetentionWindow {
    /// Build a window. An inverted pair collapses to `[min, min]`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Clamp `duration` into the window. A window deserialized with `min > max`
    /// yields `max`.
    pub fn clamp(&self, duration: Duration) -> Duration {
        duration.max(self.min).min(self.max)
    }
}

/// Retention for tiers without a size ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnboundedRetention {
    /// Every file lives exactly this long.
    Fixed(Duration),
    /// Files never expire on their own.
    Unlimited,
}

/// Per-tier size and retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierLimits {
    /// Finite ceiling; retention follows the size curve.
    Limited {
        /// Largest accepted upload in bytes.
        max_upload_size: u64,
        /// Retention bounds.
        window: RetentionWindow,
    },
    /// No ceiling; retention is a fixed policy.
    Unbounded {
        /// Retention policy.
        retention: UnboundedRetention,
    },
}

impl TierLimits {
    /// The size ceiling the streaming store enforces for this tier.
    pub fn size_limit(&self) -> SizeLimit {
        match self {
            TierLimits::Limited {
                max_upload_size, ..
            } => SizeLimit::Limited(*max_upload_size),
            TierLimits::Unbounded { .. } => SizeLimit::Unbounded,
        }
    }
}

/// Retention duration for a file of `file_size` bytes.
pub fn retention_duration(file_size: u64, max_upload_size: u64, window: RetentionWindow) -> Duration {
    let ratio = if max_upload_size == 0 {
        1.0
    } else {
        (file_size as f64 / max_upload_size as f64).clamp(0.0, 1.0)
    };
    let min = window.min.as_secs_f64();
    let span = window.max.as_secs_f64() - min;
    let secs = (min + span * (1.0 - ratio.powi(3))).max(0.0);
    // Bounds near u64::MAX seconds round past the representable range in f64.
    let duration = Duration::try_from_secs_f64(secs).unwrap_or(window.max);
    window.clamp(duration)
}

/// Expiry instant on a size-limited curve with explicit bounds.
pub fn compute_expiry_within(
    file_size: u64,
    max_upload_size: u64,
    min_retention: Duration,
    max_retention: Duration,
    uploaded_at: DateTime<Utc>,
) -> DateTime<Utc> {
    let window = RetentionWindow::new(min_retention, max_retention);
    add_duration(
        uploaded_at,
        retention_duration(file_size, max_upload_size, window),
    )
}

/// Expiry instant for a file under the given tier. `None` means it never expires.
pub fn compute_expiry(
    file_size: u64,
    limits: &TierLimits,
    uploaded_at: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    resolve_expiry(file_size, limits, uploaded_at, None)
}

/// Like [`compute_expiry`], but an explicit user retention takes precedence.
///
/// The override skips the size curve and is clamped to the tier's bounds: the
/// window for limited tiers, the fixed duration for a fixed unbounded policy.
/// Only an unlimited policy accepts the override as given.
pub fn resolve_expiry(
    file_size: u64,
    limits: &TierLimits,
    uploaded_at: DateTime<Utc>,
    custom: Option<Duration>,
) -> Option<DateTime<Utc>> {
    let duration = match (limits, custom) {
        (TierLimits::Limited { window, .. }, Some(custom)) => window.clamp(custom),
        (
            TierLimits::Limited {
                max_upload_size,
                window,
            },
            None,
        ) => retention_duration(file_size, *max_upload_size, *window),
        (TierLimits::Unbounded { retention }, custom) => match (retention, custom) {
            (UnboundedRetention::Fixed(fixed), Some(custom)) => custom.min(*fixed),
            (UnboundedRetention::Fixed(fixed), None) => *fixed,
            (UnboundedRetention::Unlimited, Some(custom)) => custom,
            (UnboundedRetention::Unlimited, None) => return None,
        },
    };
    Some(add_duration(uploaded_at, duration))
}

fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
