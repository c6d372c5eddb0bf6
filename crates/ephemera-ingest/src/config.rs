//! Ingestion settings: size tiers, retention bounds, filter rules, scanner and KDF parameters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::encryption::{MAX_HEADER_ITERATIONS, MAX_HEADER_MEMORY_KIB, MAX_HEADER_PARALLELISM};
use crate::error::{IngestError, IngestResult};
use crate::retention::{RetentionWindow, TierLimits, UnboundedRetention};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Top-level configuration for the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Directory stored artifacts are written to.
    pub storage_dir: PathBuf,
    /// Read buffer size for the streaming store, in bytes.
    pub chunk_size: usize,
    /// Size-limited (default) tier.
    pub limited_tier: LimitedTierConfig,
    /// Size-unbounded (premium) tier.
    pub premium_tier: PremiumTierConfig,
    /// Filename rejection and auto-block settings.
    pub rejection: RejectionConfig,
    /// MIME denylist settings.
    pub mime: MimeConfig,
    /// Anti-malware scanner settings.
    pub scanner: ScannerConfig,
    /// Password key-derivation cost parameters.
    pub kdf: KdfConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("/var/lib/ephemera/files"),
            chunk_size: 64 * 1024,
            limited_tier: LimitedTierConfig::default(),
            premium_tier: PremiumTierConfig::default(),
            rejection: RejectionConfig::default(),
            mime: MimeConfig::default(),
            scanner: ScannerConfig::default(),
            kdf: KdfConfig::default(),
        }
    }
}

/// Limits for ordinary uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitedTierConfig {
    /// Largest accepted upload in bytes.
    pub max_upload_size: u64,
    /// Retention given to the largest uploads, in seconds.
    pub min_retention_secs: u64,
    /// Retention given to the smallest uploads, in seconds.
    pub max_retention_secs: u64,
}

impl Default for LimitedTierConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 512 * 1024 * 1024,
            min_retention_secs: 30 * DAY_SECS,
            max_retention_secs: 365 * DAY_SECS,
        }
    }
}

/// Retention for uploads with no size ceiling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PremiumTierConfig {
    /// Fixed retention in seconds; `None` keeps files until explicitly removed.
    pub retention_secs: Option<u64>,
}

/// Filename rejection pattern and abuse auto-block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectionConfig {
    /// Regular expression matched against original filenames. `None` disables the filter.
    pub pattern: Option<String>,
    /// Track repeat offenders and block them past the threshold.
    pub auto_block: bool,
    /// Rejections tolerated inside one window before the address is blocked.
    pub threshold: u32,
    /// Length of the tracking window, in seconds.
    pub window_secs: u64,
    /// Ask the block action to also purge data uploaded from the address.
    pub purge_related: bool,
}

impl Default for RejectionConfig {
    fn default() -> Self {
        Self {
            pattern: None,
            auto_block: false,
            threshold: 10,
            window_secs: 10,
            purge_related: false,
        }
    }
}

/// Content-type denylist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MimeConfig {
    /// Denied types; `type/*` and `type/prefix*` wildcards are accepted.
    pub denied_types: Vec<String>,
    /// Leading bytes read for signature sniffing.
    pub sniff_bytes: usize,
}

impl Default for MimeConfig {
    fn default() -> Self {
        Self {
            denied_types: vec![
                "application/x-executable".to_string(),
                "application/vnd.microsoft.portable-executable".to_string(),
                "application/x-msdownload".to_string(),
            ],
            sniff_bytes: 8192,
        }
    }
}

/// Scan engine selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Engines in preference order.
    pub engines: Vec<ScanEngineConfig>,
    /// Upper bound on a single engine invocation, in seconds.
    pub timeout_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            engines: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl ScannerConfig {
    /// Per-engine timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One configured scan engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanEngineConfig {
    /// External scanner process; the file path is appended to `args`.
    Command {
        /// Engine name used in logs and failures.
        name: String,
        /// Executable to run (e.g. `clamdscan`).
        program: PathBuf,
        /// Arguments placed before the file path.
        #[serde(default)]
        args: Vec<String>,
        /// Disabled engines are skipped.
        #[serde(default = "enabled_by_default")]
        enabled: bool,
    },
    /// In-process byte signature matcher.
    Signature {
        /// Engine name used in logs and failures.
        name: String,
        /// Hex-encoded signatures keyed by detection name.
        #[serde(default)]
        signatures: Vec<SignatureConfig>,
        /// Also load the EICAR test signature.
        #[serde(default = "enabled_by_default")]
        include_eicar: bool,
        /// Disabled engines are skipped.
        #[serde(default = "enabled_by_default")]
        enabled: bool,
    },
}

fn enabled_by_default() -> bool {
    true
}

/// A named byte signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Detection name reported on a hit.
    pub name: String,
    /// Signature bytes, hex encoded.
    pub hex: String,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl IngestConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: IngestConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> IngestResult<()> {
        if self.chunk_size == 0 {
            return Err(IngestError::Config("chunk_size must be non-zero".into()));
        }
        let tier = &self.limited_tier;
        if tier.max_upload_size == 0 {
            return Err(IngestError::Config("max_upload_size must be non-zero".into()));
        }
        if tier.min_retention_secs > tier.max_retention_secs {
            return Err(IngestError::Config(format!(
                "min_retention_secs ({}) exceeds max_retention_secs ({})",
                tier.min_retention_secs, tier.max_retention_secs
            )));
        }
        if let Some(pattern) = &self.rejection.pattern {
            regex::Regex::new(pattern)
                .map_err(|e| IngestError::Config(format!("rejection pattern: {e}")))?;
        }
        if self.rejection.auto_block && self.rejection.window_secs == 0 {
            return Err(IngestError::Config("auto-block window must be non-zero".into()));
        }
        if self.mime.sniff_bytes == 0 {
            return Err(IngestError::Config("sniff_bytes must be non-zero".into()));
        }
        let kdf = &self.kdf;
        if kdf.memory_kib > MAX_HEADER_MEMORY_KIB
            || kdf.iterations > MAX_HEADER_ITERATIONS
            || kdf.parallelism > MAX_HEADER_PARALLELISM
        {
            return Err(IngestError::Config(format!(
                "kdf costs exceed what encrypted artifacts may carry (m<={MAX_HEADER_MEMORY_KIB}, t<={MAX_HEADER_ITERATIONS}, p<={MAX_HEADER_PARALLELISM})"
            )));
        }
        Ok(())
    }

    /// Size and retention limits for the limited tier.
    pub fn limited_limits(&self) -> TierLimits {
        TierLimits::Limited {
            max_upload_size: self.limited_tier.max_upload_size,
            window: RetentionWindow::new(
                Duration::from_secs(self.limited_tier.min_retention_secs),
                Duration::from_secs(self.limited_tier.max_retention_secs),
            ),
        }
    }

    /// Retention policy for the premium tier.
    pub fn premium_limits(&self) -> TierLimits {
        let retention = match self.premium_tier.retention_secs {
            Some(secs) => UnboundedRetention::Fixed(Duration::from_secs(secs)),
            None => UnboundedRetention::Unlimited,
        };
        TierLimits::Unbounded { retention }
    }
}
