#![warn(missing_docs)]

//! Ephemera ingestion subsystem: streaming upload store, content filters, size-dependent retention, encryption at rest
//!
//! Ingest path: Body → Store (size ceiling) → Filter chain → Retention → Encrypt (optional) → Catalog
//! Read path:   Catalog → Verify password → Decrypt → Data

pub mod catalog;
pub mod cli;
pub mod config;
pub mod encryption;
pub mod error;
pub mod eviction;
pub mod filter;
pub mod ingest;
pub mod metrics;
pub mod retention;
pub mod scan;
pub mod store;

pub use catalog::{ArtifactDescriptor, InMemoryCatalog, MetadataCatalog, UploadTier};
pub use config::IngestConfig;
pub use encryption::{EncryptionCodec, EncryptionKey, SealedArtifact};
pub use error::{IngestError, IngestResult};
pub use eviction::{EntryId, TimedEvictionSet};
pub use filter::{
    BlockAction, ContentFilter, FilterChain, FilterCandidate, FilterErrorKind, FilterFailure,
    LoggingBlockAction, Verdict,
};
pub use ingest::{IncomingUpload, IngestReceipt, IngestionOrchestrator};
pub use metrics::{IngestMetrics, IngestMetricsSnapshot};
pub use retention::{compute_expiry, RetentionWindow, TierLimits, UnboundedRetention};
pub use scan::{ScanEngine, ScanEngineRegistry, ScanOutcome};
pub use store::{SizeLimit, StoredArtifact, StreamingStore};
