//! Ingestion orchestrator: store, filter, date, seal, record.
//!
//! Stages run strictly in that order. Once the store has written a file, any
//! later failure deletes it again before the error is returned, so a failed
//! ingestion never leaves an artifact behind. The same holds when the ingest
//! future is dropped part way: the file stays guarded until the catalog has
//! recorded it.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncRead;
use tracing::{error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::catalog::{ArtifactDescriptor, MetadataCatalog, UploadTier};
use crate::config::IngestConfig;
use crate::encryption::EncryptionCodec;
use crate::error::{IngestError, IngestResult};
use crate::eviction::TimedEvictionSet;
use crate::filter::mime::sniff_mime;
use crate::filter::{
    AbuseEntry, AutoBlock, BlockAction, ContentFilter, FilterCandidate, FilterChain, MimeFilter,
    RejectionPatternFilter, ScanFilter,
};
use crate::metrics::IngestMetrics;
use crate::retention::{resolve_expiry, TierLimits};
use crate::scan::ScanEngineRegistry;
use crate::store::{PartialFile, StoredArtifact, StreamingStore};

const DEFAULT_SNIFF_BYTES: usize = 8192;

/// One inbound upload, consumed by [`IngestionOrchestrator::ingest`].
pub struct IncomingUpload<R> {
    /// Request body.
    pub body: R,
    /// Content length announced by the client, if any.
    pub declared_length: Option<u64>,
    /// Filename supplied by the client.
    pub original_name: String,
    /// Size and retention tier.
    pub tier: UploadTier,
    /// Uploader's network address.
    pub client_addr: Option<IpAddr>,
    /// Download password; the artifact is encrypted at rest when set.
    pub password: Option<Zeroizing<String>>,
    /// Requested retention, clamped to the tier's bounds.
    pub custom_retention: Option<Duration>,
}

impl<R> IncomingUpload<R> {
    /// A limited-tier upload with no optional fields set.
    pub fn new(body: R, original_name: impl Into<String>) -> Self {
        Self {
            body,
            declared_length: None,
            original_name: original_name.into(),
            tier: UploadTier::Limited,
            client_addr: None,
            password: None,
            custom_retention: None,
        }
    }

    /// Set the announced content length.
    pub fn with_declared_length(mut self, length: u64) -> Self {
        self.declared_length = Some(length);
        self
    }

    /// Set the tier.
    pub fn with_tier(mut self, tier: UploadTier) -> Self {
        self.tier = tier;
        self
    }

    /// Set the uploader's address.
    pub fn from_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Protect the artifact with a password. An empty password is ignored.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Request a specific retention.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.custom_retention = Some(retention);
        self
    }
}

/// Result of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    /// Catalog id of the new record.
    pub id: u64,
    /// What was recorded.
    pub descriptor: ArtifactDescriptor,
}

/// Runs every upload through the pipeline and records accepted artifacts.
pub struct IngestionOrchestrator {
    store: StreamingStore,
    chain: FilterChain,
    codec: EncryptionCodec,
    catalog: Arc<dyn MetadataCatalog>,
    limited: TierLimits,
    premium: TierLimits,
    sniff_bytes: usize,
    metrics: Arc<IngestMetrics>,
}

impl IngestionOrchestrator {
    /// Assemble from explicit parts.
    pub fn new(
        store: StreamingStore,
        chain: FilterChain,
        codec: EncryptionCodec,
        catalog: Arc<dyn MetadataCatalog>,
        limited: TierLimits,
        premium: TierLimits,
    ) -> Self {
        Self {
            store,
            chain,
            codec,
            catalog,
            limited,
            premium,
            sniff_bytes: DEFAULT_SNIFF_BYTES,
            metrics: Arc::new(IngestMetrics::new()),
        }
    }

    /// Share `metrics` instead of a private set of counters.
    pub fn with_metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Bytes read when sniffing the stored content type.
    pub fn with_sniff_bytes(mut self, sniff_bytes: usize) -> Self {
        self.sniff_bytes = sniff_bytes.max(1);
        self
    }

    /// Build the full pipeline from settings.
    ///
    /// The rejection filter is installed only when a pattern is configured, and
    /// the scan filter only when at least one engine can run on this host.
    /// Must be called from within a tokio runtime when auto-block is enabled.
    pub fn from_config(
        config: &IngestConfig,
        catalog: Arc<dyn MetadataCatalog>,
        block_action: Arc<dyn BlockAction>,
    ) -> IngestResult<Self> {
        config.validate()?;
        let metrics = Arc::new(IngestMetrics::new());
        let mut filters: Vec<Arc<dyn ContentFilter>> = Vec::new();

        if let Some(pattern) = &config.rejection.pattern {
            let mut filter = RejectionPatternFilter::new(pattern)?;
            if config.rejection.auto_block {
                let tracker = Arc::new(TimedEvictionSet::<AbuseEntry>::new(Duration::from_secs(
                    config.rejection.window_secs,
                )));
                let auto_block = AutoBlock::new(
                    tracker,
                    block_action,
                    config.rejection.threshold,
                    config.rejection.purge_related,
                )
                .with_metrics(metrics.clone());
                filter = filter.with_auto_block(auto_block);
            }
            filters.push(Arc::new(filter));
        }

        let registry = ScanEngineRegistry::from_config(&config.scanner)?;
        let scan = ScanFilter::new(&registry, config.scanner.timeout());
        if scan.engine_count() > 0 {
            filters.push(Arc::new(scan));
        } else if !registry.is_empty() {
            warn!("no configured scan engine is available, uploads will not be scanned");
        }

        if !config.mime.denied_types.is_empty() {
            filters.push(Arc::new(MimeFilter::new(
                &config.mime.denied_types,
                config.mime.sniff_bytes,
            )));
        }

        let chain = FilterChain::new(filters);
        info!(filters = ?chain.names(), "filter chain assembled");

        Ok(Self::new(
            StreamingStore::new(&config.storage_dir, config.chunk_size),
            chain,
            EncryptionCodec::new(config.kdf),
            catalog,
            config.limited_limits(),
            config.premium_limits(),
        )
        .with_metrics(metrics)
        .with_sniff_bytes(config.mime.sniff_bytes))
    }

    /// Counters for this pipeline.
    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    /// The assembled filter chain.
    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// Limits applied to uploads of `tier`.
    pub fn limits_for(&self, tier: UploadTier) -> &TierLimits {
        match tier {
            UploadTier::Limited => &self.limited,
            UploadTier::Premium => &self.premium,
        }
    }

    /// Ingest one upload end to end.
    #[instrument(
        skip(self, upload),
        fields(name = %upload.original_name, tier = ?upload.tier, client = ?upload.client_addr)
    )]
    pub async fn ingest<R>(&self, upload: IncomingUpload<R>) -> IngestResult<IngestReceipt>
    where
        R: AsyncRead + Unpin + Send,
    {
        let IncomingUpload {
            body,
            declared_length,
            original_name,
            tier,
            client_addr,
            password,
            custom_retention,
        } = upload;
        let limits = *self.limits_for(tier);

        let mut artifact = match self
            .store
            .store(body, declared_length, limits.size_limit())
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };

        let password = password.filter(|p| !p.is_empty());
        let pending = PendingArtifact {
            original_name,
            tier,
            client_addr,
            password,
            custom_retention,
            limits,
        };

        let guard = PartialFile::new(artifact.path.clone());
        match self.finish(&artifact, pending).await {
            Ok(receipt) => {
                guard.commit();
                Ok(receipt)
            }
            Err(e) => {
                if let Err(cleanup) = artifact.discard().await {
                    error!(path = %artifact.path.display(), error = %cleanup, "failed to remove artifact after rejection");
                }
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn finish(&self, artifact: &StoredArtifact, pending: PendingArtifact) -> IngestResult<IngestReceipt> {
        let candidate = FilterCandidate {
            path: artifact.path.clone(),
            original_name: pending.original_name.clone(),
            size: artifact.size,
            client_addr: pending.client_addr,
        };
        self.chain.enforce(&candidate).await?;

        let mime_type = sniff_mime(&artifact.path, self.sniff_bytes).await?;
        let uploaded_at = Utc::now();
        let expires_at = resolve_expiry(
            artifact.size,
            &pending.limits,
            uploaded_at,
            pending.custom_retention,
        );

        let sealed = self
            .codec
            .seal(&artifact.path, pending.password.as_deref().map(String::as_str))
            .await?;
        let encrypted = sealed.is_some();
        let (password_hash, stored_size) = match sealed {
            Some(sealed) => (Some(sealed.password_hash), sealed.stored_size),
            None => (None, artifact.size),
        };

        let descriptor = ArtifactDescriptor {
            token: artifact.token.clone(),
            path: artifact.path.clone(),
            original_name: pending.original_name,
            mime_type: mime_type.to_string(),
            size: artifact.size,
            stored_size,
            uploaded_at,
            expires_at,
            password_hash,
            tier: pending.tier,
        };
        let id = self
            .catalog
            .save_artifact_record(&descriptor)
            .await
            .map_err(|e| IngestError::Catalog(format!("{e:#}")))?;

        self.metrics.record_accepted(artifact.size, encrypted);
        info!(
            id,
            token = %descriptor.token,
            size = descriptor.size,
            mime = %descriptor.mime_type,
            expires_at = ?descriptor.expires_at,
            encrypted,
            "upload accepted"
        );
        Ok(IngestReceipt { id, descriptor })
    }

    fn record_failure(&self, err: &IngestError) {
        match err {
            IngestError::PayloadTooLarge { .. } => self.metrics.record_rejected_size(),
            IngestError::FilterRejected { .. } => self.metrics.record_rejected_filter(),
            IngestError::ScanEngineFailure(_) => self.metrics.record_scan_failure(),
            IngestError::UploadAborted { .. } => self.metrics.record_aborted(),
            _ => {}
        }
        warn!(kind = err.kind(), error = %err, "ingestion failed");
    }

    /// Read back a recorded artifact, decrypting it when protected.
    #[instrument(skip(self, descriptor, password), fields(token = %descriptor.token))]
    pub async fn decrypt_artifact(
        &self,
        descriptor: &ArtifactDescriptor,
        password: Option<&str>,
    ) -> IngestResult<Vec<u8>> {
        let password = password.filter(|p| !p.is_empty());
        self.codec
            .open(&descriptor.path, descriptor.password_hash.as_deref(), password)
            .await
            .map_err(|e| match e {
                IngestError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    IngestError::NotFound(descriptor.token.clone())
                }
                other => other,
            })
    }

    /// Look `token` up in the catalog and read the artifact back.
    pub async fn decrypt_by_token(&self, token: &str, password: Option<&str>) -> IngestResult<Vec<u8>> {
        let descriptor = self
            .catalog
            .lookup_by_token(token)
            .await
            .map_err(|e| IngestError::Catalog(format!("{e:#}")))?
            .ok_or_else(|| IngestError::NotFound(token.to_string()))?;
        self.decrypt_artifact(&descriptor, password).await
    }
}

struct PendingArtifact {
    original_name: String,
    tier: UploadTier,
    client_addr: Option<IpAddr>,
    password: Option<Zeroizing<String>>,
    custom_retention: Option<Duration>,
    limits: TierLimits,
}
