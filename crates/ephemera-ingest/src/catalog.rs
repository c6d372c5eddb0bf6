//! Artifact descriptors and the metadata catalog they are recorded in.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Which size and retention policy an upload falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTier {
    /// Bounded size, size-dependent retention.
    Limited,
    /// Unbounded size, fixed or no retention.
    Premium,
}

/// Everything the catalog stores about one accepted upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Random token, also the file name inside the storage directory.
    pub token: String,
    /// Location of the stored file.
    pub path: PathBuf,
    /// Name the client uploaded the file under.
    pub original_name: String,
    /// Type sniffed from the content.
    pub mime_type: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Size on disk, including the encryption header if any.
    pub stored_size: u64,
    /// When ingestion completed.
    pub uploaded_at: DateTime<Utc>,
    /// When the artifact should be removed. `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Argon2 PHC hash of the download password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Tier the upload was accepted under.
    pub tier: UploadTier,
}

impl ArtifactDescriptor {
    /// Whether a password is needed to read the artifact back.
    pub fn is_protected(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Whether the artifact is past its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Persistent record of accepted uploads.
#[async_trait]
pub trait MetadataCatalog: Send + Sync {
    /// Record a descriptor, returning its catalog id.
    async fn save_artifact_record(&self, descriptor: &ArtifactDescriptor) -> anyhow::Result<u64>;

    /// Fetch the descriptor recorded under `token`.
    async fn lookup_by_token(&self, token: &str) -> anyhow::Result<Option<ArtifactDescriptor>>;
}

/// Process-local catalog keyed by token.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    records: DashMap<String, (u64, ArtifactDescriptor)>,
    next_id: AtomicU64,
}

impl InMemoryCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded artifacts.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl MetadataCatalog for InMemoryCatalog {
    async fn save_artifact_record(&self, descriptor: &ArtifactDescriptor) -> anyhow::Result<u64> {
        if self.records.contains_key(&descriptor.token) {
            anyhow::bail!("token {} already recorded", descriptor.token);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.records
            .insert(descriptor.token.clone(), (id, descriptor.clone()));
        Ok(id)
    }

    async fn lookup_by_token(&self, token: &str) -> anyhow::Result<Option<ArtifactDescriptor>> {
        Ok(self.records.get(token).map(|entry| entry.value().1.clone()))
    }
}
