//! End-to-end ingestion through a config-built pipeline.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ephemera_ingest::config::{KdfConfig, ScanEngineConfig};
use ephemera_ingest::scan::EICAR_SIGNATURE;
use ephemera_ingest::store::reader_from_stream;
use ephemera_ingest::{
    BlockAction, FilterErrorKind, InMemoryCatalog, IncomingUpload, IngestConfig, IngestError,
    IngestionOrchestrator, MetadataCatalog, UploadTier,
};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingBlock {
    calls: AtomicUsize,
}

#[async_trait]
impl BlockAction for RecordingBlock {
    async fn block_address(&self, _address: IpAddr, _purge: bool) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn config(dir: &TempDir) -> IngestConfig {
    let mut config = IngestConfig {
        storage_dir: dir.path().join("files"),
        chunk_size: 1024,
        ..IngestConfig::default()
    };
    config.limited_tier.max_upload_size = 64 * 1024;
    config.rejection.pattern = Some(r"(?i)\.(scr|bat)$".into());
    config.rejection.auto_block = true;
    config.rejection.threshold = 2;
    config.rejection.window_secs = 60;
    config.scanner.engines = vec![ScanEngineConfig::Signature {
        name: "builtin".into(),
        signatures: vec![],
        include_eicar: true,
        enabled: true,
    }];
    config.kdf = KdfConfig {
        memory_kib: 256,
        iterations: 1,
        parallelism: 1,
    };
    config
}

fn file_count(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path().join("files"))
        .map(|d| d.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn streamed_body_is_accepted_and_recorded() {
    let dir = TempDir::new().unwrap();
    let catalog = Arc::new(InMemoryCatalog::new());
    let orch = IngestionOrchestrator::from_config(
        &config(&dir),
        catalog.clone(),
        Arc::new(RecordingBlock::default()),
    )
    .unwrap();

    let chunks: Vec<std::io::Result<Bytes>> = vec![
        Ok(Bytes::from_static(b"first chunk, ")),
        Ok(Bytes::from_static(b"second chunk")),
    ];
    let body = reader_from_stream(futures::stream::iter(chunks));
    let receipt = orch
        .ingest(IncomingUpload::new(body, "chunks.txt"))
        .await
        .unwrap();

    let recorded = catalog
        .lookup_by_token(&receipt.descriptor.token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recorded, receipt.descriptor);
    assert_eq!(
        std::fs::read(&recorded.path).unwrap(),
        b"first chunk, second chunk"
    );
    assert!(recorded.expires_at.is_some());
    assert_eq!(file_count(&dir), 1);
}

#[tokio::test]
async fn malware_is_rejected_and_removed() {
    let dir = TempDir::new().unwrap();
    let orch = IngestionOrchestrator::from_config(
        &config(&dir),
        Arc::new(InMemoryCatalog::new()),
        Arc::new(RecordingBlock::default()),
    )
    .unwrap();

    let mut payload = b"harmless prefix ".to_vec();
    payload.extend_from_slice(EICAR_SIGNATURE.as_bytes());
    let err = orch
        .ingest(IncomingUpload::new(payload.as_slice(), "readme.txt"))
        .await
        .unwrap_err();

    match err {
        IngestError::FilterRejected { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].kind, FilterErrorKind::MalwareDetected);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(file_count(&dir), 0);
    assert_eq!(orch.metrics().snapshot().rejected_filter, 1);
}

#[tokio::test]
async fn repeat_offender_is_blocked_once() {
    let dir = TempDir::new().unwrap();
    let block = Arc::new(RecordingBlock::default());
    let orch = IngestionOrchestrator::from_config(
        &config(&dir),
        Arc::new(InMemoryCatalog::new()),
        block.clone(),
    )
    .unwrap();
    let addr: IpAddr = "192.0.2.10".parse().unwrap();

    for _ in 0..4 {
        let body: &[u8] = b"@echo off";
        let result = orch
            .ingest(IncomingUpload::new(body, "run.bat").from_addr(addr))
            .await;
        assert!(matches!(result, Err(IngestError::FilterRejected { .. })));
    }
    // Let the detached block task run.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(block.calls.load(Ordering::SeqCst), 1);
    assert_eq!(orch.metrics().snapshot().auto_blocks, 1);
    assert_eq!(file_count(&dir), 0);
}

#[tokio::test]
async fn encrypted_upload_round_trips_through_catalog() {
    let dir = TempDir::new().unwrap();
    let orch = IngestionOrchestrator::from_config(
        &config(&dir),
        Arc::new(InMemoryCatalog::new()),
        Arc::new(RecordingBlock::default()),
    )
    .unwrap();

    let secret = vec![42u8; 10_000];
    let receipt = orch
        .ingest(
            IncomingUpload::new(secret.as_slice(), "blob.bin")
                .with_password("correct horse")
                .with_retention(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    let token = receipt.descriptor.token.clone();

    assert!(matches!(
        orch.decrypt_by_token(&token, None).await,
        Err(IngestError::AuthenticationRequired)
    ));
    assert!(matches!(
        orch.decrypt_by_token(&token, Some("battery staple")).await,
        Err(IngestError::AuthenticationFailed)
    ));
    assert_eq!(
        orch.decrypt_by_token(&token, Some("correct horse")).await.unwrap(),
        secret
    );
}

#[tokio::test]
async fn premium_tier_accepts_beyond_limited_ceiling() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.premium_tier.retention_secs = Some(7 * 24 * 3600);
    let orch = IngestionOrchestrator::from_config(
        &config,
        Arc::new(InMemoryCatalog::new()),
        Arc::new(RecordingBlock::default()),
    )
    .unwrap();

    let big = vec![1u8; 128 * 1024];
    let limited = orch
        .ingest(IncomingUpload::new(big.as_slice(), "big.bin").with_declared_length(big.len() as u64))
        .await;
    assert!(matches!(limited, Err(IngestError::PayloadTooLarge { .. })));

    let receipt = orch
        .ingest(IncomingUpload::new(big.as_slice(), "big.bin").with_tier(UploadTier::Premium))
        .await
        .unwrap();
    let d = receipt.descriptor;
    assert_eq!(d.size, big.len() as u64);
    assert_eq!(
        d.expires_at.unwrap() - d.uploaded_at,
        chrono::Duration::days(7)
    );
}
