//! `eph-ingest` command line: run one upload through the pipeline, preview
//! retention, or decrypt a stored artifact.

use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::catalog::{ArtifactDescriptor, InMemoryCatalog, UploadTier};
use crate::config::IngestConfig;
use crate::encryption::EncryptionCodec;
use crate::filter::LoggingBlockAction;
use crate::ingest::{IncomingUpload, IngestionOrchestrator};
use crate::metrics::IngestMetricsSnapshot;
use crate::retention::compute_expiry;

/// Top-level arguments.
#[derive(Debug, Parser)]
#[command(name = "eph-ingest")]
#[command(about = "Ephemera upload ingestion tool", long_about = None)]
pub struct Cli {
    /// Configuration file (`.toml` or `.json`). Defaults apply when absent.
    #[arg(short, long, env = "EPH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the configured storage directory.
    #[arg(short, long)]
    pub storage_dir: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest a local file and print the recorded descriptor.
    Ingest {
        /// File to upload.
        file: PathBuf,
        /// Original filename to record (defaults to the file's own name).
        #[arg(short, long)]
        name: Option<String>,
        /// Use the premium tier.
        #[arg(long)]
        premium: bool,
        /// Encrypt the stored artifact with this password.
        #[arg(short, long, env = "EPH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Requested retention in seconds.
        #[arg(long)]
        retention_secs: Option<u64>,
        /// Uploader address for abuse tracking.
        #[arg(long)]
        client_addr: Option<IpAddr>,
    },
    /// Print the expiry a file of the given size would get.
    Expiry {
        /// File size in bytes.
        #[arg(long)]
        size: u64,
        /// Use the premium tier.
        #[arg(long)]
        premium: bool,
        /// Upload instant (RFC 3339); now when omitted.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Decrypt a stored artifact.
    Decrypt {
        /// Encrypted file.
        stored: PathBuf,
        /// Password it was sealed with.
        #[arg(short, long, env = "EPH_PASSWORD", hide_env_values = true)]
        password: String,
        /// Write plaintext here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct IngestReport<'a> {
    id: u64,
    descriptor: &'a ArtifactDescriptor,
    metrics: IngestMetricsSnapshot,
}

impl Cli {
    /// Execute the selected subcommand.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Ingest {
                file,
                name,
                premium,
                password,
                retention_secs,
                client_addr,
            } => {
                let upload = UploadArgs {
                    file,
                    name,
                    premium,
                    password,
                    retention_secs,
                    client_addr,
                };
                ingest(&config, upload).await
            }
            Command::Expiry { size, premium, at } => expiry(&config, size, premium, at),
            Command::Decrypt {
                stored,
                password,
                output,
            } => decrypt(&config, &stored, &password, output.as_deref()).await,
        }
    }

    fn load_config(&self) -> Result<IngestConfig> {
        let mut config = match &self.config {
            Some(path) if path.exists() => IngestConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            Some(path) => {
                tracing::warn!("Config file not found, using defaults: {}", path.display());
                IngestConfig::default()
            }
            None => IngestConfig::default(),
        };
        if let Some(dir) = &self.storage_dir {
            config.storage_dir = dir.clone();
        }
        Ok(config)
    }
}

struct UploadArgs {
    file: PathBuf,
    name: Option<String>,
    premium: bool,
    password: Option<String>,
    retention_secs: Option<u64>,
    client_addr: Option<IpAddr>,
}

fn tier(premium: bool) -> UploadTier {
    if premium {
        UploadTier::Premium
    } else {
        UploadTier::Limited
    }
}

async fn ingest(config: &IngestConfig, args: UploadArgs) -> Result<()> {
    let orchestrator = IngestionOrchestrator::from_config(
        config,
        Arc::new(InMemoryCatalog::new()),
        Arc::new(LoggingBlockAction),
    )?;

    let file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("opening {}", args.file.display()))?;
    let length = file.metadata().await?.len();
    let name = match args.name {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string()),
    };

    let mut upload = IncomingUpload::new(file, name)
        .with_declared_length(length)
        .with_tier(tier(args.premium));
    if let Some(password) = args.password {
        upload = upload.with_password(password);
    }
    if let Some(secs) = args.retention_secs {
        upload = upload.with_retention(Duration::from_secs(secs));
    }
    if let Some(addr) = args.client_addr {
        upload = upload.from_addr(addr);
    }

    let receipt = orchestrator.ingest(upload).await?;
    let report = IngestReport {
        id: receipt.id,
        descriptor: &receipt.descriptor,
        metrics: orchestrator.metrics().snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn expiry(config: &IngestConfig, size: u64, premium: bool, at: Option<DateTime<Utc>>) -> Result<()> {
    let limits = if premium {
        config.premium_limits()
    } else {
        config.limited_limits()
    };
    if let Some(ceiling) = limits.size_limit().ceiling() {
        if size > ceiling {
            anyhow::bail!("{size} bytes exceeds the {ceiling} byte upload limit");
        }
    }
    let uploaded_at = at.unwrap_or_else(Utc::now);
    match compute_expiry(size, &limits, uploaded_at) {
        Some(expires_at) => println!("{}", expires_at.to_rfc3339()),
        None => println!("never"),
    }
    Ok(())
}

async fn decrypt(config: &IngestConfig, stored: &Path, password: &str, output: Option<&Path>) -> Result<()> {
    let plaintext = EncryptionCodec::new(config.kdf)
        .decrypt(stored, password)
        .await
        .with_context(|| format!("decrypting {}", stored.display()))?;
    match output {
        Some(path) => tokio::fs::write(path, &plaintext).await?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&plaintext)?;
            stdout.flush()?;
        }
    }
    tracing::info!(bytes = plaintext.len(), "artifact decrypted");
    Ok(())
}
