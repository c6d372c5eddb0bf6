//! Pluggable anti-malware scan engines.
//!
//! Two engines ship with the crate: [`CommandScanEngine`] drives an external
//! scanner process using clamscan-style exit codes, and [`SignatureScanEngine`]
//! searches the file for byte signatures in-process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::config::{ScanEngineConfig, ScannerConfig, SignatureConfig};
use crate::error::{IngestError, IngestResult};

/// EICAR anti-virus test string, split so this source file is not itself flagged.
pub const EICAR_SIGNATURE: &str = concat!(
    "X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR",
    "-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"
);

/// Verdict of one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Nothing found.
    Clean,
    /// A detection.
    Infected {
        /// Detection name reported by the engine.
        signature: String,
    },
}

/// Failure to produce a verdict.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Reading the file or spawning the scanner failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The scanner exited with an unexpected status.
    #[error("{engine} exited with status {code:?}: {stderr}")]
    Exit {
        /// Engine name.
        engine: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Trimmed standard error.
        stderr: String,
    },
    /// The engine did not answer in time.
    #[error("{engine} timed out after {after:?}")]
    Timeout {
        /// Engine name.
        engine: String,
        /// Configured bound.
        after: Duration,
    },
}

/// A malware scanner.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Engine name used in logs and failures.
    fn name(&self) -> &str;

    /// Whether the engine can run on this host.
    fn is_available(&self) -> bool {
        true
    }

    /// Scan one file.
    async fn scan(&self, path: &Path) -> Result<ScanOutcome, ScanError>;
}

/// External scanner process. Exit code 0 is clean, 1 is a detection, anything else an error.
#[derive(Debug, Clone)]
pub struct CommandScanEngine {
    name: String,
    program: PathBuf,
    args: Vec<String>,
}

impl CommandScanEngine {
    /// Run `program args... <path>` for each scan.
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    fn locate(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 {
            return self.program.is_file().then(|| self.program.clone());
        }
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
    }
}

/// Pull the detection name out of `<path>: <name> FOUND` style output.
fn parse_detection(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_suffix("FOUND")?;
        let (_, name) = rest.rsplit_once(": ")?;
        let name = name.trim();
        (!name.is_empty()).then(|| name.to_string())
    })
}

#[async_trait]
impl ScanEngine for CommandScanEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        self.locate().is_some()
    }

    async fn scan(&self, path: &Path) -> Result<ScanOutcome, ScanError> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        match output.status.code() {
            Some(0) => Ok(ScanOutcome::Clean),
            Some(1) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let signature = parse_detection(&stdout).unwrap_or_else(|| "unknown".to_string());
                Ok(ScanOutcome::Infected { signature })
            }
            code => Err(ScanError::Exit {
                engine: self.name.clone(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

/// In-process matcher over a set of byte signatures.
#[derive(Debug, Clone)]
pub struct SignatureScanEngine {
    name: String,
    signatures: Vec<(String, Vec<u8>)>,
    chunk_size: usize,
}

impl SignatureScanEngine {
    /// Build from `(detection name, bytes)` pairs. Empty signatures are ignored.
    pub fn new(name: impl Into<String>, signatures: Vec<(String, Vec<u8>)>) -> Self {
        Self {
            name: name.into(),
            signatures: signatures.into_iter().filter(|(_, s)| !s.is_empty()).collect(),
            chunk_size: 64 * 1024,
        }
    }

    /// Engine that only knows the EICAR test signature.
    pub fn eicar() -> Self {
        Self::new(
            "signature",
            vec![("EICAR-Test-File".to_string(), EICAR_SIGNATURE.as_bytes().to_vec())],
        )
    }

    fn longest(&self) -> usize {
        self.signatures.iter().map(|(_, s)| s.len()).max().unwrap_or(0)
    }

    fn find_in(&self, haystack: &[u8]) -> Option<&str> {
        self.signatures
            .iter()
            .find(|(_, sig)| haystack.windows(sig.len()).any(|w| w == sig.as_slice()))
            .map(|(name, _)| name.as_str())
    }
}

#[async_trait]
impl ScanEngine for SignatureScanEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, path: &Path) -> Result<ScanOutcome, ScanError> {
        let longest = self.longest();
        if longest == 0 {
            return Ok(ScanOutcome::Clean);
        }
        let mut file = tokio::fs::File::open(path).await?;
        let mut chunk = vec![0u8; self.chunk_size];
        // Carry the tail of the previous chunk so signatures spanning a boundary match.
        let mut window: Vec<u8> = Vec::with_capacity(self.chunk_size + longest);
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                return Ok(ScanOutcome::Clean);
            }
            window.extend_from_slice(&chunk[..n]);
            if let Some(name) = self.find_in(&window) {
                return Ok(ScanOutcome::Infected {
                    signature: name.to_string(),
                });
            }
            let keep = window.len().min(longest - 1);
            window.drain(..window.len() - keep);
        }
    }
}

/// The configured engines, in preference order.
#[derive(Clone, Default)]
pub struct ScanEngineRegistry {
    engines: Vec<Arc<dyn ScanEngine>>,
}

impl ScanEngineRegistry {
    /// Wrap an explicit engine list.
    pub fn new(engines: Vec<Arc<dyn ScanEngine>>) -> Self {
        Self { engines }
    }

    /// Build the enabled engines from settings.
    pub fn from_config(config: &ScannerConfig) -> IngestResult<Self> {
        let mut engines: Vec<Arc<dyn ScanEngine>> = Vec::new();
        for engine in &config.engines {
            match engine {
                ScanEngineConfig::Command {
                    name,
                    program,
                    args,
                    enabled,
                } => {
                    if *enabled {
                        engines.push(Arc::new(CommandScanEngine::new(
                            name.clone(),
                            program.clone(),
                            args.clone(),
                        )));
                    }
                }
                ScanEngineConfig::Signature {
                    name,
                    signatures,
                    include_eicar,
                    enabled,
                } => {
                    if *enabled {
                        let mut decoded = decode_signatures(signatures)?;
                        if *include_eicar {
                            decoded.push((
                                "EICAR-Test-File".to_string(),
                                EICAR_SIGNATURE.as_bytes().to_vec(),
                            ));
                        }
                        engines.push(Arc::new(SignatureScanEngine::new(name.clone(), decoded)));
                    }
                }
            }
        }
        Ok(Self { engines })
    }

    /// Engines that can run on this host.
    pub fn available(&self) -> Vec<Arc<dyn ScanEngine>> {
        self.engines
            .iter()
            .filter(|e| {
                let ok = e.is_available();
                if !ok {
                    debug!(engine = e.name(), "scan engine unavailable, skipping");
                }
                ok
            })
            .cloned()
            .collect()
    }

    /// Preferred engine, if any can run.
    pub fn first_available(&self) -> Option<Arc<dyn ScanEngine>> {
        self.engines.iter().find(|e| e.is_available()).cloned()
    }

    /// Number of configured engines.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether no engine is configured.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

fn decode_signatures(signatures: &[SignatureConfig]) -> IngestResult<Vec<(String, Vec<u8>)>> {
    signatures
        .iter()
        .map(|s| {
            hex::decode(s.hex.trim())
                .map(|bytes| (s.name.clone(), bytes))
                .map_err(|e| IngestError::Config(format!("signature {}: {e}", s.name)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_eicar_detected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "eicar.txt", EICAR_SIGNATURE.as_bytes());
        let outcome = SignatureScanEngine::eicar().scan(&path).await.unwrap();
        assert_eq!(
            outcome,
            ScanOutcome::Infected {
                signature: "EICAR-Test-File".into()
            }
        );
    }

    #[tokio::test]
    async fn test_signature_across_chunk_boundary() {
        let dir = TempDir::new().unwrap();
        let mut data = vec![b'a'; 100];
        data.extend_from_slice(b"NEEDLE");
        data.extend_from_slice(&[b'b'; 50]);
        let path = write(&dir, "f", &data);

        let mut engine = SignatureScanEngine::new("sig", vec![("needle".into(), b"NEEDLE".to_vec())]);
        engine.chunk_size = 103;
        assert!(matches!(
            engine.scan(&path).await.unwrap(),
            ScanOutcome::Infected { .. }
        ));
    }

    #[tokio::test]
    async fn test_clean_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "f", b"nothing to see");
        assert_eq!(
            SignatureScanEngine::eicar().scan(&path).await.unwrap(),
            ScanOutcome::Clean
        );
    }

    #[test]
    fn test_parse_detection() {
        assert_eq!(
            parse_detection("/tmp/x: Win.Test.EICAR_HDB-1 FOUND\n"),
            Some("Win.Test.EICAR_HDB-1".to_string())
        );
        assert_eq!(parse_detection("/tmp/x: OK\n"), None);
    }

    #[test]
    fn test_registry_from_config() {
        let config = ScannerConfig {
            engines: vec![
                ScanEngineConfig::Command {
                    name: "missing".into(),
                    program: "/nonexistent/ephemera-scanner".into(),
                    args: vec![],
                    enabled: true,
                },
                ScanEngineConfig::Signature {
                    name: "builtin".into(),
                    signatures: vec![SignatureConfig {
                        name: "marker".into(),
                        hex: "deadbeef".into(),
                    }],
                    include_eicar: true,
                    enabled: true,
                },
                ScanEngineConfig::Signature {
                    name: "off".into(),
                    signatures: vec![],
                    include_eicar: true,
                    enabled: false,
                },
            ],
            timeout_secs: 5,
        };

        let registry = ScanEngineRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 2);
        let available = registry.available();
        assert_eq!(available.len(), 1);
        assert_eq!(registry.first_available().unwrap().name(), "builtin");
    }

    #[test]
    fn test_bad_hex_is_config_error() {
        let config = ScannerConfig {
            engines: vec![ScanEngineConfig::Signature {
                name: "builtin".into(),
                signatures: vec![SignatureConfig {
                    name: "bad".into(),
                    hex: "zz".into(),
                }],
                include_eicar: false,
                enabled: true,
            }],
            timeout_secs: 5,
        };
        assert!(matches!(
            ScanEngineRegistry::from_config(&config),
            Err(IngestError::Config(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_engine_exit_codes() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "f", b"data");

        let clean = CommandScanEngine::new("true", "sh", vec!["-c".into(), "exit 0".into(), "sh".into()]);
        assert_eq!(clean.scan(&path).await.unwrap(), ScanOutcome::Clean);

        let infected = CommandScanEngine::new(
            "found",
            "sh",
            vec!["-c".into(), "echo \"$1: Test.Sig FOUND\"; exit 1".into(), "sh".into()],
        );
        assert_eq!(
            infected.scan(&path).await.unwrap(),
            ScanOutcome::Infected {
                signature: "Test.Sig".into()
            }
        );

        let broken = CommandScanEngine::new("broken", "sh", vec!["-c".into(), "exit 2".into(), "sh".into()]);
        assert!(matches!(
            broken.scan(&path).await,
            Err(ScanError::Exit { code: Some(2), .. })
        ));
    }
}
