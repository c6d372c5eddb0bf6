//! Content-type denylist based on magic-byte sniffing.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::{ContentFilter, FilterCandidate, FilterError, FilterErrorKind, Verdict, PRIORITY_LOW};

/// Type reported for content without a recognizable signature.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Sniff the MIME type of a file from its first `sniff_bytes` bytes.
pub async fn sniff_mime(path: &Path, sniff_bytes: usize) -> std::io::Result<&'static str> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(sniff_bytes.min(64 * 1024));
    file.take(sniff_bytes as u64).read_to_end(&mut head).await?;
    Ok(infer::get(&head)
        .map(|kind| kind.mime_type())
        .unwrap_or(OCTET_STREAM))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MimePattern {
    Exact(String),
    Prefix(String),
}

impl MimePattern {
    fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.strip_suffix('*') {
            Some(prefix) => MimePattern::Prefix(prefix.to_string()),
            None => MimePattern::Exact(lowered),
        }
    }

    fn matches(&self, mime: &str) -> bool {
        match self {
            MimePattern::Exact(exact) => exact == mime,
            MimePattern::Prefix(prefix) => mime.starts_with(prefix.as_str()),
        }
    }
}

/// Rejects uploads whose sniffed content type is denylisted.
///
/// The extension of the original filename is ignored.
#[derive(Debug, Clone)]
pub struct MimeFilter {
    denied: Vec<MimePattern>,
    sniff_bytes: usize,
}

impl MimeFilter {
    /// Build from denylist entries (`type/sub`, `type/*`, `type/prefix*`).
    pub fn new<I, S>(denied: I, sniff_bytes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            denied: denied
                .into_iter()
                .map(|d| MimePattern::parse(d.as_ref()))
                .collect(),
            sniff_bytes: sniff_bytes.max(1),
        }
    }

    /// Whether `mime` is denylisted.
    pub fn is_denied(&self, mime: &str) -> bool {
        let mime = mime.to_ascii_lowercase();
        self.denied.iter().any(|p| p.matches(&mime))
    }
}

#[async_trait]
impl ContentFilter for MimeFilter {
    fn name(&self) -> &str {
        "mime"
    }

    fn priority(&self) -> i32 {
        PRIORITY_LOW
    }

    fn error_kind(&self) -> FilterErrorKind {
        FilterErrorKind::ForbiddenType
    }

    async fn check(&self, candidate: &FilterCandidate) -> Result<Verdict, FilterError> {
        if self.denied.is_empty() {
            return Ok(Verdict::Pass);
        }
        let mime = sniff_mime(&candidate.path, self.sniff_bytes).await?;
        if self.is_denied(mime) {
            return Ok(Verdict::fail(
                self.error_kind(),
                format!("content type {mime} is not allowed"),
            ));
        }
        Ok(Verdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn elf_bytes() -> Vec<u8> {
        let mut data = vec![0x7F, b'E', b'L', b'F', 2, 1, 1, 0];
        data.resize(128, 0);
        data
    }

    fn png_bytes() -> Vec<u8> {
        let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        data.resize(64, 0);
        data
    }

    fn candidate(dir: &TempDir, name: &str, data: &[u8]) -> FilterCandidate {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        FilterCandidate {
            path,
            original_name: name.to_string(),
            size: data.len() as u64,
            client_addr: None,
        }
    }

    fn filter() -> MimeFilter {
        MimeFilter::new(["application/x-executable"], 8192)
    }

    #[tokio::test]
    async fn test_denied_content_with_harmless_extension() {
        let dir = TempDir::new().unwrap();
        let c = candidate(&dir, "holiday.png", &elf_bytes());
        let verdict = filter().check(&c).await.unwrap();
        assert!(matches!(
            verdict,
            Verdict::Fail { kind: FilterErrorKind::ForbiddenType, .. }
        ));
    }

    #[tokio::test]
    async fn test_allowed_content_with_suspicious_extension() {
        let dir = TempDir::new().unwrap();
        let c = candidate(&dir, "setup.exe", &png_bytes());
        assert!(filter().check(&c).await.unwrap().is_pass());
    }

    #[tokio::test]
    async fn test_sniffing() {
        let dir = TempDir::new().unwrap();
        let png = candidate(&dir, "a", &png_bytes());
        let text = candidate(&dir, "b", b"plain words");
        let empty = candidate(&dir, "c", b"");
        assert_eq!(sniff_mime(&png.path, 8192).await.unwrap(), "image/png");
        assert_eq!(sniff_mime(&text.path, 8192).await.unwrap(), OCTET_STREAM);
        assert_eq!(sniff_mime(&empty.path, 8192).await.unwrap(), OCTET_STREAM);
    }

    #[test]
    fn test_wildcards() {
        let f = MimeFilter::new(["image/*", "application/x-*", " Video/MP4 "], 16);
        assert!(f.is_denied("image/png"));
        assert!(f.is_denied("application/x-executable"));
        assert!(f.is_denied("video/mp4"));
        assert!(!f.is_denied("video/webm"));
        assert!(!f.is_denied("application/pdf"));
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let c = FilterCandidate {
            path: "/nonexistent/ephemera/file".into(),
            original_name: "x".into(),
            size: 0,
            client_addr: None,
        };
        assert!(matches!(filter().check(&c).await, Err(FilterError::Io(_))));
    }
}
