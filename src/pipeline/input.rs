//! Input resolution: turn a path, URL or upload into bytes that look like a PDF.
//!
//! pdfium needs a file-system path, so URLs are downloaded into a `TempDir`
//! that lives as long as the [`ResolvedInput`]. Every entry point checks the
//! `%PDF` magic bytes first so callers get [`Pdf2JsonError::UnreadablePdf`]
//! instead of an opaque pdfium failure.

use crate::error::Pdf2JsonError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

pub const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// The resolved input: either a local path or a downloaded temp file.
#[derive(Debug)]
pub enum ResolvedInput {
    Local(PathBuf),
    /// The `TempDir` is kept alive until processing completes.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// File name to record for the stored document.
    pub fn filename(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string())
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

pub fn has_pdf_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[..4] == PDF_MAGIC
}

/// Reject byte buffers that do not start with `%PDF`.
pub fn ensure_pdf_bytes(bytes: &[u8], path: &Path) -> Result<(), Pdf2JsonError> {
    if has_pdf_magic(bytes) {
        return Ok(());
    }
    let shown: String = bytes
        .iter()
        .take(4)
        .map(|b| if b.is_ascii_graphic() { *b as char } else { '.' })
        .collect();
    Err(Pdf2JsonError::UnreadablePdf {
        path: path.to_path_buf(),
        detail: format!("missing %PDF header (starts with '{shown}')"),
    })
}

/// Keep the final path component and replace anything outside `[A-Za-z0-9._-]`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "document.pdf".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Resolve a local path or URL to a readable PDF file.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2JsonError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, Pdf2JsonError> {
    let path = PathBuf::from(path_str);
    if !path.exists() {
        return Err(Pdf2JsonError::FileNotFound { path });
    }

    let mut magic = Vec::with_capacity(4);
    std::fs::File::open(&path)
        .and_then(|f| f.take(4).read_to_end(&mut magic))
        .map_err(|e| Pdf2JsonError::storage(&path, e))?;
    ensure_pdf_bytes(&magic, &path)?;

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2JsonError> {
    info!("Downloading PDF from: {}", url);
    let failed = |reason: String| Pdf2JsonError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            Pdf2JsonError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let filename = filename_from_url(url);
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let temp_dir = TempDir::new().map_err(|e| Pdf2JsonError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);
    ensure_pdf_bytes(&bytes, &file_path)?;

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| Pdf2JsonError::storage(&file_path, e))?;

    info!("Downloaded {} bytes to: {}", bytes.len(), file_path.display());
    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .map(|last| sanitize_filename(&last))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn magic_check() {
        assert!(has_pdf_magic(b"%PDF-1.7\n"));
        assert!(!has_pdf_magic(b"%PD"));
        let err = ensure_pdf_bytes(b"PK\x03\x04", Path::new("x.zip")).unwrap_err();
        assert!(matches!(err, Pdf2JsonError::UnreadablePdf { .. }));
        assert!(err.to_string().contains("PK.."), "got: {err}");
    }

    #[test]
    fn sanitize_strips_directories_and_odd_chars() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\form 1.pdf"), "form_1.pdf");
        assert_eq!(sanitize_filename(".hidden.pdf"), "hidden.pdf");
        assert_eq!(sanitize_filename(""), "document.pdf");
    }

    #[test]
    fn filename_from_url_falls_back() {
        assert_eq!(filename_from_url("https://x.test/a/form.pdf"), "form.pdf");
        assert_eq!(filename_from_url("https://x.test/download"), "downloaded.pdf");
    }

    #[test]
    fn local_non_pdf_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        let err = resolve_local(f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Pdf2JsonError::UnreadablePdf { .. }));
    }

    #[test]
    fn local_missing_file() {
        let err = resolve_local("/definitely/not/here.pdf").unwrap_err();
        assert!(matches!(err, Pdf2JsonError::FileNotFound { .. }));
    }

    #[test]
    fn local_pdf_resolves() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"%PDF-1.4\n%%EOF").unwrap();
        let resolved = resolve_local(f.path().to_str().unwrap()).unwrap();
        assert_eq!(resolved.path(), f.path());
    }
}
