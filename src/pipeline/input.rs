//! Source resolution: turn user input into local PDF paths.
//!
//! A batch is either a directory filtered by a glob pattern or a single
//! explicit file (local path or HTTP/HTTPS URL). URLs are downloaded into a
//! `TempDir` that lives as long as the [`SourceInput`], so pdfium always gets
//! a real path and the download is removed when the job ends.

use crate::error::PdfScanError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// A source ready for the rasteriser.
#[derive(Debug)]
pub enum SourceInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; the PDF sits in a temp directory kept alive here.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl SourceInput {
    pub fn path(&self) -> &Path {
        match self {
            SourceInput::Local(p) => p,
            SourceInput::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a single input string to a readable local PDF.
pub async fn resolve_source(input: &str, timeout_secs: u64) -> Result<SourceInput, PdfScanError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(Path::new(input)).map(SourceInput::Local)
    }
}

/// Check that `path` exists, is readable, and starts with `%PDF`.
pub fn resolve_local(path: &Path) -> Result<PathBuf, PdfScanError> {
    let unreadable = |detail: String| PdfScanError::SourceUnreadable {
        path: path.to_path_buf(),
        detail,
    };

    let mut file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => unreadable("file not found".into()),
        std::io::ErrorKind::PermissionDenied => unreadable("permission denied".into()),
        _ => unreadable(e.to_string()),
    })?;

    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) if &magic == b"%PDF" => {}
        Ok(()) => return Err(unreadable(format!("not a PDF (first bytes {magic:?})"))),
        Err(_) => return Err(unreadable("file is too short to be a PDF".into())),
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(path.to_path_buf())
}

/// List files in `dir` matching `pattern` (e.g. `*.pdf`), sorted by path,
/// truncated to `limit`.
pub fn discover_sources(
    dir: &Path,
    pattern: &str,
    limit: Option<usize>,
) -> Result<Vec<PathBuf>, PdfScanError> {
    if !dir.is_dir() {
        return Err(PdfScanError::InvalidConfig(format!(
            "input directory '{}' does not exist",
            dir.display()
        )));
    }

    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let full = format!("{}/{}", escaped.trim_end_matches('/'), pattern);
    let entries = glob::glob(&full)
        .map_err(|e| PdfScanError::InvalidConfig(format!("bad file pattern '{pattern}': {e}")))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    if let Some(limit) = limit {
        files.truncate(limit);
    }

    info!("Found {} files matching '{}' in {}", files.len(), pattern, dir.display());
    Ok(files)
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<SourceInput, PdfScanError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| PdfScanError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let filename = filename_from_url(url);
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let temp_dir = TempDir::new().map_err(|e| PdfScanError::Internal(e.to_string()))?;
    let path = temp_dir.path().join(&filename);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| PdfScanError::Internal(format!("Failed to write temp file: {e}")))?;

    resolve_local(&path)?;
    info!("Downloaded to: {}", path.display());

    Ok(SourceInput::Downloaded {
        path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_taken_from_url_path() {
        assert_eq!(filename_from_url("https://x.org/a/tender.pdf"), "tender.pdf");
        assert_eq!(filename_from_url("https://arxiv.org/pdf/1706"), "downloaded.pdf");
    }

    #[test]
    fn local_pdf_magic_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("ok.pdf");
        std::fs::write(&good, b"%PDF-1.7\n").unwrap();
        assert_eq!(resolve_local(&good).unwrap(), good);

        let bad = dir.path().join("bad.pdf");
        std::fs::write(&bad, b"<html>").unwrap();
        assert!(matches!(
            resolve_local(&bad),
            Err(PdfScanError::SourceUnreadable { .. })
        ));

        let missing = dir.path().join("missing.pdf");
        let err = resolve_local(&missing).unwrap_err();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn discovery_filters_sorts_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.pdf", "a.pdf", "b.pdf", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"%PDF").unwrap();
        }

        let all = discover_sources(dir.path(), "*.pdf", None).unwrap();
        let names: Vec<_> = all
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.pdf", "b.pdf", "c.pdf"]);

        let limited = discover_sources(dir.path(), "*.pdf", Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn discovery_requires_directory() {
        assert!(discover_sources(Path::new("/definitely/not/here"), "*.pdf", None).is_err());
    }
}
