//! Input resolution: turn a source document into a submittable PDF.
//!
//! PDFs are validated (magic bytes) and used in place. DjVu files are
//! converted once with `ddjvu` into `<stem>_converted.pdf` inside the output
//! folder; the converted file doubles as the cache, so later passes over the
//! same source reuse it instead of converting again.

use crate::error::RelayError;
use crate::naming::document_stem;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Hard cap on a single `ddjvu` run.
const DDJVU_TIMEOUT: Duration = Duration::from_secs(300);

/// Formats the relay accepts as sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Djvu,
}

impl SourceKind {
    /// Classify by extension, case-insensitively.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(SourceKind::Pdf),
            "djvu" => Some(SourceKind::Djvu),
            _ => None,
        }
    }
}

/// A user-supplied document, before any conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub kind: SourceKind,
}

impl SourceDocument {
    /// `None` when the extension is not one we handle.
    pub fn new(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let kind = SourceKind::from_path(&path)?;
        Some(Self { path, kind })
    }

    /// File name for log lines.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Base used in every chunk, marker and output name of this document.
    pub fn chunk_base(&self) -> String {
        let stem = document_stem(&self.path);
        match self.kind {
            SourceKind::Pdf => stem,
            SourceKind::Djvu => format!("{stem}_converted"),
        }
    }

    /// Where the converted PDF of a DjVu source lives. `None` for PDFs.
    pub fn converted_pdf_path(&self, output_dir: &Path) -> Option<PathBuf> {
        match self.kind {
            SourceKind::Pdf => None,
            SourceKind::Djvu => Some(output_dir.join(format!("{}.pdf", self.chunk_base()))),
        }
    }
}

/// Check that `path` exists, is readable, and starts with `%PDF`.
pub fn validate_pdf(path: &Path) -> Result<(), RelayError> {
    if !path.exists() {
        return Err(RelayError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    match std::fs::File::open(path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
                return Err(RelayError::UnreadableDocument {
                    path: path.to_path_buf(),
                    detail: format!("not a PDF (first bytes: {magic:?})"),
                });
            }
        }
        Err(e) => {
            return Err(RelayError::UnreadableDocument {
                path: path.to_path_buf(),
                detail: e.to_string(),
            });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(())
}

/// Return a PDF path the splitter can work on, converting if needed.
pub async fn to_submittable(source: &SourceDocument, output_dir: &Path) -> Result<PathBuf, RelayError> {
    match source.kind {
        SourceKind::Pdf => {
            validate_pdf(&source.path)?;
            Ok(source.path.clone())
        }
        SourceKind::Djvu => {
            let target = source
                .converted_pdf_path(output_dir)
                .ok_or_else(|| RelayError::Internal("DjVu source without target path".into()))?;
            if is_nonempty_file(&target) {
                debug!("Reusing converted PDF {}", target.display());
                return Ok(target);
            }
            convert_djvu(&source.path, &target).await?;
            Ok(target)
        }
    }
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// `true` if a `ddjvu` executable is on `PATH`.
pub fn is_ddjvu_installed() -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join("ddjvu").is_file()))
        .unwrap_or(false)
}

async fn convert_djvu(djvu: &Path, target: &Path) -> Result<(), RelayError> {
    if !djvu.exists() {
        return Err(RelayError::FileNotFound {
            path: djvu.to_path_buf(),
        });
    }
    if !is_ddjvu_installed() {
        return Err(RelayError::ConverterUnavailable {
            path: djvu.to_path_buf(),
            detail: "ddjvu not found on PATH; install djvulibre \
                     (apt: djvulibre-bin, brew: djvulibre, pacman: djvulibre)"
                .to_string(),
        });
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RelayError::OutputWriteFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }

    info!("Converting DjVu to PDF: {} → {}", djvu.display(), target.display());
    let tmp = target.with_extension("pdf.tmp");

    let run = Command::new("ddjvu")
        .arg("-format=pdf")
        .arg("-quality=85")
        .arg(djvu)
        .arg(&tmp)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(DDJVU_TIMEOUT, run)
        .await
        .map_err(|_| RelayError::ConverterUnavailable {
            path: djvu.to_path_buf(),
            detail: format!("ddjvu timed out after {}s", DDJVU_TIMEOUT.as_secs()),
        })?
        .map_err(|e| RelayError::ConverterUnavailable {
            path: djvu.to_path_buf(),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(RelayError::ConverterUnavailable {
            path: djvu.to_path_buf(),
            detail: format!(
                "ddjvu exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    if !is_nonempty_file(&tmp) {
        return Err(RelayError::ConverterUnavailable {
            path: djvu.to_path_buf(),
            detail: "ddjvu produced no output".to_string(),
        });
    }

    tokio::fs::rename(&tmp, target)
        .await
        .map_err(|e| RelayError::OutputWriteFailed {
            path: target.to_path_buf(),
            source: e,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_from_extension() {
        assert_eq!(SourceKind::from_path(Path::new("a.pdf")), Some(SourceKind::Pdf));
        assert_eq!(SourceKind::from_path(Path::new("a.PDF")), Some(SourceKind::Pdf));
        assert_eq!(SourceKind::from_path(Path::new("a.DjVu")), Some(SourceKind::Djvu));
        assert_eq!(SourceKind::from_path(Path::new("a.epub")), None);
        assert_eq!(SourceKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn djvu_chunk_base_is_converted_stem() {
        let pdf = SourceDocument::new("/in/book.pdf").unwrap();
        assert_eq!(pdf.chunk_base(), "book");
        assert_eq!(pdf.converted_pdf_path(Path::new("/out")), None);

        let djvu = SourceDocument::new("/in/book.djvu").unwrap();
        assert_eq!(djvu.chunk_base(), "book_converted");
        assert_eq!(
            djvu.converted_pdf_path(Path::new("/out")),
            Some(PathBuf::from("/out/book_converted.pdf"))
        );
    }

    #[test]
    fn validate_rejects_non_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pdf");
        std::fs::write(&path, b"GIF89a....").unwrap();
        assert!(matches!(
            validate_pdf(&path),
            Err(RelayError::UnreadableDocument { .. })
        ));
        assert!(matches!(
            validate_pdf(&dir.path().join("missing.pdf")),
            Err(RelayError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cached_djvu_conversion_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let src = SourceDocument::new(dir.path().join("scan.djvu")).unwrap();
        let cached = out.join("scan_converted.pdf");
        std::fs::write(&cached, b"%PDF-1.5 cached").unwrap();

        // The source itself does not even exist: the cache short-circuits.
        let path = to_submittable(&src, &out).await.unwrap();
        assert_eq!(path, cached);
    }
}
