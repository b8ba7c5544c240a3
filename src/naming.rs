//! Deterministic artifact names.
//!
//! A chunk's file name is the only key that ties together its sub-document,
//! its job marker, its Markdown output and its place in the final document,
//! so formatting and parsing must round-trip exactly:
//!
//! ```text
//! <base>_pages_<start>_<end>.pdf        chunk sub-document
//! <base>_pages_<start>_<end>.pdf.lock   job marker
//! <base>_pages_<start>_<end>.md         converted / renumbered output
//! <base>_concat_pages_1_<total>.md      concatenated output
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::Path;

/// Extension of chunk sub-documents.
pub const CHUNK_EXT: &str = "pdf";
/// Extension of converted outputs.
pub const OUTPUT_EXT: &str = "md";
/// Suffix appended to a chunk file name to form its job marker.
pub const MARKER_SUFFIX: &str = ".lock";

static RE_CHUNK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>.+)_pages_(?P<start>\d+)_(?P<end>\d+)\.(?P<ext>[A-Za-z0-9]+)$").unwrap()
});

static RE_CONCAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<base>.+)_concat_pages_1_(?P<total>\d+)\.md$").unwrap());

/// A parsed `<base>_pages_<start>_<end>.<ext>` name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkName {
    pub base: String,
    pub start: u32,
    pub end: u32,
    pub ext: String,
}

impl ChunkName {
    pub fn new(base: impl Into<String>, start: u32, end: u32, ext: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            start,
            end,
            ext: ext.into(),
        }
    }

    /// Parse a bare file name (no directories). Returns `None` for anything
    /// that is not a well-formed chunk name with `1 <= start <= end`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = RE_CHUNK.captures(file_name)?;
        let start: u32 = caps["start"].parse().ok()?;
        let end: u32 = caps["end"].parse().ok()?;
        if start == 0 || end < start {
            return None;
        }
        Some(Self {
            base: caps["base"].to_string(),
            start,
            end,
            ext: caps["ext"].to_string(),
        })
    }

    /// Parse the file-name component of `path`.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name().and_then(|n| n.to_str()).and_then(Self::parse)
    }

    /// Parse a job-marker file name back into the chunk it belongs to.
    pub fn parse_marker(file_name: &str) -> Option<Self> {
        file_name.strip_suffix(MARKER_SUFFIX).and_then(Self::parse)
    }

    pub fn file_name(&self) -> String {
        format!("{}_pages_{}_{}.{}", self.base, self.start, self.end, self.ext)
    }

    pub fn marker_name(&self) -> String {
        format!("{}{}", self.file_name(), MARKER_SUFFIX)
    }

    /// Same range, different artifact type.
    pub fn with_ext(&self, ext: &str) -> Self {
        Self {
            ext: ext.to_string(),
            ..self.clone()
        }
    }

    pub fn page_count(&self) -> u32 {
        self.end - self.start + 1
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// `<base>_concat_pages_1_<total>.md`
pub fn concat_file_name(base: &str, total_pages: u32) -> String {
    format!("{base}_concat_pages_1_{total_pages}.{OUTPUT_EXT}")
}

/// Inverse of [`concat_file_name`].
pub fn parse_concat(file_name: &str) -> Option<(String, u32)> {
    let caps = RE_CONCAT.captures(file_name)?;
    let total = caps["total"].parse().ok()?;
    Some((caps["base"].to_string(), total))
}

/// File name without directories and without its last extension.
pub fn document_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_name_round_trips() {
        let name = ChunkName::new("Общая психология 2018", 191, 380, "pdf");
        let file = name.file_name();
        assert_eq!(file, "Общая психология 2018_pages_191_380.pdf");
        assert_eq!(ChunkName::parse(&file), Some(name));
    }

    #[test]
    fn base_may_itself_contain_pages_token() {
        let parsed = ChunkName::parse("scan_pages_draft_pages_1_10.md").unwrap();
        assert_eq!(parsed.base, "scan_pages_draft");
        assert_eq!((parsed.start, parsed.end), (1, 10));
        assert_eq!(parsed.ext, "md");
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(ChunkName::parse("book.pdf"), None);
        assert_eq!(ChunkName::parse("book_pages_0_5.pdf"), None);
        assert_eq!(ChunkName::parse("book_pages_9_5.pdf"), None);
        assert_eq!(ChunkName::parse("book_pages_1_5.pdf.lock"), None);
        assert_eq!(ChunkName::parse("book_pages_1_5"), None);
    }

    #[test]
    fn marker_names() {
        let name = ChunkName::new("book", 1, 190, CHUNK_EXT);
        assert_eq!(name.marker_name(), "book_pages_1_190.pdf.lock");
        assert_eq!(ChunkName::parse_marker(&name.marker_name()), Some(name));
        assert_eq!(ChunkName::parse_marker("book_pages_1_190.pdf"), None);
    }

    #[test]
    fn with_ext_keeps_range() {
        let pdf = ChunkName::new("book", 381, 450, CHUNK_EXT);
        let md = pdf.with_ext(OUTPUT_EXT);
        assert_eq!(md.file_name(), "book_pages_381_450.md");
        assert_eq!(md.page_count(), 70);
    }

    #[test]
    fn concat_names() {
        assert_eq!(concat_file_name("book", 450), "book_concat_pages_1_450.md");
        assert_eq!(
            parse_concat("book_concat_pages_1_450.md"),
            Some(("book".to_string(), 450))
        );
        assert_eq!(parse_concat("book_pages_1_450.md"), None);
    }

    #[test]
    fn stem_strips_last_extension_only() {
        assert_eq!(document_stem(Path::new("/in/tom 1.kniga.pdf")), "tom 1.kniga");
    }
}
