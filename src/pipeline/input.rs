//! Input loading: turn a user-supplied path or an uploaded buffer into a
//! [`SourceDocument`] with a known kind.
//!
//! The kind comes from the file extension. PDFs are additionally checked for
//! the `%PDF` magic bytes so a mislabelled file fails here with a clear
//! message rather than deep inside pdfium.

use crate::error::PolicyCheckError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Declared kind of a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    PlainText,
    Markdown,
}

impl DocumentKind {
    /// Kind from a file name's extension (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())?
            .to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "txt" | "text" => Some(DocumentKind::PlainText),
            "md" | "markdown" => Some(DocumentKind::Markdown),
            _ => None,
        }
    }

    /// Text and Markdown are read verbatim.
    pub fn is_text(self) -> bool {
        matches!(self, DocumentKind::PlainText | DocumentKind::Markdown)
    }
}

/// Raw bytes of one input document plus its declared kind. Never mutated.
#[derive(Clone)]
pub struct SourceDocument {
    name: String,
    kind: DocumentKind,
    bytes: Vec<u8>,
}

impl std::fmt::Debug for SourceDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceDocument")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl SourceDocument {
    /// Build from an in-memory upload. `name` supplies the extension.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self, PolicyCheckError> {
        let name = name.into();
        let kind = DocumentKind::from_name(&name).ok_or_else(|| PolicyCheckError::InvalidFileType {
            document: name.clone(),
            reason: "unrecognised extension".into(),
        })?;

        if kind == DocumentKind::Pdf && !bytes.starts_with(b"%PDF") {
            let magic: Vec<u8> = bytes.iter().take(4).copied().collect();
            return Err(PolicyCheckError::InvalidFileType {
                document: name,
                reason: format!("not a PDF (first bytes: {:?})", magic),
            });
        }

        debug!("Loaded '{}' as {:?} ({} bytes)", name, kind, bytes.len());
        Ok(Self { name, kind, bytes })
    }

    /// Read a local file, mapping missing and unreadable files to their own errors.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyCheckError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => PolicyCheckError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => PolicyCheckError::FileNotFound {
                path: path.to_path_buf(),
            },
        })?;
        let name = display_name(path);
        Self::from_bytes(name, bytes)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// UTF-8 contents of a text document; invalid sequences are replaced.
    pub fn text_lossy(&self) -> String {
        match std::str::from_utf8(&self.bytes) {
            Ok(s) => s.to_string(),
            Err(e) => {
                warn!(
                    "'{}' is not valid UTF-8 (at byte {}); replacing invalid sequences",
                    self.name,
                    e.valid_up_to()
                );
                String::from_utf8_lossy(&self.bytes).into_owned()
            }
        }
    }
}

/// File name component of `path`, or the whole path when it has none.
fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Load several files in order, failing on the first unreadable one.
pub fn load_all(paths: &[PathBuf]) -> Result<Vec<SourceDocument>, PolicyCheckError> {
    paths.iter().map(SourceDocument::from_path).collect()
}
