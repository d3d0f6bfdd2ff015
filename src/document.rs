use crate::error::{RagError, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use pdf_extract::extract_text_by_pages;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// Text of a single PDF page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    /// File name of the originating document
    pub source: String,
    /// 1-based page number
    pub page: usize,
    /// Whitespace-normalized page text
    pub text: String,
}

/// Represents a loaded PDF with its per-page text
#[derive(Debug, Clone)]
pub struct Document {
    /// Where the document was read from
    pub path: PathBuf,
    /// The document's file name (used as the citation source)
    pub file_name: String,
    /// Pages in document order
    pub pages: Vec<PageText>,
}

impl Document {
    /// Load a PDF from disk and extract the text of every page
    pub fn from_file<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let path = file_path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| RagError::Load(format!("Invalid file name: {}", path.display())))?
            .to_string();

        if !is_pdf(path) {
            return Err(RagError::Load(format!(
                "Unsupported document format: {}. Only PDF files are supported.",
                file_name
            )));
        }

        if !path.is_file() {
            return Err(RagError::Load(format!("File not found: {}", path.display())));
        }

        info!("Processing PDF document: {}", path.display());
        let raw_pages = extract_pages(path)?;

        let pages: Vec<PageText> = raw_pages
            .iter()
            .enumerate()
            .map(|(idx, raw)| PageText {
                source: file_name.clone(),
                page: idx + 1,
                text: normalize_whitespace(raw),
            })
            .collect();

        if pages.iter().all(|page| page.text.is_empty()) {
            warn!("Extracted PDF content is empty or contains only whitespace");
            return Err(RagError::Load(format!(
                "No extractable text in {}",
                file_name
            )));
        }

        debug!("Loaded {} pages from {}", pages.len(), file_name);

        Ok(Document {
            path: path.to_path_buf(),
            file_name,
            pages,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Whether the path has a recognized document (PDF) extension
pub fn is_pdf<P: AsRef<Path>>(path: P) -> bool {
    from_path(path)
        .first()
        .map(|mime| mime.essence_str() == "application/pdf")
        .unwrap_or(false)
}

/// Run the extractor, turning both its errors and its panics into `Load`
/// errors. Malformed PDFs can panic deep inside the parser.
fn extract_pages(path: &Path) -> Result<Vec<String>> {
    match panic::catch_unwind(AssertUnwindSafe(|| extract_text_by_pages(path))) {
        Ok(Ok(pages)) => Ok(pages),
        Ok(Err(e)) => Err(RagError::Load(format!(
            "Failed to extract text from PDF {}: {}",
            path.display(),
            e
        ))),
        Err(_) => Err(RagError::Load(format!(
            "PDF parser crashed on {}",
            path.display()
        ))),
    }
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
            continue;
        }

        if newline_count > 0 {
            // Keep at most one blank line (paragraph break)
            if newline_count >= 2 {
                normalized.push_str("\n\n");
            } else {
                normalized.push('\n');
            }
            newline_count = 0;
            prev_char = '\n';
        }

        let c = if c == '\t' { ' ' } else { c };
        if !(c == ' ' && (prev_char == ' ' || prev_char == '\n')) {
            normalized.push(c);
        }
        prev_char = c;
    }

    normalized.trim().to_string()
}
