//! Page-tagged text extraction for uploaded documents.
//!
//! PDFs go through `pdf-extract`, one string per page. Plain-text uploads
//! are split into pages on form feeds (`\x0c`), which is how `pdftotext`
//! and friends mark page breaks.

use std::path::Path;

use thiserror::Error;

use crate::models::Page;

/// Document formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Text,
}

impl DocumentKind {
    /// Guess the kind from the file extension; unknown extensions are
    /// treated as PDF, which is the only format the upload form offers.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("txt") | Some("md") => DocumentKind::Text,
            _ => DocumentKind::Pdf,
        }
    }
}

/// Extraction error. Never panics; the indexer records it on the session.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("text is not valid UTF-8: {0}")]
    Encoding(String),
}

/// Extract page-tagged text from raw bytes.
pub fn extract_pages(bytes: &[u8], kind: DocumentKind) -> Result<Vec<Page>, ExtractError> {
    let texts = match kind {
        DocumentKind::Pdf => pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string()))?,
        DocumentKind::Text => std::str::from_utf8(bytes)
            .map_err(|e| ExtractError::Encoding(e.to_string()))?
            .split('\x0c')
            .map(str::to_string)
            .collect(),
    };

    Ok(texts
        .into_iter()
        .enumerate()
        .map(|(number, text)| Page { number, text })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_pages(b"not a pdf", DocumentKind::Pdf).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_utf8_text_returns_error() {
        let err = extract_pages(&[0xff, 0xfe, 0x00], DocumentKind::Text).unwrap_err();
        assert!(matches!(err, ExtractError::Encoding(_)));
    }

    #[test]
    fn text_pages_split_on_form_feed() {
        let pages = extract_pages(b"first page\x0csecond page", DocumentKind::Text).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 0);
        assert_eq!(pages[1].text, "second page");
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(DocumentKind::from_path(Path::new("a/b.PDF")), DocumentKind::Pdf);
        assert_eq!(DocumentKind::from_path(Path::new("notes.txt")), DocumentKind::Text);
        assert_eq!(DocumentKind::from_path(Path::new("noext")), DocumentKind::Pdf);
    }
}
