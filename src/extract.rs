//! File-to-text extraction for the ingestion pipeline.
//!
//! The extractor is the external-library boundary of ingestion: it turns an
//! uploaded file into plain text and knows nothing about chunking or
//! embeddings. Formats are sniffed from the filename extension first, then
//! from the content itself.

use miette::Diagnostic;
use scraper::Html;
use thiserror::Error;

/// Errors raised while extracting text from an uploaded file.
#[derive(Debug, Error, Diagnostic)]
pub enum ExtractionError {
    /// The file extension (or sniffed content) is not a supported format.
    #[error("unsupported document format: {filename}")]
    #[diagnostic(
        code(ragbridge::extract::unsupported),
        help("Supported formats: plain text, Markdown, HTML, CSV/TSV.")
    )]
    UnsupportedFormat { filename: String },

    /// The bytes are not valid UTF-8 for a text-based format.
    #[error("document is not valid UTF-8: {filename}")]
    #[diagnostic(code(ragbridge::extract::encoding))]
    InvalidEncoding { filename: String },
}

/// Supported document formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Html,
    Csv,
    Tsv,
}

impl DocumentFormat {
    /// Resolves the format from a filename extension.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = filename.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
        match ext.as_str() {
            "txt" | "text" | "log" => Some(Self::PlainText),
            "md" | "markdown" => Some(Self::Markdown),
            "html" | "htm" | "xhtml" => Some(Self::Html),
            "csv" => Some(Self::Csv),
            "tsv" => Some(Self::Tsv),
            _ => None,
        }
    }
}

/// Converts uploaded files into plain text.
#[derive(Clone, Debug, Default)]
pub struct TextExtractor;

impl TextExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extracts plain text from `bytes`.
    ///
    /// Falls back to content sniffing when the extension is unknown: bytes
    /// that decode as UTF-8 and open with an HTML tag are treated as HTML,
    /// other valid UTF-8 as plain text. Binary content is rejected.
    pub fn extract(&self, bytes: &[u8], filename: &str) -> Result<String, ExtractionError> {
        let format = match DocumentFormat::from_filename(filename) {
            Some(format) => format,
            None => sniff_format(bytes).ok_or_else(|| ExtractionError::UnsupportedFormat {
                filename: filename.to_string(),
            })?,
        };

        let text =
            std::str::from_utf8(bytes).map_err(|_| ExtractionError::InvalidEncoding {
                filename: filename.to_string(),
            })?;

        let extracted = match format {
            DocumentFormat::PlainText | DocumentFormat::Markdown => text.to_string(),
            DocumentFormat::Html => html_to_text(text),
            DocumentFormat::Csv => tabular_to_text(text, ','),
            DocumentFormat::Tsv => tabular_to_text(text, '\t'),
        };

        tracing::debug!(
            filename = %filename,
            format = ?format,
            bytes = bytes.len(),
            chars = extracted.len(),
            "extracted document text"
        );
        Ok(extracted)
    }
}

fn sniff_format(bytes: &[u8]) -> Option<DocumentFormat> {
    let text = std::str::from_utf8(bytes).ok()?;
    let head = text.trim_start().get(..64).unwrap_or(text.trim_start());
    let lowered = head.to_ascii_lowercase();
    if lowered.starts_with("<!doctype html") || lowered.starts_with("<html") {
        Some(DocumentFormat::Html)
    } else {
        Some(DocumentFormat::PlainText)
    }
}

/// Collects visible text from an HTML document, skipping script and style
/// subtrees, with one line per text node run.
fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut lines: Vec<String> = Vec::new();

    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let in_hidden_subtree = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|element| matches!(element.name(), "script" | "style" | "noscript"))
                .unwrap_or(false)
        });
        if in_hidden_subtree {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }

    lines.join("\n")
}

/// Flattens delimiter-separated rows into readable lines so tabular facts
/// survive chunking ("header: value" pairs when a header row exists).
fn tabular_to_text(raw: &str, delimiter: char) -> String {
    let mut rows = raw
        .lines()
        .map(|line| {
            line.split(delimiter)
                .map(|cell| cell.trim().trim_matches('"').to_string())
                .collect::<Vec<_>>()
        })
        .filter(|cells| cells.iter().any(|cell| !cell.is_empty()));

    let Some(header) = rows.next() else {
        return String::new();
    };

    let mut lines = Vec::new();
    let mut saw_data_row = false;
    for row in rows {
        saw_data_row = true;
        let pairs: Vec<String> = row
            .iter()
            .enumerate()
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(idx, cell)| match header.get(idx) {
                Some(name) if !name.is_empty() => format!("{name}: {cell}"),
                _ => cell.clone(),
            })
            .collect();
        if !pairs.is_empty() {
            lines.push(pairs.join(", "));
        }
    }

    // A single-row file has no header to pair against; keep the row itself.
    if !saw_data_row {
        return header.join(", ");
    }
    lines.join("\n")
}
