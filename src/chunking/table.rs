//! Row-oriented chunker for tabular documents.

use crate::chunking::{ChunkRequest, ChunkingError, DocumentChunker, Fragment, decode_text};

/// Chunker backing the `table` profile.
///
/// Interprets the document as delimiter-separated rows with a header line and
/// emits one fragment per data row, rendering each as `header: value` pairs
/// so field names survive into retrieval. The task's `[from_page, to_page)`
/// range selects data rows; the sentinel range selects all of them.
pub struct TableChunker;

fn detect_delimiter(header: &str) -> char {
    if header.contains('\t') { '\t' } else { ',' }
}

impl DocumentChunker for TableChunker {
    fn chunk(&self, request: &ChunkRequest<'_>) -> Result<Vec<Fragment>, ChunkingError> {
        let text = decode_text(request.bytes);
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());
        let Some(header_line) = lines.next() else {
            return Ok(Vec::new());
        };
        let delimiter = detect_delimiter(header_line);
        let headers: Vec<&str> = header_line.split(delimiter).map(str::trim).collect();
        if headers.is_empty() {
            return Err(ChunkingError::Parse("table has no header row".to_string()));
        }

        let rows: Vec<&str> = lines.collect();
        let start = request.from_page.max(0) as usize;
        let end = if request.to_page < 0 {
            rows.len()
        } else {
            (request.to_page as usize).min(rows.len())
        };
        if start >= end {
            return Ok(Vec::new());
        }

        let fragments = rows[start..end]
            .iter()
            .map(|row| {
                let content = row
                    .split(delimiter)
                    .map(str::trim)
                    .enumerate()
                    .map(|(column, value)| {
                        let field = headers.get(column).copied().unwrap_or("field");
                        format!("{field}: {value}")
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                Fragment::text(content)
            })
            .collect();
        Ok(fragments)
    }
}
