//! Task partitioning for newly ingested documents.
//!
//! One document becomes a bounded list of independently schedulable tasks:
//! PDF documents split into page windows, tabular documents into row windows,
//! and everything else into a single whole-document task. Partitioning
//! persists the tasks, flips the document into the parsing state, and
//! publishes one queue message per task. A publish failure means the queue
//! service is unreachable and is fatal to partitioning.

use crate::blob::{BlobError, BlobStorage};
use crate::queue::{QueueError, TaskMessage, TaskQueue};
use crate::store::{DocumentDescriptor, MetadataStore, NewTask, ParserConfig, StoreError};
use thiserror::Error;
use uuid::Uuid;

/// Pages per task when the parser config does not override it.
const DEFAULT_PAGE_WINDOW: u32 = 12;
/// Pages per task for the `paper` profile.
const PAPER_PAGE_WINDOW: u32 = 22;
/// Rows per task for the `table` profile.
const TABLE_ROW_WINDOW: i64 = 3000;
/// Page window large enough to always cover a whole document.
const UNBOUNDED_WINDOW: i64 = 1_000_000_000;
/// Default page range when the parser config requests none, 1-based inclusive.
const DEFAULT_PAGE_RANGE: (u32, u32) = (1, 100_000);

/// Errors raised while partitioning a document.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// Metadata store interaction failed.
    #[error("Metadata store request failed: {0}")]
    Store(#[from] StoreError),
    /// Raw document bytes could not be fetched for content probing.
    #[error("Blob storage request failed: {0}")]
    Blob(#[from] BlobError),
    /// Task message publication failed; the queue service is unreachable.
    #[error("Can't access the task queue: {0}")]
    Queue(#[from] QueueError),
}

/// Compute the page windows for a PDF document.
///
/// Requested ranges are 1-based inclusive; each becomes a 0-based half-open
/// range clamped to `[0, total_pages]` and is subdivided into consecutive
/// windows of the effective page size.
pub fn pdf_windows(parser_id: &str, config: &ParserConfig, total_pages: u32) -> Vec<(i64, i64)> {
    let mut page_size = i64::from(config.task_page_size.unwrap_or(DEFAULT_PAGE_WINDOW));
    if parser_id == "paper" {
        page_size = i64::from(config.task_page_size.unwrap_or(PAPER_PAGE_WINDOW));
    }
    if matches!(parser_id, "one" | "knowledge_graph") || !config.layout_recognize {
        page_size = UNBOUNDED_WINDOW;
    }

    let ranges: Vec<(u32, u32)> = if config.pages.is_empty() {
        vec![DEFAULT_PAGE_RANGE]
    } else {
        config.pages.clone()
    };

    let total = i64::from(total_pages);
    let mut windows = Vec::new();
    for (start, end) in ranges {
        let start = (i64::from(start) - 1).max(0);
        let end = (i64::from(end) - 1).min(total);
        let mut page = start;
        while page < end {
            windows.push((page, (page + page_size).min(end)));
            page += page_size;
        }
    }
    windows
}

/// Compute the row windows for a tabular document.
pub fn row_windows(total_rows: u32) -> Vec<(i64, i64)> {
    let total = i64::from(total_rows);
    let mut windows = Vec::new();
    let mut row = 0;
    while row < total {
        windows.push((row, (row + TABLE_ROW_WINDOW).min(total)));
        row += TABLE_ROW_WINDOW;
    }
    windows
}

/// Count the pages of a PDF from its raw bytes.
///
/// Scans for `/Type /Page` object markers, which is sufficient for
/// non-compressed object streams; documents whose page objects are packed
/// into compressed streams report zero and fall back to a single task.
pub fn pdf_page_count(bytes: &[u8]) -> u32 {
    let mut count = 0u32;
    let mut offset = 0;
    while let Some(found) = find_subslice(&bytes[offset..], b"/Type") {
        let mut cursor = offset + found + b"/Type".len();
        while bytes.get(cursor).is_some_and(|b| b.is_ascii_whitespace()) {
            cursor += 1;
        }
        if bytes[cursor..].starts_with(b"/Page")
            && !bytes[cursor + b"/Page".len()..].starts_with(b"s")
        {
            count += 1;
        }
        offset += found + b"/Type".len();
    }
    count
}

/// Count the data rows of a delimiter-separated table from its raw bytes.
pub fn table_row_count(bytes: &[u8]) -> u32 {
    let text = String::from_utf8_lossy(bytes);
    let rows = text.lines().filter(|line| !line.trim().is_empty()).count();
    // First non-empty line is the header.
    rows.saturating_sub(1) as u32
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Plan the task ranges for a document without touching any service.
///
/// `total_units` is the probed page count for PDFs or row count for tables;
/// other documents ignore it and receive a single sentinel-range task.
pub fn plan_tasks(doc: &DocumentDescriptor, total_units: u32) -> Vec<NewTask> {
    let windows: Vec<(i64, i64)> = if doc.doc_type.eq_ignore_ascii_case("pdf") {
        if total_units == 0 {
            // Page probe found nothing; process the document as one unit.
            vec![(0, -1)]
        } else {
            pdf_windows(&doc.parser_id, &doc.parser_config, total_units)
        }
    } else if doc.parser_id == "table" {
        row_windows(total_units)
    } else {
        vec![(0, -1)]
    };

    windows
        .into_iter()
        .map(|(from_page, to_page)| NewTask {
            id: Uuid::new_v4().to_string(),
            doc_id: doc.id.clone(),
            from_page,
            to_page,
        })
        .collect()
}

/// Partition a document and enqueue its tasks.
///
/// Probes the raw bytes when windowing needs content bounds, persists every
/// task in one bulk operation, flips the document into the parsing state, and
/// publishes one message per task.
pub async fn partition_document(
    doc: &DocumentDescriptor,
    store: &dyn MetadataStore,
    blob: &BlobStorage,
    queue: &TaskQueue,
) -> Result<Vec<NewTask>, PartitionError> {
    let total_units = if doc.doc_type.eq_ignore_ascii_case("pdf") {
        let (bucket, name) = store.storage_address(&doc.id).await?;
        pdf_page_count(&blob.get(&bucket, &name).await?)
    } else if doc.parser_id == "table" {
        let (bucket, name) = store.storage_address(&doc.id).await?;
        table_row_count(&blob.get(&bucket, &name).await?)
    } else {
        0
    };

    let tasks = plan_tasks(doc, total_units);
    store.insert_tasks(&tasks).await?;
    store.begin_parsing(&doc.id).await?;

    for task in &tasks {
        queue.publish(&TaskMessage::new(task.id.clone())).await?;
    }
    tracing::info!(
        doc_id = %doc.id,
        parser_id = %doc.parser_id,
        tasks = tasks.len(),
        "Document partitioned"
    );
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(doc_type: &str, parser_id: &str, config: ParserConfig) -> DocumentDescriptor {
        DocumentDescriptor {
            id: "d1".into(),
            kb_id: "kb1".into(),
            parser_id: parser_id.into(),
            parser_config: config,
            name: "report.pdf".into(),
            doc_type: doc_type.into(),
            location: "kb1/report.pdf".into(),
            size: 1024,
        }
    }

    #[test]
    fn default_window_splits_25_pages_into_three_tasks() {
        let windows = pdf_windows("naive", &ParserConfig::default(), 25);
        assert_eq!(windows, vec![(0, 12), (12, 24), (24, 25)]);
    }

    #[test]
    fn windows_cover_requested_bounds_without_gaps() {
        for pages in [1u32, 11, 12, 13, 24, 25, 97] {
            let windows = pdf_windows("naive", &ParserConfig::default(), pages);
            assert_eq!(windows.len(), (pages as usize).div_ceil(12));
            assert_eq!(windows[0].0, 0);
            assert_eq!(windows.last().expect("windows").1, i64::from(pages));
            for pair in windows.windows(2) {
                assert_eq!(pair[0].1, pair[1].0);
            }
        }
    }

    #[test]
    fn paper_profile_widens_the_window() {
        let windows = pdf_windows("paper", &ParserConfig::default(), 25);
        assert_eq!(windows, vec![(0, 22), (22, 25)]);
    }

    #[test]
    fn explicit_page_size_overrides_profile() {
        let config = ParserConfig {
            task_page_size: Some(5),
            ..ParserConfig::default()
        };
        let windows = pdf_windows("paper", &config, 11);
        assert_eq!(windows, vec![(0, 5), (5, 10), (10, 11)]);
    }

    #[test]
    fn single_window_profiles_take_the_whole_document() {
        for parser_id in ["one", "knowledge_graph"] {
            let windows = pdf_windows(parser_id, &ParserConfig::default(), 500);
            assert_eq!(windows, vec![(0, 500)]);
        }
        let config = ParserConfig {
            layout_recognize: false,
            ..ParserConfig::default()
        };
        assert_eq!(pdf_windows("naive", &config, 500), vec![(0, 500)]);
    }

    #[test]
    fn page_ranges_normalize_and_clamp() {
        let config = ParserConfig {
            pages: vec![(3, 30)],
            ..ParserConfig::default()
        };
        let windows = pdf_windows("naive", &config, 25);
        assert_eq!(windows, vec![(2, 14), (14, 25)]);
    }

    #[test]
    fn row_windows_use_fixed_3000_row_blocks() {
        assert_eq!(row_windows(7000), vec![(0, 3000), (3000, 6000), (6000, 7000)]);
        assert_eq!(row_windows(0), Vec::<(i64, i64)>::new());
    }

    #[test]
    fn pdf_page_count_scans_page_objects() {
        let pdf = b"%PDF-1.4\n1 0 obj << /Type /Pages /Count 2 >>\n2 0 obj << /Type /Page >>\n3 0 obj << /Type/Page >>\n";
        assert_eq!(pdf_page_count(pdf), 2);
        assert_eq!(pdf_page_count(b"%PDF-1.4 no markers"), 0);
    }

    #[test]
    fn table_row_count_skips_header_and_blanks() {
        assert_eq!(table_row_count(b"sku,name\nA1,bolt\n\nA2,nut\n"), 2);
        assert_eq!(table_row_count(b""), 0);
    }

    #[test]
    fn non_pdf_documents_get_a_single_sentinel_task() {
        let tasks = plan_tasks(&descriptor("doc", "naive", ParserConfig::default()), 0);
        assert_eq!(tasks.len(), 1);
        assert_eq!((tasks[0].from_page, tasks[0].to_page), (0, -1));
    }

    #[test]
    fn pdf_documents_get_one_task_per_window() {
        let tasks = plan_tasks(&descriptor("pdf", "naive", ParserConfig::default()), 25);
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|task| task.doc_id == "d1"));
        let ids: std::collections::HashSet<_> = tasks.iter().map(|task| &task.id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn unprobeable_pdfs_fall_back_to_one_task() {
        let tasks = plan_tasks(&descriptor("pdf", "naive", ParserConfig::default()), 0);
        assert_eq!(tasks.len(), 1);
        assert_eq!((tasks[0].from_page, tasks[0].to_page), (0, -1));
    }

    #[test]
    fn table_documents_window_by_rows() {
        let tasks = plan_tasks(&descriptor("doc", "table", ParserConfig::default()), 6100);
        assert_eq!(tasks.len(), 3);
        assert_eq!((tasks[2].from_page, tasks[2].to_page), (6000, 6100));
    }
}
