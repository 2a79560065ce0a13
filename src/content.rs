// src/content.rs

use crate::error::ScanError;
use calamine::{Data, Reader};
use std::io::Cursor;
use tracing::info;

/// How many leading lines of a delimited file are forwarded to the
/// model. Header plus a sample is enough to infer the column layout;
/// the rest of the file never leaves the process.
pub const SAMPLE_LINE_LIMIT: usize = 15;

/// Ceiling on the delimited payload, guarding against pathologically
/// wide spreadsheet-converted rows.
pub const SAMPLE_CHAR_LIMIT: usize = 12_000;

/// Appended whenever the payload hits `SAMPLE_CHAR_LIMIT`.
pub const TRUNCATION_MARKER: &str = "\n[...truncated]";

/// Processing lane a document was classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLane {
    Binary,
    Delimited,
    Spreadsheet,
}

/// Model-ready payload produced from an uploaded file.
#[derive(Debug)]
pub enum PreparedContent {
    /// Bytes passed through untouched for the multimodal model.
    Binary { bytes: Vec<u8>, media_type: String },
    /// Bounded text sample plus a locally computed row count. Covers
    /// both native delimited files and converted spreadsheets.
    Delimited {
        lane: ContentLane,
        sample: String,
        total_data_rows: usize,
    },
}

impl PreparedContent {
    pub fn lane(&self) -> ContentLane {
        match self {
            PreparedContent::Binary { .. } => ContentLane::Binary,
            PreparedContent::Delimited { lane, .. } => *lane,
        }
    }
}

/// Classify a file into a lane from its declared content type, falling
/// back to the reference's extension. Binary is the default lane.
pub fn classify(file_reference: &str, declared_content_type: Option<&str>) -> ContentLane {
    if let Some(mime) = declared_content_type {
        let mime = mime.to_ascii_lowercase();
        let mime = mime.split(';').next().unwrap_or("").trim().to_string();
        match mime.as_str() {
            "text/csv" | "text/tab-separated-values" | "text/plain" => {
                return ContentLane::Delimited;
            }
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel"
            | "application/vnd.oasis.opendocument.spreadsheet" => {
                return ContentLane::Spreadsheet;
            }
            _ => return ContentLane::Binary,
        }
    }

    let ext = file_reference
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "csv" | "tsv" | "txt" => ContentLane::Delimited,
        "xlsx" | "xlsm" | "xls" | "ods" => ContentLane::Spreadsheet,
        _ => ContentLane::Binary,
    }
}

/// Normalize raw file bytes into a model-ready payload.
///
/// Pure with respect to its inputs: classification and sampling only,
/// no I/O.
pub fn prepare(
    file_reference: &str,
    declared_content_type: Option<&str>,
    bytes: Vec<u8>,
) -> Result<PreparedContent, ScanError> {
    let lane = classify(file_reference, declared_content_type);
    match lane {
        ContentLane::Binary => {
            let media_type = binary_media_type(file_reference, declared_content_type);
            info!(bytes = bytes.len(), media_type = %media_type, "Binary lane: passthrough");
            Ok(PreparedContent::Binary { bytes, media_type })
        }
        ContentLane::Delimited => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            Ok(prepare_delimited(ContentLane::Delimited, &text))
        }
        ContentLane::Spreadsheet => {
            // No binary fallback: an unreadable workbook is invalid input.
            let text = spreadsheet_to_delimited(&bytes)?;
            Ok(prepare_delimited(ContentLane::Spreadsheet, &text))
        }
    }
}

pub(crate) fn binary_media_type(file_reference: &str, declared: Option<&str>) -> String {
    if let Some(mime) = declared {
        return mime.to_string();
    }
    let ext = file_reference
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Build the bounded sample and compute the true data-row count from
/// the full decoded text. The count is a hint for the model, never
/// derived from the truncated sample.
fn prepare_delimited(lane: ContentLane, text: &str) -> PreparedContent {
    let non_empty_lines = text.lines().filter(|l| !l.trim().is_empty()).count();
    // First non-empty line is the header; everything after it is data.
    let total_data_rows = non_empty_lines.saturating_sub(1);

    let mut sample: String = text
        .lines()
        .take(SAMPLE_LINE_LIMIT)
        .collect::<Vec<_>>()
        .join("\n");

    if sample.len() > SAMPLE_CHAR_LIMIT {
        let mut cut = SAMPLE_CHAR_LIMIT;
        while !sample.is_char_boundary(cut) {
            cut -= 1;
        }
        sample.truncate(cut);
        sample.push_str(TRUNCATION_MARKER);
    }

    info!(
        lane = ?lane,
        sample_lines = sample.lines().count(),
        total_data_rows,
        "Delimited lane: sampled"
    );

    PreparedContent::Delimited {
        lane,
        sample,
        total_data_rows,
    }
}

/// Convert the first sheet of a workbook to delimited text.
fn spreadsheet_to_delimited(bytes: &[u8]) -> Result<String, ScanError> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| ScanError::Spreadsheet(format!("failed to open workbook: {e}")))?;

    let first_sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| ScanError::Spreadsheet("workbook has no sheets".to_string()))?;

    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|e| ScanError::Spreadsheet(format!("failed to read sheet '{first_sheet}': {e}")))?;

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    for row in range.rows() {
        let record: Vec<String> = row.iter().map(cell_to_string).collect();
        writer
            .write_record(&record)
            .map_err(|e| ScanError::Spreadsheet(format!("csv conversion failed: {e}")))?;
    }
    let out = writer
        .into_inner()
        .map_err(|e| ScanError::Spreadsheet(format!("csv conversion failed: {e}")))?;

    info!(sheet = %first_sheet, rows = range.height(), "Spreadsheet converted to delimited text");
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_declared_type_first() {
        assert_eq!(
            classify("statement.bin", Some("text/csv")),
            ContentLane::Delimited
        );
        assert_eq!(
            classify(
                "statement.csv",
                Some("application/vnd.ms-excel")
            ),
            ContentLane::Spreadsheet
        );
        assert_eq!(
            classify("statement.csv", Some("application/pdf")),
            ContentLane::Binary
        );
    }

    #[test]
    fn classifies_by_extension_when_undeclared() {
        assert_eq!(classify("export.csv", None), ContentLane::Delimited);
        assert_eq!(classify("export.XLSX", None), ContentLane::Spreadsheet);
        assert_eq!(classify("statement.pdf", None), ContentLane::Binary);
        assert_eq!(classify("no-extension", None), ContentLane::Binary);
    }

    #[test]
    fn sample_bounded_to_fifteen_lines() {
        let text: String = (0..100)
            .map(|i| format!("2026-01-01,row {i},1.00\n"))
            .collect();
        let prepared = prepare("long.csv", None, text.into_bytes()).unwrap();
        let PreparedContent::Delimited {
            sample,
            total_data_rows,
            ..
        } = prepared
        else {
            panic!("expected delimited lane");
        };
        assert_eq!(sample.lines().count(), SAMPLE_LINE_LIMIT);
        // Row count comes from the full text, not the sample.
        assert_eq!(total_data_rows, 99);
    }

    #[test]
    fn oversized_sample_gets_truncation_marker() {
        // One enormous line, as produced by very wide converted sheets.
        let wide_line = "x".repeat(SAMPLE_CHAR_LIMIT * 2);
        let prepared = prepare("wide.csv", None, wide_line.into_bytes()).unwrap();
        let PreparedContent::Delimited { sample, .. } = prepared else {
            panic!("expected delimited lane");
        };
        assert!(sample.ends_with(TRUNCATION_MARKER));
        assert!(sample.len() <= SAMPLE_CHAR_LIMIT + TRUNCATION_MARKER.len());
    }

    #[test]
    fn short_sample_has_no_marker() {
        let prepared = prepare(
            "small.csv",
            None,
            b"Date,Description,Amount\n2026-01-05,COFFEE,-4.50\n".to_vec(),
        )
        .unwrap();
        let PreparedContent::Delimited {
            sample,
            total_data_rows,
            ..
        } = prepared
        else {
            panic!("expected delimited lane");
        };
        assert!(!sample.contains(TRUNCATION_MARKER));
        assert_eq!(total_data_rows, 1);
    }

    #[test]
    fn unreadable_spreadsheet_is_invalid_input_not_binary() {
        let result = prepare("book.xlsx", None, b"this is not a workbook".to_vec());
        assert!(matches!(result, Err(ScanError::Spreadsheet(_))));
    }

    #[test]
    fn binary_lane_passes_bytes_untouched() {
        let bytes = vec![0x25, 0x50, 0x44, 0x46, 0x2d]; // %PDF-
        let prepared = prepare("scan.pdf", None, bytes.clone()).unwrap();
        let PreparedContent::Binary {
            bytes: out,
            media_type,
        } = prepared
        else {
            panic!("expected binary lane");
        };
        assert_eq!(out, bytes);
        assert_eq!(media_type, "application/pdf");
    }
}
