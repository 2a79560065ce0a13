// src/prompts.rs

use crate::types::ColumnSpec;

/// Instructs the model to extract structured statement data. The schema
/// must stay in sync with `RawScanExtraction` in `types.rs`.
pub const SCAN_SYSTEM_PROMPT: &str = r#"You are a financial document analysis assistant.
Given a bank statement, invoice or bill, extract structured data and return ONLY valid JSON.

The JSON must match this schema exactly:
{
  "bank_name": "string or null",
  "account_number": "string or null",
  "account_type": "checking | savings | credit | investment | other, or null",
  "currency": "string or null (e.g. USD, EUR)",
  "currencies": ["list of all currencies, only for multi-currency statements"] or null,
  "period_start": "YYYY-MM-DD or null",
  "period_end": "YYYY-MM-DD or null",
  "opening_balance": number or null,
  "closing_balance": number or null,
  "transaction_count": integer or null,
  "transactions": [
    {
      "date": "YYYY-MM-DD or null",
      "description": "string",
      "amount": number,
      "type": "credit | debit"
    }
  ],
  "confidence": number between 0 and 1,
  "warnings": ["strings describing anything suspect"],
  "suggestions": ["strings suggesting follow-up actions"],
  "csv_parsing_rules": {
    "header_row": integer (0-based),
    "data_start_row": integer (0-based),
    "date_column": "string or null",
    "description_column": "string or null",
    "amount_column": "string or null",
    "debit_column": "string or null",
    "credit_column": "string or null",
    "balance_column": "string or null",
    "reference_column": "string or null",
    "date_format": "string like DD/MM/YYYY, or null",
    "amount_format": "signed | absolute",
    "debit_credit_strategy": "string or null",
    "thousands_separator": "string or null",
    "decimal_separator": "string or null"
  } or null
}

Notes:
- Use "unknown" or null for the bank name only if it genuinely cannot be determined.
- Include at most 10 sample transactions.
- Use null for fields you cannot determine.
- Return ONLY the JSON object, no markdown fences, no commentary."#;

/// Repair instruction for a malformed structured response.
pub const REPAIR_SYSTEM_PROMPT: &str = "The following text was supposed to be a single valid JSON \
object but is malformed. Emit the corrected JSON object ONLY: no markdown fences, no commentary, \
no explanation.";

/// System prompt for per-page table extraction. The detailed schema and
/// conventions travel in the user message built by
/// `page_extraction_prompt`.
pub const PAGE_SYSTEM_PROMPT: &str = "You are a financial document table extraction assistant. \
You extract tabular data from one page at a time and return ONLY valid JSON, no markdown fences, \
no commentary.";

/// User message for a delimited-text scan. The row-count hint is computed
/// locally from the full file, never from the truncated sample.
pub fn delimited_scan_prompt(sample: &str, total_data_rows: usize) -> String {
    format!(
        "Analyze this delimited bank export. Only the first lines are shown; \
the full file holds {total_data_rows} data rows (report that as transaction_count). \
Propose csv_parsing_rules describing the column layout.\n\n{sample}"
    )
}

/// User message for a binary (PDF/image) document scan.
pub fn binary_scan_prompt() -> String {
    "Analyze the attached financial document and extract the structured data. \
Set csv_parsing_rules to null: this is not a delimited file."
        .to_string()
}

/// Per-page extraction instruction for a confirmed column schema.
///
/// Fixed conventions: ISO dates, bare numeric amounts, explicit nulls
/// for empty cells, exact column names as row keys.
pub fn page_extraction_prompt(page: u32, total_pages: u32, columns: &[ColumnSpec]) -> String {
    let mut schema = String::new();
    for col in columns {
        schema.push_str(&format!(
            "  - \"{}\" ({}){}\n",
            col.name,
            col.column_type,
            col.description
                .as_deref()
                .map(|d| format!(": {d}"))
                .unwrap_or_default()
        ));
    }

    format!(
        r#"You are extracting tabular data from page {page} of {total_pages} of a financial document.
Extract EVERY data row on this page only. Do not include rows from other pages.

Each row must be a JSON object using these exact keys:
{schema}
Conventions:
- Dates in YYYY-MM-DD format.
- Currency and number fields as bare numeric values (no symbols, no thousands separators).
- Empty cells as explicit null, never omitted.

Return ONLY valid JSON matching:
{{
  "rows": [ {{ ...one object per data row... }} ],
  "confidence": number between 0 and 1,
  "warnings": ["strings"]
}}"#
    )
}
