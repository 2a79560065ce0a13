// src/types.rs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Account classification as reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Checking,
    Savings,
    Credit,
    Investment,
    #[serde(other)]
    Other,
}

/// Direction of a sampled transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnDirection {
    Credit,
    Debit,
    #[serde(other)]
    Unknown,
}

/// One entry of the bounded transaction sample in a scan result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSample {
    pub date: Option<String>,
    pub description: Option<String>,
    pub amount: Option<f64>,
    #[serde(rename = "type")]
    pub direction: Option<TxnDirection>,
}

/// How amounts are represented in a delimited export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountFormat {
    /// One amount column, negative values for debits.
    Signed,
    /// Unsigned amounts; direction comes from separate columns or a
    /// debit/credit marker.
    Absolute,
}

/// Column-layout rules as proposed by the model for a delimited export.
///
/// Everything is optional; the model may only be able to identify a
/// subset of the layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CsvRuleProposal {
    pub header_row: Option<usize>,
    pub data_start_row: Option<usize>,
    pub date_column: Option<String>,
    pub description_column: Option<String>,
    pub amount_column: Option<String>,
    pub debit_column: Option<String>,
    pub credit_column: Option<String>,
    pub balance_column: Option<String>,
    pub reference_column: Option<String>,
    pub date_format: Option<String>,
    pub amount_format: Option<AmountFormat>,
    pub debit_credit_strategy: Option<String>,
    pub thousands_separator: Option<String>,
    pub decimal_separator: Option<String>,
}

/// A persisted, per-bank CSV parsing rule set.
///
/// Append-only: new proposals are stored unconfirmed and only become
/// visible to `find_rules` once the confirmation workflow flips the
/// flag. The usage counter is the sole in-place mutation.
#[derive(Debug, Clone, Serialize)]
pub struct CsvParsingRules {
    pub id: i64,
    pub owner: String,
    pub bank_id: String,
    pub display_name: String,
    pub header_row: usize,
    pub data_start_row: usize,
    pub date_column: Option<String>,
    pub description_column: Option<String>,
    pub amount_column: Option<String>,
    pub debit_column: Option<String>,
    pub credit_column: Option<String>,
    pub balance_column: Option<String>,
    pub reference_column: Option<String>,
    pub date_format: Option<String>,
    pub amount_format: AmountFormat,
    pub debit_credit_strategy: Option<String>,
    pub thousands_separator: Option<String>,
    pub decimal_separator: Option<String>,
    pub sample_header: Option<String>,
    pub sample_row: Option<String>,
    pub created_by: String,
    pub created_at: String,
    pub use_count: u32,
    pub confirmed: bool,
}

/// Where the scan's rule reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RulesStatus {
    /// A confirmed rule set already existed for this bank; the model was
    /// not asked for a proposal on this path.
    Existing,
    /// The model proposed a rule set and it was persisted unconfirmed.
    New,
    /// No cached rules and no usable proposal.
    None,
}

/// Prompt/completion token counters reported by the model API.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Structured output contract for the single-document scan.
///
/// This is the exact shape the model is instructed to emit. All fields
/// are lenient: the model is untrusted with respect to output shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawScanExtraction {
    pub bank_name: Option<String>,
    pub account_number: Option<String>,
    pub account_type: Option<AccountType>,
    pub currency: Option<String>,
    pub currencies: Option<Vec<String>>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub opening_balance: Option<f64>,
    pub closing_balance: Option<f64>,
    pub transaction_count: Option<u32>,
    #[serde(default)]
    pub transactions: Vec<TransactionSample>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub csv_parsing_rules: Option<CsvRuleProposal>,
}

/// Confidence attached to results the invoker had to fabricate after
/// both the original response and the repair pass failed to parse.
pub const DEGRADED_CONFIDENCE: f64 = 0.1;

impl RawScanExtraction {
    /// Minimal safe default used when model output is unusable.
    pub fn degraded(warning: impl Into<String>) -> Self {
        Self {
            confidence: Some(DEGRADED_CONFIDENCE),
            warnings: vec![warning.into()],
            ..Self::default()
        }
    }
}

/// Final result of a single-document scan. Immutable after return;
/// persisted by the caller, not by this core.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub bank_name: Option<String>,
    pub bank_name_raw: Option<String>,
    pub bank_id: Option<String>,
    pub needs_bank_identification: bool,
    pub account_number: Option<String>,
    pub account_type: Option<AccountType>,
    pub currency: Option<String>,
    pub currencies: Option<Vec<String>>,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub opening_balance: Option<f64>,
    pub closing_balance: Option<f64>,
    pub transaction_count: u32,
    pub transactions: Vec<TransactionSample>,
    pub confidence: f64,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub template_id: Option<i64>,
    pub template_confidence: Option<f64>,
    pub csv_parsing_rules: Option<CsvParsingRules>,
    pub csv_parsing_rules_status: RulesStatus,
    pub token_usage: TokenUsage,
}

/// One column of a confirmed extraction schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    /// Semantic type hint for the model: "date", "text", "number", ...
    pub column_type: String,
    pub description: Option<String>,
}

/// Structured output contract for a single extracted page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPageExtraction {
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Row set extracted from one page. Independent of every other page.
#[derive(Debug, Clone, Serialize)]
pub struct PageExtractionResult {
    pub page: u32,
    pub rows: Vec<Map<String, Value>>,
    pub confidence: f64,
    pub warnings: Vec<String>,
}

impl PageExtractionResult {
    /// Entry recorded for a page whose extraction failed. Zero rows,
    /// zero confidence, one warning. Siblings are unaffected.
    pub fn failed(page: u32, warning: impl Into<String>) -> Self {
        Self {
            page,
            rows: Vec::new(),
            confidence: 0.0,
            warnings: vec![warning.into()],
        }
    }
}

/// Ordered page results plus the total extracted row count.
#[derive(Debug, Clone, Serialize)]
pub struct BatchExtractionResult {
    pub pages: Vec<PageExtractionResult>,
    pub total_rows: usize,
}

/// Historical account record used for suffix-based identity resolution.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub bank_name: String,
    pub account_suffix: String,
}

/// Append-only usage ledger entry, one per operation.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub owner: String,
    pub operation: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub duration_ms: u64,
    pub outcome: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_type_tolerates_unknown_values() {
        let t: AccountType = serde_json::from_str("\"checking\"").unwrap();
        assert_eq!(t, AccountType::Checking);
        let t: AccountType = serde_json::from_str("\"money-market\"").unwrap();
        assert_eq!(t, AccountType::Other);
    }

    #[test]
    fn raw_extraction_parses_sparse_output() {
        let raw: RawScanExtraction = serde_json::from_str(
            r#"{"bank_name": "Chase", "transaction_count": 12}"#,
        )
        .unwrap();
        assert_eq!(raw.bank_name.as_deref(), Some("Chase"));
        assert_eq!(raw.transaction_count, Some(12));
        assert!(raw.transactions.is_empty());
        assert!(raw.csv_parsing_rules.is_none());
    }

    #[test]
    fn degraded_default_carries_warning_and_low_confidence() {
        let d = RawScanExtraction::degraded("model output unusable");
        assert_eq!(d.confidence, Some(DEGRADED_CONFIDENCE));
        assert!(DEGRADED_CONFIDENCE <= 0.3);
        assert_eq!(d.warnings.len(), 1);
        assert!(d.bank_name.is_none());
    }

    #[test]
    fn transaction_direction_round_trips() {
        let t: TransactionSample = serde_json::from_str(
            r#"{"date": "2026-01-05", "description": "COFFEE", "amount": -4.5, "type": "debit"}"#,
        )
        .unwrap();
        assert_eq!(t.direction, Some(TxnDirection::Debit));
    }
}
