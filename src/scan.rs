// src/scan.rs

use crate::bank::{self, ResolvedBank};
use crate::content::{self, ContentLane, PreparedContent};
use crate::error::ScanError;
use crate::fetch::FileFetcher;
use crate::model::{DocumentModel, ModelPayload, ParsedModelJson, invoke_structured};
use crate::prompts::{SCAN_SYSTEM_PROMPT, binary_scan_prompt, delimited_scan_prompt};
use crate::store::ScanStore;
use crate::types::{
    CsvParsingRules, RawScanExtraction, RulesStatus, ScanResult, UsageEvent,
};
use std::time::Instant;
use tracing::{info, warn};

/// Confidence reported when a pre-confirmed extraction template matches
/// the resolved bank.
pub const TEMPLATE_MATCH_CONFIDENCE: f64 = 0.9;

/// Upper bound on the transaction sample carried in a scan result.
pub const MAX_TRANSACTION_SAMPLE: usize = 10;

/// Confidence assumed when the model omits its own estimate.
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Scan one uploaded document: classify it, drive the model, resolve
/// the bank identity, match cached parsing rules and templates, record
/// usage, and return the assembled result.
///
/// Failure policy: a missing reference is rejected before any model
/// call; an unfetchable document is fatal; everything after a
/// successful model call degrades into warnings instead of aborting.
pub async fn scan_document(
    model: &dyn DocumentModel,
    fetcher: &dyn FileFetcher,
    store: &ScanStore,
    owner: &str,
    file_reference: &str,
    declared_content_type: Option<&str>,
) -> Result<ScanResult, ScanError> {
    if file_reference.trim().is_empty() {
        return Err(ScanError::invalid_input("file reference is required"));
    }

    info!(owner = %owner, reference = %file_reference, "Starting document scan");
    let started = Instant::now();

    let bytes = fetcher.fetch_bytes(file_reference).await?;
    let prepared = content::prepare(file_reference, declared_content_type, bytes)?;
    let lane = prepared.lane();

    // The bounded sample is kept for the rule-set audit snapshot.
    let (payload, delimited_sample, local_row_count) = match prepared {
        PreparedContent::Binary { bytes, media_type } => (
            ModelPayload::Document {
                instruction: binary_scan_prompt(),
                bytes,
                media_type,
            },
            None,
            None,
        ),
        PreparedContent::Delimited {
            sample,
            total_data_rows,
            ..
        } => (
            ModelPayload::Text(delimited_scan_prompt(&sample, total_data_rows)),
            Some(sample),
            Some(total_data_rows),
        ),
    };

    let (parsed, token_usage) = invoke_structured(model, SCAN_SYSTEM_PROMPT, &payload).await?;

    let (raw, degraded) = match parsed {
        ParsedModelJson::Parsed(value) => match serde_json::from_value::<RawScanExtraction>(value) {
            Ok(raw) => (raw, false),
            Err(e) => {
                warn!(error = %e, "Parsed JSON did not match the scan contract");
                (
                    RawScanExtraction::degraded(format!(
                        "model output did not match the expected schema: {e}"
                    )),
                    true,
                )
            }
        },
        ParsedModelJson::Unusable { warning } => (RawScanExtraction::degraded(warning), true),
    };

    let mut warnings = raw.warnings.clone();

    // Identity resolution. A store failure here degrades like any other
    // post-model failure.
    let resolved = match bank::resolve(
        store,
        owner,
        raw.bank_name.as_deref(),
        raw.account_number.as_deref(),
    ) {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(error = %e, "Account lookup failed during identity resolution");
            ResolvedBank::Unidentified {
                warning: "Bank could not be identified from this document. Please select the bank manually."
                    .to_string(),
            }
        }
    };

    let (identity, needs_bank_identification) = match resolved {
        ResolvedBank::Identified(identity) => (Some(identity), false),
        ResolvedBank::Unidentified { warning } => {
            warnings.push(warning);
            (None, true)
        }
    };

    // Parsing rules: only for delimited or spreadsheet-derived content,
    // and only with a canonical bank identity to key on.
    let (rules, rules_status) = if lane == ContentLane::Binary {
        (None, RulesStatus::None)
    } else if let Some(identity) = &identity {
        match_rules(
            store,
            owner,
            &identity.bank_id,
            &identity.display_name,
            &raw,
            delimited_sample.as_deref(),
            &mut warnings,
        )
    } else {
        (None, RulesStatus::None)
    };

    // Template lookup is skipped entirely without an identity.
    let (template_id, template_confidence) = match &identity {
        Some(identity) => match store.find_template(owner, &identity.bank_id) {
            Ok(Some(id)) => {
                info!(template_id = id, bank = %identity.display_name, "Extraction template matched");
                (Some(id), Some(TEMPLATE_MATCH_CONFIDENCE))
            }
            Ok(None) => (None, None),
            Err(e) => {
                warn!(error = %e, "Template lookup failed");
                warnings.push("Template lookup failed; continuing without one.".to_string());
                (None, None)
            }
        },
        None => (None, None),
    };

    let confidence = raw
        .confidence
        .unwrap_or(FALLBACK_CONFIDENCE)
        .clamp(0.0, 1.0);

    // For delimited content the row count computed from the full text
    // is authoritative; the model only ever saw a bounded sample.
    let transaction_count = match local_row_count {
        Some(local) => {
            let local = local as u32;
            if let Some(claimed) = raw.transaction_count {
                if claimed != local {
                    warnings.push(format!(
                        "model reported {claimed} transactions but the file holds {local} data rows"
                    ));
                }
            }
            local
        }
        None => raw
            .transaction_count
            .unwrap_or(raw.transactions.len() as u32),
    };

    let mut transactions = raw.transactions;
    transactions.truncate(MAX_TRANSACTION_SAMPLE);

    let outcome = if degraded { "degraded" } else { "ok" };
    let event = UsageEvent {
        owner: owner.to_string(),
        operation: "scan".to_string(),
        model: model.name().to_string(),
        prompt_tokens: token_usage.prompt_tokens,
        completion_tokens: token_usage.completion_tokens,
        duration_ms: started.elapsed().as_millis() as u64,
        outcome: outcome.to_string(),
    };
    if let Err(e) = store.record_usage(&event) {
        warn!(error = %e, "Failed to record usage event");
    }

    info!(
        owner = %owner,
        reference = %file_reference,
        outcome = %outcome,
        needs_bank_identification,
        rules_status = ?rules_status,
        "Scan complete"
    );

    Ok(ScanResult {
        bank_name: identity.as_ref().map(|i| i.display_name.clone()),
        bank_name_raw: identity.as_ref().map(|i| i.raw_name.clone()),
        bank_id: identity.as_ref().map(|i| i.bank_id.clone()),
        needs_bank_identification,
        account_number: raw.account_number,
        account_type: raw.account_type,
        currency: raw.currency,
        currencies: raw.currencies,
        period_start: raw.period_start,
        period_end: raw.period_end,
        opening_balance: raw.opening_balance,
        closing_balance: raw.closing_balance,
        transaction_count,
        transactions,
        confidence,
        warnings,
        suggestions: raw.suggestions,
        template_id,
        template_confidence,
        csv_parsing_rules: rules,
        csv_parsing_rules_status: rules_status,
        token_usage,
    })
}

/// Cache-first rule matching. A hit returns the stored rule set as-is
/// and discards any model proposal. The cache exists to avoid paying
/// for proposals the bank already has. A miss persists the proposal,
/// unconfirmed, together with its audit sample rows.
fn match_rules(
    store: &ScanStore,
    owner: &str,
    bank_id: &str,
    display_name: &str,
    raw: &RawScanExtraction,
    sample: Option<&str>,
    warnings: &mut Vec<String>,
) -> (Option<CsvParsingRules>, RulesStatus) {
    match store.find_rules(owner, bank_id) {
        Ok(Some(mut existing)) => {
            if let Err(e) = store.increment_rule_usage(existing.id) {
                warn!(error = %e, rule_id = existing.id, "Failed to bump rule usage counter");
            } else {
                existing.use_count += 1;
            }
            info!(rule_id = existing.id, bank_id = %bank_id, "Reusing cached parsing rules");
            (Some(existing), RulesStatus::Existing)
        }
        Ok(None) => match &raw.csv_parsing_rules {
            Some(proposal) => {
                let header_idx = proposal.header_row.unwrap_or(0);
                let data_idx = proposal.data_start_row.unwrap_or(header_idx + 1);
                let sample_header = sample.and_then(|s| s.lines().nth(header_idx)).map(String::from);
                let sample_row = sample.and_then(|s| s.lines().nth(data_idx)).map(String::from);

                match store.save_rules(
                    owner,
                    bank_id,
                    display_name,
                    proposal,
                    sample_header.as_deref(),
                    sample_row.as_deref(),
                    owner,
                ) {
                    Ok(id) => match store.get_rules(id) {
                        Ok(Some(rules)) => (Some(rules), RulesStatus::New),
                        _ => {
                            warnings.push(
                                "Proposed parsing rules were stored but could not be read back."
                                    .to_string(),
                            );
                            (None, RulesStatus::None)
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Failed to store proposed parsing rules");
                        warnings
                            .push("Proposed parsing rules could not be stored.".to_string());
                        (None, RulesStatus::None)
                    }
                }
            }
            None => (None, RulesStatus::None),
        },
        Err(e) => {
            warn!(error = %e, "Parsing rule lookup failed");
            warnings.push("Parsing rule lookup failed; continuing without cached rules.".to_string());
            (None, RulesStatus::None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::ScriptedModel;
    use crate::types::DEGRADED_CONFIDENCE;
    use async_trait::async_trait;

    struct StaticFetcher(Vec<u8>);

    #[async_trait]
    impl FileFetcher for StaticFetcher {
        async fn fetch_bytes(&self, _reference: &str) -> Result<Vec<u8>, ScanError> {
            Ok(self.0.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl FileFetcher for FailingFetcher {
        async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>, ScanError> {
            Err(ScanError::Retrieval {
                reference: reference.to_string(),
                detail: "object not found".to_string(),
            })
        }
    }

    const CSV_BYTES: &[u8] = b"Date,Description,Amount\n2026-01-05,COFFEE,-4.50\n2026-01-06,SALARY,2500.00\n";

    const CSV_SCAN_REPLY: &str = r#"{
        "bank_name": "Chase",
        "account_number": "000012345678",
        "account_type": "checking",
        "currency": "USD",
        "transaction_count": 2,
        "transactions": [
            {"date": "2026-01-05", "description": "COFFEE", "amount": -4.5, "type": "debit"},
            {"date": "2026-01-06", "description": "SALARY", "amount": 2500.0, "type": "credit"}
        ],
        "confidence": 0.92,
        "csv_parsing_rules": {
            "header_row": 0,
            "data_start_row": 1,
            "date_column": "Date",
            "description_column": "Description",
            "amount_column": "Amount",
            "date_format": "YYYY-MM-DD",
            "amount_format": "signed"
        }
    }"#;

    #[tokio::test]
    async fn empty_reference_rejected_before_any_model_call() {
        let model = ScriptedModel::new(vec![]);
        let store = ScanStore::open_in_memory().unwrap();
        let err = scan_document(&model, &StaticFetcher(vec![]), &store, "u1", "  ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal() {
        let model = ScriptedModel::new(vec![]);
        let store = ScanStore::open_in_memory().unwrap();
        let err = scan_document(&model, &FailingFetcher, &store, "u1", "gone.pdf", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Retrieval { .. }));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn first_csv_scan_proposes_new_rules() {
        let model = ScriptedModel::new(vec![Ok(CSV_SCAN_REPLY)]);
        let store = ScanStore::open_in_memory().unwrap();

        let result = scan_document(
            &model,
            &StaticFetcher(CSV_BYTES.to_vec()),
            &store,
            "u1",
            "statement.csv",
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.bank_name.as_deref(), Some("Chase"));
        assert!(!result.needs_bank_identification);
        assert_eq!(result.transaction_count, 2);
        assert_eq!(result.csv_parsing_rules_status, RulesStatus::New);

        let rules = result.csv_parsing_rules.unwrap();
        assert_eq!(rules.date_column.as_deref(), Some("Date"));
        assert_eq!(rules.description_column.as_deref(), Some("Description"));
        assert_eq!(rules.amount_column.as_deref(), Some("Amount"));
        assert_eq!(
            rules.sample_header.as_deref(),
            Some("Date,Description,Amount")
        );
        assert_eq!(rules.sample_row.as_deref(), Some("2026-01-05,COFFEE,-4.50"));
        assert!(!rules.confirmed);

        assert_eq!(store.count_rules("u1", "chase").unwrap(), 1);
        assert_eq!(store.count_usage_events("u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn confirmed_rules_are_reused_without_a_new_row() {
        let model = ScriptedModel::new(vec![Ok(CSV_SCAN_REPLY), Ok(CSV_SCAN_REPLY)]);
        let store = ScanStore::open_in_memory().unwrap();
        let fetcher = StaticFetcher(CSV_BYTES.to_vec());

        let first = scan_document(&model, &fetcher, &store, "u1", "statement.csv", None)
            .await
            .unwrap();
        assert_eq!(first.csv_parsing_rules_status, RulesStatus::New);
        let rule_id = first.csv_parsing_rules.unwrap().id;

        // External confirmation workflow approves the proposal.
        store.confirm_rules(rule_id).unwrap();

        let second = scan_document(&model, &fetcher, &store, "u1", "statement2.csv", None)
            .await
            .unwrap();
        assert_eq!(second.csv_parsing_rules_status, RulesStatus::Existing);
        let reused = second.csv_parsing_rules.unwrap();
        assert_eq!(reused.id, rule_id);
        assert_eq!(reused.use_count, 1);

        // Idempotence: the second scan created nothing.
        assert_eq!(store.count_rules("u1", "chase").unwrap(), 1);
    }

    #[tokio::test]
    async fn unresolved_identity_sets_flag_and_skips_rules() {
        let reply = r#"{
            "bank_name": "unknown",
            "transaction_count": 2,
            "confidence": 0.6,
            "csv_parsing_rules": {"header_row": 0, "date_column": "Date"}
        }"#;
        let model = ScriptedModel::new(vec![Ok(reply)]);
        let store = ScanStore::open_in_memory().unwrap();

        let result = scan_document(
            &model,
            &StaticFetcher(CSV_BYTES.to_vec()),
            &store,
            "u1",
            "statement.csv",
            None,
        )
        .await
        .unwrap();

        assert!(result.needs_bank_identification);
        assert!(!result.warnings.is_empty());
        assert!(result.bank_id.is_none());
        // No identity means no key to store the proposal under.
        assert_eq!(result.csv_parsing_rules_status, RulesStatus::None);
        assert!(result.template_id.is_none());
    }

    #[tokio::test]
    async fn suffix_match_recovers_identity() {
        let reply = r#"{"bank_name": null, "account_number": "000012345678", "confidence": 0.7}"#;
        let model = ScriptedModel::new(vec![Ok(reply)]);
        let store = ScanStore::open_in_memory().unwrap();
        store.upsert_account("u1", "Wells Fargo", "5678").unwrap();

        let result = scan_document(
            &model,
            &StaticFetcher(b"%PDF-fake".to_vec()),
            &store,
            "u1",
            "statement.pdf",
            None,
        )
        .await
        .unwrap();

        assert!(!result.needs_bank_identification);
        assert_eq!(result.bank_name.as_deref(), Some("Wells Fargo"));
        assert_eq!(result.bank_id.as_deref(), Some("wells-fargo"));
    }

    #[tokio::test]
    async fn binary_lane_never_touches_the_rule_cache() {
        // Even a (misbehaving) proposal for a PDF must be ignored.
        let reply = r#"{
            "bank_name": "Chase",
            "confidence": 0.8,
            "csv_parsing_rules": {"header_row": 0, "date_column": "Date"}
        }"#;
        let model = ScriptedModel::new(vec![Ok(reply)]);
        let store = ScanStore::open_in_memory().unwrap();

        let result = scan_document(
            &model,
            &StaticFetcher(b"%PDF-fake".to_vec()),
            &store,
            "u1",
            "statement.pdf",
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.csv_parsing_rules_status, RulesStatus::None);
        assert!(result.csv_parsing_rules.is_none());
        assert_eq!(store.count_rules("u1", "chase").unwrap(), 0);
    }

    #[tokio::test]
    async fn template_match_carries_fixed_confidence() {
        let model = ScriptedModel::new(vec![Ok(r#"{"bank_name": "Chase", "confidence": 0.9}"#)]);
        let store = ScanStore::open_in_memory().unwrap();
        let template_id = store.insert_template("u1", "chase", "Chase checking").unwrap();

        let result = scan_document(
            &model,
            &StaticFetcher(b"%PDF-fake".to_vec()),
            &store,
            "u1",
            "statement.pdf",
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.template_id, Some(template_id));
        assert_eq!(result.template_confidence, Some(TEMPLATE_MATCH_CONFIDENCE));
    }

    #[tokio::test]
    async fn double_parse_failure_degrades_instead_of_erroring() {
        let model = ScriptedModel::new(vec![Ok("total garbage"), Ok("more garbage")]);
        let store = ScanStore::open_in_memory().unwrap();

        let result = scan_document(
            &model,
            &StaticFetcher(CSV_BYTES.to_vec()),
            &store,
            "u1",
            "statement.csv",
            None,
        )
        .await
        .unwrap();

        assert!(result.confidence <= 0.3);
        assert_eq!(result.confidence, DEGRADED_CONFIDENCE);
        assert!(!result.warnings.is_empty());
        assert!(result.needs_bank_identification);
        // The degraded outcome still lands in the usage ledger.
        assert_eq!(store.count_usage_events("u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn transaction_sample_is_bounded() {
        let many: Vec<String> = (0..25)
            .map(|i| {
                format!(
                    r#"{{"date": "2026-01-{:02}", "description": "TXN {i}", "amount": 1.0, "type": "debit"}}"#,
                    (i % 28) + 1
                )
            })
            .collect();
        let reply = format!(
            r#"{{"bank_name": "Chase", "transaction_count": 25, "transactions": [{}], "confidence": 0.9}}"#,
            many.join(",")
        );
        let model = ScriptedModel::new(vec![Ok(reply.as_str())]);
        let store = ScanStore::open_in_memory().unwrap();

        let result = scan_document(
            &model,
            &StaticFetcher(b"%PDF-fake".to_vec()),
            &store,
            "u1",
            "statement.pdf",
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.transactions.len(), MAX_TRANSACTION_SAMPLE);
        assert_eq!(result.transaction_count, 25);
    }

    #[tokio::test]
    async fn local_row_count_overrides_model_claim() {
        // The model only saw the bounded sample; its count for the full
        // file is a guess and loses to the locally computed one.
        let reply = r#"{"bank_name": "Chase", "transaction_count": 240, "confidence": 0.9}"#;
        let model = ScriptedModel::new(vec![Ok(reply)]);
        let store = ScanStore::open_in_memory().unwrap();

        let result = scan_document(
            &model,
            &StaticFetcher(CSV_BYTES.to_vec()),
            &store,
            "u1",
            "statement.csv",
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.transaction_count, 2);
        assert!(result.warnings.iter().any(|w| w.contains("240")));
    }
}
