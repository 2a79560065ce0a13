// src/pages.rs

use crate::content;
use crate::error::ScanError;
use crate::fetch::FileFetcher;
use crate::model::{DocumentModel, ModelPayload, ParsedModelJson, invoke_structured};
use crate::prompts::{PAGE_SYSTEM_PROMPT, page_extraction_prompt};
use crate::store::ScanStore;
use crate::types::{
    BatchExtractionResult, ColumnSpec, PageExtractionResult, RawPageExtraction, TokenUsage,
    UsageEvent,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Confidence assumed when a page reply omits its own estimate.
const FALLBACK_PAGE_CONFIDENCE: f64 = 0.5;

/// Extract every data row from one page of a document, keyed by the
/// confirmed column names.
///
/// Page numbers are 1-based. Unusable model output is not an error: it
/// comes back as a zero-row result with a warning. Transport and API
/// failures do propagate; `batch_extract` is the layer that isolates
/// them per page.
///
/// Every successful call writes one usage event; `batch_extract` does
/// its own aggregate recording instead of going through here.
#[allow(clippy::too_many_arguments)]
pub async fn extract_page(
    model: &dyn DocumentModel,
    fetcher: &dyn FileFetcher,
    store: &ScanStore,
    owner: &str,
    file_reference: &str,
    declared_content_type: Option<&str>,
    page: u32,
    total_pages: u32,
    columns: &[ColumnSpec],
) -> Result<PageExtractionResult, ScanError> {
    validate_page_request(file_reference, page, columns)?;
    let started = Instant::now();

    let bytes = fetcher.fetch_bytes(file_reference).await?;
    let media_type = content::binary_media_type(file_reference, declared_content_type);
    let instruction = page_extraction_prompt(page, total_pages, columns);
    let (result, usage) = page_call(model, &bytes, &media_type, instruction, page).await?;

    let degraded = result.rows.is_empty() && !result.warnings.is_empty();
    let event = UsageEvent {
        owner: owner.to_string(),
        operation: "extract_page".to_string(),
        model: model.name().to_string(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        duration_ms: started.elapsed().as_millis() as u64,
        outcome: if degraded { "degraded" } else { "ok" }.to_string(),
    };
    if let Err(e) = store.record_usage(&event) {
        warn!(error = %e, "Failed to record usage event");
    }

    Ok(result)
}

/// Extract every page of a multi-page document against a confirmed
/// column schema.
///
/// Pages are partitioned into fixed-size batches. Tasks within a batch
/// run concurrently; the next batch starts only after every task in the
/// current one has settled. The batch size is the concurrency cap that
/// keeps the model endpoint under its rate limits.
///
/// Each page gets exactly one attempt. A failed page becomes a
/// zero-row, zero-confidence entry with a warning and never cancels its
/// siblings. The returned results are sorted by page number, one entry
/// per requested page.
#[allow(clippy::too_many_arguments)]
pub async fn batch_extract(
    model: Arc<dyn DocumentModel>,
    fetcher: &dyn FileFetcher,
    store: &ScanStore,
    owner: &str,
    file_reference: &str,
    declared_content_type: Option<&str>,
    total_pages: u32,
    columns: &[ColumnSpec],
    page_batch_size: usize,
) -> Result<BatchExtractionResult, ScanError> {
    validate_page_request(file_reference, 1, columns)?;
    if total_pages == 0 {
        return Err(ScanError::invalid_input("total page count must be at least 1"));
    }
    let batch_size = page_batch_size.max(1);

    info!(
        owner = %owner,
        reference = %file_reference,
        total_pages,
        batch_size,
        "Starting batch extraction"
    );
    let started = Instant::now();

    // The document is fetched once and shared across page tasks.
    let bytes = Arc::new(fetcher.fetch_bytes(file_reference).await?);
    let media_type = Arc::new(content::binary_media_type(
        file_reference,
        declared_content_type,
    ));

    let mut results: Vec<PageExtractionResult> = Vec::with_capacity(total_pages as usize);
    let mut usage = TokenUsage::default();

    let page_numbers: Vec<u32> = (1..=total_pages).collect();
    for batch in page_numbers.chunks(batch_size) {
        let mut tasks: JoinSet<(PageExtractionResult, TokenUsage)> = JoinSet::new();
        for &page in batch {
            let model = Arc::clone(&model);
            let bytes = Arc::clone(&bytes);
            let media_type = Arc::clone(&media_type);
            let instruction = page_extraction_prompt(page, total_pages, columns);
            tasks.spawn(async move {
                match page_call(model.as_ref(), &bytes, &media_type, instruction, page).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(page, error = %e, "Page extraction failed");
                        (
                            PageExtractionResult::failed(
                                page,
                                format!("page {page} extraction failed: {e}"),
                            ),
                            TokenUsage::default(),
                        )
                    }
                }
            });
        }

        // Settle the whole batch before the next one starts.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((result, task_usage)) => {
                    usage.prompt_tokens += task_usage.prompt_tokens;
                    usage.completion_tokens += task_usage.completion_tokens;
                    results.push(result);
                }
                Err(e) => warn!(error = %e, "Page task did not complete"),
            }
        }
    }

    // One entry per requested page, even if a task vanished.
    let seen: HashSet<u32> = results.iter().map(|r| r.page).collect();
    for page in 1..=total_pages {
        if !seen.contains(&page) {
            results.push(PageExtractionResult::failed(
                page,
                format!("page {page} task did not complete"),
            ));
        }
    }

    results.sort_by_key(|r| r.page);
    let total_rows: usize = results.iter().map(|r| r.rows.len()).sum();
    let failed_pages = results
        .iter()
        .filter(|r| r.rows.is_empty() && !r.warnings.is_empty())
        .count();

    let outcome = if failed_pages == 0 { "ok" } else { "partial" };
    let event = UsageEvent {
        owner: owner.to_string(),
        operation: "extract".to_string(),
        model: model.name().to_string(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        duration_ms: started.elapsed().as_millis() as u64,
        outcome: outcome.to_string(),
    };
    if let Err(e) = store.record_usage(&event) {
        warn!(error = %e, "Failed to record usage event");
    }

    info!(
        owner = %owner,
        total_pages,
        total_rows,
        failed_pages,
        outcome = %outcome,
        "Batch extraction complete"
    );

    Ok(BatchExtractionResult {
        pages: results,
        total_rows,
    })
}

fn validate_page_request(
    file_reference: &str,
    page: u32,
    columns: &[ColumnSpec],
) -> Result<(), ScanError> {
    if file_reference.trim().is_empty() {
        return Err(ScanError::invalid_input("file reference is required"));
    }
    if page == 0 {
        return Err(ScanError::invalid_input("page numbers start at 1"));
    }
    if columns.is_empty() {
        return Err(ScanError::invalid_input("column schema must not be empty"));
    }
    Ok(())
}

/// One model invocation scoped to a single page. Malformed output
/// degrades to a failed entry here; transport errors propagate to the
/// caller for isolation.
async fn page_call(
    model: &dyn DocumentModel,
    bytes: &[u8],
    media_type: &str,
    instruction: String,
    page: u32,
) -> Result<(PageExtractionResult, TokenUsage), ScanError> {
    let payload = ModelPayload::Document {
        instruction,
        bytes: bytes.to_vec(),
        media_type: media_type.to_string(),
    };
    let (parsed, usage) = invoke_structured(model, PAGE_SYSTEM_PROMPT, &payload).await?;

    let result = match parsed {
        ParsedModelJson::Parsed(value) => match serde_json::from_value::<RawPageExtraction>(value)
        {
            Ok(raw) => PageExtractionResult {
                page,
                confidence: raw
                    .confidence
                    .unwrap_or(FALLBACK_PAGE_CONFIDENCE)
                    .clamp(0.0, 1.0),
                rows: raw.rows,
                warnings: raw.warnings,
            },
            Err(e) => PageExtractionResult::failed(
                page,
                format!("page output did not match the expected schema: {e}"),
            ),
        },
        ParsedModelJson::Unusable { warning } => PageExtractionResult::failed(page, warning),
    };
    Ok((result, usage))
}
