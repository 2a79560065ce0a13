// src/main.rs

use statement_scan::config::{self, Config, LlmBackend};
use statement_scan::model::{ChatModel, DocumentModel};
use statement_scan::types::ColumnSpec;
use statement_scan::{LocalFetcher, ScanStore, batch_extract, scan_document};
use std::sync::Arc;
use tracing::info;

const USAGE: &str = "usage:
  statement_scan scan <file> [content-type]
  statement_scan extract <file> <pages> <columns>   (columns: Name:type[,Name:type...])
  statement_scan confirm-rules <rule-id>
  statement_scan add-account <bank> <suffix>

config is read from scan.toml (override with SCAN_CONFIG);
the acting user is `local` (override with SCAN_OWNER)";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter("info")
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let config_path = std::env::var("SCAN_CONFIG").unwrap_or_else(|_| "scan.toml".to_string());
    let cfg = Config::load(&config_path)?;
    let owner = std::env::var("SCAN_OWNER").unwrap_or_else(|_| "local".to_string());

    if let Some(parent) = std::path::Path::new(&cfg.scan.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = ScanStore::new(&cfg.scan.db_path)?;
    let fetcher = LocalFetcher::new(&cfg.scan.document_root);

    match command.as_str() {
        "scan" => {
            let file = args.get(2).ok_or(USAGE)?;
            let declared = args.get(3).map(String::as_str);
            let model = build_model(&cfg).await?;
            let result = scan_document(
                model.as_ref(),
                &fetcher,
                &store,
                &owner,
                file,
                declared,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        "extract" => {
            let file = args.get(2).ok_or(USAGE)?;
            let pages: u32 = args.get(3).ok_or(USAGE)?.parse()?;
            let columns = parse_columns(args.get(4).ok_or(USAGE)?)?;
            let model = build_model(&cfg).await?;
            let result = batch_extract(
                model,
                &fetcher,
                &store,
                &owner,
                file,
                None,
                pages,
                &columns,
                cfg.scan.page_batch_size,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        "confirm-rules" => {
            let id: i64 = args.get(2).ok_or(USAGE)?.parse()?;
            store.confirm_rules(id)?;
            info!(rule_id = id, "Parsing rules confirmed");
        }
        "add-account" => {
            let bank = args.get(2).ok_or(USAGE)?;
            let suffix = args.get(3).ok_or(USAGE)?;
            store.upsert_account(&owner, bank, suffix)?;
            info!(bank = %bank, suffix = %suffix, "Account recorded");
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn build_model(cfg: &Config) -> Result<Arc<dyn DocumentModel>, Box<dyn std::error::Error>> {
    let endpoint = config::resolve_endpoint(&cfg.llm)?;
    let model = ChatModel::from_endpoint(&endpoint);
    if cfg.llm.backend == LlmBackend::Ollama && !model.check_health().await {
        return Err("local model server is not reachable; is Ollama running?".into());
    }
    Ok(Arc::new(model))
}

/// Parse a `Name:type[,Name:type...]` schema argument.
fn parse_columns(raw: &str) -> Result<Vec<ColumnSpec>, Box<dyn std::error::Error>> {
    let mut columns = Vec::new();
    for part in raw.split(',') {
        let (name, column_type) = part
            .split_once(':')
            .ok_or("columns must be Name:type pairs, e.g. Date:date,Amount:number")?;
        columns.push(ColumnSpec {
            name: name.trim().to_string(),
            column_type: column_type.trim().to_string(),
            description: None,
        });
    }
    if columns.is_empty() {
        return Err("column schema must not be empty".into());
    }
    Ok(columns)
}
