// src/config.rs

use serde::Deserialize;
use std::{fs, path::Path};
use tracing::info;

#[derive(Deserialize)]
pub struct Config {
    pub llm: LlmSection,
    #[serde(default)]
    pub scan: ScanSection,
}

#[derive(Deserialize)]
pub struct ScanSection {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Directory that file references are resolved against.
    #[serde(default = "default_document_root")]
    pub document_root: String,
    /// Pages extracted concurrently within one batch. Batches run
    /// sequentially to respect model endpoint rate limits.
    #[serde(default = "default_page_batch_size")]
    pub page_batch_size: usize,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            document_root: default_document_root(),
            page_batch_size: default_page_batch_size(),
        }
    }
}

fn default_db_path() -> String {
    "scanstore/scans.db".to_string()
}

fn default_document_root() -> String {
    ".".to_string()
}

fn default_page_batch_size() -> usize {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// Local Ollama instance (OpenAI-compatible /v1 endpoint).
    Ollama,
    /// Hosted API; key read from the LLM_API_KEY env var.
    Remote,
}

#[derive(Deserialize)]
pub struct LlmSection {
    pub backend: LlmBackend,
    pub ollama: EndpointSection,
    pub remote: EndpointSection,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize)]
pub struct EndpointSection {
    pub base_url: String,
    pub model: String,
}

fn default_timeout_secs() -> u64 {
    120
}

/// Resolved endpoint configuration ready to make API calls.
pub struct ResolvedEndpoint {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

/// Resolve the LLM config section into a concrete endpoint.
pub fn resolve_endpoint(llm: &LlmSection) -> Result<ResolvedEndpoint, Box<dyn std::error::Error>> {
    match llm.backend {
        LlmBackend::Ollama => {
            info!(
                url = %llm.ollama.base_url,
                model = %llm.ollama.model,
                "Using Ollama (local) backend"
            );
            Ok(ResolvedEndpoint {
                base_url: llm.ollama.base_url.clone(),
                model: llm.ollama.model.clone(),
                api_key: "ollama".to_string(), // required by API but ignored
                timeout_secs: llm.timeout_secs,
            })
        }
        LlmBackend::Remote => {
            let api_key = std::env::var("LLM_API_KEY")
                .map_err(|_| "LLM_API_KEY env var required for remote backend")?;
            info!(
                url = %llm.remote.base_url,
                model = %llm.remote.model,
                "Using remote API backend"
            );
            Ok(ResolvedEndpoint {
                base_url: llm.remote.base_url.clone(),
                model: llm.remote.model.clone(),
                api_key,
                timeout_secs: llm.timeout_secs,
            })
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}
