// src/fetch.rs

use crate::error::ScanError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// Object-storage retrieval capability. A failed fetch is fatal for a
/// scan; there is nothing to analyze without the bytes.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>, ScanError>;
}

/// Fetcher resolving references against a local document directory.
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl FileFetcher for LocalFetcher {
    async fn fetch_bytes(&self, reference: &str) -> Result<Vec<u8>, ScanError> {
        // References are storage keys, never paths that climb out of
        // the document root.
        if reference.contains("..") || reference.starts_with('/') {
            return Err(ScanError::Retrieval {
                reference: reference.to_string(),
                detail: "malformed reference".to_string(),
            });
        }

        let path = self.root.join(reference);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ScanError::Retrieval {
                reference: reference.to_string(),
                detail: e.to_string(),
            })?;
        info!(reference = %reference, bytes = bytes.len(), "Document fetched");
        Ok(bytes)
    }
}
