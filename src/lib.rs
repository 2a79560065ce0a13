// src/lib.rs
//
// Financial-document scanning core: classify an uploaded statement,
// drive a multimodal model to a structured extraction, resolve the
// issuing bank, cache per-bank CSV parsing rules, and extract
// multi-page tabular documents against a confirmed column schema.

pub mod bank;
pub mod config;
pub mod content;
pub mod error;
pub mod fetch;
pub mod model;
pub mod pages;
pub mod prompts;
pub mod scan;
pub mod store;
pub mod types;

pub use error::ScanError;
pub use fetch::{FileFetcher, LocalFetcher};
pub use model::{ChatModel, DocumentModel};
pub use pages::{batch_extract, extract_page};
pub use scan::scan_document;
pub use store::ScanStore;
pub use types::{BatchExtractionResult, ColumnSpec, ScanResult};
