//! Reading record metadata from a package's metadata file.
//!
//! Profile-specific extraction (CMDI and friends) lives behind
//! [`MetadataReader`]; the bundled reader understands metadata stored as an
//! InvenioRDM-shaped JSON document.

use crate::models::metadata::Metadata;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait MetadataReader: Send + Sync {
    async fn read_metadata(&self, path: &Path) -> Result<Metadata>;
}

#[derive(Clone, Debug, Default)]
pub struct JsonMetadataReader;

#[async_trait]
impl MetadataReader for JsonMetadataReader {
    async fn read_metadata(&self, path: &Path) -> Result<Metadata> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading metadata file {}", path.display()))?;
        let metadata: Metadata = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing metadata file {}", path.display()))?;
        if metadata.title.trim().is_empty() {
            anyhow::bail!("metadata file {} has an empty title", path.display());
        }
        Ok(metadata)
    }
}
