//! Throwaway BagIt packages and a DOI registrar double for unit tests.

use crate::{
    models::metadata::Metadata,
    services::{
        checksum::{DigestAlgorithm, digest_bytes},
        doi::{DoiError, DoiRegistrar, DoiResult},
    },
};
use async_trait::async_trait;
use std::{
    path::Path,
    sync::{Arc, Mutex},
};
use tempfile::TempDir;

pub fn write_file(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn metadata_json(title: &str) -> String {
    serde_json::json!({
        "resource_type": {"id": "dataset"},
        "creators": [{"person_or_org": {"type": "personal", "given_name": "Ada", "family_name": "Lovelace"}}],
        "title": title,
        "publication_date": "2024-05-17",
        "languages": [{"id": "deu"}]
    })
    .to_string()
}

/// Builds a bag with `bagit.txt`, an md5 payload manifest and the metadata
/// file at `data/Metadata/metadata.json`.
pub struct PackageBuilder {
    title: String,
    metadata: Option<String>,
    files: Vec<(String, String)>,
    record_map: Option<String>,
}

impl PackageBuilder {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            metadata: None,
            files: Vec::new(),
            record_map: None,
        }
    }

    pub fn file(mut self, relative: &str, content: &str) -> Self {
        self.files.push((relative.to_string(), content.to_string()));
        self
    }

    /// Replace the generated metadata document.
    pub fn metadata(mut self, json: &str) -> Self {
        self.metadata = Some(json.to_string());
        self
    }

    pub fn record_map(mut self, json: &str) -> Self {
        self.record_map = Some(json.to_string());
        self
    }

    pub fn build(self) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(root, "bagit.txt", "BagIt-Version: 1.0\nTag-File-Character-Encoding: UTF-8\n");

        let mut payload = vec![(
            "data/Metadata/metadata.json".to_string(),
            self.metadata.unwrap_or_else(|| metadata_json(&self.title)),
        )];
        payload.extend(self.files);

        let mut manifest = String::new();
        for (relative, content) in &payload {
            write_file(root, relative, content);
            let digest = digest_bytes(DigestAlgorithm::Md5, content.as_bytes());
            let hex = digest.trim_start_matches("md5:");
            manifest.push_str(&format!("{}  {}\n", hex, relative));
        }
        write_file(root, "manifest-md5.txt", &manifest);

        if let Some(map) = self.record_map {
            write_file(root, "recordmap.json", &map);
        }
        dir
    }
}

/// Hands out `10.5072/test-N` DOIs and remembers what it was asked.
#[derive(Clone, Default)]
pub struct MemoryRegistrar {
    state: Arc<Mutex<RegistrarState>>,
}

#[derive(Default)]
struct RegistrarState {
    reserved: Vec<(String, String)>,
    deleted: Vec<String>,
    refuse_after: Option<usize>,
}

impl MemoryRegistrar {
    /// Refuse every reservation after the first `n`.
    pub fn refuse_after(&self, n: usize) {
        self.state.lock().unwrap().refuse_after = Some(n);
    }

    /// `(doi, landing url)` of every reservation.
    pub fn reserved(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().reserved.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl DoiRegistrar for MemoryRegistrar {
    async fn reserve(&self, _metadata: &Metadata, landing_url: &str) -> DoiResult<String> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_after.is_some_and(|n| state.reserved.len() >= n) {
            return Err(DoiError::Refused("quota exceeded".to_string()));
        }
        let doi = format!("10.5072/test-{}", state.reserved.len() + 1);
        state.reserved.push((doi.clone(), landing_url.to_string()));
        Ok(doi)
    }

    async fn delete(&self, doi: &str) -> DoiResult<()> {
        self.state.lock().unwrap().deleted.push(doi.to_string());
        Ok(())
    }
}
